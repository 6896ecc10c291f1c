use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope for every message arriving over a browser socket.
///
/// The payload bodies are opaque to this layer; only the payload kind is
/// inspected for routing to the backend monitor module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    pub browser_session_key: String,
    pub payload: ClientPayload,
}

/// Payload kinds recognized by the message dispatcher.
///
/// Tags outside the three recognized request types fall into `Unknown`; they
/// are acknowledged but never dispatched to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientPayload {
    EvaluatorUpdate {
        #[serde(default)]
        request: Value,
    },
    ApplyStrategies {
        #[serde(default)]
        strategies: Value,
    },
    EndSession {
        #[serde(default)]
        request: Value,
    },
    #[serde(other)]
    Unknown,
}

impl ClientPayload {
    /// Wire tag of this payload, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientPayload::EvaluatorUpdate { .. } => "evaluator_update",
            ClientPayload::ApplyStrategies { .. } => "apply_strategies",
            ClientPayload::EndSession { .. } => "end_session",
            ClientPayload::Unknown => "unknown",
        }
    }
}

/// Structured reply returned for every handled client message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientResponse {
    pub user_session_key: String,
    pub browser_session_key: String,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
}

impl ClientResponse {
    pub fn success(user_session_key: &str, browser_session_key: &str, message: &str) -> Self {
        Self {
            user_session_key: user_session_key.to_string(),
            browser_session_key: browser_session_key.to_string(),
            success: true,
            message: message.to_string(),
            additional_info: None,
        }
    }

    pub fn failure(
        user_session_key: &str,
        browser_session_key: &str,
        message: &str,
        additional_info: Option<String>,
    ) -> Self {
        Self {
            user_session_key: user_session_key.to_string(),
            browser_session_key: browser_session_key.to_string(),
            success: false,
            message: message.to_string(),
            additional_info,
        }
    }
}

/// Frames sent from the hub to browser tabs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorFrame {
    /// Reply to a client message on the same socket.
    Response {
        #[serde(flatten)]
        response: ClientResponse,
    },
    /// Backend-originated state update for the monitored session.
    SessionUpdate { payload: Value },
    /// Backend requested authorization for suggested strategies.
    StrategyAuthorization { strategies: Value },
    /// The monitored session is ending.
    SessionEnding,
    /// Error message
    Error { message: String },
}

/// Correlates a browser session to a backend training session. Opaque to
/// this core beyond serving as a routing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeSessionRef {
    pub domain_session_id: i64,
    pub session_name: String,
    /// True when the browser is replaying a recorded session rather than
    /// monitoring a live one.
    #[serde(default)]
    pub past_session_mode: bool,
}

/// Routing key for backend monitor calls.
///
/// Live sessions are keyed by domain session id alone. Playback sessions
/// additionally carry the browser session key so that two tabs replaying the
/// same recording do not collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainSessionKey {
    pub domain_session_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_id: Option<String>,
}

impl DomainSessionKey {
    pub fn derive(knowledge_session: &KnowledgeSessionRef, browser_session_key: &str) -> Self {
        Self {
            domain_session_id: knowledge_session.domain_session_id,
            playback_id: knowledge_session
                .past_session_mode
                .then(|| browser_session_key.to_string()),
        }
    }
}

/// Durable metadata for a logged-in user. Created once at login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSessionInfo {
    pub username: String,
    #[serde(skip_serializing)]
    pub passphrase_hash: Option<String>,
    pub offline: bool,
    pub created_at: DateTime<Utc>,
}

impl UserSessionInfo {
    pub fn new(username: String, passphrase_hash: Option<String>, offline: bool) -> Self {
        Self {
            username,
            passphrase_hash,
            offline,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_end_session_envelope() {
        let json = r#"{
            "browser_session_key": "b1",
            "payload": { "type": "end_session", "request": { "reason": "done" } }
        }"#;
        let envelope: ClientEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.browser_session_key, "b1");
        assert!(matches!(
            envelope.payload,
            ClientPayload::EndSession { .. }
        ));
    }

    #[test]
    fn test_parse_payload_with_missing_body() {
        let json = r#"{ "browser_session_key": "b1", "payload": { "type": "end_session" } }"#;
        let envelope: ClientEnvelope = serde_json::from_str(json).unwrap();
        match envelope.payload {
            ClientPayload::EndSession { request } => assert!(request.is_null()),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_payload_kind_parses_as_unknown() {
        let json = r#"{
            "browser_session_key": "b1",
            "payload": { "type": "fetch_leaderboard", "page": 3 }
        }"#;
        let envelope: ClientEnvelope = serde_json::from_str(json).unwrap();
        assert!(matches!(envelope.payload, ClientPayload::Unknown));
    }

    #[test]
    fn test_response_omits_empty_additional_info() {
        let response = ClientResponse::success("u1", "b1", "ok");
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("additional_info"));

        let failure = ClientResponse::failure("u1", "b1", "bad", Some("detail".into()));
        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("detail"));
    }

    #[test]
    fn test_domain_session_key_for_live_session() {
        let ks = KnowledgeSessionRef {
            domain_session_id: 17,
            session_name: "squad-drill".into(),
            past_session_mode: false,
        };
        let key = DomainSessionKey::derive(&ks, "b1");
        assert_eq!(key.domain_session_id, 17);
        assert!(key.playback_id.is_none());
    }

    #[test]
    fn test_domain_session_key_for_playback_session() {
        let ks = KnowledgeSessionRef {
            domain_session_id: 17,
            session_name: "squad-drill".into(),
            past_session_mode: true,
        };
        let key = DomainSessionKey::derive(&ks, "b1");
        assert_eq!(key.playback_id.as_deref(), Some("b1"));
    }
}
