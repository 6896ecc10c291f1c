use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::keys::{hash_passphrase, verify_passphrase};
use crate::messages::UserSessionInfo;
use crate::monitor::MonitorEvent;
use crate::registry::SessionRegistry;

/// Shared state for the HTTP endpoints.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub events_tx: mpsc::UnboundedSender<MonitorEvent>,
    pub base_url: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub passphrase: Option<String>,
    #[serde(default)]
    pub offline: bool,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_session_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offline: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BrowserSessionRequest {
    pub passphrase: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BrowserSessionResponse {
    pub browser_session_key: String,
    pub websocket_url: String,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    user_sessions: usize,
    browser_sessions: usize,
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Socket URL handed to the browser for a given browser session.
fn websocket_url(base_http: &str, browser_session_key: &str) -> String {
    let ws_base = if let Some(rest) = base_http.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_http.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_http)
    };
    format!(
        "{}/ws?browser_session_id={}",
        ws_base.trim_end_matches('/'),
        browser_session_key
    )
}

/// POST /sessions - Log a user in, creating the user session and its first
/// browser session.
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, StatusCode> {
    let username = payload.username.trim();
    if username.is_empty() {
        return Ok(Json(LoginResponse {
            success: false,
            message: Some("username is required".to_string()),
            user_session_key: None,
            browser_session_key: None,
            websocket_url: None,
        }));
    }

    let passphrase_hash = payload
        .passphrase
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .map(hash_passphrase);

    let info = UserSessionInfo::new(username.to_string(), passphrase_hash, payload.offline);
    let user = state.registry.create_user_session(info).map_err(|e| {
        error!("Failed to create user session: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let browser = state
        .registry
        .register_browser_session(user.user_session_key())
        .map_err(|e| {
            error!("Failed to create browser session at login: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    info!(
        username = %username,
        user_session_key = %user.user_session_key(),
        "User logged in"
    );

    let base_http = normalize_base_url(&state.base_url);
    Ok(Json(LoginResponse {
        success: true,
        message: None,
        user_session_key: Some(user.user_session_key().to_string()),
        browser_session_key: Some(browser.browser_session_key().to_string()),
        websocket_url: Some(websocket_url(&base_http, browser.browser_session_key())),
    }))
}

/// GET /sessions/{id} - Check if a user session exists.
pub async fn get_session_status(
    State(state): State<AppState>,
    Path(user_session_key): Path<String>,
) -> Json<SessionStatusResponse> {
    match state.registry.get_user_session(&user_session_key) {
        Some(user) => Json(SessionStatusResponse {
            exists: true,
            username: Some(user.username().to_string()),
            browser_session_count: Some(user.browser_session_count()),
            offline: Some(user.is_offline()),
        }),
        None => Json(SessionStatusResponse {
            exists: false,
            username: None,
            browser_session_count: None,
            offline: None,
        }),
    }
}

/// DELETE /sessions/{id} - Log a user out, tearing down all of their
/// browser sessions immediately.
pub async fn logout(
    State(state): State<AppState>,
    Path(user_session_key): Path<String>,
) -> StatusCode {
    if state.registry.remove_user_session(&user_session_key) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// POST /sessions/{id}/browsers - Attach another browser session (a new
/// tab) to an existing user session.
pub async fn create_browser_session(
    State(state): State<AppState>,
    Path(user_session_key): Path<String>,
    Json(payload): Json<BrowserSessionRequest>,
) -> Result<Json<BrowserSessionResponse>, StatusCode> {
    let user = state
        .registry
        .get_user_session(&user_session_key)
        .ok_or(StatusCode::NOT_FOUND)?;

    // Sessions created with a passphrase require it again for each new tab.
    if let Some(hash) = user.info().passphrase_hash.as_deref() {
        let supplied = payload.passphrase.as_deref().unwrap_or("");
        if !verify_passphrase(supplied, hash) {
            debug!(
                user_session_key = %user_session_key,
                "Rejected browser session registration: bad passphrase"
            );
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    let browser = state
        .registry
        .register_browser_session(&user_session_key)
        .map_err(|e| {
            debug!(
                user_session_key = %user_session_key,
                "Rejected browser session registration: {}", e
            );
            StatusCode::NOT_FOUND
        })?;

    let base_http = normalize_base_url(&state.base_url);
    Ok(Json(BrowserSessionResponse {
        websocket_url: websocket_url(&base_http, browser.browser_session_key()),
        browser_session_key: browser.browser_session_key().to_string(),
    }))
}

/// POST /monitor/events - Inject a backend monitor event for routing to the
/// addressed user's browsers.
pub async fn post_monitor_event(
    State(state): State<AppState>,
    Json(event): Json<MonitorEvent>,
) -> StatusCode {
    if state.events_tx.send(event).is_err() {
        error!("Monitor event channel closed");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::ACCEPTED
}

/// GET /health - Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        user_sessions: state.registry.user_session_count(),
        browser_sessions: state.registry.browser_session_count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::monitor::{command_channel, event_channel};

    fn test_state() -> (AppState, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (command_tx, _command_rx) = command_channel();
        let (events_tx, events_rx) = event_channel();
        let state = AppState {
            registry: Arc::new(SessionRegistry::new(&Config::default(), command_tx)),
            events_tx,
            base_url: "http://localhost:8080".to_string(),
        };
        (state, events_rx)
    }

    #[test]
    fn test_websocket_url_swaps_scheme() {
        assert_eq!(
            websocket_url("http://localhost:8080", "b1"),
            "ws://localhost:8080/ws?browser_session_id=b1"
        );
        assert_eq!(
            websocket_url("https://hub.example.com", "b1"),
            "wss://hub.example.com/ws?browser_session_id=b1"
        );
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("localhost:8080/"), "http://localhost:8080");
        assert_eq!(
            normalize_base_url("https://hub.example.com"),
            "https://hub.example.com"
        );
    }

    #[tokio::test]
    async fn test_login_creates_user_and_browser_session() {
        let (state, _events_rx) = test_state();
        let response = login(
            State(state.clone()),
            Json(LoginRequest {
                username: "tester".into(),
                passphrase: Some("secret".into()),
                offline: false,
            }),
        )
        .await
        .unwrap();

        assert!(response.success);
        let user_key = response.user_session_key.as_deref().unwrap();
        let browser_key = response.browser_session_key.as_deref().unwrap();
        assert!(state.registry.get_user_session(user_key).is_some());
        assert!(state.registry.get_browser_session(browser_key).is_some());
        assert!(response
            .websocket_url
            .as_deref()
            .unwrap()
            .starts_with("ws://"));
    }

    #[tokio::test]
    async fn test_login_rejects_blank_username() {
        let (state, _events_rx) = test_state();
        let response = login(
            State(state),
            Json(LoginRequest {
                username: "   ".into(),
                passphrase: None,
                offline: false,
            }),
        )
        .await
        .unwrap();

        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_create_browser_session_requires_known_user() {
        let (state, _events_rx) = test_state();
        let err = create_browser_session(
            State(state),
            Path("nobody".into()),
            Json(BrowserSessionRequest::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_browser_session_checks_passphrase() {
        let (state, _events_rx) = test_state();
        let user = state
            .registry
            .create_user_session(UserSessionInfo::new(
                "tester".into(),
                Some(hash_passphrase("secret")),
                false,
            ))
            .unwrap();
        let key = user.user_session_key().to_string();

        let err = create_browser_session(
            State(state.clone()),
            Path(key.clone()),
            Json(BrowserSessionRequest {
                passphrase: Some("wrong".into()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StatusCode::UNAUTHORIZED);

        let response = create_browser_session(
            State(state.clone()),
            Path(key),
            Json(BrowserSessionRequest {
                passphrase: Some("secret".into()),
            }),
        )
        .await
        .unwrap();
        assert!(state
            .registry
            .get_browser_session(&response.browser_session_key)
            .is_some());
    }

    #[tokio::test]
    async fn test_logout_removes_session() {
        let (state, _events_rx) = test_state();
        let user = state
            .registry
            .create_user_session(UserSessionInfo::new("tester".into(), None, false))
            .unwrap();
        let key = user.user_session_key().to_string();

        let status = logout(State(state.clone()), Path(key.clone())).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let status = logout(State(state), Path(key)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_monitor_event_is_queued() {
        let (state, mut events_rx) = test_state();
        let status = post_monitor_event(
            State(state),
            Json(MonitorEvent {
                user_session_key: "u1".into(),
                update: crate::monitor::MonitorUpdate::SessionEnding,
            }),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(events_rx.try_recv().unwrap().user_session_key, "u1");
    }
}
