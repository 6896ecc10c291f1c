use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::connection::BrowserConnection;
use crate::messages::{ClientEnvelope, MonitorFrame};
use crate::registry::SessionRegistry;
use crate::session::BrowserSession;

/// Shared state for the browser socket endpoint.
#[derive(Clone)]
pub struct SocketRouter {
    registry: Arc<SessionRegistry>,
}

impl SocketRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpgradeParams {
    browser_session_id: Option<String>,
}

/// Resolves the upgrade request's browser session before any socket exists.
///
/// Rejected upgrades never create a connection: a blank key is a client bug
/// (400) and an unknown key is a session that already expired or never
/// existed (404).
fn validate_upgrade(
    registry: &SessionRegistry,
    params: &UpgradeParams,
) -> Result<Arc<BrowserSession>, (StatusCode, &'static str)> {
    let key = params
        .browser_session_id
        .as_deref()
        .map(str::trim)
        .unwrap_or("");
    if key.is_empty() {
        warn!("Rejecting socket upgrade with missing browser_session_id");
        return Err((StatusCode::BAD_REQUEST, "browser_session_id is required"));
    }
    registry.get_browser_session(key).ok_or_else(|| {
        warn!(browser_session_key = %key, "Rejecting socket upgrade for unknown browser session");
        (StatusCode::NOT_FOUND, "unknown browser session")
    })
}

/// WebSocket upgrade handler for `/ws?browser_session_id=...`.
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    Query(params): Query<UpgradeParams>,
    State(router): State<SocketRouter>,
) -> Response {
    let browser = match validate_upgrade(&router.registry, &params) {
        Ok(browser) => browser,
        Err(rejection) => return rejection.into_response(),
    };

    let registry = Arc::clone(&router.registry);
    let mut response =
        ws.on_upgrade(move |socket| handle_socket(socket, browser, registry, remote_addr));
    // Some proxies mangle negotiated extensions; advertise none.
    response.headers_mut().remove(header::SEC_WEBSOCKET_EXTENSIONS);
    response
}

/// Drives one browser socket from upgrade to disconnect.
async fn handle_socket(
    socket: WebSocket,
    browser: Arc<BrowserSession>,
    registry: Arc<SessionRegistry>,
    remote_addr: SocketAddr,
) {
    let (mut sender, mut receiver) = socket.split();

    // Outbound frames are queued here and drained by the forward task, which
    // owns the write half.
    let (tx, mut rx) = mpsc::unbounded_channel::<MonitorFrame>();
    let forward_key = browser.browser_session_key().to_string();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(browser_session_key = %forward_key, "Failed to serialize frame: {}", e);
                }
            }
        }
        debug!(browser_session_key = %forward_key, "Forward task ended");
    });

    let connection = BrowserConnection::new(Some(remote_addr), tx.clone());
    let connection_id = connection.connection_id().to_string();
    debug!(
        browser_session_key = %browser.browser_session_key(),
        connection_id = %connection.connection_id(),
        %remote_addr,
        "Browser socket connected"
    );
    if let Some(previous) = browser.set_connection(connection) {
        debug!(
            browser_session_key = %browser.browser_session_key(),
            connection_id = %previous.connection_id(),
            remote_addr = ?previous.remote_addr(),
            "Replaced previous connection for browser session"
        );
    }

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                error!(
                    browser_session_key = %browser.browser_session_key(),
                    "Socket error: {}", e
                );
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                handle_text_frame(&text, &browser, &registry, &tx);
            }
            Message::Binary(data) => {
                // Binary frames carrying JSON are accepted for compatibility.
                match String::from_utf8(data) {
                    Ok(text) => handle_text_frame(&text, &browser, &registry, &tx),
                    Err(_) => {
                        debug!(
                            browser_session_key = %browser.browser_session_key(),
                            "Ignoring non-UTF8 binary frame"
                        );
                    }
                }
            }
            Message::Close(_) => {
                debug!(
                    browser_session_key = %browser.browser_session_key(),
                    "Received close frame"
                );
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    // A refresh may already have rebound a replacement connection; the
    // ending path is a no-op then.
    browser.on_connection_ending(&registry, &connection_id);
    debug!(
        browser_session_key = %browser.browser_session_key(),
        connection_id = %connection_id,
        "Browser socket disconnected"
    );
}

/// Parses one inbound frame and routes it through the owning user session.
///
/// Every frame gets exactly one reply on the same socket, parse failures
/// included.
fn handle_text_frame(
    text: &str,
    browser: &BrowserSession,
    registry: &SessionRegistry,
    tx: &mpsc::UnboundedSender<MonitorFrame>,
) {
    let envelope = match serde_json::from_str::<ClientEnvelope>(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(
                browser_session_key = %browser.browser_session_key(),
                "Failed to parse client message: {}", e
            );
            let _ = tx.send(MonitorFrame::Error {
                message: format!("Invalid message format: {}", e),
            });
            return;
        }
    };

    let Some(user) = registry.get_user_session(browser.user_session_key()) else {
        warn!(
            browser_session_key = %browser.browser_session_key(),
            user_session_key = %browser.user_session_key(),
            "Dropping message for browser session with no user session"
        );
        let _ = tx.send(MonitorFrame::Error {
            message: "user session no longer exists".to_string(),
        });
        return;
    };

    let response = user.handle_client_message(registry, &envelope);
    let _ = tx.send(MonitorFrame::Response { response });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::messages::UserSessionInfo;
    use crate::monitor::command_channel;

    fn test_registry() -> Arc<SessionRegistry> {
        let (tx, _rx) = command_channel();
        Arc::new(SessionRegistry::new(&Config::default(), tx))
    }

    #[tokio::test]
    async fn test_validate_upgrade_rejects_missing_key() {
        let registry = test_registry();
        let params = UpgradeParams {
            browser_session_id: None,
        };
        let err = validate_upgrade(&registry, &params).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let params = UpgradeParams {
            browser_session_id: Some("   ".into()),
        };
        let err = validate_upgrade(&registry, &params).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_validate_upgrade_rejects_unknown_session() {
        let registry = test_registry();
        let params = UpgradeParams {
            browser_session_id: Some("not-a-session".into()),
        };
        let err = validate_upgrade(&registry, &params).unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_validate_upgrade_resolves_known_session() {
        let registry = test_registry();
        let user = registry
            .create_user_session(UserSessionInfo::new("tester".into(), None, false))
            .unwrap();
        let browser = registry
            .register_browser_session(user.user_session_key())
            .unwrap();

        let params = UpgradeParams {
            browser_session_id: Some(browser.browser_session_key().to_string()),
        };
        let resolved = validate_upgrade(&registry, &params).unwrap();
        assert_eq!(
            resolved.browser_session_key(),
            browser.browser_session_key()
        );
    }

    #[tokio::test]
    async fn test_text_frame_with_bad_json_gets_error_reply() {
        let registry = test_registry();
        let user = registry
            .create_user_session(UserSessionInfo::new("tester".into(), None, false))
            .unwrap();
        let browser = registry
            .register_browser_session(user.user_session_key())
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_text_frame("not json", &browser, &registry, &tx);

        match rx.try_recv().unwrap() {
            MonitorFrame::Error { message } => assert!(message.contains("Invalid message format")),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_text_frame_routes_through_user_session() {
        let registry = test_registry();
        let user = registry
            .create_user_session(UserSessionInfo::new("tester".into(), None, false))
            .unwrap();
        let browser = registry
            .register_browser_session(user.user_session_key())
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let text = format!(
            r#"{{ "browser_session_key": "{}", "payload": {{ "type": "end_session" }} }}"#,
            browser.browser_session_key()
        );
        handle_text_frame(&text, &browser, &registry, &tx);

        match rx.try_recv().unwrap() {
            MonitorFrame::Response { response } => {
                // No knowledge session is attached yet, so dispatch fails but
                // still produces a structured reply.
                assert!(!response.success);
                assert_eq!(response.user_session_key, user.user_session_key());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
