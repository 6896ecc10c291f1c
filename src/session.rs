use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::connection::BrowserConnection;
use crate::error::HubError;
use crate::messages::{
    ClientEnvelope, ClientPayload, ClientResponse, DomainSessionKey, KnowledgeSessionRef,
    MonitorFrame, UserSessionInfo,
};
use crate::monitor::MonitorCommand;
use crate::registry::SessionRegistry;

/// Handle to a recorded-session playback service attached to a browser tab.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackHandle {
    pub log_name: String,
}

/// Handle to a live monitor service feed attached to a browser tab.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorServiceHandle {
    pub service_id: String,
}

/// Callback invoked for each backend-originated frame relayed to a browser
/// session, before the auto-mode flag is read.
pub type MessageHandler = Box<dyn Fn(&MonitorFrame) + Send>;

struct BrowserSessionInner {
    auto_mode_enabled: bool,
    message_handler: Option<MessageHandler>,
    knowledge_session: Option<KnowledgeSessionRef>,
    playback_service: Option<PlaybackHandle>,
    monitor_service: Option<MonitorServiceHandle>,
    connection: Option<BrowserConnection>,
    cleanup_timer: Option<JoinHandle<()>>,
}

/// Server-side state for one browser tab.
///
/// A browser session survives the loss of its socket for a grace period so a
/// page refresh can rebind a fresh connection without tearing the session
/// down. At most one connection and one pending cleanup timer exist at a
/// time; both live behind the single per-session lock, so rebinding and
/// cancellation are atomic with respect to each other.
pub struct BrowserSession {
    browser_session_key: String,
    user_session_key: String,
    inner: Mutex<BrowserSessionInner>,
}

impl BrowserSession {
    pub fn new(browser_session_key: String, user_session_key: String) -> Self {
        Self {
            browser_session_key,
            user_session_key,
            inner: Mutex::new(BrowserSessionInner {
                auto_mode_enabled: true,
                message_handler: None,
                knowledge_session: None,
                playback_service: None,
                monitor_service: None,
                connection: None,
                cleanup_timer: None,
            }),
        }
    }

    pub fn browser_session_key(&self) -> &str {
        &self.browser_session_key
    }

    pub fn user_session_key(&self) -> &str {
        &self.user_session_key
    }

    fn locked(&self) -> MutexGuard<'_, BrowserSessionInner> {
        // A poisoned lock only means a panic elsewhere; the state itself is
        // still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs the active connection, cancelling any pending cleanup timer.
    /// Returns the previous connection, if one was still bound.
    pub fn set_connection(&self, connection: BrowserConnection) -> Option<BrowserConnection> {
        let mut inner = self.locked();
        if let Some(timer) = inner.cleanup_timer.take() {
            timer.abort();
            debug!(
                browser_session_key = %self.browser_session_key,
                "Cancelled pending cleanup, connection rebound"
            );
        }
        inner.connection.replace(connection)
    }

    pub fn has_connection(&self) -> bool {
        self.locked().connection.is_some()
    }

    /// Sends a frame over the live connection.
    pub fn send(&self, frame: MonitorFrame) -> Result<(), HubError> {
        let connection = self
            .locked()
            .connection
            .clone()
            .ok_or_else(|| HubError::NotConnected(self.browser_session_key.clone()))?;
        connection.send(frame)
    }

    pub fn set_auto_mode_enabled(&self, enabled: bool) {
        self.locked().auto_mode_enabled = enabled;
    }

    pub fn is_auto_mode_enabled(&self) -> bool {
        self.locked().auto_mode_enabled
    }

    pub fn set_message_handler(&self, handler: Option<MessageHandler>) {
        self.locked().message_handler = handler;
    }

    /// Runs the attached message handler (if any) and reports the auto-mode
    /// flag as of that moment.
    ///
    /// Both happen under the session lock, so concurrent messages for the
    /// same session are processed as a strict sequence while different
    /// sessions never contend.
    pub fn handle_message(&self, frame: &MonitorFrame) -> bool {
        let inner = self.locked();
        if let Some(handler) = &inner.message_handler {
            handler(frame);
        }
        inner.auto_mode_enabled
    }

    pub fn knowledge_session(&self) -> Option<KnowledgeSessionRef> {
        self.locked().knowledge_session.clone()
    }

    pub fn set_knowledge_session(
        &self,
        knowledge_session: Option<KnowledgeSessionRef>,
    ) -> Option<KnowledgeSessionRef> {
        std::mem::replace(&mut self.locked().knowledge_session, knowledge_session)
    }

    pub fn playback_service(&self) -> Option<PlaybackHandle> {
        self.locked().playback_service.clone()
    }

    pub fn set_playback_service(&self, playback: Option<PlaybackHandle>) -> Option<PlaybackHandle> {
        std::mem::replace(&mut self.locked().playback_service, playback)
    }

    pub fn monitor_service(&self) -> Option<MonitorServiceHandle> {
        self.locked().monitor_service.clone()
    }

    pub fn set_monitor_service(
        &self,
        service: Option<MonitorServiceHandle>,
    ) -> Option<MonitorServiceHandle> {
        std::mem::replace(&mut self.locked().monitor_service, service)
    }

    /// Called when a socket task's receive loop ends for this session.
    ///
    /// Only the currently bound connection may enter the cleanup path: if a
    /// page refresh already rebound a replacement, the old socket's close
    /// arrives late and is ignored here. Otherwise the connection is dropped
    /// and a one-shot removal is scheduled after the registry's grace
    /// period; a `set_connection` call before the timer fires cancels the
    /// removal, which is what makes a refresh indistinguishable from a
    /// short network blip.
    pub fn on_connection_ending(
        self: &Arc<Self>,
        registry: &Arc<SessionRegistry>,
        connection_id: &str,
    ) {
        let mut inner = self.locked();
        if let Some(current) = inner.connection.as_ref() {
            if current.connection_id() != connection_id {
                debug!(
                    browser_session_key = %self.browser_session_key,
                    connection_id = %connection_id,
                    "Ignoring close from already-replaced connection"
                );
                return;
            }
        }
        if let Some(connection) = inner.connection.take() {
            debug!(
                browser_session_key = %self.browser_session_key,
                connection_id = %connection.connection_id(),
                "Browser connection ending, starting cleanup grace timer"
            );
        }
        if let Some(previous) = inner.cleanup_timer.take() {
            previous.abort();
        }
        let grace = registry.cleanup_grace();
        let session = Arc::clone(self);
        let registry = Arc::clone(registry);
        inner.cleanup_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            // Runs without the session lock held; removal is idempotent.
            registry.remove_browser_session(&session);
        }));
    }

    /// Aborts any pending cleanup timer. Safe to call when none is pending.
    pub fn cancel_cleanup_timer(&self) {
        if let Some(timer) = self.locked().cleanup_timer.take() {
            timer.abort();
        }
    }
}

// The message handler is an opaque closure, so Debug is written out by hand
// over the identifying fields.
impl fmt::Debug for BrowserSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserSession")
            .field("browser_session_key", &self.browser_session_key)
            .field("user_session_key", &self.user_session_key)
            .finish_non_exhaustive()
    }
}

/// Server-side state for one logged-in user, aggregating that user's
/// browser sessions and routing messages between them and the backend
/// monitor module.
pub struct UserSession {
    user_session_key: String,
    info: UserSessionInfo,
    browsers: Mutex<HashMap<String, Arc<BrowserSession>>>,
    monitor_tx: mpsc::UnboundedSender<MonitorCommand>,
}

impl fmt::Debug for UserSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSession")
            .field("user_session_key", &self.user_session_key)
            .field("username", &self.info.username)
            .finish_non_exhaustive()
    }
}

impl UserSession {
    pub fn new(
        user_session_key: String,
        info: UserSessionInfo,
        monitor_tx: mpsc::UnboundedSender<MonitorCommand>,
    ) -> Self {
        Self {
            user_session_key,
            info,
            browsers: Mutex::new(HashMap::new()),
            monitor_tx,
        }
    }

    pub fn user_session_key(&self) -> &str {
        &self.user_session_key
    }

    pub fn username(&self) -> &str {
        &self.info.username
    }

    pub fn info(&self) -> &UserSessionInfo {
        &self.info
    }

    pub fn is_offline(&self) -> bool {
        self.info.offline
    }

    fn browsers_locked(&self) -> MutexGuard<'_, HashMap<String, Arc<BrowserSession>>> {
        self.browsers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a browser session to this user's set. No-op if already present.
    pub fn add_browser_session(&self, session: Arc<BrowserSession>) {
        self.browsers_locked()
            .insert(session.browser_session_key().to_string(), session);
    }

    /// Removes a browser session from this user's set. No-op if absent.
    pub fn remove_browser_session(&self, session: &BrowserSession) {
        self.browsers_locked().remove(session.browser_session_key());
    }

    pub fn has_browser_sessions(&self) -> bool {
        !self.browsers_locked().is_empty()
    }

    pub fn browser_session_count(&self) -> usize {
        self.browsers_locked().len()
    }

    /// Snapshot of the attached browser sessions.
    pub fn browser_sessions(&self) -> Vec<Arc<BrowserSession>> {
        self.browsers_locked().values().cloned().collect()
    }

    /// Sends a frame to every attached browser session's connection.
    ///
    /// Delivery is best-effort per recipient: one dead or missing connection
    /// never prevents delivery to the rest, and nothing propagates past this
    /// call.
    pub fn broadcast_to_browsers(&self, frame: &MonitorFrame) {
        for browser in self.browser_sessions() {
            if let Err(err) = browser.send(frame.clone()) {
                warn!(
                    browser_session_key = %browser.browser_session_key(),
                    error = %err,
                    "Failed to deliver frame to browser session"
                );
            }
        }
    }

    /// Pushes a backend-originated frame through every attached browser
    /// session and reports whether all of them are in auto mode.
    ///
    /// Vacuously true with no browsers attached, matching the short-circuit
    /// semantics of the strategy-authorization path.
    pub fn relay_monitor_update(&self, frame: &MonitorFrame) -> bool {
        let mut all_auto = true;
        for browser in self.browser_sessions() {
            all_auto &= browser.handle_message(frame);
            if let Err(err) = browser.send(frame.clone()) {
                debug!(
                    browser_session_key = %browser.browser_session_key(),
                    error = %err,
                    "Skipping disconnected browser session during relay"
                );
            }
        }
        all_auto
    }

    /// Routes one inbound client message to the backend monitor module.
    ///
    /// This is the containment boundary: every failure in resolution or
    /// dispatch is caught, logged, and converted into a failure response.
    /// The caller always gets a response and this session stays usable.
    pub fn handle_client_message(
        &self,
        registry: &SessionRegistry,
        envelope: &ClientEnvelope,
    ) -> ClientResponse {
        match self.dispatch(registry, envelope) {
            Ok(message) => ClientResponse::success(
                &self.user_session_key,
                &envelope.browser_session_key,
                message,
            ),
            Err(err) => {
                error!(
                    user_session_key = %self.user_session_key,
                    browser_session_key = %envelope.browser_session_key,
                    payload_kind = envelope.payload.kind(),
                    error = %err,
                    "Failed to dispatch client message"
                );
                ClientResponse::failure(
                    &self.user_session_key,
                    &envelope.browser_session_key,
                    "failed to process message",
                    Some(err.to_string()),
                )
            }
        }
    }

    fn dispatch(
        &self,
        registry: &SessionRegistry,
        envelope: &ClientEnvelope,
    ) -> Result<&'static str, HubError> {
        let browser = registry
            .get_browser_session(&envelope.browser_session_key)
            .ok_or_else(|| {
                HubError::UnknownBrowserSession(envelope.browser_session_key.clone())
            })?;

        if matches!(envelope.payload, ClientPayload::Unknown) {
            warn!(
                browser_session_key = %envelope.browser_session_key,
                "Ignoring unrecognized payload kind"
            );
            return Ok("message accepted, unrecognized payload kind was not dispatched");
        }

        let knowledge_session = browser.knowledge_session().ok_or_else(|| {
            HubError::NoKnowledgeSession(envelope.browser_session_key.clone())
        })?;
        let key = DomainSessionKey::derive(&knowledge_session, browser.browser_session_key());

        let (command, message) = match envelope.payload.clone() {
            ClientPayload::EvaluatorUpdate { request } => (
                MonitorCommand::EvaluatorUpdate { request, key },
                "evaluator update forwarded",
            ),
            ClientPayload::ApplyStrategies { strategies } => (
                MonitorCommand::ApplyStrategies {
                    strategies,
                    evaluator: self.info.username.clone(),
                    key,
                },
                "strategies forwarded for application",
            ),
            ClientPayload::EndSession { request } => (
                MonitorCommand::EndSession { request, key },
                "end session request forwarded",
            ),
            ClientPayload::Unknown => unreachable!("handled above"),
        };

        self.monitor_tx
            .send(command)
            .map_err(|_| HubError::MonitorUnavailable)?;
        Ok(message)
    }
}
