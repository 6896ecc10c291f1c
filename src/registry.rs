use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::HubError;
use crate::keys::generate_session_key;
use crate::messages::UserSessionInfo;
use crate::monitor::MonitorCommand;
use crate::session::{BrowserSession, UserSession};

/// Shared lookup for every live user and browser session.
///
/// Both maps are keyed by session key. Entries are inserted at login /
/// tab-open and removed by the grace-period cleanup tasks, logout, or an
/// explicit removal call; per-key operations are atomic, so concurrent
/// removal requests for the same session collapse into one.
pub struct SessionRegistry {
    users: DashMap<String, Arc<UserSession>>,
    browsers: DashMap<String, Arc<BrowserSession>>,
    cleanup_grace: Duration,
    user_linger: Duration,
    monitor_tx: mpsc::UnboundedSender<MonitorCommand>,
}

impl SessionRegistry {
    pub fn new(config: &Config, monitor_tx: mpsc::UnboundedSender<MonitorCommand>) -> Self {
        Self {
            users: DashMap::new(),
            browsers: DashMap::new(),
            cleanup_grace: Duration::from_millis(config.cleanup_grace_ms),
            user_linger: Duration::from_millis(config.user_linger_ms),
            monitor_tx,
        }
    }

    pub fn cleanup_grace(&self) -> Duration {
        self.cleanup_grace
    }

    /// Creates and registers a user session under a freshly generated key.
    pub fn create_user_session(
        &self,
        info: UserSessionInfo,
    ) -> Result<Arc<UserSession>, HubError> {
        let session = Arc::new(UserSession::new(
            generate_session_key(),
            info,
            self.monitor_tx.clone(),
        ));
        self.insert_user_session(session)
    }

    /// Registers an already-built user session, rejecting key collisions.
    ///
    /// Keys are generated, so a collision here means a key was reused; that
    /// is a bug worth surfacing loudly rather than silently replacing the
    /// existing session.
    pub(crate) fn insert_user_session(
        &self,
        session: Arc<UserSession>,
    ) -> Result<Arc<UserSession>, HubError> {
        let key = session.user_session_key().to_string();
        match self.users.entry(key.clone()) {
            Entry::Occupied(_) => {
                error!(user_session_key = %key, "Refusing to replace existing user session");
                Err(HubError::DuplicateSession(key))
            }
            Entry::Vacant(entry) => {
                info!(
                    user_session_key = %key,
                    username = %session.username(),
                    "Registered user session"
                );
                entry.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    pub fn get_user_session(&self, user_session_key: &str) -> Option<Arc<UserSession>> {
        self.users.get(user_session_key).map(|s| Arc::clone(&s))
    }

    pub fn get_browser_session(&self, browser_session_key: &str) -> Option<Arc<BrowserSession>> {
        self.browsers
            .get(browser_session_key)
            .map(|s| Arc::clone(&s))
    }

    pub fn user_session_count(&self) -> usize {
        self.users.len()
    }

    pub fn browser_session_count(&self) -> usize {
        self.browsers.len()
    }

    /// Creates a browser session for an existing user session, for a newly
    /// opened tab.
    pub fn register_browser_session(
        &self,
        user_session_key: &str,
    ) -> Result<Arc<BrowserSession>, HubError> {
        let user = self
            .get_user_session(user_session_key)
            .ok_or_else(|| HubError::UnknownUserSession(user_session_key.to_string()))?;

        let session = Arc::new(BrowserSession::new(
            generate_session_key(),
            user_session_key.to_string(),
        ));
        match self.browsers.entry(session.browser_session_key().to_string()) {
            Entry::Occupied(_) => {
                let key = session.browser_session_key().to_string();
                error!(browser_session_key = %key, "Refusing to replace existing browser session");
                return Err(HubError::DuplicateSession(key));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&session));
            }
        }
        user.add_browser_session(Arc::clone(&session));
        debug!(
            browser_session_key = %session.browser_session_key(),
            user_session_key = %user_session_key,
            "Registered browser session"
        );
        Ok(session)
    }

    /// Removes a browser session from the registry and its user's set,
    /// terminating any playback service still attached. Idempotent.
    ///
    /// When this was the user's last browser session, the user session is
    /// scheduled for reclamation after the linger period so a new tab can
    /// still reuse the login.
    pub fn remove_browser_session(self: &Arc<Self>, session: &BrowserSession) {
        session.cancel_cleanup_timer();

        if let Some(playback) = session.set_playback_service(None) {
            info!(
                browser_session_key = %session.browser_session_key(),
                log_name = %playback.log_name,
                "Terminating playback service for removed browser session"
            );
        }
        session.set_monitor_service(None);

        let removed = self
            .browsers
            .remove(session.browser_session_key())
            .is_some();

        if let Some(user) = self.get_user_session(session.user_session_key()) {
            user.remove_browser_session(session);
            if removed && !user.has_browser_sessions() {
                self.schedule_user_linger(user.user_session_key().to_string());
            }
        }

        if removed {
            debug!(
                browser_session_key = %session.browser_session_key(),
                "Removed browser session"
            );
        }
    }

    /// Reclaims the user session after the linger period unless a browser
    /// session was attached in the meantime.
    fn schedule_user_linger(self: &Arc<Self>, user_session_key: String) {
        let registry = Arc::clone(self);
        let linger = self.user_linger;
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            let still_empty = registry
                .get_user_session(&user_session_key)
                .map(|user| !user.has_browser_sessions())
                .unwrap_or(false);
            if still_empty {
                registry.users.remove(&user_session_key);
                info!(
                    user_session_key = %user_session_key,
                    "Reclaimed user session with no remaining browser sessions"
                );
            }
        });
    }

    /// Removes a user session and all of its browser sessions, for logout.
    /// Returns false if the session was already gone.
    pub fn remove_user_session(&self, user_session_key: &str) -> bool {
        let Some((_, user)) = self.users.remove(user_session_key) else {
            return false;
        };
        for browser in user.browser_sessions() {
            browser.cancel_cleanup_timer();
            if let Some(playback) = browser.set_playback_service(None) {
                info!(
                    browser_session_key = %browser.browser_session_key(),
                    log_name = %playback.log_name,
                    "Terminating playback service at logout"
                );
            }
            self.browsers.remove(browser.browser_session_key());
            user.remove_browser_session(&browser);
        }
        info!(
            user_session_key = %user_session_key,
            username = %user.username(),
            "Removed user session"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::command_channel;
    use crate::session::PlaybackHandle;
    use std::time::Duration;
    use tokio::time::sleep;

    fn test_registry(user_linger_ms: u64) -> Arc<SessionRegistry> {
        let (tx, _rx) = command_channel();
        let config = Config {
            cleanup_grace_ms: 30,
            user_linger_ms,
            ..Default::default()
        };
        Arc::new(SessionRegistry::new(&config, tx))
    }

    fn test_info() -> UserSessionInfo {
        UserSessionInfo::new("tester".into(), None, false)
    }

    #[tokio::test]
    async fn test_duplicate_user_session_key_is_rejected() {
        let registry = test_registry(5_000);
        let (tx, _rx) = command_channel();

        let first = Arc::new(UserSession::new("u1".into(), test_info(), tx.clone()));
        let second = Arc::new(UserSession::new("u1".into(), test_info(), tx));

        assert!(registry.insert_user_session(first).is_ok());
        let err = registry.insert_user_session(second).unwrap_err();
        assert!(matches!(err, HubError::DuplicateSession(key) if key == "u1"));
        assert_eq!(registry.user_session_count(), 1);
    }

    #[tokio::test]
    async fn test_register_browser_session_requires_known_user() {
        let registry = test_registry(5_000);
        let err = registry.register_browser_session("nobody").unwrap_err();
        assert!(matches!(err, HubError::UnknownUserSession(_)));
    }

    #[tokio::test]
    async fn test_remove_browser_session_terminates_playback() {
        let registry = test_registry(5_000);
        let user = registry.create_user_session(test_info()).unwrap();
        let browser = registry
            .register_browser_session(user.user_session_key())
            .unwrap();
        browser.set_playback_service(Some(PlaybackHandle {
            log_name: "run-1.log".into(),
        }));

        registry.remove_browser_session(&browser);

        assert!(browser.playback_service().is_none());
        assert!(registry
            .get_browser_session(browser.browser_session_key())
            .is_none());
        assert_eq!(user.browser_session_count(), 0);
    }

    #[tokio::test]
    async fn test_user_session_reclaimed_after_linger() {
        let registry = test_registry(30);
        let user = registry.create_user_session(test_info()).unwrap();
        let browser = registry
            .register_browser_session(user.user_session_key())
            .unwrap();

        registry.remove_browser_session(&browser);
        sleep(Duration::from_millis(80)).await;

        assert!(registry.get_user_session(user.user_session_key()).is_none());
    }

    #[tokio::test]
    async fn test_new_browser_session_cancels_user_reclamation() {
        let registry = test_registry(40);
        let user = registry.create_user_session(test_info()).unwrap();
        let browser = registry
            .register_browser_session(user.user_session_key())
            .unwrap();

        registry.remove_browser_session(&browser);
        sleep(Duration::from_millis(10)).await;

        // A new tab attaches before the linger fires; the user session must
        // survive.
        registry
            .register_browser_session(user.user_session_key())
            .unwrap();
        sleep(Duration::from_millis(80)).await;

        assert!(registry.get_user_session(user.user_session_key()).is_some());
    }

    #[tokio::test]
    async fn test_remove_user_session_clears_all_browser_sessions() {
        let registry = test_registry(5_000);
        let user = registry.create_user_session(test_info()).unwrap();
        let first = registry
            .register_browser_session(user.user_session_key())
            .unwrap();
        let second = registry
            .register_browser_session(user.user_session_key())
            .unwrap();

        assert!(registry.remove_user_session(user.user_session_key()));
        assert!(registry
            .get_browser_session(first.browser_session_key())
            .is_none());
        assert!(registry
            .get_browser_session(second.browser_session_key())
            .is_none());
        assert!(!registry.remove_user_session(user.user_session_key()));
    }

    #[tokio::test]
    async fn test_concurrent_registration_across_tasks() {
        let registry = test_registry(5_000);
        let user = registry.create_user_session(test_info()).unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let key = user.user_session_key().to_string();
            handles.push(tokio::spawn(async move {
                registry.register_browser_session(&key).unwrap()
            }));
        }
        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }

        assert_eq!(registry.browser_session_count(), 16);
        for session in &sessions {
            registry.remove_browser_session(session);
        }
        assert_eq!(registry.browser_session_count(), 0);
    }
}
