use thiserror::Error;

/// Failures raised by the session core.
///
/// Everything here is contained at the network edge: message-level failures
/// become structured responses, upgrade-level failures become logged
/// rejections. Nothing in this taxonomy is allowed to tear down a session or
/// the registry.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("unknown user session: {0}")]
    UnknownUserSession(String),
    #[error("unknown browser session: {0}")]
    UnknownBrowserSession(String),
    /// Session keys are generated fresh, so this indicates a programming
    /// error rather than a runtime condition. It is surfaced loudly instead
    /// of being swallowed.
    #[error("duplicate session key: {0}")]
    DuplicateSession(String),
    #[error("no knowledge session attached to browser session {0}")]
    NoKnowledgeSession(String),
    #[error("monitor module channel is closed")]
    MonitorUnavailable,
    #[error("browser session {0} has no live connection")]
    NotConnected(String),
    #[error("connection channel closed")]
    ConnectionClosed,
}
