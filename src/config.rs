use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Delay between a browser connection closing and the browser session
    /// being removed, tolerating page refreshes.
    pub cleanup_grace_ms: u64,
    /// Delay between a user session losing its last browser session and the
    /// user session itself being reclaimed.
    pub user_linger_ms: u64,
    /// Base URL advertised to clients for the websocket endpoint.
    pub base_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("MONITOR_HUB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            cleanup_grace_ms: env::var("CLEANUP_GRACE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5_000),
            user_linger_ms: env::var("USER_LINGER_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5_000),
            base_url: env::var("MONITOR_HUB_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            cleanup_grace_ms: 5_000,
            user_linger_ms: 5_000,
            base_url: "http://localhost:8080".to_string(),
        }
    }
}
