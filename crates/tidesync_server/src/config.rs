//! Server configuration.

use std::time::Duration;

/// Configuration for the web server orchestrator.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Idle time after which a client session is dropped.
    pub session_ttl: Duration,
    /// Maximum number of rows accepted in one uploaded part.
    pub max_part_rows: usize,
    /// Whether to require authentication.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
    /// Lifetime of issued tokens.
    pub token_expiry: Duration,
}

impl ServerConfig {
    /// Creates a configuration with default limits and no authentication.
    pub fn new() -> Self {
        Self {
            session_ttl: Duration::from_secs(10 * 60),
            max_part_rows: 50_000,
            require_auth: false,
            auth_secret: None,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the session idle time.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Sets the maximum rows per uploaded part.
    pub fn with_max_part_rows(mut self, rows: usize) -> Self {
        self.max_part_rows = rows;
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
