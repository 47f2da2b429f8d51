//! Authentication support for the sync server.
//!
//! Tokens are signed with HMAC-SHA256 and carry their issue time for
//! expiration checking.
//!
//! ## Token Format
//!
//! Tokens are composed of:
//! - 16 bytes: subject id (a user or device)
//! - 8 bytes: issue time (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 signature
//!
//! Total: 56 bytes, hex-encoded for transport in the token header.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const SIGNED_LEN: usize = 24;
const TOKEN_LEN: usize = SIGNED_LEN + 32;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and checks tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Creates a hex-encoded token for `subject`.
    pub fn create_token(&self, subject: Uuid) -> ServerResult<String> {
        self.create_token_at(subject, now_millis())
    }

    fn create_token_at(&self, subject: Uuid, issued_at: u64) -> ServerResult<String> {
        let mut token = Vec::with_capacity(TOKEN_LEN);
        token.extend_from_slice(subject.as_bytes());
        token.extend_from_slice(&issued_at.to_be_bytes());

        let signature = self.mac(&token)?.finalize().into_bytes();
        token.extend_from_slice(&signature);
        Ok(hex::encode(token))
    }

    /// Validates a token and returns its subject.
    pub fn validate_token(&self, token: &str) -> ServerResult<Uuid> {
        let bytes = hex::decode(token.trim())
            .map_err(|_| ServerError::NotAuthenticated("malformed token".into()))?;
        if bytes.len() != TOKEN_LEN {
            return Err(ServerError::NotAuthenticated("invalid token length".into()));
        }

        let (signed, signature) = bytes.split_at(SIGNED_LEN);
        self.mac(signed)?
            .verify_slice(signature)
            .map_err(|_| ServerError::NotAuthenticated("invalid signature".into()))?;

        let (subject, issued_at) = signed.split_at(16);
        let subject = Uuid::from_slice(subject)
            .map_err(|_| ServerError::NotAuthenticated("malformed token".into()))?;
        let mut stamp = [0u8; 8];
        stamp.copy_from_slice(issued_at);
        let issued_at = u64::from_be_bytes(stamp);

        let expiry_millis = self.config.token_expiry.as_millis() as u64;
        if now_millis() > issued_at.saturating_add(expiry_millis) {
            return Err(ServerError::NotAuthenticated("token expired".into()));
        }

        Ok(subject)
    }

    fn mac(&self, data: &[u8]) -> ServerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("invalid auth secret: {e}")))?;
        mac.update(data);
        Ok(mac)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
