//! # TideSync Server
//!
//! HTTP endpoint for a TideSync server store.
//!
//! This crate provides:
//! - [`WebServerOrchestrator`], dispatching the three sync endpoints
//! - Per-client sessions buffering multi-part uploads and downloads
//! - Authentication (HMAC-SHA256 tokens)
//! - [`Interceptors`] observing requests, responses and parts
//!
//! # Authentication
//!
//! Authentication is optional:
//!
//! ```rust,ignore
//! use tidesync_server::{ServerConfig, WebServerOrchestrator};
//!
//! let config = ServerConfig::new().with_auth(b"my-secure-secret".to_vec());
//! let web = WebServerOrchestrator::new(server, config);
//!
//! // Hand tokens to clients, which send them in the `tidesync-token` header.
//! let token = web.token_validator().unwrap().create_token(user_id)?;
//! ```
//!
//! # Endpoints
//!
//! - `/sync/scope`: provisions or loads the server scope
//! - `/sync/changes`: uploads one client part; the last one returns the
//!   first server part
//! - `/sync/changes/more`: fetches the remaining server parts

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod interceptors;
mod web;

pub use auth::{AuthConfig, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use interceptors::{ChangesArgs, HttpContext, Interceptors, MessageArgs};
pub use web::WebServerOrchestrator;
