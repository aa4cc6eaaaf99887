//! # pushsync directory
//!
//! In-memory reference implementation of the device-directory service the
//! pushsync engine talks to.
//!
//! This crate provides:
//! - Request routing for every directory endpoint
//! - Device records with interests, metadata and user binding
//! - HMAC-SHA256 user bearer tokens
//! - Fault injection (`fail_next`, `forget_device`) for failure tests
//!
//! # Example
//!
//! ```rust,ignore
//! use pushsync_directory::{DirectoryServer, ServerConfig};
//!
//! let server = DirectoryServer::new(ServerConfig::default().with_max_devices_per_user(3));
//! let bearer = server.token_for("alice");
//!
//! // Route HttpRequests from the engine's HttpDirectory to server.handle().
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod config;
mod error;
mod server;

pub use auth::TokenIssuer;
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::{DeviceRecord, DirectoryServer};
