//! # pushsync protocol
//!
//! Data types shared by the pushsync engine and the reference device
//! directory.
//!
//! This crate provides:
//! - [`Job`], the persisted intent record, and its versioned CBOR codec
//! - Interest-name validation and the confirmed-set content hash
//! - [`DeviceMetadata`]
//! - JSON wire types and endpoint routing for the device-directory API
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod error;
mod interest;
mod job;
mod metadata;
mod wire;

pub use error::{ProtocolError, ProtocolResult};
pub use interest::{
    interests_hash, validate_interest, validate_interests, InterestSet, MAX_INTEREST_LENGTH,
};
pub use job::{Job, JobKind, JOB_SCHEMA_VERSION};
pub use metadata::DeviceMetadata;
pub use wire::{
    Endpoint, ErrorBody, HttpMethod, HttpRequest, HttpResponse, RefreshTokenRequest,
    RegisterRequest, RegisterResponse, SetSubscriptionsRequest,
};
