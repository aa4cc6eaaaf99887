//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while validating or encoding protocol data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// An interest name breaks the naming rules.
    #[error("invalid interest {name:?}: {reason}")]
    InvalidInterest {
        /// The offending name.
        name: String,
        /// Which rule it breaks.
        reason: String,
    },

    /// A user id is not usable for a binding.
    #[error("invalid user id {user_id:?}: {reason}")]
    InvalidUserId {
        /// The offending id.
        user_id: String,
        /// Which rule it breaks.
        reason: String,
    },

    /// A job record could not be encoded.
    #[error("failed to encode job: {0}")]
    Encode(String),

    /// A job record could not be decoded.
    #[error("failed to decode job: {0}")]
    Decode(String),

    /// A job record was written by a newer schema.
    #[error("unsupported job schema {found}, this build reads up to {supported}")]
    UnsupportedSchema {
        /// Schema version found in the record.
        found: u16,
        /// Highest schema version this build understands.
        supported: u16,
    },

    /// A JSON wire body could not be (de)serialized.
    #[error("malformed wire body: {0}")]
    Wire(String),
}

impl ProtocolError {
    pub(crate) fn invalid_interest(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidInterest {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Wire(err.to_string())
    }
}
