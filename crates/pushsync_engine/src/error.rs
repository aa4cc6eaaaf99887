//! Error types for the sync engine.

use pushsync_protocol::ProtocolError;
use pushsync_storage::StorageError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for directory calls.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors surfaced to callers of the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The device is already bound to a different user.
    #[error("device is bound to user {bound:?}, cannot bind {requested:?}")]
    IdentityConflict {
        /// User the device is (or will be) bound to.
        bound: String,
        /// User the caller asked for.
        requested: String,
    },

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

    /// Durable storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A record could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// Persisted device state is unreadable.
    #[error("corrupt device state: {0}")]
    CorruptState(String),

    /// A directory call failed.
    #[error("directory error: {0}")]
    Api(#[from] ApiError),

    /// The worker thread is gone.
    #[error("sync worker stopped")]
    WorkerStopped,

    /// The queue did not drain in time.
    #[error("timed out waiting for the job queue to drain")]
    Timeout,
}

impl From<ProtocolError> for EngineError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidInterest { name, reason } => {
                EngineError::InvalidInterest { name, reason }
            }
            ProtocolError::InvalidUserId { user_id, reason } => {
                EngineError::InvalidUserId { user_id, reason }
            }
            other => EngineError::Protocol(other),
        }
    }
}

/// Outcome of a failed directory call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The device id is unknown to the directory (404).
    #[error("device not found")]
    DeviceNotFound,

    /// The request was rejected as malformed (400 and other 4xx).
    #[error("bad request ({status}): {reason}")]
    BadRequest {
        /// Status code.
        status: u16,
        /// Reason given by the directory.
        reason: String,
    },

    /// The user already has too many devices (422).
    #[error("too many devices: {0}")]
    TooManyDevices(String),

    /// The user bearer token was refused (401/403).
    #[error("token rejected ({status}): {reason}")]
    TokenRejected {
        /// Status code.
        status: u16,
        /// Reason given by the directory.
        reason: String,
    },

    /// The directory failed (5xx).
    #[error("server error ({status}): {reason}")]
    Server {
        /// Status code.
        status: u16,
        /// Reason given by the directory.
        reason: String,
    },

    /// The request never got a response.
    #[error("network error: {0}")]
    Network(String),

    /// A 2xx response body could not be understood.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the last attempt.
        source: Box<ApiError>,
    },
}

impl ApiError {
    /// Classifies a non-2xx status.
    pub fn from_status(status: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match status {
            404 => ApiError::DeviceNotFound,
            422 => ApiError::TooManyDevices(reason),
            401 | 403 => ApiError::TokenRejected { status, reason },
            500..=599 => ApiError::Server { status, reason },
            _ => ApiError::BadRequest { status, reason },
        }
    }

    /// Returns true if the call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Server { .. } | ApiError::Network(_))
    }

    /// Returns true if the device record no longer exists.
    pub fn is_device_not_found(&self) -> bool {
        matches!(self, ApiError::DeviceNotFound)
    }

    /// The error of the last attempt, looking through [`ApiError::Exhausted`].
    pub fn root(&self) -> &ApiError {
        match self {
            ApiError::Exhausted { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(ApiError::from_status(404, "x"), ApiError::DeviceNotFound);
        assert!(matches!(
            ApiError::from_status(422, "x"),
            ApiError::TooManyDevices(_)
        ));
        assert!(matches!(
            ApiError::from_status(401, "x"),
            ApiError::TokenRejected { status: 401, .. }
        ));
        assert!(matches!(
            ApiError::from_status(403, "x"),
            ApiError::TokenRejected { status: 403, .. }
        ));
        assert!(matches!(
            ApiError::from_status(400, "x"),
            ApiError::BadRequest { status: 400, .. }
        ));
        assert!(matches!(
            ApiError::from_status(409, "x"),
            ApiError::BadRequest { status: 409, .. }
        ));
        assert!(matches!(
            ApiError::from_status(503, "x"),
            ApiError::Server { status: 503, .. }
        ));
    }

    #[test]
    fn retryable_errors() {
        assert!(ApiError::Network("connection reset".into()).is_retryable());
        assert!(ApiError::from_status(500, "boom").is_retryable());
        assert!(!ApiError::from_status(400, "bad").is_retryable());
        assert!(!ApiError::from_status(422, "limit").is_retryable());
        assert!(!ApiError::DeviceNotFound.is_retryable());

        let exhausted = ApiError::Exhausted {
            attempts: 4,
            source: Box::new(ApiError::Network("down".into())),
        };
        assert!(!exhausted.is_retryable());
        assert_eq!(exhausted.root(), &ApiError::Network("down".into()));
    }

    #[test]
    fn validation_errors_convert_to_their_own_variants() {
        let err: EngineError = ProtocolError::InvalidInterest {
            name: "a b".into(),
            reason: "space".into(),
        }
        .into();
        assert!(matches!(err, EngineError::InvalidInterest { .. }));

        let err: EngineError = ProtocolError::InvalidUserId {
            user_id: String::new(),
            reason: "empty".into(),
        }
        .into();
        assert!(matches!(err, EngineError::InvalidUserId { .. }));

        let err: EngineError = ProtocolError::Decode("eof".into()).into();
        assert!(matches!(err, EngineError::Protocol(_)));
    }

    #[test]
    fn error_display() {
        let err = EngineError::IdentityConflict {
            bound: "alice".into(),
            requested: "bob".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("alice"));
        assert!(msg.contains("bob"));
    }
}
