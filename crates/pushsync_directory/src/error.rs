//! Error types for the reference directory.

use pushsync_protocol::HttpResponse;
use thiserror::Error;

/// Result type for directory operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors the directory answers requests with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Malformed request body or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Interest name rejected.
    #[error("invalid interest: {0}")]
    InvalidInterest(String),

    /// Bearer token missing or not issued by this directory.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// No device with this id.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// No route for this method and path.
    #[error("no route for {0}")]
    RouteNotFound(String),

    /// The user already has the maximum number of devices.
    #[error("user {user} already has {limit} devices")]
    TooManyDevices {
        /// User id.
        user: String,
        /// Configured limit.
        limit: usize,
    },

    /// A failure scheduled with `fail_next`.
    #[error("injected failure with status {0}")]
    Injected(u16),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// HTTP status code for this error.
    pub fn status(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::InvalidInterest(_) => 400,
            ServerError::NotAuthorized(_) => 401,
            ServerError::DeviceNotFound(_) | ServerError::RouteNotFound(_) => 404,
            ServerError::TooManyDevices { .. } => 422,
            ServerError::Injected(status) => *status,
            ServerError::Internal(_) => 500,
        }
    }

    /// Short error code placed in the response body.
    fn code(&self) -> &'static str {
        match self {
            ServerError::InvalidRequest(_) => "Invalid request",
            ServerError::InvalidInterest(_) => "Invalid interest",
            ServerError::NotAuthorized(_) => "Unauthorized",
            ServerError::DeviceNotFound(_) => "Device not found",
            ServerError::RouteNotFound(_) => "Not found",
            ServerError::TooManyDevices { .. } => "Too many devices",
            ServerError::Injected(_) => "Injected failure",
            ServerError::Internal(_) => "Internal error",
        }
    }

    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status() >= 500
    }

    /// Renders the error as a response with an `{error, description}` body.
    pub fn to_response(&self) -> HttpResponse {
        HttpResponse::error(self.status(), self.code(), self.to_string())
    }
}

impl From<pushsync_protocol::ProtocolError> for ServerError {
    fn from(err: pushsync_protocol::ProtocolError) -> Self {
        match err {
            pushsync_protocol::ProtocolError::InvalidInterest { .. } => {
                ServerError::InvalidInterest(err.to_string())
            }
            other => ServerError::InvalidRequest(other.to_string()),
        }
    }
}
