//! JSON wire types and endpoint routing for the device-directory API.
//!
//! All device routes live under `/instances/{instance}/devices/fcm`.

use crate::error::ProtocolResult;
use crate::interest::InterestSet;
use crate::metadata::DeviceMetadata;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// HTTP method of a directory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        })
    }
}

/// A request handed to an HTTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL, or a bare path for in-process routing.
    pub url: String,
    /// Bearer token for the `Authorization` header.
    pub bearer: Option<String>,
    /// Extra headers, in the order they were added.
    pub headers: Vec<(String, String)>,
    /// JSON body, empty when the route takes none.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Creates a request without a body.
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            bearer: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Attaches a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ProtocolError::Wire`] if the value cannot be serialized.
    pub fn with_json<T: Serialize>(mut self, value: &T) -> ProtocolResult<Self> {
        self.body = serde_json::to_vec(value)?;
        Ok(self)
    }

    /// Attaches a bearer token.
    #[must_use]
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ProtocolError::Wire`] for malformed bodies.
    pub fn json<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// A response returned by an HTTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A response with no body.
    #[must_use]
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }

    /// A response with a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ProtocolError::Wire`] if the value cannot be serialized.
    pub fn json<T: Serialize>(status: u16, value: &T) -> ProtocolResult<Self> {
        Ok(Self {
            status,
            body: serde_json::to_vec(value)?,
        })
    }

    /// An error response carrying an [`ErrorBody`].
    pub fn error(status: u16, error: impl Into<String>, description: impl Into<String>) -> Self {
        let body = ErrorBody {
            error: error.into(),
            description: description.into(),
        };
        // ErrorBody is two strings; serialization cannot fail.
        Self {
            status,
            body: serde_json::to_vec(&body).unwrap_or_default(),
        }
    }

    /// Returns true for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ProtocolError::Wire`] for malformed bodies.
    pub fn parse<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Human-readable reason for a failed response.
    ///
    /// Uses the [`ErrorBody`] when present, otherwise a generic message.
    #[must_use]
    pub fn reason(&self) -> String {
        match self.parse::<ErrorBody>() {
            Ok(body) if !body.description.is_empty() => {
                format!("{}: {}", body.error, body.description)
            }
            Ok(body) if !body.error.is_empty() => body.error,
            _ => format!("unexpected response (status {})", self.status),
        }
    }
}

/// Register a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Push token.
    pub token: String,
    /// Ids this installation registered under before.
    #[serde(default)]
    pub known_previous_client_ids: Vec<String>,
    /// Device metadata.
    #[serde(default)]
    pub metadata: DeviceMetadata,
}

/// Response to [`RegisterRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    /// Assigned device id.
    pub id: String,
    /// Interests the directory already holds for this installation.
    #[serde(default)]
    pub initial_interest_set: InterestSet,
}

/// Replace the push token of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRequest {
    /// New push token.
    pub token: String,
}

/// Replace the interest set of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSubscriptionsRequest {
    /// Full interest set.
    pub interests: InterestSet,
}

/// Body of a non-2xx response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorBody {
    /// Short error code.
    pub error: String,
    /// Longer explanation.
    pub description: String,
}

/// A routed directory operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `POST /instances/{i}/devices/fcm`
    Register {
        /// Instance id.
        instance: String,
    },
    /// `PUT …/{device}/token`
    RefreshToken {
        /// Instance id.
        instance: String,
        /// Device id.
        device: String,
    },
    /// `POST …/{device}/interests/{interest}`
    Subscribe {
        /// Instance id.
        instance: String,
        /// Device id.
        device: String,
        /// Interest name.
        interest: String,
    },
    /// `DELETE …/{device}/interests/{interest}`
    Unsubscribe {
        /// Instance id.
        instance: String,
        /// Device id.
        device: String,
        /// Interest name.
        interest: String,
    },
    /// `PUT …/{device}/interests`
    SetSubscriptions {
        /// Instance id.
        instance: String,
        /// Device id.
        device: String,
    },
    /// `PUT …/{device}/metadata`
    SetMetadata {
        /// Instance id.
        instance: String,
        /// Device id.
        device: String,
    },
    /// `PUT …/{device}/user`
    SetUser {
        /// Instance id.
        instance: String,
        /// Device id.
        device: String,
    },
    /// `DELETE …/{device}`
    Delete {
        /// Instance id.
        instance: String,
        /// Device id.
        device: String,
    },
}

impl Endpoint {
    /// Method this endpoint is served under.
    #[must_use]
    pub fn method(&self) -> HttpMethod {
        match self {
            Self::Register { .. } | Self::Subscribe { .. } => HttpMethod::Post,
            Self::RefreshToken { .. }
            | Self::SetSubscriptions { .. }
            | Self::SetMetadata { .. }
            | Self::SetUser { .. } => HttpMethod::Put,
            Self::Unsubscribe { .. } | Self::Delete { .. } => HttpMethod::Delete,
        }
    }

    /// Path of this endpoint, starting at `/instances/`.
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            Self::Register { instance } => format!("/instances/{instance}/devices/fcm"),
            Self::RefreshToken { instance, device } => {
                format!("/instances/{instance}/devices/fcm/{device}/token")
            }
            Self::Subscribe {
                instance,
                device,
                interest,
            }
            | Self::Unsubscribe {
                instance,
                device,
                interest,
            } => format!("/instances/{instance}/devices/fcm/{device}/interests/{interest}"),
            Self::SetSubscriptions { instance, device } => {
                format!("/instances/{instance}/devices/fcm/{device}/interests")
            }
            Self::SetMetadata { instance, device } => {
                format!("/instances/{instance}/devices/fcm/{device}/metadata")
            }
            Self::SetUser { instance, device } => {
                format!("/instances/{instance}/devices/fcm/{device}/user")
            }
            Self::Delete { instance, device } => {
                format!("/instances/{instance}/devices/fcm/{device}")
            }
        }
    }

    /// Device id targeted by this endpoint, if it is device-scoped.
    #[must_use]
    pub fn device(&self) -> Option<&str> {
        match self {
            Self::Register { .. } => None,
            Self::RefreshToken { device, .. }
            | Self::Subscribe { device, .. }
            | Self::Unsubscribe { device, .. }
            | Self::SetSubscriptions { device, .. }
            | Self::SetMetadata { device, .. }
            | Self::SetUser { device, .. }
            | Self::Delete { device, .. } => Some(device),
        }
    }

    /// Routes a method and URL to an endpoint.
    ///
    /// Anything before `/instances/` (scheme, host, base path) is ignored, as
    /// is a query string.
    #[must_use]
    pub fn parse(method: HttpMethod, url: &str) -> Option<Self> {
        let start = url.find("/instances/")?;
        let path = &url[start..];
        let path = path.split('?').next().unwrap_or(path);
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

        let (instance, rest) = match segments.as_slice() {
            ["instances", instance, "devices", "fcm", rest @ ..] if !instance.is_empty() => {
                ((*instance).to_string(), rest)
            }
            _ => return None,
        };

        let endpoint = match (method, rest) {
            (HttpMethod::Post, []) => Self::Register { instance },
            (HttpMethod::Put, [device, "token"]) => Self::RefreshToken {
                instance,
                device: (*device).to_string(),
            },
            (HttpMethod::Post, [device, "interests", interest]) => Self::Subscribe {
                instance,
                device: (*device).to_string(),
                interest: (*interest).to_string(),
            },
            (HttpMethod::Delete, [device, "interests", interest]) => Self::Unsubscribe {
                instance,
                device: (*device).to_string(),
                interest: (*interest).to_string(),
            },
            (HttpMethod::Put, [device, "interests"]) => Self::SetSubscriptions {
                instance,
                device: (*device).to_string(),
            },
            (HttpMethod::Put, [device, "metadata"]) => Self::SetMetadata {
                instance,
                device: (*device).to_string(),
            },
            (HttpMethod::Put, [device, "user"]) => Self::SetUser {
                instance,
                device: (*device).to_string(),
            },
            (HttpMethod::Delete, [device]) => Self::Delete {
                instance,
                device: (*device).to_string(),
            },
            _ => return None,
        };

        if endpoint.device().is_some_and(str::is_empty) {
            return None;
        }
        Some(endpoint)
    }
}
