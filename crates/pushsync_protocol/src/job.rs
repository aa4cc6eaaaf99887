//! Persisted intent records.
//!
//! Jobs are stored in the durable queue as a CBOR envelope:
//!
//! ```text
//! { "schema": u16, "job": { "type": "<Kind>", ...fields } }
//! ```
//!
//! Every field is optional on decode so records written by an older build
//! still load. Records from a newer schema are rejected with
//! [`ProtocolError::UnsupportedSchema`] and left to the caller to skip.

use crate::error::{ProtocolError, ProtocolResult};
use crate::interest::{validate_interest, validate_interests, InterestSet};
use crate::metadata::DeviceMetadata;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current job schema version.
pub const JOB_SCHEMA_VERSION: u16 = 1;

/// A state-changing intent accepted from the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Job {
    /// Register the device with a push token.
    Start {
        /// Push token to register.
        #[serde(default)]
        token: String,
        /// Device ids this installation used before, so the directory can
        /// carry their interests over.
        #[serde(default, rename = "knownPriorIds")]
        known_prior_ids: Vec<String>,
    },
    /// The push token changed.
    RefreshToken {
        /// Replacement token.
        #[serde(default, rename = "newToken")]
        new_token: String,
    },
    /// Add one interest.
    Subscribe {
        /// Interest name.
        #[serde(default)]
        name: String,
    },
    /// Remove one interest.
    Unsubscribe {
        /// Interest name.
        #[serde(default)]
        name: String,
    },
    /// Replace the whole interest set.
    SetSubscriptions {
        /// The new set.
        #[serde(default)]
        interests: InterestSet,
    },
    /// The host application booted; reconcile metadata and interests.
    ApplicationStart {
        /// Versions the application is running with.
        #[serde(default)]
        metadata: DeviceMetadata,
    },
    /// Bind the device to a user.
    SetUserId {
        /// User to bind.
        #[serde(default, rename = "userId")]
        user_id: String,
    },
    /// Unregister the device and forget all state.
    Stop,
}

/// Discriminant of a [`Job`], for logging and matching without payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// [`Job::Start`]
    Start,
    /// [`Job::RefreshToken`]
    RefreshToken,
    /// [`Job::Subscribe`]
    Subscribe,
    /// [`Job::Unsubscribe`]
    Unsubscribe,
    /// [`Job::SetSubscriptions`]
    SetSubscriptions,
    /// [`Job::ApplicationStart`]
    ApplicationStart,
    /// [`Job::SetUserId`]
    SetUserId,
    /// [`Job::Stop`]
    Stop,
}

impl JobKind {
    /// Returns the stable tag used in the persisted record.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "Start",
            Self::RefreshToken => "RefreshToken",
            Self::Subscribe => "Subscribe",
            Self::Unsubscribe => "Unsubscribe",
            Self::SetSubscriptions => "SetSubscriptions",
            Self::ApplicationStart => "ApplicationStart",
            Self::SetUserId => "SetUserId",
            Self::Stop => "Stop",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    schema: u16,
    job: &'a Job,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    schema: u16,
    job: Job,
}

#[derive(Deserialize)]
struct SchemaProbe {
    #[serde(default)]
    schema: u16,
}

impl Job {
    /// Returns the discriminant of this job.
    #[must_use]
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Start { .. } => JobKind::Start,
            Self::RefreshToken { .. } => JobKind::RefreshToken,
            Self::Subscribe { .. } => JobKind::Subscribe,
            Self::Unsubscribe { .. } => JobKind::Unsubscribe,
            Self::SetSubscriptions { .. } => JobKind::SetSubscriptions,
            Self::ApplicationStart { .. } => JobKind::ApplicationStart,
            Self::SetUserId { .. } => JobKind::SetUserId,
            Self::Stop => JobKind::Stop,
        }
    }

    /// Returns true for jobs that only touch the interest set.
    #[must_use]
    pub fn is_interest_change(&self) -> bool {
        matches!(
            self,
            Self::Subscribe { .. } | Self::Unsubscribe { .. } | Self::SetSubscriptions { .. }
        )
    }

    /// Checks the interest names or user id carried by this job.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidInterest`] for the first bad name,
    /// or [`ProtocolError::InvalidUserId`] for an empty user id.
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            Self::Subscribe { name } | Self::Unsubscribe { name } => validate_interest(name),
            Self::SetSubscriptions { interests } => validate_interests(interests),
            Self::SetUserId { user_id } if user_id.is_empty() => {
                Err(ProtocolError::InvalidUserId {
                    user_id: user_id.clone(),
                    reason: "must not be empty".into(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Applies an interest change to `interests`.
    ///
    /// Returns true if the set changed. Jobs that are not interest changes
    /// leave the set alone and return false.
    pub fn apply_to(&self, interests: &mut InterestSet) -> bool {
        match self {
            Self::Subscribe { name } => interests.insert(name.clone()),
            Self::Unsubscribe { name } => interests.remove(name),
            Self::SetSubscriptions { interests: next } => {
                if interests == next {
                    false
                } else {
                    interests.clone_from(next);
                    true
                }
            }
            _ => false,
        }
    }

    /// Encodes the job into a versioned CBOR envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let envelope = EnvelopeRef {
            schema: JOB_SCHEMA_VERSION,
            job: self,
        };
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&envelope, &mut buf)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes a job from its CBOR envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnsupportedSchema`] for records written by a
    /// newer build, or [`ProtocolError::Decode`] for malformed bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let probe: SchemaProbe =
            ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        if probe.schema > JOB_SCHEMA_VERSION {
            return Err(ProtocolError::UnsupportedSchema {
                found: probe.schema,
                supported: JOB_SCHEMA_VERSION,
            });
        }

        let envelope: Envelope =
            ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        debug_assert!(envelope.schema <= JOB_SCHEMA_VERSION);
        Ok(envelope.job)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribe { name } | Self::Unsubscribe { name } => {
                write!(f, "{}({name})", self.kind())
            }
            Self::SetSubscriptions { interests } => {
                write!(f, "{}({} interests)", self.kind(), interests.len())
            }
            Self::SetUserId { user_id } => write!(f, "{}({user_id})", self.kind()),
            Self::ApplicationStart { metadata } => write!(f, "{}({metadata})", self.kind()),
            _ => write!(f, "{}", self.kind()),
        }
    }
}
