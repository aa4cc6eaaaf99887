//! Device metadata reported to the directory.

use serde::{Deserialize, Serialize};
use std::fmt;

/// SDK and OS versions of the device.
///
/// The engine remembers the last value the directory accepted and re-sends
/// it on application start whenever the running versions differ.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceMetadata {
    /// Version of the embedding SDK.
    pub sdk_version: String,
    /// Version of the host operating system.
    pub os_version: String,
}

impl DeviceMetadata {
    /// Creates metadata from the two version strings.
    pub fn new(sdk_version: impl Into<String>, os_version: impl Into<String>) -> Self {
        Self {
            sdk_version: sdk_version.into(),
            os_version: os_version.into(),
        }
    }
}

impl fmt::Display for DeviceMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sdk {} / os {}", self.sdk_version, self.os_version)
    }
}
