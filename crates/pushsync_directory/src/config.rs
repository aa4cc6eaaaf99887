//! Directory configuration.

/// Configuration for the reference directory.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of devices one user may be bound to.
    pub max_devices_per_user: usize,
    /// Secret used to sign user bearer tokens.
    pub auth_secret: Vec<u8>,
}

impl ServerConfig {
    /// Creates a configuration signing tokens with `auth_secret`.
    pub fn new(auth_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            max_devices_per_user: 10,
            auth_secret: auth_secret.into(),
        }
    }

    /// Sets the per-user device limit.
    pub fn with_max_devices_per_user(mut self, max: usize) -> Self {
        self.max_devices_per_user = max;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(b"pushsync-directory-development-secret".to_vec())
    }
}
