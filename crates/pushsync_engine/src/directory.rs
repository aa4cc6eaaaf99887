//! Device directory abstraction and the retrying client.

use crate::config::RetryConfig;
use crate::error::{ApiError, ApiResult};
use pushsync_protocol::{DeviceMetadata, InterestSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Id the directory assigned to the device.
    pub device_id: String,
    /// Interests the directory already holds for this installation.
    pub initial_interests: InterestSet,
}

/// The remote device directory.
///
/// Each method is one logical call. Implementations classify failures with
/// [`ApiError::from_status`] and report transport failures as
/// [`ApiError::Network`]; they never retry.
pub trait DirectoryApi: Send + Sync {
    /// Registers a device.
    fn register(
        &self,
        token: &str,
        known_prior_ids: &[String],
        metadata: &DeviceMetadata,
    ) -> ApiResult<Registration>;

    /// Replaces the push token of a device.
    fn refresh_token(&self, device_id: &str, token: &str) -> ApiResult<()>;

    /// Adds one interest.
    fn subscribe(&self, device_id: &str, interest: &str) -> ApiResult<()>;

    /// Removes one interest.
    fn unsubscribe(&self, device_id: &str, interest: &str) -> ApiResult<()>;

    /// Replaces the whole interest set.
    fn replace_subscriptions(&self, device_id: &str, interests: &InterestSet) -> ApiResult<()>;

    /// Reports device metadata.
    fn set_metadata(&self, device_id: &str, metadata: &DeviceMetadata) -> ApiResult<()>;

    /// Binds the device to the user the bearer token was minted for.
    fn set_user(&self, device_id: &str, bearer_token: &str) -> ApiResult<()>;

    /// Deletes the device.
    fn delete(&self, device_id: &str) -> ApiResult<()>;
}

impl<T: DirectoryApi + ?Sized> DirectoryApi for Arc<T> {
    fn register(
        &self,
        token: &str,
        known_prior_ids: &[String],
        metadata: &DeviceMetadata,
    ) -> ApiResult<Registration> {
        (**self).register(token, known_prior_ids, metadata)
    }

    fn refresh_token(&self, device_id: &str, token: &str) -> ApiResult<()> {
        (**self).refresh_token(device_id, token)
    }

    fn subscribe(&self, device_id: &str, interest: &str) -> ApiResult<()> {
        (**self).subscribe(device_id, interest)
    }

    fn unsubscribe(&self, device_id: &str, interest: &str) -> ApiResult<()> {
        (**self).unsubscribe(device_id, interest)
    }

    fn replace_subscriptions(&self, device_id: &str, interests: &InterestSet) -> ApiResult<()> {
        (**self).replace_subscriptions(device_id, interests)
    }

    fn set_metadata(&self, device_id: &str, metadata: &DeviceMetadata) -> ApiResult<()> {
        (**self).set_metadata(device_id, metadata)
    }

    fn set_user(&self, device_id: &str, bearer_token: &str) -> ApiResult<()> {
        (**self).set_user(device_id, bearer_token)
    }

    fn delete(&self, device_id: &str) -> ApiResult<()> {
        (**self).delete(device_id)
    }
}

/// Wraps a [`DirectoryApi`] with bounded exponential backoff.
///
/// Only [`ApiError::is_retryable`] failures are repeated. Backoff sleeps on
/// the calling thread. When the last attempt still fails with a retryable
/// error the result is [`ApiError::Exhausted`].
pub struct RetryingClient<A> {
    api: A,
    retry: RetryConfig,
}

impl<A: DirectoryApi> RetryingClient<A> {
    /// Creates a client retrying per `retry`.
    pub fn new(api: A, retry: RetryConfig) -> Self {
        Self { api, retry }
    }

    /// The wrapped directory.
    pub fn api(&self) -> &A {
        &self.api
    }

    /// Runs `call` with retries.
    pub fn with_retry<T, F>(&self, operation: &str, mut call: F) -> ApiResult<T>
    where
        F: FnMut(&A) -> ApiResult<T>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match call(&self.api) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(operation, attempt, ?delay, error = %err, "retrying directory call");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) if err.is_retryable() => {
                    warn!(operation, attempts = attempt, error = %err, "directory call exhausted retries");
                    return Err(ApiError::Exhausted {
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs `call` once.
    pub fn once<T, F>(&self, call: F) -> ApiResult<T>
    where
        F: FnOnce(&A) -> ApiResult<T>,
    {
        call(&self.api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDirectory, Op};
    use std::time::Duration;

    fn fast_retry() -> RetryConfig {
        RetryConfig::default()
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2))
    }

    #[test]
    fn success_needs_one_call() {
        let mock = Arc::new(MockDirectory::new());
        let client = RetryingClient::new(Arc::clone(&mock), fast_retry());
        client
            .with_retry("subscribe", |api| api.subscribe("d", "a"))
            .unwrap();
        assert_eq!(mock.call_count(), 1);
    }

    #[test]
    fn server_errors_are_retried_until_success() {
        let mock = Arc::new(MockDirectory::new());
        mock.fail_next(Op::Subscribe, ApiError::from_status(500, "boom"));
        mock.fail_next(Op::Subscribe, ApiError::Network("reset".into()));
        let client = RetryingClient::new(Arc::clone(&mock), fast_retry());

        client
            .with_retry("subscribe", |api| api.subscribe("d", "a"))
            .unwrap();
        assert_eq!(mock.call_count(), 3);
    }

    #[test]
    fn retries_are_bounded() {
        let mock = Arc::new(MockDirectory::new());
        for _ in 0..10 {
            mock.fail_next(Op::Subscribe, ApiError::from_status(503, "busy"));
        }
        let client = RetryingClient::new(Arc::clone(&mock), fast_retry());

        let err = client
            .with_retry("subscribe", |api| api.subscribe("d", "a"))
            .unwrap_err();
        assert!(matches!(err, ApiError::Exhausted { attempts: 4, .. }));
        assert_eq!(mock.call_count(), 4);
    }

    #[test]
    fn client_errors_are_not_retried() {
        for status in [400, 401, 404, 422] {
            let mock = Arc::new(MockDirectory::new());
            mock.fail_next(Op::Subscribe, ApiError::from_status(status, "no"));
            let client = RetryingClient::new(Arc::clone(&mock), fast_retry());

            let err = client
                .with_retry("subscribe", |api| api.subscribe("d", "a"))
                .unwrap_err();
            assert!(!err.is_retryable());
            assert!(!matches!(err, ApiError::Exhausted { .. }));
            assert_eq!(mock.call_count(), 1, "status {status}");
        }
    }

    #[test]
    fn once_never_retries() {
        let mock = Arc::new(MockDirectory::new());
        mock.fail_next(Op::SetMetadata, ApiError::from_status(500, "boom"));
        let client = RetryingClient::new(Arc::clone(&mock), fast_retry());

        let err = client
            .once(|api| api.set_metadata("d", &DeviceMetadata::default()))
            .unwrap_err();
        assert!(matches!(err, ApiError::Server { status: 500, .. }));
        assert_eq!(mock.call_count(), 1);
    }
}
