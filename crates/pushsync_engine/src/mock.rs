//! A scriptable in-memory directory for tests.

use crate::directory::{DirectoryApi, Registration};
use crate::error::{ApiError, ApiResult};
use parking_lot::Mutex;
use pushsync_protocol::{DeviceMetadata, InterestSet};
use std::collections::{HashMap, HashSet, VecDeque};

/// Directory operation, used to script failures and inspect calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// [`DirectoryApi::register`]
    Register,
    /// [`DirectoryApi::refresh_token`]
    RefreshToken,
    /// [`DirectoryApi::subscribe`]
    Subscribe,
    /// [`DirectoryApi::unsubscribe`]
    Unsubscribe,
    /// [`DirectoryApi::replace_subscriptions`]
    ReplaceSubscriptions,
    /// [`DirectoryApi::set_metadata`]
    SetMetadata,
    /// [`DirectoryApi::set_user`]
    SetUser,
    /// [`DirectoryApi::delete`]
    Delete,
}

/// One recorded call with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `register`
    Register {
        /// Token sent.
        token: String,
        /// Prior ids sent.
        known_prior_ids: Vec<String>,
        /// Metadata sent.
        metadata: DeviceMetadata,
    },
    /// `refresh_token`
    RefreshToken {
        /// Target device.
        device_id: String,
        /// Token sent.
        token: String,
    },
    /// `subscribe`
    Subscribe {
        /// Target device.
        device_id: String,
        /// Interest sent.
        interest: String,
    },
    /// `unsubscribe`
    Unsubscribe {
        /// Target device.
        device_id: String,
        /// Interest sent.
        interest: String,
    },
    /// `replace_subscriptions`
    ReplaceSubscriptions {
        /// Target device.
        device_id: String,
        /// Set sent.
        interests: InterestSet,
    },
    /// `set_metadata`
    SetMetadata {
        /// Target device.
        device_id: String,
        /// Metadata sent.
        metadata: DeviceMetadata,
    },
    /// `set_user`
    SetUser {
        /// Target device.
        device_id: String,
        /// Bearer token sent.
        bearer_token: String,
    },
    /// `delete`
    Delete {
        /// Target device.
        device_id: String,
    },
}

impl Call {
    /// The operation this call invoked.
    pub fn op(&self) -> Op {
        match self {
            Call::Register { .. } => Op::Register,
            Call::RefreshToken { .. } => Op::RefreshToken,
            Call::Subscribe { .. } => Op::Subscribe,
            Call::Unsubscribe { .. } => Op::Unsubscribe,
            Call::ReplaceSubscriptions { .. } => Op::ReplaceSubscriptions,
            Call::SetMetadata { .. } => Op::SetMetadata,
            Call::SetUser { .. } => Op::SetUser,
            Call::Delete { .. } => Op::Delete,
        }
    }

    fn device_id(&self) -> Option<&str> {
        match self {
            Call::Register { .. } => None,
            Call::RefreshToken { device_id, .. }
            | Call::Subscribe { device_id, .. }
            | Call::Unsubscribe { device_id, .. }
            | Call::ReplaceSubscriptions { device_id, .. }
            | Call::SetMetadata { device_id, .. }
            | Call::SetUser { device_id, .. }
            | Call::Delete { device_id } => Some(device_id),
        }
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<(Call, bool)>,
    failures: HashMap<Op, VecDeque<ApiError>>,
    next_id: u64,
    initial_interests: InterestSet,
    forgotten: HashSet<String>,
    interests: HashMap<String, InterestSet>,
}

/// A mock directory for testing.
///
/// Every call is recorded. Failures are scripted per operation with
/// [`MockDirectory::fail_next`]; a device dropped with
/// [`MockDirectory::forget_device`] answers 404 to every device-scoped call.
/// Registrations hand out `device-1`, `device-2`, and so on.
#[derive(Default)]
pub struct MockDirectory {
    state: Mutex<MockState>,
}

impl MockDirectory {
    /// Creates a new mock directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the interest set returned by every registration.
    pub fn set_initial_interests(&self, interests: InterestSet) {
        self.state.lock().initial_interests = interests;
    }

    /// Makes the next call of `op` fail with `error`. Failures queue up.
    pub fn fail_next(&self, op: Op, error: ApiError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Answers 404 to every later call naming `device_id`.
    pub fn forget_device(&self, device_id: &str) {
        self.state.lock().forgotten.insert(device_id.to_string());
    }

    /// All calls made so far.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.iter().map(|(c, _)| c.clone()).collect()
    }

    /// Operations of all calls made so far, in order.
    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().calls.iter().map(|(c, _)| c.op()).collect()
    }

    /// Operations of all calls, each paired with whether it succeeded.
    pub fn outcomes(&self) -> Vec<(Op, bool)> {
        self.state
            .lock()
            .calls
            .iter()
            .map(|(c, ok)| (c.op(), *ok))
            .collect()
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Number of calls of `op` made so far.
    pub fn count(&self, op: Op) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(c, _)| c.op() == op)
            .count()
    }

    /// Forgets recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Interests the mock holds for `device_id` after successful calls.
    pub fn device_interests(&self, device_id: &str) -> Option<InterestSet> {
        self.state.lock().interests.get(device_id).cloned()
    }

    fn record<T>(&self, call: Call, apply: impl FnOnce(&mut MockState) -> T) -> ApiResult<T> {
        let mut state = self.state.lock();
        let scripted = state
            .failures
            .get_mut(&call.op())
            .and_then(VecDeque::pop_front);
        let forgotten = call
            .device_id()
            .is_some_and(|id| state.forgotten.contains(id));

        let result = match scripted {
            Some(err) => Err(err),
            None if forgotten => Err(ApiError::DeviceNotFound),
            None => Ok(apply(&mut *state)),
        };
        state.calls.push((call, result.is_ok()));
        result
    }
}

impl DirectoryApi for MockDirectory {
    fn register(
        &self,
        token: &str,
        known_prior_ids: &[String],
        metadata: &DeviceMetadata,
    ) -> ApiResult<Registration> {
        let call = Call::Register {
            token: token.to_string(),
            known_prior_ids: known_prior_ids.to_vec(),
            metadata: metadata.clone(),
        };
        self.record(call, |state| {
            state.next_id += 1;
            let device_id = format!("device-{}", state.next_id);
            let initial = state.initial_interests.clone();
            state.interests.insert(device_id.clone(), initial.clone());
            Registration {
                device_id,
                initial_interests: initial,
            }
        })
    }

    fn refresh_token(&self, device_id: &str, token: &str) -> ApiResult<()> {
        let call = Call::RefreshToken {
            device_id: device_id.to_string(),
            token: token.to_string(),
        };
        self.record(call, |_| ())
    }

    fn subscribe(&self, device_id: &str, interest: &str) -> ApiResult<()> {
        let call = Call::Subscribe {
            device_id: device_id.to_string(),
            interest: interest.to_string(),
        };
        self.record(call, |state| {
            state
                .interests
                .entry(device_id.to_string())
                .or_default()
                .insert(interest.to_string());
        })
    }

    fn unsubscribe(&self, device_id: &str, interest: &str) -> ApiResult<()> {
        let call = Call::Unsubscribe {
            device_id: device_id.to_string(),
            interest: interest.to_string(),
        };
        self.record(call, |state| {
            if let Some(set) = state.interests.get_mut(device_id) {
                set.remove(interest);
            }
        })
    }

    fn replace_subscriptions(&self, device_id: &str, interests: &InterestSet) -> ApiResult<()> {
        let call = Call::ReplaceSubscriptions {
            device_id: device_id.to_string(),
            interests: interests.clone(),
        };
        self.record(call, |state| {
            state
                .interests
                .insert(device_id.to_string(), interests.clone());
        })
    }

    fn set_metadata(&self, device_id: &str, metadata: &DeviceMetadata) -> ApiResult<()> {
        let call = Call::SetMetadata {
            device_id: device_id.to_string(),
            metadata: metadata.clone(),
        };
        self.record(call, |_| ())
    }

    fn set_user(&self, device_id: &str, bearer_token: &str) -> ApiResult<()> {
        let call = Call::SetUser {
            device_id: device_id.to_string(),
            bearer_token: bearer_token.to_string(),
        };
        self.record(call, |_| ())
    }

    fn delete(&self, device_id: &str) -> ApiResult<()> {
        let call = Call::Delete {
            device_id: device_id.to_string(),
        };
        self.record(call, |state| {
            state.interests.remove(device_id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_hands_out_sequential_ids() {
        let mock = MockDirectory::new();
        mock.set_initial_interests(["a".to_string()].into());

        let first = mock.register("t", &[], &DeviceMetadata::default()).unwrap();
        let second = mock.register("t", &[], &DeviceMetadata::default()).unwrap();
        assert_eq!(first.device_id, "device-1");
        assert_eq!(second.device_id, "device-2");
        assert!(first.initial_interests.contains("a"));
    }

    #[test]
    fn mock_scripted_failures_are_consumed_in_order() {
        let mock = MockDirectory::new();
        mock.fail_next(Op::Subscribe, ApiError::DeviceNotFound);
        mock.fail_next(Op::Subscribe, ApiError::Network("x".into()));

        assert_eq!(mock.subscribe("d", "a"), Err(ApiError::DeviceNotFound));
        assert!(matches!(mock.subscribe("d", "a"), Err(ApiError::Network(_))));
        assert!(mock.subscribe("d", "a").is_ok());
        assert!(mock.unsubscribe("d", "a").is_ok());

        assert_eq!(
            mock.outcomes(),
            vec![
                (Op::Subscribe, false),
                (Op::Subscribe, false),
                (Op::Subscribe, true),
                (Op::Unsubscribe, true)
            ]
        );
    }

    #[test]
    fn mock_forgotten_devices_answer_404() {
        let mock = MockDirectory::new();
        let reg = mock.register("t", &[], &DeviceMetadata::default()).unwrap();
        mock.forget_device(&reg.device_id);

        assert_eq!(
            mock.subscribe(&reg.device_id, "a"),
            Err(ApiError::DeviceNotFound)
        );
        assert!(mock.subscribe("other", "a").is_ok());
        assert_eq!(mock.count(Op::Subscribe), 2);
    }

    #[test]
    fn mock_tracks_device_interests() {
        let mock = MockDirectory::new();
        let reg = mock.register("t", &[], &DeviceMetadata::default()).unwrap();
        mock.subscribe(&reg.device_id, "a").unwrap();
        mock.subscribe(&reg.device_id, "b").unwrap();
        mock.unsubscribe(&reg.device_id, "a").unwrap();

        assert_eq!(
            mock.device_interests(&reg.device_id),
            Some(InterestSet::from(["b".to_string()]))
        );
    }
}
