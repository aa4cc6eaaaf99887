//! Events the engine reports to the host application.

use parking_lot::Mutex;
use pushsync_protocol::InterestSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a user binding failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    /// The device is already bound to someone else.
    #[error("device is already bound to user {bound:?}")]
    Conflict {
        /// User the device is bound to.
        bound: String,
    },

    /// The user id is not usable.
    #[error("invalid user id: {0}")]
    InvalidUserId(String),

    /// No token provider was configured.
    #[error("no token provider configured")]
    NoTokenProvider,

    /// The token provider returned an error.
    #[error("token provider failed: {0}")]
    TokenProvider(String),

    /// The token provider did not answer in time.
    #[error("token provider timed out after {0:?}")]
    TokenProviderTimeout(Duration),

    /// The directory refused the token.
    #[error("the directory rejected the user token: {0}")]
    TokenRejected(String),

    /// The user is bound to too many devices.
    #[error("too many devices bound to this user: {0}")]
    TooManyDevices(String),

    /// The binding was dropped by a stop before it reached the directory.
    #[error("binding discarded because the device was stopped")]
    Discarded,

    /// Any other directory failure.
    #[error("binding failed: {0}")]
    Failed(String),
}

/// Something the host application may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The local interest set changed.
    SubscriptionsChanged(InterestSet),
    /// A user binding finished.
    UserIdBound {
        /// User the binding was for.
        user_id: String,
        /// Failure, if it failed.
        error: Option<BindingError>,
    },
}

/// Receives [`SyncEvent`]s. Called on the worker thread.
pub trait EventSink: Send + Sync {
    /// Handles one event.
    fn on_event(&self, event: SyncEvent);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn on_event(&self, event: SyncEvent) {
        (**self).on_event(event);
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn on_event(&self, _event: SyncEvent) {}
}

/// Records events in memory; clones share the record.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl MemoryEventSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Returns and forgets the recorded events.
    pub fn take(&self) -> Vec<SyncEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// User binding outcomes recorded so far.
    pub fn bindings(&self) -> Vec<(String, Option<BindingError>)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SyncEvent::UserIdBound { user_id, error } => Some((user_id.clone(), error.clone())),
                SyncEvent::SubscriptionsChanged(_) => None,
            })
            .collect()
    }

    /// Interest sets reported so far.
    pub fn interest_changes(&self) -> Vec<InterestSet> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SyncEvent::SubscriptionsChanged(set) => Some(set.clone()),
                SyncEvent::UserIdBound { .. } => None,
            })
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn on_event(&self, event: SyncEvent) {
        self.events.lock().push(event);
    }
}
