//! # pushsync engine
//!
//! Client-side engine that keeps a device's push registration in sync with
//! the device directory.
//!
//! This crate provides:
//! - A crash-durable FIFO job queue over a storage backend
//! - Persisted device state (id, token, user, interests, confirmations)
//! - A reconciliation dispatcher with retries and device recreation
//! - User binding through a host-supplied or HTTP-backed token provider
//! - An HTTP directory client and a scriptable mock directory
//!
//! ## Architecture
//!
//! The host calls [`SyncEngine`] methods, which validate input and append
//! [`Job`](pushsync_protocol::Job)s to the [`JobQueue`]. One worker thread
//! runs the [`Dispatcher`], which handles the head job against a
//! [`DirectoryApi`] and pops it.
//!
//! Before the device is started, interest changes and user bindings are
//! held at the queue head and folded into the registration.
//!
//! ## Key Invariants
//!
//! - Jobs are handled one at a time, in queue order
//! - A job leaves the queue only after it has been handled
//! - Local interest changes are visible before they reach the directory
//! - A device the directory forgot is recreated with the local interests
//! - Every user binding request reports exactly one outcome

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod directory;
mod dispatcher;
mod engine;
mod error;
mod events;
mod http;
mod mock;
mod queue;
mod store;
mod token;

pub use config::{EngineConfig, RetryConfig};
pub use directory::{DirectoryApi, Registration, RetryingClient};
pub use dispatcher::Dispatcher;
pub use engine::SyncEngine;
pub use error::{ApiError, ApiResult, EngineError, EngineResult};
pub use events::{BindingError, EventSink, MemoryEventSink, NoopEventSink, SyncEvent};
pub use http::{HttpClient, HttpDirectory, LoopbackClient, LoopbackServer};
pub use mock::{Call, MockDirectory, Op};
pub use queue::{compute_crc32, JobQueue, QueueEntry, QUEUE_MAGIC, QUEUE_VERSION};
pub use store::{DeviceState, DeviceStateStore, FileStateStore, MemoryStateStore};
pub use token::{AuthData, HttpTokenProvider, TokenProvider};
