//! # pushsync storage
//!
//! Durable byte stores backing the pushsync job queue and device state.
//!
//! Backends are **opaque byte stores**: the queue owns its record framing and
//! the state store owns its snapshot encoding. A backend only has to append,
//! read back, truncate and atomically replace its contents.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral instances
//! - [`FileBackend`] - For state that must survive process restarts
//!
//! ## Example
//!
//! ```rust
//! use pushsync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.append(b"job-1").unwrap();
//! backend.sync().unwrap();
//! assert_eq!(backend.read_all().unwrap(), b"job-1");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
