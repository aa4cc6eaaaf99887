//! Storage backend trait definition.

use crate::error::StorageResult;

/// A durable byte store.
///
/// # Invariants
///
/// - `append` writes at the current end and returns that offset
/// - after `sync` returns, every appended byte survives process termination
/// - `replace` is atomic: readers observe either the old or the new contents,
///   never a mix, even across a crash
/// - backends must be `Send` so a queue can move to its worker thread
pub trait StorageBackend: Send {
    /// Reads the entire contents of the store.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn read_all(&self) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the store.
    ///
    /// Returns the offset where the data was written. The data is not
    /// guaranteed durable until [`StorageBackend::sync`] returns.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Forces all appended data and file metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Truncates the store to `new_size` bytes and syncs.
    ///
    /// Used to cut a torn tail after a crash and to reset a drained queue.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::InvalidTruncate`] if `new_size` is past
    /// the end, or an I/O error.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole contents with `data` and syncs.
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement cannot be made durable. On error
    /// the previous contents are left intact.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;
}
