//! Storage backend trait definition.

use crate::error::StorageResult;

/// A byte store underneath a realm's commit log.
///
/// Backends never interpret what they hold. The storage session writes a
/// header followed by commit frames and is the only component that knows
/// that layout.
///
/// # Invariants
///
/// - `append` returns the offset the data landed at
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `sync` makes every appended byte durable
/// - `refresh` picks up bytes appended through another handle on the same
///   medium (another process writing the same file)
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`StorageError::ReadPastEnd`](crate::StorageError::ReadPastEnd)
    /// when the range is not fully inside the store.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or when the backend is read-only.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the size of the store as last observed by this handle.
    ///
    /// # Errors
    ///
    /// Fails when the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    fn sync(&mut self) -> StorageResult<()>;

    /// Cuts the store down to `new_size` bytes.
    ///
    /// Used by compaction, which rewrites the log from offset zero.
    ///
    /// # Errors
    ///
    /// Fails when `new_size` exceeds the current size, on I/O errors, or
    /// when the backend is read-only.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Re-reads the size from the underlying medium and returns it.
    ///
    /// Backends whose contents can only change through this handle keep the
    /// default, which returns [`size`](Self::size).
    ///
    /// # Errors
    ///
    /// Fails when the size cannot be determined.
    fn refresh(&mut self) -> StorageResult<u64> {
        self.size()
    }
}
