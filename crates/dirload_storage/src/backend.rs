//! Scratch backend trait definition.

use crate::error::StorageResult;

/// A low-level byte store backing one scratch file.
///
/// Backends are written sequentially by a single owner during phase one and
/// then shared read-only by the phase-two merge cursors. All record framing
/// belongs to the caller.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` and `read_into` return exactly the bytes previously appended
/// - Appended data is visible to reads even before `flush`
/// - After `discard`, every operation fails with [`crate::StorageError::Discarded`]
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For on-disk scratch directories
pub trait ScratchBackend: Send + Sync {
    /// Reads exactly `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range extends beyond the current size or an
    /// I/O error occurs.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Reads up to `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes read, which is smaller than `buf.len()`
    /// only when the end of storage is reached.
    ///
    /// # Errors
    ///
    /// Returns an error if `offset` is beyond the current size or an I/O
    /// error occurs.
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize>;

    /// Appends data to the end of the storage.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes down to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the storage in bytes.
    ///
    /// This is the offset where the next `append` will write.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs all data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Releases the storage and deletes whatever backs it.
    ///
    /// Discarding twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying file cannot be removed.
    fn discard(&self) -> StorageResult<()>;
}
