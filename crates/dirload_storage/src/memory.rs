//! In-memory scratch backend.

use crate::backend::ScratchBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;

/// An in-memory scratch backend.
///
/// This backend keeps the whole scratch file in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Small imports where spilling to disk is not worth it
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use dirload_storage::{ScratchBackend, InMemoryBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let offset = backend.append(b"test data").unwrap();
/// assert_eq!(offset, 0);
/// assert_eq!(backend.size().unwrap(), 9);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Option<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Some(Vec::new())),
        }
    }

    /// Creates a new in-memory backend with pre-existing data.
    ///
    /// Useful for feeding hand-built scratch images to readers in tests.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(Some(data)),
        }
    }

    /// Returns a copy of all data in the backend.
    ///
    /// Returns an empty vector once the backend is discarded.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone().unwrap_or_default()
    }

    /// Returns true once [`ScratchBackend::discard`] has been called.
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        self.data.read().is_none()
    }
}

impl ScratchBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let guard = self.data.read();
        let data = guard.as_ref().ok_or(StorageError::Discarded)?;
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);

        if offset > size || end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[start..end].to_vec())
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        let guard = self.data.read();
        let data = guard.as_ref().ok_or(StorageError::Discarded)?;
        let size = data.len() as u64;
        if offset > size {
            return Err(StorageError::ReadPastEnd {
                offset,
                len: buf.len(),
                size,
            });
        }

        let start = offset as usize;
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }

    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        let data = self.data.get_mut().as_mut().ok_or(StorageError::Discarded)?;
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.data.get_mut().is_none() {
            return Err(StorageError::Discarded);
        }
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        self.data
            .read()
            .as_ref()
            .map(|data| data.len() as u64)
            .ok_or(StorageError::Discarded)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.flush()
    }

    fn discard(&self) -> StorageResult<()> {
        self.data.write().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn memory_append_and_read() {
        let mut backend = InMemoryBackend::new();

        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.read_at(0, 11).unwrap(), b"hello world");
    }

    #[test]
    fn short_read_at_end() {
        let backend = InMemoryBackend::with_data(b"abcdef".to_vec());

        let mut window = [0u8; 4];
        assert_eq!(backend.read_into(4, &mut window).unwrap(), 2);
        assert_eq!(&window[..2], b"ef");
        assert_eq!(backend.read_into(6, &mut window).unwrap(), 0);
        assert!(backend.read_into(7, &mut window).is_err());
    }

    #[test]
    fn discarded_backend_rejects_operations() {
        let mut backend = InMemoryBackend::new();
        backend.append(b"x").unwrap();
        backend.discard().unwrap();

        assert!(backend.is_discarded());
        assert!(matches!(backend.append(b"y"), Err(StorageError::Discarded)));
        assert!(matches!(backend.size(), Err(StorageError::Discarded)));
    }

    proptest! {
        #[test]
        fn windows_reassemble_appended_bytes(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..16),
            window in 1usize..32,
        ) {
            let mut backend = InMemoryBackend::new();
            let mut expected = Vec::new();
            for chunk in &chunks {
                backend.append(chunk).unwrap();
                expected.extend_from_slice(chunk);
            }

            let mut actual = Vec::new();
            let mut offset = 0u64;
            let mut buf = vec![0u8; window];
            loop {
                let read = backend.read_into(offset, &mut buf).unwrap();
                if read == 0 {
                    break;
                }
                actual.extend_from_slice(&buf[..read]);
                offset += read as u64;
            }
            prop_assert_eq!(actual, expected);
        }
    }
}
