//! Buffered file backend for on-disk scratch files.

use crate::backend::ScratchBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Default size of the in-process write buffer.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 8 * 1024;

/// A file-based scratch backend.
///
/// Appends are staged in an in-process buffer and written out whenever the
/// buffer fills, so the many small record writes of a scratch writer turn
/// into a few large sequential writes. Reads that touch staged bytes flush
/// them first.
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
/// A single internal lock serialises seeks, reads and writes.
///
/// # Example
///
/// ```no_run
/// use dirload_storage::{ScratchBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::create(Path::new("cn.equality")).unwrap();
/// backend.append(b"record").unwrap();
/// backend.flush().unwrap();
/// backend.discard().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    write_buffer_size: usize,
    inner: Mutex<FileInner>,
}

#[derive(Debug)]
struct FileInner {
    file: Option<File>,
    pending: Vec<u8>,
    written: u64,
}

impl FileInner {
    fn file(&mut self) -> StorageResult<&mut File> {
        self.file.as_mut().ok_or(StorageError::Discarded)
    }

    fn drain_pending(&mut self) -> StorageResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let written = self.written;
        let file = self.file()?;
        file.seek(SeekFrom::Start(written))?;
        file.write_all(&pending)?;
        self.written += pending.len() as u64;
        self.pending = pending;
        self.pending.clear();
        Ok(())
    }

    fn size(&self) -> u64 {
        self.written + self.pending.len() as u64
    }
}

impl FileBackend {
    /// Creates a new, empty scratch file, truncating any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(path: &Path) -> StorageResult<Self> {
        Self::create_with_buffer(path, DEFAULT_WRITE_BUFFER_SIZE)
    }

    /// Creates a new scratch file with a custom write buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create_with_buffer(path: &Path, write_buffer_size: usize) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            write_buffer_size: write_buffer_size.max(1),
            inner: Mutex::new(FileInner {
                file: Some(file),
                pending: Vec::with_capacity(write_buffer_size),
                written: 0,
            }),
        })
    }

    /// Opens an existing file for reading and further appends.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            inner: Mutex::new(FileInner {
                file: Some(file),
                pending: Vec::with_capacity(DEFAULT_WRITE_BUFFER_SIZE),
                written,
            }),
        })
    }

    /// Creates a scratch file, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot
    /// be created.
    pub fn create_with_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::create(path)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScratchBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        let read = self.read_into(offset, &mut buffer)?;
        if read < len {
            let size = self.inner.lock().size();
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(buffer)
    }

    fn read_into(&self, offset: u64, buf: &mut [u8]) -> StorageResult<usize> {
        let mut inner = self.inner.lock();
        let size = inner.size();
        if inner.file.is_none() {
            return Err(StorageError::Discarded);
        }
        if offset > size {
            return Err(StorageError::ReadPastEnd {
                offset,
                len: buf.len(),
                size,
            });
        }

        let available = (size - offset).min(buf.len() as u64) as usize;
        if available == 0 {
            return Ok(0);
        }
        if offset + available as u64 > inner.written {
            inner.drain_pending()?;
        }

        let file = inner.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[..available])?;
        Ok(available)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let write_buffer_size = self.write_buffer_size;
        let inner = self.inner.get_mut();
        if inner.file.is_none() {
            return Err(StorageError::Discarded);
        }

        let offset = inner.size();
        if data.len() >= write_buffer_size {
            inner.drain_pending()?;
            let written = inner.written;
            let file = inner.file()?;
            file.seek(SeekFrom::Start(written))?;
            file.write_all(data)?;
            inner.written += data.len() as u64;
        } else {
            inner.pending.extend_from_slice(data);
            if inner.pending.len() >= write_buffer_size {
                inner.drain_pending()?;
            }
        }

        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        let inner = self.inner.get_mut();
        inner.drain_pending()?;
        inner.file()?.flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        let inner = self.inner.lock();
        if inner.file.is_none() {
            return Err(StorageError::Discarded);
        }
        Ok(inner.size())
    }

    fn sync(&mut self) -> StorageResult<()> {
        let inner = self.inner.get_mut();
        inner.drain_pending()?;
        inner.file()?.sync_all()?;
        Ok(())
    }

    fn discard(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if inner.file.take().is_none() {
            return Ok(());
        }
        inner.pending.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cn.equality");

        let backend = FileBackend::create(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn file_append_and_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scratch.bin");

        let mut backend = FileBackend::create(&path).unwrap();

        let offset1 = backend.append(b"hello").unwrap();
        assert_eq!(offset1, 0);

        let offset2 = backend.append(b" world").unwrap();
        assert_eq!(offset2, 5);

        assert_eq!(backend.size().unwrap(), 11);

        let data = backend.read_at(0, 11).unwrap();
        assert_eq!(&data, b"hello world");
    }

    #[test]
    fn staged_bytes_are_readable_before_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scratch.bin");

        let mut backend = FileBackend::create_with_buffer(&path, 1024).unwrap();
        backend.append(b"abc").unwrap();

        let mut window = [0u8; 8];
        let read = backend.read_into(1, &mut window).unwrap();
        assert_eq!(&window[..read], b"bc");
    }

    #[test]
    fn large_append_bypasses_buffer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scratch.bin");

        let mut backend = FileBackend::create_with_buffer(&path, 4).unwrap();
        backend.append(b"ab").unwrap();
        let offset = backend.append(b"0123456789").unwrap();
        assert_eq!(offset, 2);
        backend.flush().unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 12);
        assert_eq!(backend.read_at(2, 10).unwrap(), b"0123456789");
    }

    #[test]
    fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scratch.bin");

        let mut backend = FileBackend::create(&path).unwrap();
        backend.append(b"hello").unwrap();

        let result = backend.read_at(10, 5);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
        let result = backend.read_at(3, 5);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn reopen_after_sync() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scratch.bin");

        {
            let mut backend = FileBackend::create(&path).unwrap();
            backend.append(b"persistent data").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 15);
        assert_eq!(backend.read_at(0, 15).unwrap(), b"persistent data");
    }

    #[test]
    fn discard_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scratch.bin");

        let mut backend = FileBackend::create(&path).unwrap();
        backend.append(b"x").unwrap();
        backend.discard().unwrap();

        assert!(!path.exists());
        assert!(matches!(backend.size(), Err(StorageError::Discarded)));
        backend.discard().unwrap();
    }
}
