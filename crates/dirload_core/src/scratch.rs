//! Scratch space for the files of one run.
//!
//! On disk the layout is:
//!
//! ```text
//! <scratch_dir>/
//! ├─ <backend-id>.lock    # advisory lock, held for the whole run
//! └─ <backend-id>/        # removed at the start and at the end of a run
//!    ├─ cn.equality       # scratch records of one index stream
//!    ├─ cn.equality.offsets
//!    ├─ dn2id
//!    ├─ dn2id.offsets
//!    └─ dn-cache          # DN validation cache
//! ```
//!
//! Without a scratch directory every file is an in-memory backend.

use crate::error::{CoreError, CoreResult};
use dirload_storage::{FileBackend, InMemoryBackend, ScratchBackend};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Where the scratch files of a run live.
#[derive(Debug)]
pub(crate) struct ScratchSpace {
    dir: Option<PathBuf>,
    state: Mutex<SpaceState>,
}

#[derive(Debug)]
struct SpaceState {
    cleaned: bool,
    lock: Option<(PathBuf, File)>,
}

impl ScratchSpace {
    /// Keeps every scratch file in memory.
    pub(crate) fn in_memory() -> Self {
        Self {
            dir: None,
            state: Mutex::new(SpaceState {
                cleaned: false,
                lock: None,
            }),
        }
    }

    /// Locks and empties `<root>/<backend_id>`.
    pub(crate) fn open(root: &Path, backend_id: &str) -> CoreResult<Self> {
        fs::create_dir_all(root)?;
        let lock_path = root.join(format!("{backend_id}.lock"));
        let lock = lock_file(&lock_path)?;

        let dir = root.join(backend_id);
        if dir.exists() {
            debug!(path = %dir.display(), "removing stale scratch directory");
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir: Some(dir),
            state: Mutex::new(SpaceState {
                cleaned: false,
                lock: lock.map(|file| (lock_path, file)),
            }),
        })
    }

    /// Returns the scratch directory, if the space is on disk.
    pub(crate) fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Creates an empty scratch file.
    pub(crate) fn create(&self, name: &str) -> CoreResult<Box<dyn ScratchBackend>> {
        match &self.dir {
            Some(dir) => Ok(Box::new(FileBackend::create(&dir.join(file_name(name)))?)),
            None => Ok(Box::new(InMemoryBackend::new())),
        }
    }

    /// Removes the scratch directory and releases the lock.
    ///
    /// Later calls do nothing.
    pub(crate) fn cleanup(&self) {
        let mut state = self.state.lock();
        if state.cleaned {
            return;
        }
        state.cleaned = true;
        if let Some(dir) = &self.dir {
            if let Err(err) = fs::remove_dir_all(dir) {
                if dir.exists() {
                    warn!(path = %dir.display(), error = %err, "could not remove scratch directory");
                }
            }
        }
        if let Some((path, file)) = state.lock.take() {
            drop(file);
            let _ = fs::remove_file(path);
        }
    }
}

impl Drop for ScratchSpace {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(feature = "std")]
fn lock_file(path: &Path) -> CoreResult<Option<File>> {
    use fs2::FileExt;
    use std::fs::OpenOptions;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    if file.try_lock_exclusive().is_err() {
        return Err(CoreError::ScratchDirLocked {
            path: path.display().to_string(),
        });
    }
    Ok(Some(file))
}

#[cfg(not(feature = "std"))]
fn lock_file(_path: &Path) -> CoreResult<Option<File>> {
    Ok(None)
}

/// Maps an index stream name to a portable file name.
fn file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_is_emptied_and_removed() {
        let root = tempfile::tempdir().unwrap();
        let stale = root.path().join("userRoot");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("leftover"), b"x").unwrap();

        let space = ScratchSpace::open(root.path(), "userRoot").unwrap();
        assert!(!stale.join("leftover").exists());

        let mut file = space.create("cn.equality").unwrap();
        file.append(b"record").unwrap();
        file.flush().unwrap();
        assert!(stale.join("cn.equality").exists());

        space.cleanup();
        assert!(!stale.exists());
        assert!(!root.path().join("userRoot.lock").exists());
        space.cleanup();
    }

    #[cfg(feature = "std")]
    #[test]
    fn second_run_is_locked_out() {
        let root = tempfile::tempdir().unwrap();
        let _first = ScratchSpace::open(root.path(), "userRoot").unwrap();
        assert!(matches!(
            ScratchSpace::open(root.path(), "userRoot"),
            Err(CoreError::ScratchDirLocked { .. })
        ));
    }

    #[test]
    fn in_memory_space_has_no_directory() {
        let space = ScratchSpace::in_memory();
        assert!(space.dir().is_none());
        let mut file = space.create("dn2id").unwrap();
        assert_eq!(file.append(b"abc").unwrap(), 0);
        assert_eq!(file.size().unwrap(), 3);
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(file_name("cn.ex_substring"), "cn.ex_substring");
        assert_eq!(file_name("a/b c"), "a_b_c");
    }
}
