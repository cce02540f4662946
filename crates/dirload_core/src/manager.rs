//! Hand-off of one index stream's scratch files from phase one to phase two.
//!
//! A scratch file is a sequence of sorted runs, one per phase-one batch. Its
//! companion `.offsets` file lists the `[begin, end)` byte range of every
//! run as two big-endian `i64`s.

use crate::error::{CoreError, CoreResult};
use crate::index::IndexKey;
use dirload_storage::ScratchBackend;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

const RANGE_LEN: usize = 16;

pub(crate) struct IndexManager {
    key: IndexKey,
    name: String,
    state: Mutex<ManagerState>,
}

#[derive(Default)]
struct ManagerState {
    data: Option<Arc<dyn ScratchBackend>>,
    offsets: Option<Arc<dyn ScratchBackend>>,
    buffer_count: usize,
    file_size: u64,
}

impl IndexManager {
    pub(crate) fn new(key: IndexKey) -> Self {
        let name = key.name();
        Self {
            key,
            name,
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub(crate) fn key(&self) -> &IndexKey {
        &self.key
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_dn(&self) -> bool {
        self.key.is_dn2id()
    }

    /// Called by the scratch writer once every run is on disk.
    pub(crate) fn set_files(
        &self,
        data: Box<dyn ScratchBackend>,
        offsets: Box<dyn ScratchBackend>,
        buffer_count: usize,
        file_size: u64,
    ) {
        let mut state = self.state.lock();
        state.data = Some(Arc::from(data));
        state.offsets = Some(Arc::from(offsets));
        state.buffer_count = buffer_count;
        state.file_size = file_size;
    }

    /// Number of sorted runs in the scratch file.
    pub(crate) fn buffer_count(&self) -> usize {
        self.state.lock().buffer_count
    }

    #[cfg(test)]
    pub(crate) fn file_size(&self) -> u64 {
        self.state.lock().file_size
    }

    pub(crate) fn data(&self) -> CoreResult<Arc<dyn ScratchBackend>> {
        self.state
            .lock()
            .data
            .clone()
            .ok_or_else(|| CoreError::scratch_corruption(format!("no scratch file for {}", self.name)))
    }

    /// Reads the byte range of every run.
    pub(crate) fn ranges(&self) -> CoreResult<Vec<(u64, u64)>> {
        let (offsets, expected, file_size) = {
            let state = self.state.lock();
            let offsets = state.offsets.clone().ok_or_else(|| {
                CoreError::scratch_corruption(format!("no offsets file for {}", self.name))
            })?;
            (offsets, state.buffer_count, state.file_size)
        };
        let size = offsets.size()?;
        if size != (expected * RANGE_LEN) as u64 {
            return Err(CoreError::scratch_corruption(format!(
                "offsets file of {} holds {size} bytes for {expected} runs",
                self.name
            )));
        }
        let bytes = offsets.read_at(0, size as usize)?;
        let mut ranges = Vec::with_capacity(expected);
        for chunk in bytes.chunks_exact(RANGE_LEN) {
            let begin = i64::from_be_bytes(chunk[..8].try_into().unwrap_or_default());
            let end = i64::from_be_bytes(chunk[8..].try_into().unwrap_or_default());
            if begin < 0 || end < begin || end as u64 > file_size {
                return Err(CoreError::scratch_corruption(format!(
                    "run [{begin}, {end}) of {} is outside the {file_size} byte file",
                    self.name
                )));
            }
            ranges.push((begin as u64, end as u64));
        }
        Ok(ranges)
    }

    /// Drops both scratch files.
    pub(crate) fn cleanup(&self) {
        let mut state = self.state.lock();
        for file in [state.data.take(), state.offsets.take()].into_iter().flatten() {
            if let Err(err) = file.discard() {
                warn!(index = %self.name, error = %err, "could not remove scratch file");
            }
        }
    }
}

/// Encodes one run range for the offsets file.
pub(crate) fn encode_range(begin: u64, end: u64) -> [u8; RANGE_LEN] {
    let mut out = [0u8; RANGE_LEN];
    out[..8].copy_from_slice(&(begin as i64).to_be_bytes());
    out[8..].copy_from_slice(&(end as i64).to_be_bytes());
    out
}
