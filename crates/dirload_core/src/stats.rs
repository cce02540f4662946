//! Run statistics and the final report.
//!
//! Counters are atomic and can be polled by a progress reporter while the
//! run is in progress. Source-side counters (read, rejected, ignored) live
//! in the [`EntrySource`](crate::source::EntrySource) and are merged in when
//! a snapshot is taken.

use crate::budget::MemoryPlan;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Engine-side counters of one run.
#[derive(Debug, Default)]
pub struct ImportStats {
    /// Entries written to id2entry by phase one.
    imported: AtomicU64,
    /// Entries copied from the previous container.
    migrated: AtomicU64,
    /// Entries whose previous version was replaced.
    replaced: AtomicU64,
    /// Phase-one buffers handed to the sort pool.
    buffers_sorted: AtomicU64,
    /// Bytes written to scratch files.
    scratch_bytes: AtomicU64,
    /// Scratch files fully merged by phase two.
    indexes_merged: AtomicU64,
    /// Distinct keys committed by phase two.
    keys_written: AtomicU64,
    /// Set once phase two starts.
    merging: AtomicBool,
}

impl ImportStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_imported(&self) {
        self.imported.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_migrated(&self) {
        self.migrated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_replaced(&self) {
        self.replaced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_buffer_sorted(&self) {
        self.buffers_sorted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_scratch_bytes(&self, bytes: u64) {
        self.scratch_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_index_merged(&self) {
        self.indexes_merged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_keys_written(&self, keys: u64) {
        self.keys_written.fetch_add(keys, Ordering::Relaxed);
    }

    pub(crate) fn record_merge_started(&self) {
        self.merging.store(true, Ordering::Relaxed);
    }

    /// Returns the number of imported entries.
    pub fn imported(&self) -> u64 {
        self.imported.load(Ordering::Relaxed)
    }

    /// Returns the number of migrated entries.
    pub fn migrated(&self) -> u64 {
        self.migrated.load(Ordering::Relaxed)
    }

    /// Returns the number of replaced entries.
    pub fn replaced(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }

    /// Returns the number of sorted phase-one buffers.
    pub fn buffers_sorted(&self) -> u64 {
        self.buffers_sorted.load(Ordering::Relaxed)
    }

    /// Returns the bytes written to scratch files.
    pub fn scratch_bytes(&self) -> u64 {
        self.scratch_bytes.load(Ordering::Relaxed)
    }

    /// Returns the number of merged scratch files.
    pub fn indexes_merged(&self) -> u64 {
        self.indexes_merged.load(Ordering::Relaxed)
    }

    /// Returns the number of keys committed by phase two.
    pub fn keys_written(&self) -> u64 {
        self.keys_written.load(Ordering::Relaxed)
    }

    /// Returns true once phase two has started.
    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::Relaxed)
    }

    /// Takes a snapshot, adding the source counters.
    #[must_use]
    pub fn snapshot(&self, read: u64, rejected: u64, ignored: u64) -> ImportProgress {
        ImportProgress {
            read,
            rejected,
            ignored,
            imported: self.imported(),
            migrated: self.migrated(),
            replaced: self.replaced(),
            buffers_sorted: self.buffers_sorted(),
            scratch_bytes: self.scratch_bytes(),
            indexes_merged: self.indexes_merged(),
            keys_written: self.keys_written(),
        }
    }
}

/// A point-in-time copy of the run counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ImportProgress {
    /// Records read from the source.
    pub read: u64,
    /// Records rejected.
    pub rejected: u64,
    /// Entries ignored.
    pub ignored: u64,
    /// Entries imported.
    pub imported: u64,
    /// Entries migrated from the previous container.
    pub migrated: u64,
    /// Entries replaced in append mode.
    pub replaced: u64,
    /// Phase-one buffers sorted.
    pub buffers_sorted: u64,
    /// Bytes written to scratch files.
    pub scratch_bytes: u64,
    /// Scratch files merged.
    pub indexes_merged: u64,
    /// Keys committed by phase two.
    pub keys_written: u64,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImportStatus {
    /// Both phases ran to completion.
    Completed,
    /// The run was canceled or ran out of disk space.
    Interrupted,
}

/// Outcome of an import or rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    /// How the run ended.
    pub status: ImportStatus,
    /// Final counters.
    pub progress: ImportProgress,
    /// Time spent reading entries and writing scratch files.
    pub phase_one: Duration,
    /// Time spent merging scratch files into the store.
    pub phase_two: Duration,
    /// Worker threads phase one ran with.
    pub thread_count: usize,
    /// True if the planner lowered the requested thread count.
    pub thread_count_reduced: bool,
    /// The memory plan of phase one.
    pub plan: MemoryPlan,
}

impl ImportReport {
    /// Returns true if the run completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == ImportStatus::Completed
    }

    /// Entries imported per second of phase one.
    #[must_use]
    pub fn import_rate(&self) -> f64 {
        let secs = self.phase_one.as_secs_f64();
        if secs > 0.0 {
            self.progress.imported as f64 / secs
        } else {
            0.0
        }
    }
}
