//! State shared by every task of one run.

use crate::config::TuningConfig;
use crate::error::{CoreError, CoreResult};
use crate::registry::IndexRegistry;
use crate::scratch::ScratchSpace;
use crate::stats::ImportStats;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Requests cancellation of a running import or rebuild.
///
/// Handles are cheap to clone and may be used from any thread. Running
/// tasks notice the request at their next loop iteration and return early;
/// the run then reports [`ImportStatus::Interrupted`](crate::ImportStatus).
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Creates a handle that is not canceled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::AcqRel) {
            info!("cancellation requested");
        }
    }

    /// Reports that the disk holding `path` is full, which cancels the run.
    pub fn disk_space_exhausted(&self, path: &Path) {
        error!(path = %path.display(), "disk space exhausted, interrupting the run");
        self.flag.store(true, Ordering::Release);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub(crate) fn flag(&self) -> &AtomicBool {
        &self.flag
    }
}

/// Everything a task needs besides its own input.
pub(crate) struct ImportContext {
    pub(crate) run_id: Uuid,
    pub(crate) cancel: CancelHandle,
    pub(crate) stats: Arc<ImportStats>,
    pub(crate) tuning: TuningConfig,
    pub(crate) scratch: ScratchSpace,
    pub(crate) registry: IndexRegistry,
}

impl ImportContext {
    pub(crate) fn new(
        cancel: CancelHandle,
        stats: Arc<ImportStats>,
        tuning: TuningConfig,
        scratch: ScratchSpace,
        registry: IndexRegistry,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            cancel,
            stats,
            tuning,
            scratch,
            registry,
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Returns [`CoreError::Canceled`] once the run is canceled.
    pub(crate) fn check_canceled(&self) -> CoreResult<()> {
        if self.is_canceled() {
            Err(CoreError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Stops the run after a task failed.
    pub(crate) fn abort(&self, task: &str, err: &CoreError) {
        if !err.is_canceled() {
            error!(run = %self.run_id, task, error = %err, "task failed, aborting the run");
        }
        self.cancel.flag().store(true, Ordering::Release);
    }
}

#[cfg(test)]
impl ImportContext {
    pub(crate) fn for_tests(registry: IndexRegistry) -> Arc<Self> {
        Arc::new(Self::new(
            CancelHandle::new(),
            Arc::new(ImportStats::new()),
            TuningConfig::default(),
            ScratchSpace::in_memory(),
            registry,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_canceled());
        handle.cancel();
        assert!(clone.is_canceled());
    }

    #[test]
    fn disk_space_exhaustion_cancels() {
        let handle = CancelHandle::new();
        handle.disk_space_exhausted(Path::new("/tmp/scratch"));
        assert!(handle.is_canceled());
    }

    #[test]
    fn abort_sets_the_flag() {
        let ctx = ImportContext::for_tests(IndexRegistry::default());
        assert!(ctx.check_canceled().is_ok());
        ctx.abort("writer", &CoreError::store("boom"));
        assert!(matches!(ctx.check_canceled(), Err(CoreError::Canceled)));
    }
}
