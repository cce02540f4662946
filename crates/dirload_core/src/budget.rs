//! Memory budget planning.
//!
//! One fixed memory pool is split between the destination store's cache, the
//! temporary DN validation cache and the phase-one sort buffers. Phase two
//! reuses the same pool for the read-ahead windows of its merge cursors.
//!
//! ```text
//! available = total × import share
//! usable    = available − indexes × per-index I/O reserve
//! buffers   = usable − db cache − temp cache
//!           ÷ (per-thread buffers × indexes × threads + writer buffers × indexes)
//! ```

use crate::config::TuningConfig;
use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use tracing::{info, warn};

/// Inputs of the phase-one plan.
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest {
    /// Memory the run may use before the import share is applied.
    pub total_memory: u64,
    /// Number of indexes written by the run.
    pub index_count: usize,
    /// Requested phase-one worker threads.
    pub thread_count: usize,
    /// DN validation or a rebuild needs the temporary DN cache.
    pub needs_dn_cache: bool,
    /// DN validation is enabled, so surplus buffer memory goes to the caches.
    pub validating: bool,
    /// The destination starts out empty.
    pub cleared: bool,
    /// The run is an index rebuild.
    pub rebuild: bool,
}

/// Result of phase-one planning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryPlan {
    /// Memory given to the run after the import share.
    pub available_memory: u64,
    /// Memory left after the per-index I/O reserve.
    pub usable_memory: u64,
    /// Size of each phase-one buffer.
    pub buffer_size: usize,
    /// Number of recycled phase-one buffers.
    pub phase_one_buffer_count: usize,
    /// Destination store cache.
    pub db_cache_size: u64,
    /// Temporary DN validation cache.
    pub tmp_cache_size: u64,
    /// Threads the plan fits.
    pub thread_count: usize,
    /// Threads that were requested.
    pub requested_threads: usize,
}

impl MemoryPlan {
    /// Memory phase two may spend on read-ahead windows.
    ///
    /// The destination cache stays live while the scratch files are merged,
    /// so it is not available to the windows.
    #[must_use]
    pub fn merge_memory(&self) -> u64 {
        self.available_memory.saturating_sub(self.db_cache_size)
    }

    /// Returns true if the plan had to lower the thread count.
    #[must_use]
    pub fn thread_count_reduced(&self) -> bool {
        self.thread_count != self.requested_threads
    }
}

/// Applies the import share to the memory the run may use.
#[must_use]
pub fn available_memory(total_memory: u64, rebuild: bool, tuning: &TuningConfig) -> u64 {
    let total = total_memory.max(tuning.minimum_available_memory);
    let mut percent = tuning.import_memory_percent;
    if total <= tuning.small_heap_size {
        percent = percent.saturating_sub(tuning.small_heap_penalty_percent);
    }
    if rebuild {
        percent = percent.saturating_sub(tuning.rebuild_penalty_percent);
    }
    total / 100 * percent + total % 100 * percent / 100
}

/// Computes buffer size, buffer count, cache split and thread count.
///
/// # Errors
///
/// Returns [`CoreError::InsufficientMemory`] if even a single thread cannot
/// get buffers of the minimum size.
pub fn plan_phase_one(request: &PlanRequest, tuning: &TuningConfig) -> CoreResult<MemoryPlan> {
    if request.thread_count == 0 {
        return Err(CoreError::invalid_configuration("thread count must be at least 1"));
    }
    let available = available_memory(request.total_memory, request.rebuild, tuning);
    let index_count = request.index_count as u64;
    let usable = available.saturating_sub(index_count * tuning.per_index_io_reserve as u64);

    let (mut db_cache, mut tmp_cache) = if request.needs_dn_cache {
        if usable < tuning.min_db_cache_memory + tuning.min_db_cache_size {
            (tuning.min_db_cache_size, tuning.min_db_cache_size)
        } else if !request.cleared {
            (usable * 33 / 100, usable * 33 / 100)
        } else {
            (tuning.max_db_cache_size, usable * 66 / 100)
        }
    } else if usable < tuning.min_db_cache_memory {
        (tuning.min_db_cache_size, 0)
    } else {
        (tuning.max_db_cache_size, 0)
    };

    let buffer_memory = usable.saturating_sub(db_cache + tmp_cache);
    let mut threads = request.thread_count;
    let mut buffer_size = 0usize;
    let mut phase_one_buffer_count = 0usize;

    if request.index_count != 0 {
        loop {
            phase_one_buffer_count =
                tuning.phase_one_buffers_per_thread * request.index_count * threads;
            let total_buffers =
                (phase_one_buffer_count + tuning.writer_buffers_per_index * request.index_count) as u64;
            buffer_size = usize::try_from(buffer_memory / total_buffers).unwrap_or(usize::MAX);

            if buffer_size > tuning.max_buffer_size {
                buffer_size = tuning.max_buffer_size;
                if request.validating {
                    let extra = buffer_memory - total_buffers * buffer_size as u64;
                    if request.cleared {
                        tmp_cache += extra;
                    } else {
                        db_cache += extra / 2;
                        tmp_cache += extra / 2;
                    }
                }
                break;
            } else if buffer_size > tuning.min_buffer_size {
                break;
            } else if threads > 1 {
                threads -= 1;
            } else {
                let minimum = total_buffers * tuning.min_buffer_size as u64;
                return Err(CoreError::InsufficientMemory {
                    available: usable,
                    required: minimum + db_cache + tmp_cache,
                });
            }
        }
    }

    if threads != request.thread_count {
        info!(
            requested = request.thread_count,
            effective = threads,
            "reduced import thread count to fit the memory budget"
        );
    }
    info!(
        available_memory = available,
        buffers = phase_one_buffer_count,
        buffer_size,
        db_cache,
        tmp_cache,
        "phase one memory plan"
    );

    Ok(MemoryPlan {
        available_memory: available,
        usable_memory: usable,
        buffer_size,
        phase_one_buffer_count,
        db_cache_size: db_cache,
        tmp_cache_size: tmp_cache,
        thread_count: threads,
        requested_threads: request.thread_count,
    })
}

/// Result of phase-two planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePlan {
    /// Size of each merge cursor's read-ahead window.
    pub read_ahead_size: usize,
    /// Permits of the global read-ahead semaphore.
    pub permits: usize,
    /// Threads of the merge pool.
    pub threads: usize,
}

/// Sizes the phase-two read-ahead windows.
///
/// `buffer_counts` holds the number of scratch buffers of every scratch
/// file. The largest files that can run concurrently must fit into
/// `merge_memory`; when they cannot even with one thread, windows drop to
/// the minimum size and the biggest files are merged in batches.
#[must_use]
pub fn plan_phase_two(
    merge_memory: u64,
    buffer_size: usize,
    buffer_counts: &[usize],
    processors: usize,
    tuning: &TuningConfig,
) -> MergePlan {
    let mut counts = buffer_counts.to_vec();
    counts.sort_unstable_by(|a, b| b.cmp(a));
    let mut threads = processors.max(tuning.phase_two_planned_threads).max(1);
    let min_read_ahead = tuning.min_read_ahead_size.max(1);

    let (read_ahead_size, permits) = loop {
        let buffers: usize = counts.iter().take(threads).sum::<usize>().max(1);
        let size = usize::try_from(merge_memory / buffers as u64).unwrap_or(usize::MAX);
        if size > buffer_size {
            break (buffer_size.max(1), buffers);
        } else if size > min_read_ahead {
            break (size, buffers);
        } else if threads > 1 {
            threads -= 1;
        } else {
            let permits = usize::try_from(merge_memory / min_read_ahead as u64)
                .unwrap_or(usize::MAX)
                .max(1);
            warn!(
                merge_memory,
                read_ahead = min_read_ahead,
                permits,
                "not enough memory for phase two, merging the largest indexes in batches"
            );
            break (min_read_ahead, permits);
        }
    };

    let threads = threads.max(tuning.phase_two_min_threads);
    info!(read_ahead_size, permits, threads, "phase two memory plan");
    MergePlan {
        read_ahead_size,
        permits,
        threads,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn request(total_mb: u64, index_count: usize, threads: usize) -> PlanRequest {
        PlanRequest {
            total_memory: total_mb * MB,
            index_count,
            thread_count: threads,
            needs_dn_cache: true,
            validating: true,
            cleared: true,
            rebuild: false,
        }
    }

    #[test]
    fn import_share_shrinks_on_small_heaps_and_rebuilds() {
        let tuning = TuningConfig::default();
        assert_eq!(available_memory(1000 * MB, false, &tuning), 900 * MB);
        assert_eq!(available_memory(200 * MB, false, &tuning), 130 * MB);
        assert_eq!(available_memory(200 * MB, true, &tuning), 100 * MB);
        assert_eq!(available_memory(MB, false, &tuning), 32 * MB * 65 / 100);
    }

    #[test]
    fn plentiful_memory_clamps_buffers_and_donates_surplus() {
        let tuning = TuningConfig::default();
        let plan = plan_phase_one(&request(4096, 4, 2), &tuning).unwrap();

        assert_eq!(plan.buffer_size, tuning.max_buffer_size);
        assert_eq!(plan.phase_one_buffer_count, 2 * 4 * 2);
        assert_eq!(plan.db_cache_size, tuning.max_db_cache_size);
        assert!(plan.tmp_cache_size > plan.usable_memory * 66 / 100);
        let buffers = (plan.phase_one_buffer_count + 16) as u64 * plan.buffer_size as u64;
        assert_eq!(plan.db_cache_size + plan.tmp_cache_size + buffers, plan.usable_memory);
        assert!(!plan.thread_count_reduced());
    }

    #[test]
    fn appending_splits_caches_evenly() {
        let tuning = TuningConfig::default();
        let mut req = request(4096, 4, 2);
        req.cleared = false;
        let plan = plan_phase_one(&req, &tuning).unwrap();
        assert!(plan.db_cache_size > tuning.max_db_cache_size);
        let diff = plan.db_cache_size.abs_diff(plan.tmp_cache_size);
        assert!(diff <= 1);
    }

    #[test]
    fn tight_memory_reduces_threads() {
        let tuning = TuningConfig::default();
        let plan = plan_phase_one(&request(64, 40, 32), &tuning).unwrap();
        assert_eq!(plan.thread_count, 17);
        assert!(plan.thread_count_reduced());
        assert!(plan.buffer_size > tuning.min_buffer_size);
    }

    #[test]
    fn impossible_budget_names_required_memory() {
        let tuning = TuningConfig::default();
        let err = plan_phase_one(&request(32, 2000, 4), &tuning).unwrap_err();
        match err {
            CoreError::InsufficientMemory { available, required } => assert!(required > available),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn skipping_validation_needs_no_temp_cache() {
        let tuning = TuningConfig::default();
        let mut req = request(1024, 4, 4);
        req.needs_dn_cache = false;
        req.validating = false;
        let plan = plan_phase_one(&req, &tuning).unwrap();
        assert_eq!(plan.tmp_cache_size, 0);
        assert_eq!(plan.db_cache_size, tuning.max_db_cache_size);
        assert_eq!(plan.buffer_size, tuning.max_buffer_size);
    }

    #[test]
    fn zero_threads_is_a_configuration_error() {
        let tuning = TuningConfig::default();
        assert!(matches!(
            plan_phase_one(&request(1024, 4, 0), &tuning),
            Err(CoreError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn phase_two_window_never_exceeds_buffer_size() {
        let tuning = TuningConfig::default();
        let plan = plan_phase_two(512 * MB, 64 * 1024, &[10, 5, 3], 8, &tuning);
        assert_eq!(plan.read_ahead_size, 64 * 1024);
        assert_eq!(plan.permits, 18);
        assert_eq!(plan.threads, 8);
    }

    #[test]
    fn phase_two_falls_back_to_batches() {
        let tuning = TuningConfig::default();
        let plan = plan_phase_two(64 * 1024, 1024 * 1024, &[1000, 900], 2, &tuning);
        assert_eq!(plan.read_ahead_size, tuning.min_read_ahead_size);
        assert_eq!(plan.permits, 32);
        assert_eq!(plan.threads, 2);
    }

    #[test]
    fn merge_windows_leave_room_for_the_store_cache() {
        let tuning = TuningConfig::default();
        let plan = plan_phase_one(&request(64, 6, 2), &tuning).unwrap();
        let merge_memory = plan.merge_memory();
        assert_eq!(merge_memory, plan.available_memory - plan.db_cache_size);

        for counts in [vec![1usize; 6], vec![40; 6], vec![5000, 4000, 10, 1, 1, 1]] {
            let merge = plan_phase_two(merge_memory, plan.buffer_size, &counts, 2, &tuning);
            assert!(
                (merge.permits * merge.read_ahead_size) as u64 <= merge_memory,
                "{} permits of {} bytes exceed {merge_memory}",
                merge.permits,
                merge.read_ahead_size
            );
        }
    }

    #[test]
    fn planned_merge_threads_are_tunable() {
        let tuning = TuningConfig {
            phase_two_planned_threads: 1,
            phase_two_min_threads: 1,
            ..TuningConfig::default()
        };
        let plan = plan_phase_two(512 * MB, 64 * 1024, &[10, 5, 3], 1, &tuning);
        assert_eq!(plan.threads, 1);
        assert_eq!(plan.permits, 10);
        let plan = plan_phase_two(512 * MB, 64 * 1024, &[10, 5, 3], 1, &TuningConfig::default());
        assert_eq!(plan.threads, 4);
        assert_eq!(plan.permits, 18);
    }
}
