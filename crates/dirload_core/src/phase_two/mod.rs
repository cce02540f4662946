//! Phase two: merge the scratch runs of every index stream into the store.
//!
//! The dn stream goes first, then every attribute stream. Each stream is
//! merged by one task of the merge pool; a global semaphore bounds the
//! read-ahead windows open at once.

mod dn_state;
mod input_buffer;
mod write_task;

use crate::budget::{plan_phase_two, MergePlan};
use crate::context::ImportContext;
use crate::error::CoreResult;
use crate::executor::{join_all, Semaphore, TaskPool};
use crate::manager::IndexManager;
use std::sync::Arc;
use tracing::info;
use write_task::merge_index;

/// Merges every scratch file, then drops it.
pub(crate) fn run_phase_two(
    ctx: &Arc<ImportContext>,
    managers: Vec<Arc<IndexManager>>,
    merge_memory: u64,
    buffer_size: usize,
) -> CoreResult<MergePlan> {
    ctx.stats.record_merge_started();
    let counts: Vec<usize> = managers.iter().map(|m| m.buffer_count()).collect();
    let plan = plan_phase_two(merge_memory, buffer_size, &counts, num_cpus::get(), &ctx.tuning);
    let semaphore = Arc::new(Semaphore::new(plan.permits));
    let pool = TaskPool::new("dirload-merge", plan.threads)?;

    let (dn, attributes): (Vec<_>, Vec<_>) = managers.into_iter().partition(|m| m.is_dn());
    for group in [dn, attributes] {
        let handles: Vec<_> = group
            .into_iter()
            .map(|manager| {
                let ctx = Arc::clone(ctx);
                let semaphore = Arc::clone(&semaphore);
                pool.submit(format!("merge {}", manager.name()), move || {
                    let outcome = merge_index(&ctx, &manager, plan.read_ahead_size, &semaphore, plan.permits);
                    manager.cleanup();
                    match outcome {
                        Ok(keys) => {
                            ctx.stats.record_keys_written(keys);
                            ctx.stats.record_index_merged();
                            info!(index = %manager.name(), keys, "index merged");
                            Ok(())
                        }
                        Err(err) => {
                            ctx.abort(&format!("merge {}", manager.name()), &err);
                            Err(err)
                        }
                    }
                })
            })
            .collect();
        join_all(handles)?;
    }
    pool.shutdown();
    Ok(plan)
}
