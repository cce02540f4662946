//! Merge of one scratch file into its destination trees.

use crate::context::ImportContext;
use crate::error::{CoreError, CoreResult};
use crate::executor::Semaphore;
use crate::id_set::ImportIdSet;
use crate::manager::IndexManager;
use crate::phase_two::dn_state::DnState;
use crate::phase_two::input_buffer::{HeapCursor, IndexInputBuffer};
use crate::registry::IndexTarget;
use crate::types::IndexId;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Receives every merged key once.
trait KeySink {
    fn write(&mut self, index_id: IndexId, key: &[u8], inserts: &ImportIdSet, deletes: &ImportIdSet) -> CoreResult<()>;

    /// Returns the number of keys written.
    fn finish(self: Box<Self>) -> CoreResult<u64>;
}

/// Applies deletes, then inserts, to attribute trees.
struct TreeSink<'a> {
    ctx: &'a ImportContext,
    keys: u64,
}

impl KeySink for TreeSink<'_> {
    fn write(&mut self, index_id: IndexId, key: &[u8], inserts: &ImportIdSet, deletes: &ImportIdSet) -> CoreResult<()> {
        let IndexTarget::Tree(tree) = &self.ctx.registry.get(index_id)?.target else {
            return Err(CoreError::scratch_corruption(format!("{index_id} is not an attribute tree")));
        };
        if !deletes.is_empty() {
            tree.delete(key, deletes)?;
        }
        if !inserts.is_empty() {
            tree.insert(key, inserts)?;
        }
        self.keys += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> CoreResult<u64> {
        Ok(self.keys)
    }
}

/// Feeds one [`DnState`] per suffix.
struct DnSink<'a> {
    ctx: &'a ImportContext,
    states: HashMap<IndexId, DnState>,
}

impl KeySink for DnSink<'_> {
    fn write(&mut self, index_id: IndexId, key: &[u8], inserts: &ImportIdSet, _deletes: &ImportIdSet) -> CoreResult<()> {
        if !self.states.contains_key(&index_id) {
            let IndexTarget::Dn(targets) = &self.ctx.registry.get(index_id)?.target else {
                return Err(CoreError::scratch_corruption(format!("{index_id} is not a dn stream")));
            };
            let state = DnState::new(targets.clone(), self.ctx.tuning.dn_state_flush_threshold);
            self.states.insert(index_id, state);
        }
        match self.states.get_mut(&index_id) {
            Some(state) => state.write(key, inserts),
            None => Ok(()),
        }
    }

    fn finish(self: Box<Self>) -> CoreResult<u64> {
        let mut keys = 0;
        for (_, state) in self.states {
            keys += state.finish()?;
        }
        Ok(keys)
    }
}

/// Merges the runs of `manager` into the store.
///
/// Attribute streams are merged in batches of at most `permits.total` runs,
/// each batch holding one permit per run. The dn stream is merged in a
/// single pass, shrinking its windows so every run fits, because a parent
/// must be written before the first child of any batch is.
pub(crate) fn merge_index(
    ctx: &ImportContext,
    manager: &IndexManager,
    read_ahead_size: usize,
    semaphore: &Semaphore,
    total_permits: usize,
) -> CoreResult<u64> {
    let ranges = manager.ranges()?;
    if ranges.is_empty() {
        return Ok(0);
    }
    let file = manager.data()?;
    let comparator = manager.key().comparator();
    let total_permits = total_permits.max(1);
    let cancel = ctx.cancel.flag();

    let (batch_len, window) = if manager.is_dn() {
        let shrunk = read_ahead_size.saturating_mul(total_permits) / ranges.len();
        (ranges.len(), shrunk.max(ctx.tuning.min_read_ahead_size).max(1))
    } else {
        (total_permits, read_ahead_size)
    };

    let mut sink: Box<dyn KeySink + '_> = if manager.is_dn() {
        Box::new(DnSink {
            ctx,
            states: HashMap::new(),
        })
    } else {
        Box::new(TreeSink { ctx, keys: 0 })
    };

    for (batch_no, batch) in ranges.chunks(batch_len).enumerate() {
        let held = batch.len().min(total_permits);
        semaphore.acquire(held, cancel)?;
        let runs = batch
            .iter()
            .enumerate()
            .map(|(i, &(begin, end))| {
                IndexInputBuffer::new(
                    Arc::clone(&file),
                    batch_no * batch_len + i,
                    comparator,
                    begin,
                    end,
                    window,
                )
            })
            .collect();
        let outcome = merge_runs(ctx, runs, sink.as_mut());
        semaphore.release(held);
        outcome?;
        debug!(index = %manager.name(), batch = batch_no, runs = batch.len(), "merged batch");
    }
    sink.finish()
}

fn merge_runs(ctx: &ImportContext, runs: Vec<IndexInputBuffer>, sink: &mut dyn KeySink) -> CoreResult<()> {
    let mut heap = BinaryHeap::with_capacity(runs.len());
    for mut run in runs {
        if run.next_record()? {
            heap.push(HeapCursor(run));
        }
    }

    let mut inserts = ImportIdSet::new(0, false);
    let mut deletes = ImportIdSet::new(0, false);
    let mut key = Vec::new();
    while let Some(HeapCursor(mut run)) = heap.pop() {
        ctx.check_canceled()?;
        key.clear();
        key.extend_from_slice(run.key());
        let index_id = run.index_id();
        let (limit, maintain) = ctx.registry.limits(index_id);
        inserts.reset(limit, maintain);
        deletes.reset(0, false);

        loop {
            run.read_inserts(Some(&mut inserts))?;
            run.read_deletes(Some(&mut deletes))?;
            if run.next_record()? {
                heap.push(HeapCursor(run));
            }
            match heap.peek() {
                Some(next) if next.0.compare(&key, index_id) == Ordering::Equal => {}
                _ => break,
            }
            match heap.pop() {
                Some(HeapCursor(next)) => run = next,
                None => break,
            }
        }
        sink.write(index_id, &key, &inserts, &deletes)?;
    }
    Ok(())
}
