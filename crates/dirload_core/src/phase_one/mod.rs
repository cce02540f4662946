//! Phase one: turn entries into sorted scratch runs.
//!
//! ```text
//! workers ──emit──▶ per-stream buffers ──full──▶ sort pool ──▶ scratch writer
//!    ▲                                                             │
//!    └──────────────────── free buffer list ◀──────recycle─────────┘
//! ```
//!
//! Workers write entries to id2entry directly; every index key goes through
//! the buffers. The free list is bounded, so workers stall when sorting or
//! writing falls behind.

mod output_buffer;
mod sort;
mod worker;
mod writer;

pub(crate) use output_buffer::IndexOutputBuffer;
pub(crate) use worker::{index_entry, EntryFeed, EntryPolicy, ImportWorker, KeyEmitter};
#[cfg(test)]
pub(crate) use writer::ScratchFileWriter;

use crate::budget::MemoryPlan;
use crate::context::ImportContext;
use crate::error::{CoreError, CoreResult};
use crate::executor::POLL_INTERVAL;
use crate::manager::IndexManager;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use sort::SortStage;
use std::sync::Arc;
use tracing::debug;
use writer::ScratchWriters;

/// Buffers, sort pool and scratch writers of one run.
pub(crate) struct PhaseOne {
    ctx: Arc<ImportContext>,
    buffer_size: usize,
    free_tx: Sender<IndexOutputBuffer>,
    free_rx: Receiver<IndexOutputBuffer>,
    sorts: SortStage,
    writers: Arc<ScratchWriters>,
}

impl PhaseOne {
    /// Allocates the free list and starts the sort pool.
    pub(crate) fn start(ctx: Arc<ImportContext>, plan: &MemoryPlan) -> CoreResult<Arc<Self>> {
        let count = plan.phase_one_buffer_count.max(1);
        let buffer_size = plan.buffer_size.max(1);
        let (free_tx, free_rx) = bounded(count);
        for _ in 0..count {
            free_tx
                .try_send(IndexOutputBuffer::new(buffer_size))
                .map_err(|_| CoreError::invalid_configuration("free buffer list is full"))?;
        }
        let writers = Arc::new(ScratchWriters::new(
            Arc::clone(&ctx),
            free_tx.clone(),
            ctx.tuning.writer_buffers_per_index,
        ));
        let sorts = SortStage::new(Arc::clone(&ctx), plan.thread_count, Arc::clone(&writers))?;
        debug!(buffers = count, buffer_size, "phase one started");
        Ok(Arc::new(Self {
            ctx,
            buffer_size,
            free_tx,
            free_rx,
            sorts,
            writers,
        }))
    }

    pub(crate) fn ctx(&self) -> &Arc<ImportContext> {
        &self.ctx
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Takes a buffer off the free list, waiting while all are in use.
    pub(crate) fn take_free(&self) -> CoreResult<IndexOutputBuffer> {
        loop {
            match self.free_rx.recv_timeout(POLL_INTERVAL) {
                Ok(buffer) => return Ok(buffer),
                Err(RecvTimeoutError::Timeout) => self.ctx.check_canceled()?,
                Err(RecvTimeoutError::Disconnected) => return Err(CoreError::Canceled),
            }
        }
    }

    /// Puts an unused buffer back on the free list.
    pub(crate) fn give_back(&self, mut buffer: IndexOutputBuffer) {
        if !buffer.is_discard() {
            buffer.reset();
            let _ = self.free_tx.try_send(buffer);
        }
    }

    pub(crate) fn submit_sort(&self, buffer: IndexOutputBuffer) {
        self.sorts.submit(buffer);
    }

    /// Waits for outstanding sorts, then stops the writers.
    ///
    /// Returns the managers of every scratch file, ordered by stream name.
    pub(crate) fn finish(&self) -> CoreResult<Vec<Arc<IndexManager>>> {
        let sorted = self.sorts.wait();
        let written = self.writers.stop_and_join();
        match (sorted, written) {
            (Ok(()), Ok(managers)) => Ok(managers),
            (Err(err), Ok(managers)) => {
                for manager in managers {
                    manager.cleanup();
                }
                Err(err)
            }
            (Ok(()), Err(err)) => Err(err),
            (Err(sort_err), Err(write_err)) => {
                Err(crate::executor::prefer_fatal(Some(sort_err), write_err))
            }
        }
    }
}
