//! Sort tasks: the step between a full buffer and its scratch writer.

use crate::context::ImportContext;
use crate::error::{CoreError, CoreResult};
use crate::executor::{prefer_fatal, TaskPool, POLL_INTERVAL};
use crate::phase_one::output_buffer::IndexOutputBuffer;
use crate::phase_one::writer::ScratchWriters;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Outstanding sort tasks and the first error any of them hit.
#[derive(Default)]
struct Outstanding {
    running: usize,
    failure: Option<CoreError>,
}

pub(crate) struct SortStage {
    ctx: Arc<ImportContext>,
    pool: TaskPool,
    writers: Arc<ScratchWriters>,
    state: Arc<(Mutex<Outstanding>, Condvar)>,
}

impl SortStage {
    pub(crate) fn new(ctx: Arc<ImportContext>, threads: usize, writers: Arc<ScratchWriters>) -> CoreResult<Self> {
        Ok(Self {
            pool: TaskPool::new("dirload-sort", threads)?,
            ctx,
            writers,
            state: Arc::new((Mutex::new(Outstanding::default()), Condvar::new())),
        })
    }

    /// Sorts `buffer` on the pool and queues it on its writer.
    pub(crate) fn submit(&self, mut buffer: IndexOutputBuffer) {
        self.state.0.lock().running += 1;
        let ctx = Arc::clone(&self.ctx);
        let writers = Arc::clone(&self.writers);
        let state = Arc::clone(&self.state);
        let task_name = buffer
            .index_key()
            .map_or_else(|| "sort".to_string(), |key| format!("sort {}", key.name()));

        // The handle is not kept: outcomes are collected through `state`.
        let _ = self.pool.submit(task_name.clone(), move || {
            let _running = Running(Arc::clone(&state));
            let outcome = ctx.check_canceled().and_then(|()| {
                buffer.sort();
                ctx.stats.record_buffer_sorted();
                writers.enqueue(buffer)
            });
            if let Err(err) = outcome {
                ctx.abort(&task_name, &err);
                let mut outstanding = state.0.lock();
                outstanding.failure = Some(prefer_fatal(outstanding.failure.take(), err));
            }
            Ok(())
        });
    }

    /// Waits for every submitted sort to finish.
    pub(crate) fn wait(&self) -> CoreResult<()> {
        let (lock, done) = &*self.state;
        let mut outstanding = lock.lock();
        while outstanding.running > 0 {
            done.wait_for(&mut outstanding, POLL_INTERVAL);
        }
        match outstanding.failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Counts a sort as finished even if it panics.
struct Running(Arc<(Mutex<Outstanding>, Condvar)>);

impl Drop for Running {
    fn drop(&mut self) {
        let (lock, done) = &*self.0;
        lock.lock().running -= 1;
        done.notify_all();
    }
}
