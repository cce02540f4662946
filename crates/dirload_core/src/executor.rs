//! Fixed-size thread pools and the phase-two permit semaphore.
//!
//! Every pool is a set of named OS threads pulling boxed jobs from one
//! unbounded crossbeam channel. Jobs report back through a one-shot channel
//! so the submitter can join them individually; a panicking job becomes
//! [`CoreError::TaskFailed`] instead of tearing down the pool.

use crate::error::{CoreError, CoreResult};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// How long blocking waits sleep between cancellation checks.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of worker threads.
pub(crate) struct TaskPool {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Spawns `threads` workers named `<name>-<n>`.
    pub(crate) fn new(name: &str, threads: usize) -> CoreResult<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads.max(1));
        for n in 0..threads.max(1) {
            let receiver = receiver.clone();
            let worker = thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })?;
            workers.push(worker);
        }
        debug!(pool = name, threads = workers.len(), "started task pool");
        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            workers,
        })
    }

    /// Queues `task`, returning a handle to its result.
    pub(crate) fn submit<T, F>(&self, task_name: impl Into<String>, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> CoreResult<T> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let task_name = task_name.into();
        let job_name = task_name.clone();
        let job: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|_| {
                error!(task = %job_name, "task panicked");
                Err(CoreError::TaskFailed { task: job_name })
            });
            let _ = tx.send(outcome);
        });
        if let Some(sender) = &self.sender {
            if sender.send(job).is_err() {
                error!(pool = %self.name, "task pool is shut down");
            }
        }
        TaskHandle {
            name: task_name,
            receiver: rx,
        }
    }

    /// Stops accepting jobs and waits for queued jobs to finish.
    pub(crate) fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Result slot of one submitted task.
pub(crate) struct TaskHandle<T> {
    name: String,
    receiver: Receiver<CoreResult<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task finishes.
    pub(crate) fn join(self) -> CoreResult<T> {
        self.receiver
            .recv()
            .unwrap_or_else(|_| Err(CoreError::TaskFailed { task: self.name }))
    }
}

/// Joins every handle and returns the first error that is not a
/// cancellation, or [`CoreError::Canceled`] if the only errors were
/// cancellations.
pub(crate) fn join_all<T>(handles: impl IntoIterator<Item = TaskHandle<T>>) -> CoreResult<Vec<T>> {
    let mut values = Vec::new();
    let mut failure: Option<CoreError> = None;
    for handle in handles {
        match handle.join() {
            Ok(value) => values.push(value),
            Err(err) => failure = Some(prefer_fatal(failure, err)),
        }
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(values),
    }
}

/// Keeps the first fatal error; a cancellation only wins over nothing.
pub(crate) fn prefer_fatal(current: Option<CoreError>, next: CoreError) -> CoreError {
    match current {
        Some(err) if !err.is_canceled() || next.is_canceled() => err,
        _ => next,
    }
}

/// A counting semaphore whose waits give up once `cancel` is set.
pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    released: Condvar,
}

impl Semaphore {
    pub(crate) fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            released: Condvar::new(),
        }
    }

    /// Takes `count` permits, blocking until they are free.
    pub(crate) fn acquire(&self, count: usize, cancel: &AtomicBool) -> CoreResult<()> {
        let mut permits = self.permits.lock();
        while *permits < count {
            if cancel.load(Ordering::Acquire) {
                return Err(CoreError::Canceled);
            }
            self.released.wait_for(&mut permits, POLL_INTERVAL);
        }
        *permits -= count;
        Ok(())
    }

    pub(crate) fn release(&self, count: usize) {
        if count == 0 {
            return;
        }
        *self.permits.lock() += count;
        self.released.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        *self.permits.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn pool_runs_tasks_and_returns_results() {
        let pool = TaskPool::new("test", 3).unwrap();
        let handles: Vec<_> = (0..10u64)
            .map(|n| pool.submit(format!("square-{n}"), move || Ok(n * n)))
            .collect();
        let results = join_all(handles).unwrap();
        assert_eq!(results, (0..10u64).map(|n| n * n).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn panics_become_task_failures() {
        let pool = TaskPool::new("test", 1).unwrap();
        let handle = pool.submit("boom", || -> CoreResult<()> { panic!("boom") });
        assert!(matches!(handle.join(), Err(CoreError::TaskFailed { task }) if task == "boom"));

        let after = pool.submit("after", || Ok(1));
        assert_eq!(after.join().unwrap(), 1);
    }

    #[test]
    fn fatal_errors_win_over_cancellation() {
        let pool = TaskPool::new("test", 2).unwrap();
        let handles = vec![
            pool.submit("a", || -> CoreResult<()> { Err(CoreError::Canceled) }),
            pool.submit("b", || Err(CoreError::store("disk gone"))),
            pool.submit("c", || Err(CoreError::Canceled)),
        ];
        assert!(matches!(join_all(handles), Err(CoreError::Store { .. })));

        let handles = vec![pool.submit("d", || -> CoreResult<()> { Err(CoreError::Canceled) })];
        assert!(matches!(join_all(handles), Err(CoreError::Canceled)));
    }

    #[test]
    fn semaphore_bounds_concurrency() {
        let semaphore = Arc::new(Semaphore::new(2));
        let cancel = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..6)
            .map(|_| {
                let (semaphore, cancel) = (Arc::clone(&semaphore), Arc::clone(&cancel));
                let (active, peak) = (Arc::clone(&active), Arc::clone(&peak));
                thread::spawn(move || {
                    semaphore.acquire(1, &cancel).unwrap();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                    semaphore.release(1);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(semaphore.available(), 2);
    }

    #[test]
    fn semaphore_wait_observes_cancellation() {
        let semaphore = Semaphore::new(0);
        let cancel = AtomicBool::new(true);
        assert!(matches!(semaphore.acquire(1, &cancel), Err(CoreError::Canceled)));
    }
}
