//! Periodic progress log lines for the whole run.
//!
//! Phase one lines report entries read, phase two lines report merged
//! indexes and committed keys.

use crate::source::EntrySource;
use crate::stats::ImportStats;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub(crate) struct ProgressReporter {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    /// Starts logging every `interval`. Returns `None` when disabled.
    pub(crate) fn start(
        interval: Option<Duration>,
        source: Arc<dyn EntrySource>,
        stats: Arc<ImportStats>,
    ) -> Option<Self> {
        let interval = interval.filter(|d| !d.is_zero())?;
        let (stop, stopped) = bounded::<()>(1);
        let spawned = thread::Builder::new()
            .name("dirload-progress".to_string())
            .spawn(move || {
                let mut tracker = Tracker::new();
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                    match tracker.sample(&*source, &stats) {
                        Sample::Loading { read, rate } => info!(
                            read,
                            imported = stats.imported(),
                            rejected = source.entries_rejected(),
                            ignored = source.entries_ignored(),
                            migrated = stats.migrated(),
                            rate = %format!("{rate:.1}/s"),
                            "import progress"
                        ),
                        Sample::Merging { indexes, keys, rate } => info!(
                            indexes_merged = indexes,
                            keys_written = keys,
                            rate = %format!("{rate:.1} keys/s"),
                            "merge progress"
                        ),
                    }
                }
            });
        match spawned {
            Ok(handle) => Some(Self { stop, handle }),
            Err(err) => {
                warn!(error = %err, "could not start the progress reporter");
                None
            }
        }
    }

    pub(crate) fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.handle.join();
    }
}

/// One progress line.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Sample {
    Loading { read: u64, rate: f64 },
    Merging { indexes: u64, keys: u64, rate: f64 },
}

/// Rates since the previous line.
struct Tracker {
    last_read: u64,
    last_keys: u64,
    last_time: Instant,
}

impl Tracker {
    fn new() -> Self {
        Self {
            last_read: 0,
            last_keys: 0,
            last_time: Instant::now(),
        }
    }

    fn sample(&mut self, source: &dyn EntrySource, stats: &ImportStats) -> Sample {
        let elapsed = self.last_time.elapsed().as_secs_f64();
        let per_second = |delta: u64| if elapsed > 0.0 { delta as f64 / elapsed } else { 0.0 };
        self.last_time = Instant::now();

        if stats.is_merging() {
            let keys = stats.keys_written();
            let rate = per_second(keys.saturating_sub(self.last_keys));
            self.last_keys = keys;
            Sample::Merging {
                indexes: stats.indexes_merged(),
                keys,
                rate,
            }
        } else {
            let read = source.entries_read();
            let rate = per_second(read.saturating_sub(self.last_read));
            self.last_read = read;
            Sample::Loading { read, rate }
        }
    }
}
