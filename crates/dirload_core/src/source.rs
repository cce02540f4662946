//! Entry sources feeding an import.
//!
//! A source is shared by every phase-one worker, so implementations are
//! internally synchronised. Besides yielding entries, a source owns the
//! read / rejected / ignored counters and the reject callback.

use crate::entry::Entry;
use crate::error::CoreResult;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// A stream of entries to import.
pub trait EntrySource: Send + Sync {
    /// Returns the next entry, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying input fails. Malformed records
    /// are rejected and skipped instead.
    fn next_entry(&self) -> CoreResult<Option<Entry>>;

    /// Number of records read so far, including rejected ones.
    fn entries_read(&self) -> u64;

    /// Number of rejected records.
    fn entries_rejected(&self) -> u64;

    /// Number of entries skipped because no suffix wanted them.
    fn entries_ignored(&self) -> u64;

    /// Rejects an entry, recording why.
    fn reject(&self, entry: &Entry, reason: &str);

    /// Marks an entry as ignored.
    fn ignore(&self, entry: &Entry);
}

/// One rejected record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// DN of the record, or its position when it had no usable DN.
    pub dn: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Counters and reject log shared by the source implementations.
#[derive(Debug, Default)]
pub struct SourceCounters {
    read: AtomicU64,
    rejected: AtomicU64,
    ignored: AtomicU64,
    rejections: Mutex<Vec<Rejection>>,
}

impl SourceCounters {
    /// Records a read.
    pub fn record_read(&self) {
        self.read.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a rejection.
    pub fn record_rejection(&self, dn: String, reason: &str) {
        warn!(dn = %dn, reason, "entry rejected");
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.rejections.lock().push(Rejection {
            dn,
            reason: reason.to_string(),
        });
    }

    /// Records an ignored entry.
    pub fn record_ignored(&self, dn: String) {
        debug!(dn = %dn, "entry ignored");
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the read counter.
    pub fn read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    /// Returns the rejected counter.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Returns the ignored counter.
    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    /// Returns a copy of every rejection so far.
    pub fn rejections(&self) -> Vec<Rejection> {
        self.rejections.lock().clone()
    }
}

/// A source over a fixed list of entries.
#[derive(Debug, Default)]
pub struct MemorySource {
    entries: Mutex<VecDeque<Entry>>,
    counters: SourceCounters,
}

impl MemorySource {
    /// Creates a source yielding `entries` in order.
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = Entry>) -> Self {
        Self {
            entries: Mutex::new(entries.into_iter().collect()),
            counters: SourceCounters::default(),
        }
    }

    /// Returns every rejection so far.
    #[must_use]
    pub fn rejections(&self) -> Vec<Rejection> {
        self.counters.rejections()
    }
}

impl EntrySource for MemorySource {
    fn next_entry(&self) -> CoreResult<Option<Entry>> {
        let entry = self.entries.lock().pop_front();
        if entry.is_some() {
            self.counters.record_read();
        }
        Ok(entry)
    }

    fn entries_read(&self) -> u64 {
        self.counters.read()
    }

    fn entries_rejected(&self) -> u64 {
        self.counters.rejected()
    }

    fn entries_ignored(&self) -> u64 {
        self.counters.ignored()
    }

    fn reject(&self, entry: &Entry, reason: &str) {
        self.counters.record_rejection(entry.dn().to_string(), reason);
    }

    fn ignore(&self, entry: &Entry) {
        self.counters.record_ignored(entry.dn().to_string());
    }
}
