//! Phase-one workers: read, validate and index entries.

use crate::dn_cache::DnCache;
use crate::entry::Entry;
use crate::error::{CoreError, CoreResult};
use crate::index::IndexKey;
use crate::phase_one::{IndexOutputBuffer, PhaseOne};
use crate::source::EntrySource;
use crate::store::RootContainer;
use crate::suffix::{match_suffix, Suffix};
use crate::types::{EntryId, IndexId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Per-worker buffers, one per index stream.
pub(crate) struct KeyEmitter<'a> {
    phase: &'a PhaseOne,
    buffers: HashMap<IndexKey, IndexOutputBuffer>,
}

impl<'a> KeyEmitter<'a> {
    pub(crate) fn new(phase: &'a PhaseOne) -> Self {
        Self {
            phase,
            buffers: HashMap::new(),
        }
    }

    /// Buffers one record, handing full buffers to the sort pool.
    pub(crate) fn emit(
        &mut self,
        key: &IndexKey,
        index_id: IndexId,
        bytes: &[u8],
        entry_id: EntryId,
        insert: bool,
    ) -> CoreResult<()> {
        let size = IndexOutputBuffer::record_size(bytes.len(), entry_id);
        if size > self.phase.buffer_size() {
            trace!(index = %key, size, "record larger than a buffer");
            let mut oversized = IndexOutputBuffer::discard(size);
            oversized.set_index_key(key.clone());
            oversized.add(bytes, entry_id, index_id, insert);
            self.phase.submit_sort(oversized);
            return Ok(());
        }

        if let Some(buffer) = self.buffers.get_mut(key) {
            if buffer.has_room(bytes.len(), entry_id) {
                buffer.add(bytes, entry_id, index_id, insert);
                return Ok(());
            }
        }
        if let Some(full) = self.buffers.remove(key) {
            self.phase.submit_sort(full);
        }
        let mut buffer = self.phase.take_free()?;
        buffer.set_index_key(key.clone());
        buffer.add(bytes, entry_id, index_id, insert);
        self.buffers.insert(key.clone(), buffer);
        Ok(())
    }

    /// Hands every partly filled buffer to the sort pool.
    pub(crate) fn finish(mut self) {
        for (_, buffer) in self.buffers.drain() {
            if buffer.is_empty() {
                self.phase.give_back(buffer);
            } else {
                self.phase.submit_sort(buffer);
            }
        }
    }

    /// Returns every buffer unsorted after a failure.
    pub(crate) fn abandon(mut self) {
        for (_, buffer) in self.buffers.drain() {
            self.phase.give_back(buffer);
        }
    }
}

/// Writes `entry` to id2entry and dn2uri and emits its index keys.
pub(crate) fn index_entry(
    suffix: &Suffix,
    entry: &Entry,
    id: EntryId,
    emitter: &mut KeyEmitter<'_>,
) -> CoreResult<()> {
    if let Some((key, index_id)) = &suffix.streams.dn {
        emitter.emit(key, *index_id, &suffix.dn_key(entry.dn())?, id, true)?;
    }
    suffix.container().dn2uri().add_entry(entry)?;
    suffix
        .streams
        .for_each_attribute_key(entry, |key, index_id, bytes| emitter.emit(key, index_id, bytes, id, true))?;
    suffix.container().id2entry().put(id, entry)
}

/// An entry handed to a worker, with its suffix and a fresh entry id.
pub(crate) struct FedEntry {
    pub(crate) entry: Entry,
    pub(crate) suffix: Arc<Suffix>,
    pub(crate) id: EntryId,
}

/// Serialises reads from the source.
///
/// Reading, suffix matching, marking the DN pending and id assignment happen
/// under one lock, so a child read after its parent always finds the parent
/// either pending or validated.
pub(crate) struct EntryFeed {
    source: Arc<dyn EntrySource>,
    root: Arc<dyn RootContainer>,
    suffixes: Vec<Arc<Suffix>>,
    track_pending: bool,
    lock: Mutex<()>,
}

impl EntryFeed {
    pub(crate) fn new(
        source: Arc<dyn EntrySource>,
        root: Arc<dyn RootContainer>,
        suffixes: Vec<Arc<Suffix>>,
        track_pending: bool,
    ) -> Self {
        Self {
            source,
            root,
            suffixes,
            track_pending,
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn source(&self) -> &dyn EntrySource {
        &*self.source
    }

    /// Returns the next entry some suffix loads.
    pub(crate) fn next(&self) -> CoreResult<Option<FedEntry>> {
        let _guard = self.lock.lock();
        while let Some(entry) = self.source.next_entry()? {
            let Some(suffix) = match_suffix(&self.suffixes, entry.dn()).filter(|s| s.wants(entry.dn())) else {
                self.source.ignore(&entry);
                continue;
            };
            if self.track_pending {
                suffix.add_pending(entry.dn());
            }
            let id = self.root.next_entry_id();
            return Ok(Some(FedEntry {
                entry,
                suffix: Arc::clone(suffix),
                id,
            }));
        }
        Ok(None)
    }
}

/// How a worker treats entries whose DN already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryPolicy {
    /// Existing DNs are rejected.
    Import,
    /// Existing entries are replaced in place, keeping their id.
    AppendReplace,
}

pub(crate) struct ImportWorker {
    phase: Arc<PhaseOne>,
    feed: Arc<EntryFeed>,
    dn_cache: Option<Arc<DnCache>>,
    cleared: bool,
    policy: EntryPolicy,
}

impl ImportWorker {
    pub(crate) fn new(
        phase: Arc<PhaseOne>,
        feed: Arc<EntryFeed>,
        dn_cache: Option<Arc<DnCache>>,
        cleared: bool,
        policy: EntryPolicy,
    ) -> Self {
        Self {
            phase,
            feed,
            dn_cache,
            cleared,
            policy,
        }
    }

    /// Processes entries until the source is exhausted.
    pub(crate) fn run(&self) -> CoreResult<()> {
        let mut emitter = KeyEmitter::new(&self.phase);
        match self.process_all(&mut emitter) {
            Ok(()) => {
                emitter.finish();
                Ok(())
            }
            Err(err) => {
                emitter.abandon();
                self.phase.ctx().abort("import worker", &err);
                Err(err)
            }
        }
    }

    fn process_all(&self, emitter: &mut KeyEmitter<'_>) -> CoreResult<()> {
        loop {
            self.phase.ctx().check_canceled()?;
            let Some(fed) = self.feed.next()? else {
                return Ok(());
            };
            match self.policy {
                EntryPolicy::Import => self.process_import(fed, emitter)?,
                EntryPolicy::AppendReplace => self.process_append_replace(fed, emitter)?,
            }
        }
    }

    fn process_import(&self, fed: FedEntry, emitter: &mut KeyEmitter<'_>) -> CoreResult<()> {
        let FedEntry { entry, suffix, id } = fed;
        let verdict = match &self.dn_cache {
            Some(cache) => self.check_dn(&suffix, &entry, cache),
            None => Ok(None),
        };
        suffix.remove_pending(entry.dn());
        if let Some(reason) = verdict? {
            self.feed.source().reject(&entry, &reason);
            return Ok(());
        }
        index_entry(&suffix, &entry, id, emitter)?;
        self.phase.ctx().stats.record_imported();
        Ok(())
    }

    /// Returns the rejection reason for `entry`, if any.
    fn check_dn(&self, suffix: &Suffix, entry: &Entry, cache: &DnCache) -> CoreResult<Option<String>> {
        let dn = entry.dn();
        if dn != suffix.base() {
            let cancel = self.phase.ctx().cancel.flag();
            match dn.parent() {
                Some(parent) if suffix.is_parent_processed(&parent, cache, self.cleared, cancel)? => {}
                Some(parent) => return Ok(Some(format!("parent entry '{parent}' does not exist"))),
                None => return Ok(Some("entry has no parent".to_string())),
            }
        }
        if !self.cleared && suffix.container().dn2id().get(&suffix.dn_key(dn)?)?.is_some() {
            return Ok(Some("entry already exists".to_string()));
        }
        if !cache.insert(dn)? {
            return Ok(Some("entry already exists in the import source".to_string()));
        }
        Ok(None)
    }

    fn process_append_replace(&self, fed: FedEntry, emitter: &mut KeyEmitter<'_>) -> CoreResult<()> {
        let key = fed.suffix.dn_key(fed.entry.dn())?;
        let Some(old_id) = fed.suffix.container().dn2id().get(&key)? else {
            return self.process_import(fed, emitter);
        };
        let FedEntry { entry, suffix, .. } = fed;
        suffix.remove_pending(entry.dn());

        let container = suffix.container();
        let old = container.id2entry().get(old_id)?.ok_or_else(|| {
            CoreError::store(format!("dn2id maps '{}' to missing {old_id}", entry.dn()))
        })?;
        container.dn2uri().replace_entry(&old, &entry)?;
        suffix
            .streams
            .for_each_attribute_key(&old, |key, index_id, bytes| emitter.emit(key, index_id, bytes, old_id, false))?;
        suffix
            .streams
            .for_each_attribute_key(&entry, |key, index_id, bytes| emitter.emit(key, index_id, bytes, old_id, true))?;
        container.id2entry().put(old_id, &entry)?;

        let stats = &self.phase.ctx().stats;
        stats.record_replaced();
        stats.record_imported();
        Ok(())
    }
}
