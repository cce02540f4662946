//! In-memory directory store.
//!
//! Every tree is a `BTreeMap` behind a `parking_lot::RwLock`, which gives the
//! key-ordered iteration the loader relies on. Nothing is persisted.
//!
//! # Example
//!
//! ```rust
//! use dirload_core::index::{AttributeIndexConfig, IndexKind};
//! use dirload_core::store::memory::MemoryRootContainer;
//! use dirload_core::store::RootContainer;
//!
//! let root = MemoryRootContainer::new();
//! root.add_suffix(
//!     "dc=example,dc=com",
//!     vec![AttributeIndexConfig::new("cn").with_kind(IndexKind::Equality)],
//! )
//! .unwrap();
//! assert_eq!(root.base_dns().len(), 1);
//! ```

use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::{CoreError, CoreResult};
use crate::id_set::{apply_delete, apply_insert, EntryIdSet, ImportIdSet};
use crate::index::{AttributeIndex, AttributeIndexConfig, IndexKind};
use crate::store::{Dn2IdTree, EntryContainer, EntryTree, IndexTree, ReferralTree, RootContainer};
use crate::types::EntryId;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// In-memory key to ID-set tree.
#[derive(Debug)]
pub struct MemoryIndexTree {
    name: String,
    entry_limit: usize,
    maintain_count: bool,
    records: RwLock<BTreeMap<Vec<u8>, EntryIdSet>>,
    trusted: AtomicBool,
}

impl MemoryIndexTree {
    /// Creates an empty, trusted tree.
    #[must_use]
    pub fn new(name: impl Into<String>, entry_limit: usize, maintain_count: bool) -> Self {
        Self {
            name: name.into(),
            entry_limit,
            maintain_count,
            records: RwLock::new(BTreeMap::new()),
            trusted: AtomicBool::new(true),
        }
    }
}

impl IndexTree for MemoryIndexTree {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(&self, key: &[u8], ids: &ImportIdSet) -> CoreResult<()> {
        let mut records = self.records.write();
        let existing = records.remove(key);
        let updated = apply_insert(existing, ids, self.entry_limit, self.maintain_count);
        records.insert(key.to_vec(), updated);
        Ok(())
    }

    fn delete(&self, key: &[u8], ids: &ImportIdSet) -> CoreResult<()> {
        let mut records = self.records.write();
        let existing = records.remove(key);
        if let Some(remaining) = apply_delete(existing, ids) {
            records.insert(key.to_vec(), remaining);
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> CoreResult<Option<EntryIdSet>> {
        Ok(self.records.read().get(key).cloned())
    }

    fn keys_from(&self, start: &[u8], limit: usize) -> CoreResult<Vec<(Vec<u8>, EntryIdSet)>> {
        Ok(self
            .records
            .read()
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
            .take(limit)
            .map(|(key, ids)| (key.clone(), ids.clone()))
            .collect())
    }

    fn record_count(&self) -> CoreResult<u64> {
        Ok(self.records.read().len() as u64)
    }

    fn entry_limit(&self) -> usize {
        self.entry_limit
    }

    fn maintain_count(&self) -> bool {
        self.maintain_count
    }

    fn is_trusted(&self) -> bool {
        self.trusted.load(Ordering::Acquire)
    }

    fn set_trusted(&self, trusted: bool) -> CoreResult<()> {
        self.trusted.store(trusted, Ordering::Release);
        Ok(())
    }

    fn clear(&self) -> CoreResult<()> {
        self.records.write().clear();
        Ok(())
    }
}

/// In-memory dn2id tree.
#[derive(Debug, Default)]
pub struct MemoryDn2IdTree {
    map: RwLock<BTreeMap<Vec<u8>, EntryId>>,
}

impl Dn2IdTree for MemoryDn2IdTree {
    fn get(&self, key: &[u8]) -> CoreResult<Option<EntryId>> {
        Ok(self.map.read().get(key).copied())
    }

    fn put(&self, key: &[u8], id: EntryId) -> CoreResult<()> {
        self.map.write().insert(key.to_vec(), id);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> CoreResult<bool> {
        Ok(self.map.write().remove(key).is_some())
    }

    fn first_at_or_after(&self, key: &[u8]) -> CoreResult<Option<(Vec<u8>, EntryId)>> {
        Ok(self
            .map
            .read()
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(|(key, id)| (key.clone(), *id)))
    }

    fn count(&self) -> CoreResult<u64> {
        Ok(self.map.read().len() as u64)
    }

    fn clear(&self) -> CoreResult<()> {
        self.map.write().clear();
        Ok(())
    }
}

/// In-memory id2entry tree.
#[derive(Debug, Default)]
pub struct MemoryEntryTree {
    entries: RwLock<BTreeMap<EntryId, Entry>>,
}

impl EntryTree for MemoryEntryTree {
    fn get(&self, id: EntryId) -> CoreResult<Option<Entry>> {
        Ok(self.entries.read().get(&id).cloned())
    }

    fn put(&self, id: EntryId, entry: &Entry) -> CoreResult<()> {
        if id.is_none() {
            return Err(CoreError::store("entry ID 0 is reserved"));
        }
        self.entries.write().insert(id, entry.clone());
        Ok(())
    }

    fn next_after(&self, id: EntryId) -> CoreResult<Option<(EntryId, Entry)>> {
        Ok(self
            .entries
            .read()
            .range((Bound::Excluded(id), Bound::Unbounded))
            .next()
            .map(|(id, entry)| (*id, entry.clone())))
    }

    fn count(&self) -> CoreResult<u64> {
        Ok(self.entries.read().len() as u64)
    }

    fn clear(&self) -> CoreResult<()> {
        self.entries.write().clear();
        Ok(())
    }
}

/// In-memory dn2uri tree keyed by normalised DN.
#[derive(Debug)]
pub struct MemoryReferralTree {
    referrals: RwLock<BTreeMap<String, Vec<String>>>,
    trusted: AtomicBool,
}

impl Default for MemoryReferralTree {
    fn default() -> Self {
        Self {
            referrals: RwLock::new(BTreeMap::new()),
            trusted: AtomicBool::new(true),
        }
    }
}

impl ReferralTree for MemoryReferralTree {
    fn add_entry(&self, entry: &Entry) -> CoreResult<bool> {
        let urls = entry.referral_urls();
        if urls.is_empty() {
            return Ok(false);
        }
        self.referrals
            .write()
            .insert(entry.dn().normalized(), urls.to_vec());
        Ok(true)
    }

    fn replace_entry(&self, old: &Entry, new: &Entry) -> CoreResult<()> {
        self.referrals.write().remove(&old.dn().normalized());
        self.add_entry(new)?;
        Ok(())
    }

    fn get(&self, dn: &Dn) -> CoreResult<Option<Vec<String>>> {
        Ok(self.referrals.read().get(&dn.normalized()).cloned())
    }

    fn is_trusted(&self) -> bool {
        self.trusted.load(Ordering::Acquire)
    }

    fn set_trusted(&self, trusted: bool) -> CoreResult<()> {
        self.trusted.store(trusted, Ordering::Release);
        Ok(())
    }

    fn clear(&self) -> CoreResult<()> {
        self.referrals.write().clear();
        Ok(())
    }
}

/// In-memory container for one base DN.
pub struct MemoryEntryContainer {
    base_dn: Dn,
    name: String,
    dn2id: Arc<MemoryDn2IdTree>,
    id2entry: Arc<MemoryEntryTree>,
    dn2uri: Arc<MemoryReferralTree>,
    id2children: Arc<MemoryIndexTree>,
    id2subtree: Arc<MemoryIndexTree>,
    indexes: Vec<Arc<AttributeIndex>>,
    locked: AtomicBool,
    deleted: AtomicBool,
}

impl MemoryEntryContainer {
    /// Creates an empty container with the given attribute indexes.
    ///
    /// The id2children and id2subtree trees are unlimited.
    #[must_use]
    pub fn new(base_dn: Dn, name: impl Into<String>, configs: Vec<AttributeIndexConfig>) -> Self {
        let indexes = configs
            .iter()
            .map(|config| {
                let trees = config
                    .stream_kinds()
                    .into_iter()
                    .map(|kind| {
                        let tree: Arc<dyn IndexTree> = Arc::new(MemoryIndexTree::new(
                            format!("{}.{}", config.attribute, kind),
                            config.entry_limit,
                            config.maintain_count,
                        ));
                        (kind, tree)
                    })
                    .collect::<BTreeMap<IndexKind, Arc<dyn IndexTree>>>();
                Arc::new(AttributeIndex::new(config.clone(), trees))
            })
            .collect();

        Self {
            base_dn,
            name: name.into(),
            dn2id: Arc::new(MemoryDn2IdTree::default()),
            id2entry: Arc::new(MemoryEntryTree::default()),
            dn2uri: Arc::new(MemoryReferralTree::default()),
            id2children: Arc::new(MemoryIndexTree::new("id2children", 0, false)),
            id2subtree: Arc::new(MemoryIndexTree::new("id2subtree", 0, false)),
            indexes,
            locked: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        }
    }

    /// Returns true once [`EntryContainer::delete`] has been called.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Returns true while a run holds the container lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

impl EntryContainer for MemoryEntryContainer {
    fn base_dn(&self) -> &Dn {
        &self.base_dn
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn dn2id(&self) -> Arc<dyn Dn2IdTree> {
        self.dn2id.clone()
    }

    fn id2entry(&self) -> Arc<dyn EntryTree> {
        self.id2entry.clone()
    }

    fn dn2uri(&self) -> Arc<dyn ReferralTree> {
        self.dn2uri.clone()
    }

    fn id2children(&self) -> Arc<dyn IndexTree> {
        self.id2children.clone()
    }

    fn id2subtree(&self) -> Arc<dyn IndexTree> {
        self.id2subtree.clone()
    }

    fn attribute_indexes(&self) -> Vec<Arc<AttributeIndex>> {
        self.indexes.clone()
    }

    fn lock(&self) -> CoreResult<()> {
        if self.locked.swap(true, Ordering::AcqRel) {
            return Err(CoreError::store(format!(
                "entry container {} is already locked",
                self.name
            )));
        }
        Ok(())
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn clear(&self) -> CoreResult<()> {
        self.dn2id.clear()?;
        self.id2entry.clear()?;
        self.dn2uri.clear()?;
        self.id2children.clear()?;
        self.id2subtree.clear()?;
        for index in &self.indexes {
            for (_, tree) in index.trees() {
                tree.clear()?;
            }
        }
        Ok(())
    }

    fn delete(&self) -> CoreResult<()> {
        self.clear()?;
        self.deleted.store(true, Ordering::Release);
        Ok(())
    }
}

/// In-memory root container.
pub struct MemoryRootContainer {
    next_id: AtomicU64,
    containers: RwLock<BTreeMap<String, Arc<dyn EntryContainer>>>,
    configs: Mutex<BTreeMap<String, Vec<AttributeIndexConfig>>>,
}

impl Default for MemoryRootContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRootContainer {
    /// Creates a root container with no suffixes. The first entry ID is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            containers: RwLock::new(BTreeMap::new()),
            configs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Adds and registers an empty suffix.
    ///
    /// # Errors
    ///
    /// Returns an error if the base DN is invalid or already registered.
    pub fn add_suffix(
        &self,
        base_dn: &str,
        configs: Vec<AttributeIndexConfig>,
    ) -> CoreResult<Arc<dyn EntryContainer>> {
        let base = Dn::parse(base_dn)?;
        self.configs.lock().insert(base.normalized(), configs.clone());
        let container: Arc<dyn EntryContainer> =
            Arc::new(MemoryEntryContainer::new(base.clone(), base.normalized(), configs));
        self.register(&base, container.clone())?;
        Ok(container)
    }

    /// Returns the next ID that will be assigned, without assigning it.
    #[must_use]
    pub fn peek_next_entry_id(&self) -> EntryId {
        EntryId::new(self.next_id.load(Ordering::Acquire))
    }
}

impl RootContainer for MemoryRootContainer {
    fn next_entry_id(&self) -> EntryId {
        EntryId::new(self.next_id.fetch_add(1, Ordering::AcqRel))
    }

    fn base_dns(&self) -> Vec<Dn> {
        self.containers
            .read()
            .values()
            .map(|container| container.base_dn().clone())
            .collect()
    }

    fn entry_container(&self, base: &Dn) -> Option<Arc<dyn EntryContainer>> {
        self.containers.read().get(&base.normalized()).cloned()
    }

    fn open_entry_container(&self, base: &Dn, name: &str) -> CoreResult<Arc<dyn EntryContainer>> {
        let configs = self
            .configs
            .lock()
            .get(&base.normalized())
            .cloned()
            .ok_or_else(|| CoreError::store(format!("no suffix configured for '{base}'")))?;
        Ok(Arc::new(MemoryEntryContainer::new(base.clone(), name, configs)))
    }

    fn register(&self, base: &Dn, container: Arc<dyn EntryContainer>) -> CoreResult<()> {
        let mut containers = self.containers.write();
        let key = base.normalized();
        if containers.contains_key(&key) {
            return Err(CoreError::store(format!(
                "a container is already registered for '{base}'"
            )));
        }
        containers.insert(key, container);
        Ok(())
    }

    fn unregister(&self, base: &Dn) -> Option<Arc<dyn EntryContainer>> {
        self.containers.write().remove(&base.normalized())
    }
}
