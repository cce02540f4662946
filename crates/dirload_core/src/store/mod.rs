//! Interfaces of the destination directory store.
//!
//! The loader does not own a storage engine. It writes through these traits,
//! which a backend implements on top of its key-ordered, transactional
//! record containers. [`memory`] provides a complete in-memory
//! implementation used by tests and by embedders without a persistent store.
//!
//! # Structure
//!
//! ```text
//! RootContainer
//! └─ EntryContainer (one per base DN)
//!    ├─ dn2id        DN key -> entry ID
//!    ├─ id2entry     entry ID -> entry
//!    ├─ dn2uri       referral DN -> URLs
//!    ├─ id2children  parent ID -> child IDs
//!    ├─ id2subtree   ancestor ID -> descendant IDs
//!    └─ attribute indexes (one tree per attribute and kind)
//! ```

pub mod memory;

use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::CoreResult;
use crate::id_set::{EntryIdSet, ImportIdSet};
use crate::index::AttributeIndex;
use crate::types::EntryId;
use std::sync::Arc;

/// A key to entry-ID-set tree: attribute indexes, id2children, id2subtree.
///
/// # Invariants
///
/// - `insert` and `delete` apply the tree's own entry limit, degrading
///   records to undefined exactly like [`crate::id_set::apply_insert`]
/// - `keys_from` iterates in ascending byte order
pub trait IndexTree: Send + Sync {
    /// Returns the tree name.
    fn name(&self) -> &str;

    /// Adds the IDs of `ids` to the record of `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn insert(&self, key: &[u8], ids: &ImportIdSet) -> CoreResult<()>;

    /// Removes the IDs of `ids` from the record of `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn delete(&self, key: &[u8], ids: &ImportIdSet) -> CoreResult<()>;

    /// Returns the record of `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn get(&self, key: &[u8]) -> CoreResult<Option<EntryIdSet>>;

    /// Returns up to `limit` records with keys at or after `start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn keys_from(&self, start: &[u8], limit: usize) -> CoreResult<Vec<(Vec<u8>, EntryIdSet)>>;

    /// Returns the number of keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn record_count(&self) -> CoreResult<u64>;

    /// Returns the configured entry limit (zero for unlimited).
    fn entry_limit(&self) -> usize;

    /// Returns true if counts are maintained above the limit.
    fn maintain_count(&self) -> bool;

    /// Returns true if the content is known to match the primary data.
    fn is_trusted(&self) -> bool;

    /// Persists the trusted flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn set_trusted(&self, trusted: bool) -> CoreResult<()>;

    /// Removes every record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn clear(&self) -> CoreResult<()>;
}

/// The DN key to entry ID tree.
pub trait Dn2IdTree: Send + Sync {
    /// Looks up the entry ID of a DN key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn get(&self, key: &[u8]) -> CoreResult<Option<EntryId>>;

    /// Maps `key` to `id`, replacing any previous mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn put(&self, key: &[u8], id: EntryId) -> CoreResult<()>;

    /// Removes the mapping of `key`, returning true if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn delete(&self, key: &[u8]) -> CoreResult<bool>;

    /// Positions a cursor: returns the first mapping with a key at or after
    /// `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn first_at_or_after(&self, key: &[u8]) -> CoreResult<Option<(Vec<u8>, EntryId)>>;

    /// Returns the number of mappings.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn count(&self) -> CoreResult<u64>;

    /// Removes every mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn clear(&self) -> CoreResult<()>;
}

/// The primary entry ID to entry record tree.
pub trait EntryTree: Send + Sync {
    /// Reads an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the record does not decode.
    fn get(&self, id: EntryId) -> CoreResult<Option<Entry>>;

    /// Writes an entry record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn put(&self, id: EntryId, entry: &Entry) -> CoreResult<()>;

    /// Returns the first entry with an ID greater than `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn next_after(&self, id: EntryId) -> CoreResult<Option<(EntryId, Entry)>>;

    /// Returns the number of entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn count(&self) -> CoreResult<u64>;

    /// Removes every entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn clear(&self) -> CoreResult<()>;
}

/// The referral side index (dn2uri).
pub trait ReferralTree: Send + Sync {
    /// Records the referral URLs of `entry`. Returns false for non-referrals.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn add_entry(&self, entry: &Entry) -> CoreResult<bool>;

    /// Replaces the record of `old` by that of `new`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn replace_entry(&self, old: &Entry, new: &Entry) -> CoreResult<()>;

    /// Returns the URLs recorded for `dn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn get(&self, dn: &Dn) -> CoreResult<Option<Vec<String>>>;

    /// Returns true if the content is known to match the primary data.
    fn is_trusted(&self) -> bool;

    /// Persists the trusted flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn set_trusted(&self, trusted: bool) -> CoreResult<()>;

    /// Removes every record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn clear(&self) -> CoreResult<()>;
}

/// All trees of one base DN.
pub trait EntryContainer: Send + Sync {
    /// Returns the base DN.
    fn base_dn(&self) -> &Dn;

    /// Returns the container name, unique within its root container.
    fn name(&self) -> String;

    /// Returns the dn2id tree.
    fn dn2id(&self) -> Arc<dyn Dn2IdTree>;

    /// Returns the id2entry tree.
    fn id2entry(&self) -> Arc<dyn EntryTree>;

    /// Returns the dn2uri tree.
    fn dn2uri(&self) -> Arc<dyn ReferralTree>;

    /// Returns the id2children tree.
    fn id2children(&self) -> Arc<dyn IndexTree>;

    /// Returns the id2subtree tree.
    fn id2subtree(&self) -> Arc<dyn IndexTree>;

    /// Returns the attribute indexes.
    fn attribute_indexes(&self) -> Vec<Arc<AttributeIndex>>;

    /// Takes the exclusive write lock for the duration of a run.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is already locked.
    fn lock(&self) -> CoreResult<()>;

    /// Releases the exclusive write lock.
    fn unlock(&self);

    /// Removes every record of every tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn clear(&self) -> CoreResult<()>;

    /// Drops the container's storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    fn delete(&self) -> CoreResult<()>;
}

/// The set of entry containers of one backend.
pub trait RootContainer: Send + Sync {
    /// Assigns the next entry ID.
    fn next_entry_id(&self) -> EntryId;

    /// Returns the base DNs with a registered container.
    fn base_dns(&self) -> Vec<Dn>;

    /// Returns the container registered for `base`.
    fn entry_container(&self, base: &Dn) -> Option<Arc<dyn EntryContainer>>;

    /// Creates an unregistered, empty container for `base` with the same
    /// index configuration as the registered one.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be created.
    fn open_entry_container(&self, base: &Dn, name: &str) -> CoreResult<Arc<dyn EntryContainer>>;

    /// Registers `container` as the container of `base`.
    ///
    /// # Errors
    ///
    /// Returns an error if another container is registered for `base`.
    fn register(&self, base: &Dn, container: Arc<dyn EntryContainer>) -> CoreResult<()>;

    /// Unregisters the container of `base`, returning it.
    fn unregister(&self, base: &Dn) -> Option<Arc<dyn EntryContainer>>;
}
