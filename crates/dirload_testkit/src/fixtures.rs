//! Test fixtures and directory helpers.
//!
//! Provides an in-memory directory with one configured suffix, sample entry
//! trees and lookups that hide the DN and index key encodings.

use dirload_core::store::memory::MemoryRootContainer;
use dirload_core::store::{EntryContainer, RootContainer};
use dirload_core::{
    AttributeIndexConfig, CoreResult, Dn, Entry, EntryId, EntryIdSet, ImportConfig, ImportReport, Importer,
    IndexKind, MemorySource,
};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;
use tempfile::TempDir;

/// Base DN of every fixture.
pub const EXAMPLE_BASE: &str = "dc=example,dc=com";

/// Memory budget small enough to keep test allocations modest.
pub const TEST_MEMORY: u64 = 64 * 1024 * 1024;

/// The indexes configured on the fixture suffix.
pub fn example_indexes() -> Vec<AttributeIndexConfig> {
    vec![
        AttributeIndexConfig::new("cn")
            .with_kind(IndexKind::Equality)
            .with_kind(IndexKind::Presence)
            .with_kind(IndexKind::Substring),
        AttributeIndexConfig::new("mail").with_kind(IndexKind::Equality),
        AttributeIndexConfig::new("uid").with_kind(IndexKind::Equality),
        AttributeIndexConfig::new("objectClass").with_kind(IndexKind::Equality),
    ]
}

/// An in-memory directory with the suffix [`EXAMPLE_BASE`].
pub struct TestDirectory {
    /// The root container.
    pub root: Arc<MemoryRootContainer>,
    base: Dn,
    scratch: Option<TempDir>,
}

impl TestDirectory {
    /// Creates a directory whose imports keep scratch data in memory.
    pub fn new() -> Self {
        let root = Arc::new(MemoryRootContainer::new());
        root.add_suffix(EXAMPLE_BASE, example_indexes())
            .expect("Failed to add the example suffix");
        Self {
            root,
            base: Dn::parse(EXAMPLE_BASE).expect("Invalid base DN"),
            scratch: None,
        }
    }

    /// Creates a directory whose imports write scratch files to a
    /// temporary directory.
    pub fn with_scratch_dir() -> Self {
        let mut dir = Self::new();
        dir.scratch = Some(TempDir::new().expect("Failed to create temp directory"));
        dir
    }

    /// Returns the scratch directory, if any.
    pub fn scratch_path(&self) -> Option<&std::path::Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    /// Returns a small import configuration using the scratch directory.
    pub fn config(&self) -> ImportConfig {
        let mut config = ImportConfig::new()
            .thread_count(2)
            .available_memory(TEST_MEMORY)
            .progress_interval(None);
        if let Some(path) = self.scratch_path() {
            config = config.scratch_dir(path);
        }
        config
    }

    /// Imports `entries` with `config`.
    pub fn import(&self, entries: Vec<Entry>, config: ImportConfig) -> CoreResult<ImportReport> {
        let root: Arc<dyn RootContainer> = self.root.clone();
        Importer::new(config, root).import(Arc::new(MemorySource::new(entries)))
    }

    /// Returns the container currently registered for the base DN.
    pub fn container(&self) -> Arc<dyn EntryContainer> {
        self.root
            .entry_container(&self.base)
            .expect("Example suffix is not registered")
    }

    /// Looks up the entry id of `dn` in dn2id.
    pub fn entry_id(&self, dn: &str) -> Option<EntryId> {
        let key = Dn::parse(dn)
            .and_then(|dn| dn.to_key(&self.base))
            .expect("DN is not below the example base");
        self.container().dn2id().get(&key).expect("dn2id lookup failed")
    }

    /// Returns the entry stored for `dn`.
    pub fn entry(&self, dn: &str) -> Option<Entry> {
        let id = self.entry_id(dn)?;
        self.container().id2entry().get(id).expect("id2entry lookup failed")
    }

    /// Returns the id set stored for `value` in the `kind` index of
    /// `attribute`.
    pub fn index_lookup(&self, attribute: &str, kind: IndexKind, value: &str) -> Option<EntryIdSet> {
        let index = self
            .container()
            .attribute_indexes()
            .into_iter()
            .find(|index| index.attribute().eq_ignore_ascii_case(attribute))
            .expect("Attribute is not indexed");
        let mut keys = BTreeSet::new();
        index.config().extract_keys(kind, &[value.to_string()], &mut keys);
        let key = keys.into_iter().next().expect("Value produced no key");
        index
            .tree(kind)
            .expect("Index kind is not configured")
            .get(&key)
            .expect("Index lookup failed")
    }

    /// Returns the ids stored for `value`, which must be a defined set.
    pub fn index_ids(&self, attribute: &str, kind: IndexKind, value: &str) -> Vec<u64> {
        defined_ids(self.index_lookup(attribute, kind, value))
    }

    /// Returns the children of `dn` from id2children.
    pub fn children_of(&self, dn: &str) -> Vec<u64> {
        let id = self.entry_id(dn).expect("Parent is not in dn2id");
        defined_ids(self.container().id2children().get(&id.to_key()).expect("id2children lookup failed"))
    }

    /// Returns the subordinates of `dn` from id2subtree.
    pub fn subtree_of(&self, dn: &str) -> Vec<u64> {
        let id = self.entry_id(dn).expect("Parent is not in dn2id");
        defined_ids(self.container().id2subtree().get(&id.to_key()).expect("id2subtree lookup failed"))
    }

    /// Returns the number of dn2id records.
    pub fn dn_count(&self) -> u64 {
        self.container().dn2id().count().expect("dn2id count failed")
    }
}

impl Default for TestDirectory {
    fn default() -> Self {
        Self::new()
    }
}

fn defined_ids(set: Option<EntryIdSet>) -> Vec<u64> {
    match set {
        None => Vec::new(),
        Some(EntryIdSet::Defined(ids)) => ids.iter().map(|id| id.as_u64()).collect(),
        Some(other) => panic!("expected a defined id set, got {other:?}"),
    }
}

/// Parses `dn` into an entry with the given attribute values.
pub fn entry(dn: &str, values: &[(&str, &str)]) -> Entry {
    let mut entry = Entry::new(Dn::parse(dn).expect("Invalid DN"));
    for (attribute, value) in values {
        entry.add_value(attribute, *value);
    }
    entry
}

/// A person entry under `ou=people`.
pub fn person(uid: &str) -> Entry {
    let mail = format!("{uid}@example.com");
    entry(
        &format!("cn={uid},ou=people,{EXAMPLE_BASE}"),
        &[
            ("objectClass", "person"),
            ("cn", uid),
            ("uid", uid),
            ("mail", mail.as_str()),
        ],
    )
}

/// The base entry, `ou=people` and `cn=bob` under it.
pub fn sample_entries() -> Vec<Entry> {
    vec![
        entry(EXAMPLE_BASE, &[("objectClass", "domain"), ("dc", "example")]),
        entry(
            &format!("ou=people,{EXAMPLE_BASE}"),
            &[("objectClass", "organizationalUnit"), ("ou", "people")],
        ),
        entry(
            &format!("cn=bob,ou=people,{EXAMPLE_BASE}"),
            &[("objectClass", "person"), ("cn", "bob"), ("mail", "bob@example.com")],
        ),
    ]
}

/// The base entry, `ou=people`, `ou=groups` and `people` person entries.
pub fn people_tree(people: usize) -> Vec<Entry> {
    let mut entries = vec![
        entry(EXAMPLE_BASE, &[("objectClass", "domain")]),
        entry(&format!("ou=people,{EXAMPLE_BASE}"), &[("objectClass", "organizationalUnit")]),
        entry(&format!("ou=groups,{EXAMPLE_BASE}"), &[("objectClass", "organizationalUnit")]),
    ];
    entries.extend((0..people).map(|n| person(&format!("user{n:05}"))));
    entries
}

/// Renders entries as LDIF content records.
pub fn to_ldif(entries: &[Entry]) -> String {
    let mut out = String::new();
    for entry in entries {
        let _ = writeln!(out, "dn: {}", entry.dn());
        for (attribute, values) in entry.attributes() {
            for value in values {
                let _ = writeln!(out, "{attribute}: {value}");
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_import() {
        let dir = TestDirectory::new();
        let report = dir.import(sample_entries(), dir.config()).unwrap();
        assert!(report.is_completed());
        assert_eq!(dir.dn_count(), 3);
        let bob = dir.entry_id("cn=bob,ou=people,dc=example,dc=com").unwrap();
        assert_eq!(dir.index_ids("cn", IndexKind::Equality, "bob"), vec![bob.as_u64()]);
    }

    #[test]
    fn people_tree_shape() {
        let entries = people_tree(4);
        assert_eq!(entries.len(), 7);
        assert_eq!(entries[3].dn().to_string(), "cn=user00000,ou=people,dc=example,dc=com");
    }

    #[test]
    fn ldif_rendering() {
        let text = to_ldif(&sample_entries()[..1]);
        assert!(text.starts_with("dn: dc=example,dc=com\n"));
        assert!(text.ends_with("\n\n"));
    }
}
