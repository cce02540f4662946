//! Builds dn2id, id2children and id2subtree from the sorted dn stream.
//!
//! DN keys arrive in key order, so every parent precedes its children and
//! the chain of ancestors of the current key can be kept on a stack. Parents
//! that were not part of this run (append mode) are looked up in dn2id.

use crate::dn::{parent_key, DN_KEY_SEPARATOR};
use crate::error::{CoreError, CoreResult};
use crate::id_set::ImportIdSet;
use crate::registry::{tree_limits, DnTargets};
use crate::store::IndexTree;
use crate::types::EntryId;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

pub(crate) struct DnState {
    targets: DnTargets,
    ancestors: Vec<(Vec<u8>, EntryId)>,
    children: BTreeMap<EntryId, ImportIdSet>,
    subtree: BTreeMap<EntryId, ImportIdSet>,
    flush_threshold: usize,
    keys_written: u64,
}

/// True if `ancestor` is a proper DN-key ancestor of `key`.
fn is_ancestor_key(ancestor: &[u8], key: &[u8]) -> bool {
    ancestor.len() < key.len() && key.starts_with(ancestor) && key[ancestor.len()] == DN_KEY_SEPARATOR
}

impl DnState {
    pub(crate) fn new(targets: DnTargets, flush_threshold: usize) -> Self {
        Self {
            targets,
            ancestors: Vec::new(),
            children: BTreeMap::new(),
            subtree: BTreeMap::new(),
            flush_threshold: flush_threshold.max(1),
            keys_written: 0,
        }
    }

    /// Records the entry of one DN key.
    pub(crate) fn write(&mut self, key: &[u8], ids: &ImportIdSet) -> CoreResult<()> {
        let Some(&id) = ids.ids().first() else {
            return Ok(());
        };
        if ids.len() > 1 {
            warn!(key = ?String::from_utf8_lossy(key), ids = ids.len(), kept = %id, "DN key maps to several entries");
        }

        while let Some((top, _)) = self.ancestors.last() {
            if is_ancestor_key(top, key) {
                break;
            }
            self.ancestors.pop();
        }

        if let Some(parent) = parent_key(key) {
            let parent_id = self.ancestor_id(parent)?.ok_or_else(|| {
                CoreError::constraint_violation(format!(
                    "parent of DN key {:?} is missing",
                    String::from_utf8_lossy(key)
                ))
            })?;
            if let Some(tree) = &self.targets.children {
                add_to(&mut self.children, tree, parent_id, id);
            }
            if let Some(tree) = self.targets.subtree.clone() {
                add_to(&mut self.subtree, &tree, parent_id, id);
                let mut current = parent_key(parent);
                while let Some(ancestor) = current {
                    let ancestor_id = self.ancestor_id(ancestor)?.ok_or_else(|| {
                        CoreError::constraint_violation(format!(
                            "ancestor {:?} of a DN key is missing",
                            String::from_utf8_lossy(ancestor)
                        ))
                    })?;
                    add_to(&mut self.subtree, &tree, ancestor_id, id);
                    current = parent_key(ancestor);
                }
            }
        }

        if self.targets.write_dn2id {
            self.targets.dn2id.put(key, id)?;
            self.keys_written += 1;
        }
        self.ancestors.push((key.to_vec(), id));

        if self.children.len() > self.flush_threshold {
            self.flush_children()?;
        }
        if self.subtree.len() > self.flush_threshold {
            self.flush_subtree()?;
        }
        Ok(())
    }

    fn ancestor_id(&self, key: &[u8]) -> CoreResult<Option<EntryId>> {
        if let Some((_, id)) = self.ancestors.iter().rev().find(|(k, _)| k.as_slice() == key) {
            return Ok(Some(*id));
        }
        self.targets.dn2id.get(key)
    }

    fn flush_children(&mut self) -> CoreResult<()> {
        if let Some(tree) = &self.targets.children {
            self.keys_written += flush(&mut self.children, &**tree)?;
        }
        Ok(())
    }

    fn flush_subtree(&mut self) -> CoreResult<()> {
        if let Some(tree) = &self.targets.subtree {
            self.keys_written += flush(&mut self.subtree, &**tree)?;
        }
        Ok(())
    }

    /// Writes the remaining sets and returns the number of keys written.
    pub(crate) fn finish(mut self) -> CoreResult<u64> {
        self.flush_children()?;
        self.flush_subtree()?;
        Ok(self.keys_written)
    }
}

fn add_to(sets: &mut BTreeMap<EntryId, ImportIdSet>, tree: &Arc<dyn IndexTree>, parent: EntryId, id: EntryId) {
    sets.entry(parent)
        .or_insert_with(|| {
            let (limit, maintain) = tree_limits(&**tree);
            ImportIdSet::new(limit, maintain)
        })
        .add(id);
}

fn flush(sets: &mut BTreeMap<EntryId, ImportIdSet>, tree: &dyn IndexTree) -> CoreResult<u64> {
    let written = sets.len() as u64;
    for (id, set) in std::mem::take(sets) {
        tree.insert(&id.to_key(), &set)?;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id_set::EntryIdSet;
    use crate::store::memory::{MemoryDn2IdTree, MemoryIndexTree};
    use crate::store::Dn2IdTree;

    fn targets() -> (DnTargets, Arc<MemoryDn2IdTree>, Arc<MemoryIndexTree>, Arc<MemoryIndexTree>) {
        let dn2id = Arc::new(MemoryDn2IdTree::default());
        let children = Arc::new(MemoryIndexTree::new("id2children", 0, false));
        let subtree = Arc::new(MemoryIndexTree::new("id2subtree", 0, false));
        let targets = DnTargets {
            dn2id: dn2id.clone(),
            write_dn2id: true,
            children: Some(children.clone()),
            subtree: Some(subtree.clone()),
        };
        (targets, dn2id, children, subtree)
    }

    fn one(id: u64) -> ImportIdSet {
        let mut set = ImportIdSet::new(0, false);
        set.add(EntryId::new(id));
        set
    }

    fn ids(tree: &MemoryIndexTree, parent: u64) -> Vec<u64> {
        match tree.get(&EntryId::new(parent).to_key()).unwrap() {
            Some(EntryIdSet::Defined(ids)) => ids.iter().map(|id| id.as_u64()).collect(),
            other => panic!("unexpected set {other:?}"),
        }
    }

    #[test]
    fn builds_parent_and_subtree_sets() {
        let (targets, dn2id, children, subtree) = targets();
        let mut state = DnState::new(targets, 1);
        state.write(b"", &one(1)).unwrap();
        state.write(b"\0ou=people", &one(2)).unwrap();
        state.write(b"\0ou=people\0cn=a", &one(3)).unwrap();
        state.write(b"\0ou=people\0cn=b", &one(4)).unwrap();
        state.write(b"\0ou=staff", &one(5)).unwrap();
        state.finish().unwrap();

        assert_eq!(dn2id.get(b"\0ou=people\0cn=b").unwrap(), Some(EntryId::new(4)));
        assert_eq!(ids(&children, 1), vec![2, 5]);
        assert_eq!(ids(&children, 2), vec![3, 4]);
        assert_eq!(ids(&subtree, 1), vec![2, 3, 4, 5]);
        assert_eq!(ids(&subtree, 2), vec![3, 4]);
    }

    #[test]
    fn parents_outside_the_run_come_from_dn2id() {
        let (targets, dn2id, children, subtree) = targets();
        dn2id.put(b"", EntryId::new(1)).unwrap();
        dn2id.put(b"\0ou=people", EntryId::new(2)).unwrap();
        let mut state = DnState::new(targets, 100);
        state.write(b"\0ou=people\0cn=new", &one(9)).unwrap();
        state.finish().unwrap();
        assert_eq!(ids(&children, 2), vec![9]);
        assert_eq!(ids(&subtree, 1), vec![9]);
    }

    #[test]
    fn missing_parent_is_a_violation() {
        let (targets, ..) = targets();
        let mut state = DnState::new(targets, 100);
        assert!(matches!(
            state.write(b"\0ou=ghost\0cn=a", &one(3)),
            Err(CoreError::ConstraintViolation { .. })
        ));
    }

    #[test]
    fn duplicate_ids_keep_the_smallest() {
        let (targets, dn2id, ..) = targets();
        let mut state = DnState::new(targets, 100);
        let mut both = one(7);
        both.add(EntryId::new(3));
        state.write(b"", &both).unwrap();
        assert_eq!(dn2id.get(b"").unwrap(), Some(EntryId::new(3)));
    }

    #[test]
    fn ancestor_keys() {
        assert!(is_ancestor_key(b"", b"\0a"));
        assert!(is_ancestor_key(b"\0a", b"\0a\0b"));
        assert!(!is_ancestor_key(b"\0a", b"\0ab"));
        assert!(!is_ancestor_key(b"\0a", b"\0a"));
    }
}
