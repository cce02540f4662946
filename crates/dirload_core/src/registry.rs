//! Run-scoped handles for destination index trees.
//!
//! Every tree a run writes gets an [`IndexId`] when the run starts. The id
//! travels with each buffered and scratch record, so phase two can find the
//! destination of a record without holding on to store objects.

use crate::entry::Entry;
use crate::error::{CoreError, CoreResult};
use crate::index::{AttributeIndex, IndexKey, IndexKind};
use crate::store::{Dn2IdTree, EntryContainer, IndexTree};
use crate::types::IndexId;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Destinations fed by the dn2id stream of one suffix.
#[derive(Clone)]
pub(crate) struct DnTargets {
    pub(crate) dn2id: Arc<dyn Dn2IdTree>,
    /// False when dn2id is only read, e.g. when rebuilding id2children.
    pub(crate) write_dn2id: bool,
    pub(crate) children: Option<Arc<dyn IndexTree>>,
    pub(crate) subtree: Option<Arc<dyn IndexTree>>,
}

/// Where the records of one index id end up.
#[derive(Clone)]
pub(crate) enum IndexTarget {
    Tree(Arc<dyn IndexTree>),
    Dn(DnTargets),
}

pub(crate) struct RegisteredIndex {
    pub(crate) key: IndexKey,
    pub(crate) target: IndexTarget,
}

/// Index ids of one run, in registration order.
#[derive(Default)]
pub(crate) struct IndexRegistry {
    indexes: Vec<RegisteredIndex>,
}

impl IndexRegistry {
    pub(crate) fn register(&mut self, key: IndexKey, target: IndexTarget) -> IndexId {
        let id = IndexId::new(self.indexes.len() as u32);
        self.indexes.push(RegisteredIndex { key, target });
        id
    }

    pub(crate) fn get(&self, id: IndexId) -> CoreResult<&RegisteredIndex> {
        self.indexes
            .get(id.as_u32() as usize)
            .ok_or_else(|| CoreError::scratch_corruption(format!("unknown index id {id}")))
    }

    /// Returns the id-set limits of `id`, unlimited for unknown ids.
    pub(crate) fn limits(&self, id: IndexId) -> (usize, bool) {
        self.get(id)
            .map(|index| (index.key.entry_limit(), index.key.maintain_count()))
            .unwrap_or((0, false))
    }

    pub(crate) fn len(&self) -> usize {
        self.indexes.len()
    }
}

/// The streams of one attribute index that a run writes.
pub(crate) struct AttributeStreams {
    pub(crate) index: Arc<AttributeIndex>,
    pub(crate) streams: Vec<(IndexKey, IndexId)>,
}

/// Index ids a suffix emits keys for.
#[derive(Default)]
pub(crate) struct StreamSet {
    pub(crate) dn: Option<(IndexKey, IndexId)>,
    pub(crate) attributes: Vec<AttributeStreams>,
}

impl StreamSet {
    /// Registers dn2id, id2children, id2subtree and every attribute stream
    /// of `container`.
    pub(crate) fn register_all(
        registry: &mut IndexRegistry,
        container: &dyn EntryContainer,
    ) -> Self {
        let targets = DnTargets {
            dn2id: container.dn2id(),
            write_dn2id: true,
            children: Some(container.id2children()),
            subtree: Some(container.id2subtree()),
        };
        Self::register(registry, Some(targets), container.attribute_indexes(), |_, _| true)
    }

    /// Registers the dn targets, if any, and the attribute streams accepted
    /// by `select`.
    pub(crate) fn register(
        registry: &mut IndexRegistry,
        dn_targets: Option<DnTargets>,
        indexes: Vec<Arc<AttributeIndex>>,
        select: impl Fn(&AttributeIndex, IndexKind) -> bool,
    ) -> Self {
        let dn = dn_targets.map(|targets| {
            let key = IndexKey::dn2id();
            let id = registry.register(key.clone(), IndexTarget::Dn(targets));
            (key, id)
        });

        let mut attributes = Vec::new();
        for index in indexes {
            let mut streams = Vec::new();
            for (kind, tree) in index.trees() {
                if !select(&*index, kind) {
                    continue;
                }
                let key = index.config().index_key(kind);
                let id = registry.register(key.clone(), IndexTarget::Tree(tree.clone()));
                streams.push((key, id));
            }
            if !streams.is_empty() {
                attributes.push(AttributeStreams { index, streams });
            }
        }
        Self { dn, attributes }
    }

    /// Returns every attribute tree the set writes.
    pub(crate) fn attribute_trees(&self) -> Vec<Arc<dyn IndexTree>> {
        self.attributes
            .iter()
            .flat_map(|attr| {
                attr.streams
                    .iter()
                    .filter_map(|(key, _)| attr.index.tree(key.kind()).cloned())
            })
            .collect()
    }

    /// Extracts the attribute keys of `entry` and hands each to `emit`.
    ///
    /// Attributes the entry does not carry produce nothing.
    pub(crate) fn for_each_attribute_key(
        &self,
        entry: &Entry,
        mut emit: impl FnMut(&IndexKey, IndexId, &[u8]) -> CoreResult<()>,
    ) -> CoreResult<()> {
        let mut keys = BTreeSet::new();
        for attr in &self.attributes {
            let values = entry.values(attr.index.attribute());
            if values.is_empty() {
                continue;
            }
            for (key, id) in &attr.streams {
                keys.clear();
                attr.index.config().extract_keys(key.kind(), values, &mut keys);
                for value_key in &keys {
                    emit(key, *id, value_key)?;
                }
            }
        }
        Ok(())
    }
}

/// Id-set limits used for the per-parent sets of id2children/id2subtree.
pub(crate) fn tree_limits(tree: &dyn IndexTree) -> (usize, bool) {
    (tree.entry_limit(), tree.maintain_count())
}
