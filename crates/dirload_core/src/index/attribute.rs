//! An attribute index bound to its destination trees.

use crate::error::CoreResult;
use crate::index::{AttributeIndexConfig, IndexKind};
use crate::store::IndexTree;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The configured indexes of one attribute together with the trees that
/// receive their keys.
pub struct AttributeIndex {
    config: AttributeIndexConfig,
    trees: BTreeMap<IndexKind, Arc<dyn IndexTree>>,
}

impl AttributeIndex {
    /// Binds `config` to one tree per stream kind.
    ///
    /// Trees for kinds the configuration does not produce are ignored.
    #[must_use]
    pub fn new(config: AttributeIndexConfig, trees: BTreeMap<IndexKind, Arc<dyn IndexTree>>) -> Self {
        let kinds = config.stream_kinds();
        let trees = trees
            .into_iter()
            .filter(|(kind, _)| kinds.contains(kind))
            .collect();
        Self { config, trees }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &AttributeIndexConfig {
        &self.config
    }

    /// Returns the lower-cased attribute type.
    #[must_use]
    pub fn attribute(&self) -> &str {
        &self.config.attribute
    }

    /// Returns the tree of one stream kind.
    #[must_use]
    pub fn tree(&self, kind: IndexKind) -> Option<&Arc<dyn IndexTree>> {
        self.trees.get(&kind)
    }

    /// Iterates over `(kind, tree)` pairs.
    pub fn trees(&self) -> impl Iterator<Item = (IndexKind, &Arc<dyn IndexTree>)> {
        self.trees.iter().map(|(kind, tree)| (*kind, tree))
    }

    /// Returns true if every tree is trusted.
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.trees.values().all(|tree| tree.is_trusted())
    }

    /// Sets the trusted flag on every tree.
    ///
    /// # Errors
    ///
    /// Returns an error if a tree rejects the update.
    pub fn set_trusted(&self, trusted: bool) -> CoreResult<()> {
        for tree in self.trees.values() {
            tree.set_trusted(trusted)?;
        }
        Ok(())
    }
}

impl fmt::Debug for AttributeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeIndex")
            .field("attribute", &self.config.attribute)
            .field("kinds", &self.trees.keys().collect::<Vec<_>>())
            .finish()
    }
}
