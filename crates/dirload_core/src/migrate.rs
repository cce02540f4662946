//! Migration of existing entries into a temporary container.
//!
//! When include or exclude branches restrict an import, the import writes a
//! fresh container. Entries of the previous container that the import does
//! not replace are copied over with new entry ids:
//!
//! - before the workers start, everything outside the include branches;
//! - after they finish, everything under the exclude branches.

use crate::dn::{subtree_upper_bound, DN_KEY_SEPARATOR};
use crate::dn_cache::DnCache;
use crate::error::{CoreError, CoreResult};
use crate::phase_one::{index_entry, KeyEmitter, PhaseOne};
use crate::store::{EntryContainer, RootContainer};
use crate::suffix::Suffix;
use crate::types::EntryId;
use tracing::info;

pub(crate) struct Migration<'a> {
    suffix: &'a Suffix,
    root: &'a dyn RootContainer,
    phase: &'a PhaseOne,
    dn_cache: Option<&'a DnCache>,
}

impl<'a> Migration<'a> {
    pub(crate) fn new(
        suffix: &'a Suffix,
        root: &'a dyn RootContainer,
        phase: &'a PhaseOne,
        dn_cache: Option<&'a DnCache>,
    ) -> Self {
        Self {
            suffix,
            root,
            phase,
            dn_cache,
        }
    }

    /// Copies every entry outside the include branches.
    pub(crate) fn migrate_existing(&self) -> CoreResult<u64> {
        let Some(source) = self.suffix.source() else {
            return Ok(0);
        };
        let mut emitter = KeyEmitter::new(self.phase);
        let outcome = self.copy_existing(&**source, &mut emitter);
        self.finish(emitter, outcome, "existing")
    }

    /// Copies every entry under the exclude branches.
    pub(crate) fn migrate_excluded(&self) -> CoreResult<u64> {
        let Some(source) = self.suffix.source() else {
            return Ok(0);
        };
        let mut emitter = KeyEmitter::new(self.phase);
        let outcome = self.copy_excluded(&**source, &mut emitter);
        self.finish(emitter, outcome, "excluded")
    }

    fn copy_existing(&self, source: &dyn EntryContainer, emitter: &mut KeyEmitter<'_>) -> CoreResult<u64> {
        let include_keys = self
            .suffix
            .include_branches()
            .iter()
            .map(|dn| self.suffix.dn_key(dn))
            .collect::<CoreResult<Vec<_>>>()?;
        let dn2id = source.dn2id();
        let mut migrated = 0;
        let mut cursor = Vec::new();
        while let Some((key, id)) = dn2id.first_at_or_after(&cursor)? {
            self.phase.ctx().check_canceled()?;
            if include_keys.contains(&key) {
                cursor = subtree_upper_bound(&key);
                continue;
            }
            self.migrate_one(source, id, emitter)?;
            migrated += 1;
            cursor = key;
            cursor.push(DN_KEY_SEPARATOR);
        }
        Ok(migrated)
    }

    fn copy_excluded(&self, source: &dyn EntryContainer, emitter: &mut KeyEmitter<'_>) -> CoreResult<u64> {
        let dn2id = source.dn2id();
        let mut migrated = 0;
        for exclude in self.suffix.exclude_branches() {
            let mut cursor = self.suffix.dn_key(exclude)?;
            let bound = subtree_upper_bound(&cursor);
            while let Some((key, id)) = dn2id.first_at_or_after(&cursor)? {
                if key >= bound {
                    break;
                }
                self.phase.ctx().check_canceled()?;
                self.migrate_one(source, id, emitter)?;
                migrated += 1;
                cursor = key;
                cursor.push(DN_KEY_SEPARATOR);
            }
        }
        Ok(migrated)
    }

    fn migrate_one(&self, source: &dyn EntryContainer, old_id: EntryId, emitter: &mut KeyEmitter<'_>) -> CoreResult<()> {
        let entry = source.id2entry().get(old_id)?.ok_or_else(|| {
            CoreError::store(format!("{} has no entry for {old_id}", source.name()))
        })?;
        let id = self.root.next_entry_id();
        if let Some(cache) = self.dn_cache {
            cache.insert(entry.dn())?;
        }
        index_entry(self.suffix, &entry, id, emitter)?;
        self.phase.ctx().stats.record_migrated();
        Ok(())
    }

    fn finish(&self, emitter: KeyEmitter<'_>, outcome: CoreResult<u64>, what: &str) -> CoreResult<u64> {
        match outcome {
            Ok(migrated) => {
                emitter.finish();
                if migrated > 0 {
                    info!(base = %self.suffix.base(), migrated, "migrated {what} entries");
                }
                Ok(migrated)
            }
            Err(err) => {
                emitter.abandon();
                Err(err)
            }
        }
    }
}
