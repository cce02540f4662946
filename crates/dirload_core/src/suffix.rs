//! One base DN taking part in a run.
//!
//! A suffix knows which container receives its entries, which container
//! the previous data is migrated from, and which branches of the source are
//! loaded. It also tracks entries that workers have read but not yet
//! validated, so a child never checks for its parent while the parent is
//! still in flight on another worker.

use crate::config::ImportConfig;
use crate::dn::Dn;
use crate::dn_cache::DnCache;
use crate::error::{CoreError, CoreResult};
use crate::executor::POLL_INTERVAL;
use crate::registry::StreamSet;
use crate::store::{EntryContainer, RootContainer};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Parents remembered as present, so siblings skip the cache lookup.
const RECENT_PARENTS: usize = 16;

/// Suffix appended to the base DN to name the temporary container.
const TEMP_CONTAINER_SUFFIX: &str = "_importTmp";

pub(crate) struct Suffix {
    base: Dn,
    container: Arc<dyn EntryContainer>,
    source: Option<Arc<dyn EntryContainer>>,
    include_branches: Vec<Dn>,
    exclude_branches: Vec<Dn>,
    pub(crate) streams: StreamSet,
    pending: Mutex<HashSet<Dn>>,
    processed: Condvar,
    recent_parents: Mutex<VecDeque<Dn>>,
}

impl Suffix {
    pub(crate) fn new(container: Arc<dyn EntryContainer>) -> Self {
        Self {
            base: container.base_dn().clone(),
            container,
            source: None,
            include_branches: Vec::new(),
            exclude_branches: Vec::new(),
            streams: StreamSet::default(),
            pending: Mutex::new(HashSet::new()),
            processed: Condvar::new(),
            recent_parents: Mutex::new(VecDeque::with_capacity(RECENT_PARENTS)),
        }
    }

    /// Decides how `container` takes part in an import.
    ///
    /// Returns `None` when the configured branches leave nothing of the
    /// suffix to load. Branch selection only applies when the import
    /// replaces existing data without clearing the whole backend; it may
    /// redirect the load into a fresh temporary container while the
    /// previous one becomes the migration source.
    pub(crate) fn resolve(
        root: &dyn RootContainer,
        container: Arc<dyn EntryContainer>,
        config: &ImportConfig,
    ) -> CoreResult<Option<Self>> {
        let base = container.base_dn().clone();
        if config.append || config.clear_backend {
            return Ok(Some(Self::new(container)));
        }

        let excludes = parse_branches(&config.exclude_branches)?;
        let includes = parse_branches(&config.include_branches)?;
        if excludes.contains(&base) {
            info!(base = %base, "base DN excluded, skipping suffix");
            return Ok(None);
        }
        let mut exclude_branches: Vec<Dn> = excludes
            .into_iter()
            .filter(|dn| dn.is_descendant_of(&base))
            .collect();

        if includes.is_empty() {
            let mut suffix = Self::new(container);
            suffix.exclude_branches = exclude_branches;
            return Ok(Some(suffix));
        }

        let under_base: Vec<Dn> = includes
            .into_iter()
            .filter(|dn| dn.is_under_or_equal(&base))
            .collect();
        if under_base.is_empty() {
            info!(base = %base, "no include branch under base DN, skipping suffix");
            return Ok(None);
        }
        let mut include_branches: Vec<Dn> = Vec::new();
        for dn in &under_base {
            let nested = under_base.iter().any(|other| dn.is_descendant_of(other));
            if !nested && !include_branches.contains(dn) {
                include_branches.push(dn.clone());
            }
        }
        exclude_branches.retain(|dn| include_branches.iter().any(|inc| dn.is_descendant_of(inc)));

        if include_branches.len() == 1 && exclude_branches.is_empty() && include_branches[0] == base {
            let mut suffix = Self::new(container);
            suffix.include_branches = include_branches;
            return Ok(Some(suffix));
        }

        let temp_name = format!("{}{TEMP_CONTAINER_SUFFIX}", base.normalized());
        debug!(base = %base, container = %temp_name, "loading into a temporary container");
        let temp = root.open_entry_container(&base, &temp_name)?;
        let mut suffix = Self::new(temp);
        suffix.source = Some(container);
        suffix.include_branches = include_branches;
        suffix.exclude_branches = exclude_branches;
        Ok(Some(suffix))
    }

    pub(crate) fn base(&self) -> &Dn {
        &self.base
    }

    /// The container entries are written to.
    pub(crate) fn container(&self) -> &Arc<dyn EntryContainer> {
        &self.container
    }

    /// The container existing entries are migrated from, if any.
    pub(crate) fn source(&self) -> Option<&Arc<dyn EntryContainer>> {
        self.source.as_ref()
    }

    pub(crate) fn include_branches(&self) -> &[Dn] {
        &self.include_branches
    }

    pub(crate) fn exclude_branches(&self) -> &[Dn] {
        &self.exclude_branches
    }

    /// Returns the DN key of `dn` within this suffix.
    pub(crate) fn dn_key(&self, dn: &Dn) -> CoreResult<Vec<u8>> {
        dn.to_key(&self.base)
    }

    /// Returns true if a source entry with this DN is loaded.
    pub(crate) fn wants(&self, dn: &Dn) -> bool {
        if self.exclude_branches.iter().any(|ex| dn.is_under_or_equal(ex)) {
            return false;
        }
        self.include_branches.is_empty()
            || self.include_branches.iter().any(|inc| dn.is_under_or_equal(inc))
    }

    /// Marks `dn` as read but not yet validated.
    pub(crate) fn add_pending(&self, dn: &Dn) {
        self.pending.lock().insert(dn.clone());
    }

    /// Releases workers waiting on `dn`.
    pub(crate) fn remove_pending(&self, dn: &Dn) {
        let removed = self.pending.lock().remove(dn);
        if removed {
            self.processed.notify_all();
        }
    }

    /// Returns true if `parent` exists, waiting for it first if another
    /// worker is still validating it.
    ///
    /// Presence is decided by the DN cache or, unless the destination
    /// started out empty, by the destination's dn2id.
    pub(crate) fn is_parent_processed(
        &self,
        parent: &Dn,
        dn_cache: &DnCache,
        cleared: bool,
        cancel: &AtomicBool,
    ) -> CoreResult<bool> {
        if self.recent_parents.lock().contains(parent) {
            return Ok(true);
        }
        {
            let mut pending = self.pending.lock();
            while pending.contains(parent) {
                if cancel.load(Ordering::Acquire) {
                    return Err(CoreError::Canceled);
                }
                self.processed.wait_for(&mut pending, POLL_INTERVAL);
            }
        }

        let mut found = dn_cache.contains(parent)?;
        if !found && !cleared {
            let key = self.dn_key(parent)?;
            found = self.container.dn2id().get(&key)?.is_some();
        }
        if found {
            let mut recent = self.recent_parents.lock();
            if recent.len() == RECENT_PARENTS {
                recent.pop_front();
            }
            recent.push_back(parent.clone());
        }
        Ok(found)
    }
}

fn parse_branches(branches: &[String]) -> CoreResult<Vec<Dn>> {
    branches.iter().map(|text| Dn::parse(text)).collect()
}

/// Finds the suffix whose base DN is the closest ancestor-or-self of `dn`.
pub(crate) fn match_suffix<'a>(suffixes: &'a [Arc<Suffix>], dn: &Dn) -> Option<&'a Arc<Suffix>> {
    suffixes
        .iter()
        .filter(|suffix| dn.is_under_or_equal(suffix.base()))
        .max_by_key(|suffix| suffix.base().len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryRootContainer;
    use dirload_storage::InMemoryBackend;
    use std::thread;
    use std::time::Duration;

    fn dn(text: &str) -> Dn {
        Dn::parse(text).unwrap()
    }

    fn setup() -> (MemoryRootContainer, Arc<dyn EntryContainer>) {
        let root = MemoryRootContainer::new();
        let container = root.add_suffix("dc=example,dc=com", Vec::new()).unwrap();
        (root, container)
    }

    #[test]
    fn append_ignores_branches() {
        let (root, container) = setup();
        let config = ImportConfig::new()
            .append(true)
            .exclude_branch("dc=example,dc=com");
        let suffix = Suffix::resolve(&root, container, &config)
            .unwrap()
            .unwrap();
        assert!(suffix.source().is_none());
        assert!(suffix.wants(&dn("cn=x,dc=example,dc=com")));
    }

    #[test]
    fn excluded_base_skips_suffix() {
        let (root, container) = setup();
        let config = ImportConfig::new().exclude_branch("DC=Example,dc=com");
        assert!(Suffix::resolve(&root, container, &config)
            .unwrap()
            .is_none());
    }

    #[test]
    fn include_outside_base_skips_suffix() {
        let (root, container) = setup();
        let config = ImportConfig::new().include_branch("dc=other,dc=com");
        assert!(Suffix::resolve(&root, container, &config)
            .unwrap()
            .is_none());
    }

    #[test]
    fn include_of_whole_base_loads_in_place() {
        let (root, container) = setup();
        let config = ImportConfig::new().include_branch("dc=example,dc=com");
        let suffix = Suffix::resolve(&root, container.clone(), &config)
            .unwrap()
            .unwrap();
        assert!(suffix.source().is_none());
        assert_eq!(suffix.container().name(), container.name());
    }

    #[test]
    fn partial_include_uses_temporary_container() {
        let (root, container) = setup();
        let config = ImportConfig::new()
            .include_branch("ou=people,dc=example,dc=com")
            .include_branch("ou=staff,ou=people,dc=example,dc=com")
            .exclude_branch("ou=gone,ou=people,dc=example,dc=com")
            .exclude_branch("ou=groups,dc=example,dc=com");
        let suffix = Suffix::resolve(&root, container, &config)
            .unwrap()
            .unwrap();

        assert_eq!(suffix.container().name(), "dc=example,dc=com_importTmp");
        assert!(suffix.source().is_some());
        assert_eq!(suffix.include_branches(), &[dn("ou=people,dc=example,dc=com")]);
        assert_eq!(suffix.exclude_branches(), &[dn("ou=gone,ou=people,dc=example,dc=com")]);

        assert!(suffix.wants(&dn("cn=a,ou=staff,ou=people,dc=example,dc=com")));
        assert!(!suffix.wants(&dn("cn=a,ou=gone,ou=people,dc=example,dc=com")));
        assert!(!suffix.wants(&dn("cn=a,ou=groups,dc=example,dc=com")));
        assert!(!suffix.wants(&dn("dc=example,dc=com")));
    }

    #[test]
    fn closest_suffix_wins() {
        let root = MemoryRootContainer::new();
        let outer = root.add_suffix("dc=com", Vec::new()).unwrap();
        let inner = root.add_suffix("dc=example,dc=com", Vec::new()).unwrap();
        let suffixes = vec![
            Arc::new(Suffix::new(outer)),
            Arc::new(Suffix::new(inner)),
        ];
        let found = match_suffix(&suffixes, &dn("cn=a,dc=example,dc=com")).unwrap();
        assert_eq!(found.base(), &dn("dc=example,dc=com"));
        assert!(match_suffix(&suffixes, &dn("dc=org")).is_none());
    }

    #[test]
    fn child_waits_for_pending_parent() {
        let (_root, container) = setup();
        let suffix = Arc::new(Suffix::new(container));
        let cache = Arc::new(DnCache::new(Box::new(InMemoryBackend::new())));
        let parent = dn("ou=people,dc=example,dc=com");
        suffix.add_pending(&parent);

        let waiter = {
            let (suffix, cache, parent) = (Arc::clone(&suffix), Arc::clone(&cache), parent.clone());
            thread::spawn(move || {
                let cancel = AtomicBool::new(false);
                suffix.is_parent_processed(&parent, &cache, true, &cancel)
            })
        };
        thread::sleep(Duration::from_millis(20));
        cache.insert(&parent).unwrap();
        suffix.remove_pending(&parent);
        assert!(waiter.join().unwrap().unwrap());
    }

    #[test]
    fn missing_parent_consults_dn2id_unless_cleared() {
        let (_root, container) = setup();
        container.dn2id().put(b"\0ou=people", crate::types::EntryId::new(2)).unwrap();
        let suffix = Suffix::new(container);
        let cache = DnCache::new(Box::new(InMemoryBackend::new()));
        let cancel = AtomicBool::new(false);
        let parent = dn("ou=people,dc=example,dc=com");

        assert!(!suffix.is_parent_processed(&parent, &cache, true, &cancel).unwrap());
        assert!(suffix.is_parent_processed(&parent, &cache, false, &cancel).unwrap());
        assert!(suffix.is_parent_processed(&parent, &cache, true, &cancel).unwrap());
    }

    #[test]
    fn canceled_wait_returns() {
        let (_root, container) = setup();
        let suffix = Suffix::new(container);
        let cache = DnCache::new(Box::new(InMemoryBackend::new()));
        let parent = dn("ou=people,dc=example,dc=com");
        suffix.add_pending(&parent);
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            suffix.is_parent_processed(&parent, &cache, true, &cancel),
            Err(CoreError::Canceled)
        ));
    }
}
