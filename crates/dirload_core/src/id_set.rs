//! Entry ID sets with the entry-limit degrade policy.
//!
//! Below an index's entry limit a key maps to an explicit sorted set of
//! entry IDs. Once a key would track more IDs than the limit allows, the set
//! degrades to *undefined*: the IDs are dropped and, when the index
//! maintains counts, only the number of IDs is kept. The same rule applies
//! while merging scratch records ([`ImportIdSet`]) and when those merged
//! sets are applied to persisted records ([`apply_insert`], [`apply_delete`]).

use crate::types::EntryId;

/// Persisted ID set of one index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryIdSet {
    /// Explicit, sorted, duplicate-free IDs.
    Defined(Vec<EntryId>),
    /// Too many IDs to track.
    Undefined {
        /// Number of IDs, when the index maintains counts.
        count: Option<u64>,
    },
}

impl EntryIdSet {
    /// Builds a defined set from arbitrary IDs.
    #[must_use]
    pub fn from_ids(ids: impl IntoIterator<Item = EntryId>) -> Self {
        let mut ids: Vec<EntryId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self::Defined(ids)
    }

    /// Returns true for an explicit set.
    #[must_use]
    pub fn is_defined(&self) -> bool {
        matches!(self, Self::Defined(_))
    }

    /// Returns the explicit IDs, or `None` when undefined.
    #[must_use]
    pub fn ids(&self) -> Option<&[EntryId]> {
        match self {
            Self::Defined(ids) => Some(ids),
            Self::Undefined { .. } => None,
        }
    }

    /// Returns the number of IDs if it is known.
    #[must_use]
    pub fn len(&self) -> Option<u64> {
        match self {
            Self::Defined(ids) => Some(ids.len() as u64),
            Self::Undefined { count } => *count,
        }
    }

    /// Returns true for an explicit empty set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Defined(ids) if ids.is_empty())
    }

    /// Returns true if `id` is known to be in the set.
    ///
    /// An undefined set may contain any ID, so this returns true for it.
    #[must_use]
    pub fn contains(&self, id: EntryId) -> bool {
        match self {
            Self::Defined(ids) => ids.binary_search(&id).is_ok(),
            Self::Undefined { .. } => true,
        }
    }
}

/// Accumulator for the IDs of one key while merging scratch records.
///
/// Merging is commutative and associative as long as no partial set
/// crosses the limit: the union of explicit sets does not depend on the
/// order in which partial sets arrive.
#[derive(Debug, Clone)]
pub struct ImportIdSet {
    ids: Vec<EntryId>,
    defined: bool,
    undefined_count: u64,
    limit: usize,
    maintain_count: bool,
}

impl ImportIdSet {
    /// Creates an empty set. A `limit` of zero means unlimited.
    #[must_use]
    pub fn new(limit: usize, maintain_count: bool) -> Self {
        Self {
            ids: Vec::new(),
            defined: true,
            undefined_count: 0,
            limit: effective_limit(limit),
            maintain_count,
        }
    }

    /// Empties the set and re-targets it at another key's limits.
    pub fn reset(&mut self, limit: usize, maintain_count: bool) {
        self.ids.clear();
        self.defined = true;
        self.undefined_count = 0;
        self.limit = effective_limit(limit);
        self.maintain_count = maintain_count;
    }

    /// Adds one ID, degrading to undefined when the limit is exceeded.
    pub fn add(&mut self, id: EntryId) {
        if !self.defined {
            self.undefined_count += 1;
            return;
        }
        if let Err(pos) = self.ids.binary_search(&id) {
            self.ids.insert(pos, id);
            if self.ids.len() > self.limit {
                self.degrade();
            }
        }
    }

    /// Marks the set undefined, adding `count` IDs of unknown identity.
    pub fn add_undefined(&mut self, count: u64) {
        if self.defined {
            self.degrade();
        }
        self.undefined_count += count;
    }

    /// Merges another partial set for the same key into this one.
    pub fn merge(&mut self, other: &ImportIdSet) {
        if other.defined {
            for &id in &other.ids {
                self.add(id);
            }
        } else {
            self.add_undefined(other.undefined_count);
        }
    }

    fn degrade(&mut self) {
        self.undefined_count = self.ids.len() as u64;
        self.ids = Vec::new();
        self.defined = false;
    }

    /// Returns true while the set holds explicit IDs.
    #[must_use]
    pub fn is_defined(&self) -> bool {
        self.defined
    }

    /// Returns true for a defined set without IDs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defined && self.ids.is_empty()
    }

    /// Returns the number of IDs, counted even after degrading.
    #[must_use]
    pub fn len(&self) -> u64 {
        if self.defined {
            self.ids.len() as u64
        } else {
            self.undefined_count
        }
    }

    /// Returns the explicit IDs, empty when undefined.
    #[must_use]
    pub fn ids(&self) -> &[EntryId] {
        &self.ids
    }

    /// Returns the configured limit (`usize::MAX` when unlimited).
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns true if counts are kept once undefined.
    #[must_use]
    pub fn maintain_count(&self) -> bool {
        self.maintain_count
    }

    /// Converts into the persisted representation.
    #[must_use]
    pub fn to_entry_id_set(&self) -> EntryIdSet {
        if self.defined {
            EntryIdSet::Defined(self.ids.clone())
        } else {
            EntryIdSet::Undefined {
                count: self.maintain_count.then_some(self.undefined_count),
            }
        }
    }
}

fn effective_limit(limit: usize) -> usize {
    if limit == 0 {
        usize::MAX
    } else {
        limit
    }
}

/// Applies an insert delta to a persisted record.
///
/// `limit` and `maintain_count` are the destination index's settings.
#[must_use]
pub fn apply_insert(
    existing: Option<EntryIdSet>,
    delta: &ImportIdSet,
    limit: usize,
    maintain_count: bool,
) -> EntryIdSet {
    let limit = effective_limit(limit);
    let counted = |n: u64| maintain_count.then_some(n);
    match existing {
        Some(EntryIdSet::Undefined { count }) => EntryIdSet::Undefined {
            count: count.and_then(|c| counted(c + delta.len())),
        },
        Some(EntryIdSet::Defined(ids)) if !delta.is_defined() => EntryIdSet::Undefined {
            count: counted(ids.len() as u64 + delta.len()),
        },
        None if !delta.is_defined() => EntryIdSet::Undefined {
            count: counted(delta.len()),
        },
        existing => {
            let mut ids = match existing {
                Some(EntryIdSet::Defined(ids)) => ids,
                _ => Vec::new(),
            };
            ids.extend_from_slice(delta.ids());
            ids.sort_unstable();
            ids.dedup();
            if ids.len() > limit {
                EntryIdSet::Undefined {
                    count: counted(ids.len() as u64),
                }
            } else {
                EntryIdSet::Defined(ids)
            }
        }
    }
}

/// Applies a delete delta to a persisted record.
///
/// Returns `None` when the key no longer maps to any ID.
#[must_use]
pub fn apply_delete(existing: Option<EntryIdSet>, delta: &ImportIdSet) -> Option<EntryIdSet> {
    match existing? {
        EntryIdSet::Undefined { count } => Some(EntryIdSet::Undefined {
            count: if delta.is_defined() {
                count.map(|c| c.saturating_sub(delta.len()))
            } else {
                None
            },
        }),
        EntryIdSet::Defined(_) if !delta.is_defined() => {
            Some(EntryIdSet::Undefined { count: None })
        }
        EntryIdSet::Defined(mut ids) => {
            ids.retain(|id| delta.ids().binary_search(id).is_err());
            if ids.is_empty() {
                None
            } else {
                Some(EntryIdSet::Defined(ids))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(raw: &[u64]) -> Vec<EntryId> {
        raw.iter().copied().map(EntryId::new).collect()
    }

    #[test]
    fn stays_defined_at_limit() {
        let mut set = ImportIdSet::new(3, false);
        for id in [3, 1, 2] {
            set.add(EntryId::new(id));
        }
        assert!(set.is_defined());
        assert_eq!(set.ids(), ids(&[1, 2, 3]).as_slice());
    }

    #[test]
    fn degrades_above_limit() {
        let mut set = ImportIdSet::new(3, true);
        for id in 1..=4 {
            set.add(EntryId::new(id));
        }
        assert!(!set.is_defined());
        assert_eq!(set.len(), 4);
        assert_eq!(set.to_entry_id_set(), EntryIdSet::Undefined { count: Some(4) });

        set.add(EntryId::new(5));
        assert_eq!(set.len(), 5);
    }

    #[test]
    fn duplicates_do_not_count_towards_limit() {
        let mut set = ImportIdSet::new(1, false);
        set.add(EntryId::new(7));
        set.add(EntryId::new(7));
        assert!(set.is_defined());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let mut set = ImportIdSet::new(0, false);
        for id in 1..=10_000 {
            set.add(EntryId::new(id));
        }
        assert!(set.is_defined());
        assert_eq!(set.limit(), usize::MAX);
    }

    #[test]
    fn persisted_insert_degrades_with_destination_limit() {
        let mut delta = ImportIdSet::new(0, false);
        delta.add(EntryId::new(3));
        let existing = Some(EntryIdSet::from_ids(ids(&[1, 2])));

        assert_eq!(
            apply_insert(existing.clone(), &delta, 3, false),
            EntryIdSet::from_ids(ids(&[1, 2, 3]))
        );
        assert_eq!(
            apply_insert(existing, &delta, 2, true),
            EntryIdSet::Undefined { count: Some(3) }
        );
    }

    #[test]
    fn persisted_undefined_keeps_counting() {
        let mut delta = ImportIdSet::new(0, true);
        delta.add(EntryId::new(9));
        let existing = Some(EntryIdSet::Undefined { count: Some(10) });
        assert_eq!(
            apply_insert(existing.clone(), &delta, 5, true),
            EntryIdSet::Undefined { count: Some(11) }
        );
        assert_eq!(
            apply_delete(existing, &delta),
            Some(EntryIdSet::Undefined { count: Some(9) })
        );
    }

    #[test]
    fn delete_removes_ids_and_empty_keys() {
        let mut delta = ImportIdSet::new(0, false);
        delta.add(EntryId::new(1));
        let existing = Some(EntryIdSet::from_ids(ids(&[1, 2])));
        let remaining = apply_delete(existing, &delta);
        assert_eq!(remaining, Some(EntryIdSet::from_ids(ids(&[2]))));

        delta.add(EntryId::new(2));
        assert_eq!(apply_delete(remaining, &delta), None);
        assert_eq!(apply_delete(None, &delta), None);
    }

    proptest! {
        #[test]
        fn merge_order_does_not_matter(
            parts in prop::collection::vec(prop::collection::vec(1u64..500, 0..20), 1..6)
        ) {
            let build = |order: &[Vec<u64>]| {
                let mut total = ImportIdSet::new(0, false);
                for part in order {
                    let mut partial = ImportIdSet::new(0, false);
                    for &id in part {
                        partial.add(EntryId::new(id));
                    }
                    total.merge(&partial);
                }
                total.to_entry_id_set()
            };
            let mut reversed = parts.clone();
            reversed.reverse();
            let all: Vec<EntryId> = parts.iter().flatten().copied().map(EntryId::new).collect();

            prop_assert_eq!(build(&parts), build(&reversed));
            prop_assert_eq!(build(&parts), EntryIdSet::from_ids(all));
        }
    }
}
