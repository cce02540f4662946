//! Identity of one sortable index stream.

use crate::index::IndexKind;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Total order over record keys of one index stream.
#[derive(Clone, Copy)]
pub struct KeyComparator {
    name: &'static str,
    compare: fn(&[u8], &[u8]) -> Ordering,
}

impl KeyComparator {
    /// Unsigned byte-wise order, used by every built-in stream.
    #[must_use]
    pub const fn lexicographic() -> Self {
        Self {
            name: "lexicographic",
            compare: lexicographic,
        }
    }

    /// A custom order.
    #[must_use]
    pub const fn custom(name: &'static str, compare: fn(&[u8], &[u8]) -> Ordering) -> Self {
        Self { name, compare }
    }

    /// Compares two keys.
    #[must_use]
    #[inline]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.compare)(a, b)
    }

    /// Returns the comparator's name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl Default for KeyComparator {
    fn default() -> Self {
        Self::lexicographic()
    }
}

impl fmt::Debug for KeyComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyComparator").field(&self.name).finish()
    }
}

fn lexicographic(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Identity of one sortable index stream: attribute × kind.
///
/// The entry limit and the comparator travel with the key but are not part
/// of its identity: two keys for the same attribute and kind are equal.
#[derive(Debug, Clone)]
pub struct IndexKey {
    attribute: String,
    kind: IndexKind,
    entry_limit: usize,
    maintain_count: bool,
    comparator: KeyComparator,
}

impl IndexKey {
    /// Creates a stream key. A zero `entry_limit` means unlimited.
    #[must_use]
    pub fn new(attribute: &str, kind: IndexKind, entry_limit: usize, maintain_count: bool) -> Self {
        Self {
            attribute: attribute.to_ascii_lowercase(),
            kind,
            entry_limit,
            maintain_count,
            comparator: KeyComparator::lexicographic(),
        }
    }

    /// The key of the dn2id stream. DN keys are never degraded.
    #[must_use]
    pub fn dn2id() -> Self {
        Self::new("dn", IndexKind::Dn2Id, 0, false)
    }

    /// Replaces the comparator.
    #[must_use]
    pub fn with_comparator(mut self, comparator: KeyComparator) -> Self {
        self.comparator = comparator;
        self
    }

    /// Returns the lower-cased attribute type.
    #[must_use]
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Returns the index kind.
    #[must_use]
    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// Returns the configured entry limit (zero for unlimited).
    #[must_use]
    pub fn entry_limit(&self) -> usize {
        self.entry_limit
    }

    /// Returns true if counts are kept above the limit.
    #[must_use]
    pub fn maintain_count(&self) -> bool {
        self.maintain_count
    }

    /// Returns the order of keys within the stream.
    #[must_use]
    pub fn comparator(&self) -> KeyComparator {
        self.comparator
    }

    /// Returns true for the dn2id stream.
    #[must_use]
    pub fn is_dn2id(&self) -> bool {
        self.kind == IndexKind::Dn2Id
    }

    /// Returns the stream name, also used for its scratch file.
    #[must_use]
    pub fn name(&self) -> String {
        if self.is_dn2id() {
            IndexKind::Dn2Id.name().to_string()
        } else {
            format!("{}.{}", self.attribute, self.kind)
        }
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.attribute == other.attribute && self.kind == other.kind
    }
}

impl Eq for IndexKey {}

impl Hash for IndexKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.attribute.hash(state);
        self.kind.hash(state);
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn entry_limit_is_not_identity() {
        let a = IndexKey::new("cn", IndexKind::Equality, 10, false);
        let b = IndexKey::new("CN", IndexKind::Equality, 4000, true);
        let c = IndexKey::new("cn", IndexKind::Substring, 10, false);

        assert_eq!(a, b);
        assert_ne!(a, c);
        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn names() {
        assert_eq!(IndexKey::new("cn", IndexKind::Equality, 0, false).name(), "cn.equality");
        assert_eq!(IndexKey::dn2id().name(), "dn2id");
    }

    #[test]
    fn custom_comparator() {
        fn reverse(a: &[u8], b: &[u8]) -> Ordering {
            b.cmp(a)
        }
        let key = IndexKey::new("cn", IndexKind::Ordering, 0, false)
            .with_comparator(KeyComparator::custom("reverse", reverse));
        assert_eq!(key.comparator().compare(b"a", b"b"), Ordering::Greater);
        assert_eq!(key.comparator().name(), "reverse");
    }
}
