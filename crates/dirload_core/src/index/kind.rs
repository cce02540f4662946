//! Index kinds.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of one sortable index stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IndexKind {
    /// The DN to entry ID mapping, source of the children and subtree trees.
    Dn2Id = 0,
    /// Exact match on normalised values.
    Equality = 1,
    /// Attribute presence.
    Presence = 2,
    /// Substring match.
    Substring = 3,
    /// Ordering (greater/less than) match.
    Ordering = 4,
    /// Approximate (sounds-like) match.
    Approximate = 5,
    /// Substring keys of extensible matching rules.
    ExtensibleSubstring = 6,
    /// Keys of all other extensible matching rules.
    ExtensibleShared = 7,
}

impl IndexKind {
    /// Kinds an attribute index can be configured with.
    pub const ATTRIBUTE_KINDS: [IndexKind; 7] = [
        IndexKind::Equality,
        IndexKind::Presence,
        IndexKind::Substring,
        IndexKind::Ordering,
        IndexKind::Approximate,
        IndexKind::ExtensibleSubstring,
        IndexKind::ExtensibleShared,
    ];

    /// Returns the name used in index names and rebuild lists.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            IndexKind::Dn2Id => "dn2id",
            IndexKind::Equality => "equality",
            IndexKind::Presence => "presence",
            IndexKind::Substring => "substring",
            IndexKind::Ordering => "ordering",
            IndexKind::Approximate => "approximate",
            IndexKind::ExtensibleSubstring => "ex_substring",
            IndexKind::ExtensibleShared => "ex_shared",
        }
    }

    /// Parses a kind name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        std::iter::once(IndexKind::Dn2Id)
            .chain(Self::ATTRIBUTE_KINDS)
            .find(|kind| kind.name() == name)
    }

    /// Returns true for the two extensible kinds.
    #[must_use]
    pub const fn is_extensible(self) -> bool {
        matches!(
            self,
            IndexKind::ExtensibleSubstring | IndexKind::ExtensibleShared
        )
    }
}

impl TryFrom<u8> for IndexKind {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(IndexKind::Dn2Id),
            1 => Ok(IndexKind::Equality),
            2 => Ok(IndexKind::Presence),
            3 => Ok(IndexKind::Substring),
            4 => Ok(IndexKind::Ordering),
            5 => Ok(IndexKind::Approximate),
            6 => Ok(IndexKind::ExtensibleSubstring),
            7 => Ok(IndexKind::ExtensibleShared),
            _ => Err(CoreError::invalid_configuration(format!(
                "unknown index kind: {value}"
            ))),
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for kind in IndexKind::ATTRIBUTE_KINDS {
            assert_eq!(IndexKind::from_name(kind.name()), Some(kind));
            assert_eq!(IndexKind::try_from(kind as u8).unwrap(), kind);
        }
        assert_eq!(IndexKind::from_name("DN2ID"), Some(IndexKind::Dn2Id));
        assert_eq!(IndexKind::from_name("vlv"), None);
        assert!(IndexKind::try_from(8).is_err());
    }
}
