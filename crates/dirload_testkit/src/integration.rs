//! Cross-crate integration test helpers.
//!
//! Provides checks that run against a [`TestDirectory`] after an import or
//! rebuild, verifying that the DN trees and attribute indexes agree with
//! the stored entries.

use crate::fixtures::{TestDirectory, EXAMPLE_BASE};
use dirload_core::{Dn, IndexKind};

/// Asserts that every DN in `dns` is stored and linked to its ancestors.
///
/// The direct parent must list the entry in id2children and every ancestor
/// up to the base must list it in id2subtree.
pub fn verify_tree(dir: &TestDirectory, dns: &[String]) {
    let base = Dn::parse(EXAMPLE_BASE).expect("Invalid base DN");
    for text in dns {
        let dn = Dn::parse(text).expect("Invalid DN");
        let id = dir
            .entry_id(text)
            .unwrap_or_else(|| panic!("{text} is missing from dn2id"))
            .as_u64();
        if dn == base {
            continue;
        }

        let parent = dn.parent().expect("DN below the base has a parent");
        assert!(
            dir.children_of(&parent.to_string()).contains(&id),
            "{text} is not a child of {parent}"
        );

        let mut ancestor = Some(parent);
        while let Some(current) = ancestor {
            assert!(
                dir.subtree_of(&current.to_string()).contains(&id),
                "{text} is not in the subtree of {current}"
            );
            if current == base {
                break;
            }
            ancestor = current.parent();
        }
    }
}

/// Asserts that every stored entry is found through its `cn` equality key.
pub fn verify_cn_index(dir: &TestDirectory, dns: &[String]) {
    for text in dns {
        let Some(entry) = dir.entry(text) else {
            panic!("{text} is missing from id2entry");
        };
        let id = dir.entry_id(text).expect("Entry has no id").as_u64();
        for value in entry.values("cn") {
            assert!(
                dir.index_ids("cn", IndexKind::Equality, value).contains(&id),
                "cn={value} does not index {text}"
            );
        }
    }
}
