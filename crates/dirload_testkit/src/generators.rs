//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random test data
//! that maintains required invariants.

use crate::fixtures::{entry, EXAMPLE_BASE};
use dirload_core::Entry;
use proptest::prelude::*;

/// Strategy for RDN values: short lowercase words.
pub fn rdn_value_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,7}").expect("Invalid regex")
}

/// Strategy for a DN tree below [`EXAMPLE_BASE`], parents first.
///
/// Node `n` hangs below a random earlier node or the base. RDNs are
/// `ou=n<n>`, so every DN is unique.
pub fn dn_tree_strategy(max_nodes: usize) -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(any::<prop::sample::Index>(), 1..max_nodes.max(2)).prop_map(|parents| {
        let mut dns: Vec<String> = Vec::with_capacity(parents.len());
        for (n, parent) in parents.iter().enumerate() {
            let under = parent.index(n + 1);
            let parent_dn = if under == 0 {
                EXAMPLE_BASE.to_string()
            } else {
                dns[under - 1].clone()
            };
            dns.push(format!("ou=n{n},{parent_dn}"));
        }
        dns
    })
}

/// Strategy for the entries of a DN tree, base included, in random order.
pub fn shuffled_tree_strategy(max_nodes: usize) -> impl Strategy<Value = Vec<Entry>> {
    dn_tree_strategy(max_nodes)
        .prop_map(|dns| {
            std::iter::once(EXAMPLE_BASE.to_string())
                .chain(dns)
                .map(|dn| entry(&dn, &[("objectClass", "organizationalUnit")]))
                .collect::<Vec<_>>()
        })
        .prop_shuffle()
}

/// Strategy for `(key, entry id, insert)` index records.
pub fn index_record_strategy(keys: u8, max_id: u64) -> impl Strategy<Value = (Vec<u8>, u64, bool)> {
    (0..keys.max(1), 1..max_id.max(2), prop::bool::weighted(0.8))
        .prop_map(|(key, id, insert)| (vec![b'k', key], id, insert))
}
