//! Benchmark utilities.

use dirload_core::store::memory::MemoryRootContainer;
use dirload_core::{AttributeIndexConfig, Dn, Entry, IndexKind};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;

/// Base DN used by every benchmark.
pub const BENCH_BASE: &str = "dc=bench,dc=example";

/// Generate random lowercase words of `len` letters.
pub fn random_word(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

/// Creates a root container with `cn`, `mail` and `uid` indexes.
pub fn bench_root() -> Arc<MemoryRootContainer> {
    let root = Arc::new(MemoryRootContainer::new());
    root.add_suffix(
        BENCH_BASE,
        vec![
            AttributeIndexConfig::new("cn")
                .with_kind(IndexKind::Equality)
                .with_kind(IndexKind::Substring),
            AttributeIndexConfig::new("mail").with_kind(IndexKind::Equality),
            AttributeIndexConfig::new("uid").with_kind(IndexKind::Equality),
        ],
    )
    .expect("Failed to add the bench suffix");
    root
}

/// Generate the base entry, `ou=people` and `count` people below it.
///
/// With `shuffle`, the people come in random order; parents still come
/// first.
pub fn generate_people(count: usize, shuffle: bool) -> Vec<Entry> {
    let base = Dn::parse(BENCH_BASE).expect("Invalid base DN");
    let people = base.child("ou=people").expect("Invalid RDN");
    let mut persons: Vec<Entry> = (0..count)
        .map(|n| {
            let uid = format!("u{n:07}");
            let dn = people.child(&format!("uid={uid}")).expect("Invalid RDN");
            Entry::new(dn)
                .with_value("objectClass", "person")
                .with_value("uid", uid.clone())
                .with_value("cn", random_word(10))
                .with_value("mail", format!("{uid}@example.com"))
        })
        .collect();
    if shuffle {
        persons.shuffle(&mut rand::thread_rng());
    }

    let mut entries = Vec::with_capacity(count + 2);
    entries.push(Entry::new(base));
    entries.push(Entry::new(people));
    entries.extend(persons);
    entries
}

/// Generate `count` sorted entry ids with random gaps.
pub fn generate_ids(count: usize) -> Vec<u64> {
    let mut rng = rand::thread_rng();
    let mut next = 0u64;
    (0..count)
        .map(|_| {
            next += rng.gen_range(1..64);
            next
        })
        .collect()
}
