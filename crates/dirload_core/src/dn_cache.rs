//! Temporary cache of the DNs seen by phase one.
//!
//! DN validation needs to answer "was this DN already imported" and "has the
//! parent been imported" for millions of entries. The cache keeps only an
//! FNV-1a hash of each normalised DN in memory; the DN bytes themselves go
//! to a scratch log as `[varint len][bytes]` records. A hash bucket lists the
//! log offsets of every DN with that hash, so collisions are resolved by
//! reading the candidates back.

use crate::dn::Dn;
use crate::error::{CoreError, CoreResult};
use crate::packed::{read_packed, write_packed, MAX_PACKED_LEN};
use dirload_storage::ScratchBackend;
use parking_lot::Mutex;
use std::collections::HashMap;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// FNV-1a over `bytes`.
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Hashed DN set backed by a scratch log.
pub(crate) struct DnCache {
    inner: Mutex<DnCacheInner>,
    hasher: fn(&[u8]) -> u64,
}

struct DnCacheInner {
    log: Box<dyn ScratchBackend>,
    buckets: HashMap<u64, Vec<u64>>,
}

impl DnCache {
    pub(crate) fn new(log: Box<dyn ScratchBackend>) -> Self {
        Self::with_hasher(log, fnv1a)
    }

    fn with_hasher(log: Box<dyn ScratchBackend>, hasher: fn(&[u8]) -> u64) -> Self {
        Self {
            inner: Mutex::new(DnCacheInner {
                log,
                buckets: HashMap::new(),
            }),
            hasher,
        }
    }

    /// Adds `dn`. Returns false if it was already present.
    pub(crate) fn insert(&self, dn: &Dn) -> CoreResult<bool> {
        let normalized = dn.normalized();
        let bytes = normalized.as_bytes();
        let hash = (self.hasher)(bytes);

        let mut inner = self.inner.lock();
        if inner.bucket_contains(hash, bytes)? {
            return Ok(false);
        }
        let mut record = Vec::with_capacity(bytes.len() + MAX_PACKED_LEN);
        write_packed(&mut record, bytes.len() as u64);
        record.extend_from_slice(bytes);
        let offset = inner.log.append(&record)?;
        inner.buckets.entry(hash).or_default().push(offset);
        Ok(true)
    }

    /// Returns true if `dn` was inserted before.
    pub(crate) fn contains(&self, dn: &Dn) -> CoreResult<bool> {
        let normalized = dn.normalized();
        let bytes = normalized.as_bytes();
        let hash = (self.hasher)(bytes);
        self.inner.lock().bucket_contains(hash, bytes)
    }

    /// Drops the log.
    pub(crate) fn shutdown(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        inner.buckets.clear();
        inner.log.discard()?;
        Ok(())
    }
}

impl DnCacheInner {
    fn bucket_contains(&self, hash: u64, bytes: &[u8]) -> CoreResult<bool> {
        let Some(offsets) = self.buckets.get(&hash) else {
            return Ok(false);
        };
        for &offset in offsets {
            if self.read_dn(offset)? == bytes {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn read_dn(&self, offset: u64) -> CoreResult<Vec<u8>> {
        let mut header = [0u8; MAX_PACKED_LEN];
        let read = self.log.read_into(offset, &mut header)?;
        let (len, consumed) = read_packed(&header[..read])?
            .ok_or_else(|| CoreError::scratch_corruption("truncated DN cache record"))?;
        let len = usize::try_from(len)
            .map_err(|_| CoreError::scratch_corruption("DN cache record too long"))?;
        Ok(self.log.read_at(offset + consumed as u64, len)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirload_storage::InMemoryBackend;

    fn dn(text: &str) -> Dn {
        Dn::parse(text).unwrap()
    }

    #[test]
    fn fnv1a_reference_values() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn insert_detects_duplicates_by_normalized_dn() {
        let cache = DnCache::new(Box::new(InMemoryBackend::new()));
        assert!(cache.insert(&dn("cn=Bob,dc=example,dc=com")).unwrap());
        assert!(!cache.insert(&dn("CN=bob, DC=Example,dc=com")).unwrap());
        assert!(cache.contains(&dn("cn=bob,dc=example,dc=com")).unwrap());
        assert!(!cache.contains(&dn("cn=alice,dc=example,dc=com")).unwrap());
    }

    #[test]
    fn colliding_hashes_are_resolved() {
        let cache = DnCache::with_hasher(Box::new(InMemoryBackend::new()), |_| 42);
        assert!(cache.insert(&dn("cn=a,dc=com")).unwrap());
        assert!(cache.insert(&dn("cn=b,dc=com")).unwrap());
        assert!(!cache.insert(&dn("cn=a,dc=com")).unwrap());
        assert!(cache.contains(&dn("cn=b,dc=com")).unwrap());
        assert!(!cache.contains(&dn("cn=c,dc=com")).unwrap());
        assert_eq!(cache.inner.lock().buckets[&42].len(), 2);
    }

    #[test]
    fn shutdown_discards_the_log() {
        let cache = DnCache::new(Box::new(InMemoryBackend::new()));
        cache.insert(&dn("dc=com")).unwrap();
        cache.shutdown().unwrap();
        assert!(cache.contains(&dn("dc=com")).is_ok_and(|found| !found));
    }
}
