//! Fixed-budget buffers of `(key, entry id, index id, insert)` records.
//!
//! A buffer fills up for one index stream on one worker, is sorted by the
//! sort pool and then written to the stream's scratch file. Buffers are
//! recycled through a bounded free list; special-purpose buffers are either
//! a poison marker that stops a scratch writer, or a discard buffer that is
//! written once and then dropped instead of recycled.

use crate::index::{IndexKey, KeyComparator};
use crate::packed::packed_len;
use crate::types::{EntryId, IndexId};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferKind {
    Pooled,
    Discard,
    Poison,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    key_start: usize,
    key_len: usize,
    entry_id: EntryId,
    index_id: IndexId,
    insert: bool,
}

/// A phase-one sort buffer.
#[derive(Debug)]
pub(crate) struct IndexOutputBuffer {
    kind: BufferKind,
    capacity: usize,
    used: usize,
    keys: Vec<u8>,
    records: Vec<Record>,
    index_key: Option<IndexKey>,
}

impl IndexOutputBuffer {
    /// Creates a recyclable buffer holding up to `capacity` record bytes.
    pub(crate) fn new(capacity: usize) -> Self {
        Self::with_kind(BufferKind::Pooled, capacity)
    }

    /// Creates a buffer that is dropped after it has been written.
    pub(crate) fn discard(capacity: usize) -> Self {
        Self::with_kind(BufferKind::Discard, capacity)
    }

    /// Creates the marker that stops a scratch writer.
    pub(crate) fn poison() -> Self {
        Self::with_kind(BufferKind::Poison, 0)
    }

    fn with_kind(kind: BufferKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            used: 0,
            keys: Vec::new(),
            records: Vec::new(),
            index_key: None,
        }
    }

    /// Bytes one record occupies in the buffer budget.
    pub(crate) fn record_size(key_len: usize, entry_id: EntryId) -> usize {
        1 + 4 + packed_len(key_len as u64) + key_len + packed_len(entry_id.as_u64()) + 4
    }

    pub(crate) fn has_room(&self, key_len: usize, entry_id: EntryId) -> bool {
        self.used + Self::record_size(key_len, entry_id) <= self.capacity
    }

    pub(crate) fn add(&mut self, key: &[u8], entry_id: EntryId, index_id: IndexId, insert: bool) {
        self.used += Self::record_size(key.len(), entry_id);
        self.records.push(Record {
            key_start: self.keys.len(),
            key_len: key.len(),
            entry_id,
            index_id,
            insert,
        });
        self.keys.extend_from_slice(key);
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn is_poison(&self) -> bool {
        self.kind == BufferKind::Poison
    }

    pub(crate) fn is_discard(&self) -> bool {
        self.kind == BufferKind::Discard
    }

    #[cfg(test)]
    pub(crate) fn set_discard(&mut self) {
        if self.kind == BufferKind::Pooled {
            self.kind = BufferKind::Discard;
        }
    }

    pub(crate) fn set_index_key(&mut self, key: IndexKey) {
        self.index_key = Some(key);
    }

    pub(crate) fn index_key(&self) -> Option<&IndexKey> {
        self.index_key.as_ref()
    }

    fn comparator(&self) -> KeyComparator {
        self.index_key
            .as_ref()
            .map(IndexKey::comparator)
            .unwrap_or_default()
    }

    /// Empties the buffer for reuse by any stream.
    pub(crate) fn reset(&mut self) {
        self.used = 0;
        self.keys.clear();
        self.records.clear();
        self.index_key = None;
    }

    /// Sorts records by key under the stream's comparator, then by index id.
    ///
    /// The sort is stable, so records of the same key and index keep the
    /// order in which they were added.
    pub(crate) fn sort(&mut self) {
        let comparator = self.comparator();
        let keys = &self.keys;
        self.records.sort_by(|a, b| {
            let ka = &keys[a.key_start..a.key_start + a.key_len];
            let kb = &keys[b.key_start..b.key_start + b.key_len];
            comparator.compare(ka, kb).then(a.index_id.cmp(&b.index_id))
        });
    }

    pub(crate) fn key(&self, pos: usize) -> &[u8] {
        let record = &self.records[pos];
        &self.keys[record.key_start..record.key_start + record.key_len]
    }

    pub(crate) fn entry_id(&self, pos: usize) -> EntryId {
        self.records[pos].entry_id
    }

    pub(crate) fn index_id(&self, pos: usize) -> IndexId {
        self.records[pos].index_id
    }

    pub(crate) fn is_insert(&self, pos: usize) -> bool {
        self.records[pos].insert
    }

    /// Orders record `pos` against `key`/`index_id` the way [`sort`](Self::sort) does.
    pub(crate) fn compare(&self, pos: usize, key: &[u8], index_id: IndexId) -> Ordering {
        self.comparator()
            .compare(self.key(pos), key)
            .then(self.index_id(pos).cmp(&index_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexKind;
    use proptest::prelude::*;

    fn sorted_view(buffer: &IndexOutputBuffer) -> Vec<(Vec<u8>, u32, u64, bool)> {
        (0..buffer.len())
            .map(|i| {
                (
                    buffer.key(i).to_vec(),
                    buffer.index_id(i).as_u32(),
                    buffer.entry_id(i).as_u64(),
                    buffer.is_insert(i),
                )
            })
            .collect()
    }

    #[test]
    fn record_size_accounts_for_varints() {
        assert_eq!(IndexOutputBuffer::record_size(3, EntryId::new(1)), 1 + 4 + 1 + 3 + 1 + 4);
        assert_eq!(IndexOutputBuffer::record_size(200, EntryId::new(300)), 1 + 4 + 2 + 200 + 2 + 4);
    }

    #[test]
    fn room_is_checked_against_capacity() {
        let size = IndexOutputBuffer::record_size(3, EntryId::new(1));
        let mut buffer = IndexOutputBuffer::new(size * 2);
        assert!(buffer.has_room(3, EntryId::new(1)));
        buffer.add(b"abc", EntryId::new(1), IndexId::new(0), true);
        buffer.add(b"abd", EntryId::new(1), IndexId::new(0), true);
        assert!(!buffer.has_room(3, EntryId::new(1)));

        buffer.reset();
        assert!(buffer.is_empty());
        assert!(buffer.has_room(3, EntryId::new(1)));
    }

    #[test]
    fn sort_orders_by_key_then_index() {
        let mut buffer = IndexOutputBuffer::new(1 << 16);
        buffer.set_index_key(IndexKey::new("cn", IndexKind::Equality, 0, false));
        buffer.add(b"bob", EntryId::new(1), IndexId::new(2), true);
        buffer.add(b"al", EntryId::new(2), IndexId::new(2), true);
        buffer.add(b"bob", EntryId::new(3), IndexId::new(1), false);
        buffer.sort();
        assert_eq!(
            sorted_view(&buffer),
            vec![
                (b"al".to_vec(), 2, 2, true),
                (b"bob".to_vec(), 1, 3, false),
                (b"bob".to_vec(), 2, 1, true),
            ]
        );
        assert_eq!(buffer.compare(0, b"bob", IndexId::new(0)), Ordering::Less);
        assert_eq!(buffer.compare(2, b"bob", IndexId::new(2)), Ordering::Equal);
    }

    #[test]
    fn special_buffers() {
        assert!(IndexOutputBuffer::poison().is_poison());
        assert!(IndexOutputBuffer::discard(10).is_discard());
        let mut pooled = IndexOutputBuffer::new(10);
        pooled.set_discard();
        assert!(pooled.is_discard());
    }

    proptest! {
        #[test]
        fn sorting_twice_changes_nothing(
            records in prop::collection::vec(
                (prop::collection::vec(any::<u8>(), 0..6), 0u32..4, 1u64..1000, any::<bool>()),
                0..64,
            )
        ) {
            let mut buffer = IndexOutputBuffer::new(usize::MAX);
            for (key, index, id, insert) in &records {
                buffer.add(key, EntryId::new(*id), IndexId::new(*index), *insert);
            }
            buffer.sort();
            let once = sorted_view(&buffer);
            buffer.sort();
            prop_assert_eq!(&once, &sorted_view(&buffer));
            for pair in once.windows(2) {
                prop_assert!((&pair[0].0, pair[0].1) <= (&pair[1].0, pair[1].1));
            }
        }
    }
}
