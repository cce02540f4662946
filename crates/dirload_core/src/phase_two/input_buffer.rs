//! Read cursor over one sorted run of a scratch file.

use crate::error::{CoreError, CoreResult};
use crate::id_set::ImportIdSet;
use crate::index::KeyComparator;
use crate::packed::{read_packed, unzigzag, MAX_PACKED_LEN};
use crate::types::{EntryId, IndexId};
use dirload_storage::ScratchBackend;
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Start,
    NeedInsertIdSet,
    NeedDeleteIdSet,
}

/// Streams the records of the run `[begin, end)` through a bounded window.
pub(crate) struct IndexInputBuffer {
    file: Arc<dyn ScratchBackend>,
    buffer_id: usize,
    comparator: KeyComparator,
    file_offset: u64,
    end: u64,
    window: Vec<u8>,
    cursor: usize,
    window_size: usize,
    state: RecordState,
    key: Vec<u8>,
    index_id: IndexId,
}

impl IndexInputBuffer {
    pub(crate) fn new(
        file: Arc<dyn ScratchBackend>,
        buffer_id: usize,
        comparator: KeyComparator,
        begin: u64,
        end: u64,
        window_size: usize,
    ) -> Self {
        Self {
            file,
            buffer_id,
            comparator,
            file_offset: begin,
            end,
            window: Vec::new(),
            cursor: 0,
            window_size: window_size.max(MAX_PACKED_LEN),
            state: RecordState::Start,
            key: Vec::new(),
            index_id: IndexId::new(0),
        }
    }

    pub(crate) fn key(&self) -> &[u8] {
        &self.key
    }

    pub(crate) fn index_id(&self) -> IndexId {
        self.index_id
    }

    pub(crate) fn buffer_id(&self) -> usize {
        self.buffer_id
    }

    fn remaining(&self) -> u64 {
        (self.window.len() - self.cursor) as u64 + (self.end - self.file_offset)
    }

    /// Makes at least `n` unread bytes available in the window.
    fn ensure(&mut self, n: usize) -> CoreResult<()> {
        let buffered = self.window.len() - self.cursor;
        if buffered >= n {
            return Ok(());
        }
        self.window.drain(..self.cursor);
        self.cursor = 0;

        let target = n.max(self.window_size);
        let wanted = (target - buffered) as u64;
        let readable = wanted.min(self.end - self.file_offset) as usize;
        if readable > 0 {
            let start = self.window.len();
            self.window.resize(start + readable, 0);
            let read = self.file.read_into(self.file_offset, &mut self.window[start..])?;
            self.window.truncate(start + read);
            self.file_offset += read as u64;
        }
        if self.window.len() < n {
            return Err(CoreError::scratch_corruption(format!(
                "run {} ends inside a record",
                self.buffer_id
            )));
        }
        Ok(())
    }

    fn read_varint(&mut self) -> CoreResult<u64> {
        let available = usize::try_from(self.remaining()).unwrap_or(usize::MAX);
        self.ensure(MAX_PACKED_LEN.min(available).max(1))?;
        let (value, used) = read_packed(&self.window[self.cursor..])?.ok_or_else(|| {
            CoreError::scratch_corruption(format!("run {} ends inside a varint", self.buffer_id))
        })?;
        self.cursor += used;
        Ok(value)
    }

    fn read_ids(&mut self, count: u64, mut target: Option<&mut ImportIdSet>) -> CoreResult<()> {
        let mut previous = 0u64;
        for _ in 0..count {
            previous += self.read_varint()?;
            if let Some(set) = target.as_deref_mut() {
                set.add(EntryId::new(previous));
            }
        }
        Ok(())
    }

    /// Advances to the next record, skipping whatever of the current record
    /// was not read. Returns false at the end of the run.
    pub(crate) fn next_record(&mut self) -> CoreResult<bool> {
        if self.state == RecordState::NeedInsertIdSet {
            self.read_inserts(None)?;
        }
        if self.state == RecordState::NeedDeleteIdSet {
            self.read_deletes(None)?;
        }
        if self.remaining() == 0 {
            return Ok(false);
        }

        self.ensure(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.window[self.cursor..self.cursor + 4]);
        self.cursor += 4;
        self.index_id = IndexId::new(u32::from_be_bytes(raw));

        let len = usize::try_from(self.read_varint()?)
            .map_err(|_| CoreError::scratch_corruption("key length overflows"))?;
        self.ensure(len)?;
        self.key.clear();
        self.key
            .extend_from_slice(&self.window[self.cursor..self.cursor + len]);
        self.cursor += len;
        self.state = RecordState::NeedInsertIdSet;
        Ok(true)
    }

    /// Reads the insert ids of the current record into `target`.
    pub(crate) fn read_inserts(&mut self, target: Option<&mut ImportIdSet>) -> CoreResult<()> {
        if self.state != RecordState::NeedInsertIdSet {
            return Err(CoreError::scratch_corruption("insert ids read out of order"));
        }
        let count = unzigzag(self.read_varint()?);
        if count < 0 {
            let undefined = self.read_varint()?;
            if let Some(set) = target {
                set.add_undefined(undefined);
            }
        } else {
            self.read_ids(count as u64, target)?;
        }
        self.state = RecordState::NeedDeleteIdSet;
        Ok(())
    }

    /// Reads the delete ids of the current record into `target`.
    pub(crate) fn read_deletes(&mut self, target: Option<&mut ImportIdSet>) -> CoreResult<()> {
        if self.state != RecordState::NeedDeleteIdSet {
            return Err(CoreError::scratch_corruption("delete ids read out of order"));
        }
        let count = self.read_varint()?;
        self.read_ids(count, target)?;
        self.state = RecordState::Start;
        Ok(())
    }

    /// Orders the current record against `key`/`index_id`.
    pub(crate) fn compare(&self, key: &[u8], index_id: IndexId) -> Ordering {
        self.comparator
            .compare(&self.key, key)
            .then(self.index_id.cmp(&index_id))
    }
}

/// Min-heap adapter: the smallest record pops first, ties by run.
pub(crate) struct HeapCursor(pub(crate) IndexInputBuffer);

impl PartialEq for HeapCursor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapCursor {}

impl PartialOrd for HeapCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .compare(self.0.key(), self.0.index_id())
            .then(other.0.buffer_id().cmp(&self.0.buffer_id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ImportContext;
    use crate::index::{IndexKey, IndexKind};
    use crate::manager::IndexManager;
    use crate::phase_one::{IndexOutputBuffer, ScratchFileWriter};
    use crate::registry::{IndexRegistry, IndexTarget};
    use crate::store::memory::MemoryIndexTree;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

    /// Writes two runs through a scratch writer and returns their manager.
    fn written_runs() -> Arc<IndexManager> {
        let ctx = ImportContext::for_tests(IndexRegistry::default());
        let key = IndexKey::new("cn", IndexKind::Equality, 0, false);
        let manager = Arc::new(IndexManager::new(key.clone()));
        let mut writer = ScratchFileWriter::new(
            Arc::clone(&manager),
            ctx.scratch.create("cn").unwrap(),
            ctx.scratch.create("cn.offsets").unwrap(),
            Arc::clone(&ctx),
        );
        let runs: [&[(&str, u64, bool)]; 2] = [
            &[("bob", 4, true), ("amy", 1, true), ("bob", 9, false)],
            &[("bob", 2, true), ("cat", 300, true)],
        ];
        for run in runs {
            let mut buffer = IndexOutputBuffer::new(1 << 12);
            buffer.set_index_key(key.clone());
            for &(k, id, insert) in run {
                buffer.add(k.as_bytes(), EntryId::new(id), IndexId::new(0), insert);
            }
            buffer.sort();
            writer.write_batch(&[buffer]).unwrap();
        }
        writer.finish().unwrap();
        manager
    }

    fn cursors(manager: &IndexManager, window: usize) -> Vec<IndexInputBuffer> {
        let file = manager.data().unwrap();
        manager
            .ranges()
            .unwrap()
            .into_iter()
            .enumerate()
            .map(|(i, (begin, end))| {
                IndexInputBuffer::new(Arc::clone(&file), i, KeyComparator::default(), begin, end, window)
            })
            .collect()
    }

    #[test]
    fn records_read_back_with_tiny_windows() {
        let manager = written_runs();
        let mut runs = cursors(&manager, 1);
        let first = &mut runs[0];

        assert!(first.next_record().unwrap());
        assert_eq!(first.key(), b"amy");
        let mut inserts = ImportIdSet::new(0, false);
        first.read_inserts(Some(&mut inserts)).unwrap();
        assert_eq!(inserts.ids(), &[EntryId::new(1)]);

        assert!(first.next_record().unwrap());
        assert_eq!(first.key(), b"bob");
        let mut inserts = ImportIdSet::new(0, false);
        let mut deletes = ImportIdSet::new(0, false);
        first.read_inserts(Some(&mut inserts)).unwrap();
        first.read_deletes(Some(&mut deletes)).unwrap();
        assert_eq!(inserts.ids(), &[EntryId::new(4)]);
        assert_eq!(deletes.ids(), &[EntryId::new(9)]);
        assert!(!first.next_record().unwrap());
    }

    #[test]
    fn unread_ids_are_skipped() {
        let manager = written_runs();
        let mut second = cursors(&manager, 64).remove(1);
        assert!(second.next_record().unwrap());
        assert!(second.next_record().unwrap());
        assert_eq!(second.key(), b"cat");
        let mut inserts = ImportIdSet::new(0, false);
        second.read_inserts(Some(&mut inserts)).unwrap();
        assert_eq!(inserts.ids(), &[EntryId::new(300)]);
        assert!(second.read_inserts(None).is_err());
    }

    #[test]
    fn heap_pops_smallest_key_first() {
        let manager = written_runs();
        let mut heap = BinaryHeap::new();
        for mut run in cursors(&manager, 16) {
            assert!(run.next_record().unwrap());
            heap.push(HeapCursor(run));
        }
        let mut order = Vec::new();
        while let Some(HeapCursor(mut run)) = heap.pop() {
            order.push((String::from_utf8(run.key().to_vec()).unwrap(), run.buffer_id()));
            if run.next_record().unwrap() {
                heap.push(HeapCursor(run));
            }
        }
        assert_eq!(
            order,
            vec![
                ("amy".to_string(), 0),
                ("bob".to_string(), 0),
                ("bob".to_string(), 1),
                ("cat".to_string(), 1),
            ]
        );
    }

    #[test]
    fn truncated_run_is_corrupt() {
        let manager = written_runs();
        let file = manager.data().unwrap();
        let (begin, end) = manager.ranges().unwrap()[0];
        let mut run = IndexInputBuffer::new(file, 0, KeyComparator::default(), begin, end - 1, 8);
        let outcome = (|| {
            while run.next_record()? {}
            Ok::<_, CoreError>(())
        })();
        assert!(matches!(outcome, Err(CoreError::ScratchCorruption { .. })));
    }

    type ExpectedRun = BTreeMap<Vec<u8>, (BTreeSet<u64>, BTreeSet<u64>)>;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn scratch_runs_decode_to_the_sets_written(
            runs in prop::collection::vec(
                prop::collection::vec((0u8..5, 1u64..40, any::<bool>()), 1..40),
                1..4,
            ),
            limit in 1usize..6,
            window in 1usize..64,
        ) {
            let key = IndexKey::new("cn", IndexKind::Equality, limit, true);
            let mut registry = IndexRegistry::default();
            registry.register(
                key.clone(),
                IndexTarget::Tree(Arc::new(MemoryIndexTree::new("cn.equality", limit, true))),
            );
            let ctx = ImportContext::for_tests(registry);
            let manager = Arc::new(IndexManager::new(key.clone()));
            let mut writer = ScratchFileWriter::new(
                Arc::clone(&manager),
                ctx.scratch.create("cn").unwrap(),
                ctx.scratch.create("cn.offsets").unwrap(),
                Arc::clone(&ctx),
            );

            let mut expected: Vec<ExpectedRun> = Vec::new();
            for records in &runs {
                // Each run is the merge of two sorted buffers.
                let mut halves = [IndexOutputBuffer::new(1 << 12), IndexOutputBuffer::new(1 << 12)];
                let mut sets = ExpectedRun::new();
                for (i, &(k, id, insert)) in records.iter().enumerate() {
                    let k = vec![b'k', k];
                    halves[i % 2].add(&k, EntryId::new(id), IndexId::new(0), insert);
                    let (inserts, deletes) = sets.entry(k).or_default();
                    if insert {
                        inserts.insert(id);
                    } else {
                        deletes.insert(id);
                    }
                }
                for half in &mut halves {
                    half.set_index_key(key.clone());
                    half.sort();
                }
                writer.write_batch(&halves).unwrap();
                expected.push(sets);
            }
            writer.finish().unwrap();

            let mut decoded = cursors(&manager, window);
            prop_assert_eq!(decoded.len(), expected.len());
            for (run, sets) in decoded.iter_mut().zip(&expected) {
                for (k, (inserts, deletes)) in sets {
                    prop_assert!(run.next_record().unwrap());
                    prop_assert_eq!(run.key(), k.as_slice());
                    prop_assert_eq!(run.index_id(), IndexId::new(0));

                    let mut read_inserts = ImportIdSet::new(0, false);
                    let mut read_deletes = ImportIdSet::new(0, false);
                    run.read_inserts(Some(&mut read_inserts)).unwrap();
                    run.read_deletes(Some(&mut read_deletes)).unwrap();

                    if inserts.len() > limit {
                        prop_assert!(!read_inserts.is_defined());
                        prop_assert_eq!(read_inserts.len(), inserts.len() as u64);
                    } else {
                        let ids: Vec<u64> = read_inserts.ids().iter().map(|id| id.as_u64()).collect();
                        prop_assert_eq!(ids, inserts.iter().copied().collect::<Vec<_>>());
                    }
                    let ids: Vec<u64> = read_deletes.ids().iter().map(|id| id.as_u64()).collect();
                    prop_assert_eq!(ids, deletes.iter().copied().collect::<Vec<_>>());
                }
                prop_assert!(!run.next_record().unwrap());
            }
        }
    }
}
