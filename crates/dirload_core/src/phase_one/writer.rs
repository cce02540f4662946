//! Scratch writers: one thread per index stream.
//!
//! A writer receives sorted buffers for its stream, merges a small batch of
//! them and appends the result to the stream's scratch file as one sorted
//! run. Records of the same key and index id are collapsed into a single
//! scratch record:
//!
//! ```text
//! [u32 BE index id][varint key len][key]
//! [zigzag insert count | -1 then varint undefined count][delta insert ids]
//! [varint delete count][delta delete ids]
//! ```

use crate::context::ImportContext;
use crate::error::{CoreError, CoreResult};
use crate::executor::{prefer_fatal, POLL_INTERVAL};
use crate::id_set::ImportIdSet;
use crate::index::IndexKey;
use crate::manager::{encode_range, IndexManager};
use crate::packed::{write_packed, write_packed_signed};
use crate::phase_one::output_buffer::IndexOutputBuffer;
use crate::types::EntryId;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use dirload_storage::ScratchBackend;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Staged bytes are appended to the scratch file once they reach this size.
const STAGING_FLUSH: usize = 64 * 1024;

/// Writes the sorted runs of one index stream.
pub(crate) struct ScratchFileWriter {
    manager: Arc<IndexManager>,
    data: Box<dyn ScratchBackend>,
    offsets: Box<dyn ScratchBackend>,
    ctx: Arc<ImportContext>,
    staging: Vec<u8>,
    inserts: ImportIdSet,
    deletes: ImportIdSet,
    written: u64,
    buffer_count: usize,
}

impl ScratchFileWriter {
    pub(crate) fn new(
        manager: Arc<IndexManager>,
        data: Box<dyn ScratchBackend>,
        offsets: Box<dyn ScratchBackend>,
        ctx: Arc<ImportContext>,
    ) -> Self {
        Self {
            manager,
            data,
            offsets,
            ctx,
            staging: Vec::with_capacity(STAGING_FLUSH),
            inserts: ImportIdSet::new(0, false),
            deletes: ImportIdSet::new(0, false),
            written: 0,
            buffer_count: 0,
        }
    }

    /// Writes buffers until a poison buffer arrives, recycling each written
    /// pooled buffer onto `free`.
    pub(crate) fn run(
        mut self,
        receiver: Receiver<IndexOutputBuffer>,
        free: Sender<IndexOutputBuffer>,
    ) -> CoreResult<()> {
        match self.write_all(&receiver, &free) {
            Ok(()) => self.finish(),
            Err(err) => {
                if err.is_disk_full() {
                    let dir = self.ctx.scratch.dir().unwrap_or(Path::new("."));
                    self.ctx.cancel.disk_space_exhausted(dir);
                }
                self.ctx.abort(self.manager.name(), &err);
                let _ = self.data.discard();
                let _ = self.offsets.discard();
                Err(err)
            }
        }
    }

    fn write_all(
        &mut self,
        receiver: &Receiver<IndexOutputBuffer>,
        free: &Sender<IndexOutputBuffer>,
    ) -> CoreResult<()> {
        let max_batch = self.ctx.tuning.drain_batch + 1;
        let mut batch: Vec<IndexOutputBuffer> = Vec::with_capacity(max_batch);
        loop {
            self.ctx.check_canceled()?;
            let first = match receiver.recv_timeout(POLL_INTERVAL) {
                Ok(buffer) => buffer,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            };
            let mut stop = first.is_poison();
            if !stop {
                batch.push(first);
            }
            while !stop && batch.len() < max_batch {
                match receiver.try_recv() {
                    Ok(buffer) if buffer.is_poison() => stop = true,
                    Ok(buffer) => batch.push(buffer),
                    Err(_) => break,
                }
            }

            if !batch.is_empty() {
                self.write_batch(&batch)?;
                for mut buffer in batch.drain(..) {
                    if !buffer.is_discard() {
                        buffer.reset();
                        let _ = free.try_send(buffer);
                    }
                }
            }
            if stop {
                return Ok(());
            }
        }
    }

    /// Merges `batch` into one sorted run.
    pub(crate) fn write_batch(&mut self, batch: &[IndexOutputBuffer]) -> CoreResult<()> {
        let begin = self.written + self.staging.len() as u64;
        let mut cursors = vec![0usize; batch.len()];
        let mut group: Option<(usize, usize)> = None;

        loop {
            let mut best: Option<usize> = None;
            for (b, buffer) in batch.iter().enumerate() {
                if cursors[b] >= buffer.len() {
                    continue;
                }
                best = match best {
                    Some(o) if buffer.compare(cursors[b], batch[o].key(cursors[o]), batch[o].index_id(cursors[o]))
                        != Ordering::Less =>
                    {
                        Some(o)
                    }
                    _ => Some(b),
                };
            }
            let Some(b) = best else { break };
            let pos = cursors[b];
            let buffer = &batch[b];

            if let Some((gb, gp)) = group {
                if batch[gb].compare(gp, buffer.key(pos), buffer.index_id(pos)) != Ordering::Equal {
                    self.encode_group(&batch[gb], gp)?;
                    group = None;
                }
            }
            if group.is_none() {
                group = Some((b, pos));
                let (limit, maintain) = self.ctx.registry.limits(buffer.index_id(pos));
                self.inserts.reset(limit, maintain);
                self.deletes.reset(0, false);
            }
            if buffer.is_insert(pos) {
                self.inserts.add(buffer.entry_id(pos));
            } else {
                self.deletes.add(buffer.entry_id(pos));
            }
            cursors[b] += 1;
        }
        if let Some((gb, gp)) = group {
            self.encode_group(&batch[gb], gp)?;
        }

        self.flush_staging()?;
        self.offsets.append(&encode_range(begin, self.written))?;
        self.buffer_count += 1;
        Ok(())
    }

    fn encode_group(&mut self, buffer: &IndexOutputBuffer, pos: usize) -> CoreResult<()> {
        let key = buffer.key(pos);
        self.staging
            .extend_from_slice(&buffer.index_id(pos).as_u32().to_be_bytes());
        write_packed(&mut self.staging, key.len() as u64);
        self.staging.extend_from_slice(key);

        if self.inserts.is_defined() {
            write_packed_signed(&mut self.staging, self.inserts.len() as i64);
            write_ids(&mut self.staging, self.inserts.ids());
        } else {
            write_packed_signed(&mut self.staging, -1);
            write_packed(&mut self.staging, self.inserts.len());
        }
        write_packed(&mut self.staging, self.deletes.len());
        write_ids(&mut self.staging, self.deletes.ids());

        if self.staging.len() >= STAGING_FLUSH {
            self.flush_staging()?;
        }
        Ok(())
    }

    fn flush_staging(&mut self) -> CoreResult<()> {
        if self.staging.is_empty() {
            return Ok(());
        }
        self.data.append(&self.staging)?;
        self.written += self.staging.len() as u64;
        self.ctx.stats.record_scratch_bytes(self.staging.len() as u64);
        self.staging.clear();
        Ok(())
    }

    /// Flushes both files and hands them to the manager.
    pub(crate) fn finish(mut self) -> CoreResult<()> {
        self.flush_staging()?;
        self.data.flush()?;
        self.offsets.flush()?;
        debug!(
            index = %self.manager.name(),
            runs = self.buffer_count,
            bytes = self.written,
            "scratch file complete"
        );
        self.manager
            .set_files(self.data, self.offsets, self.buffer_count, self.written);
        Ok(())
    }
}

/// Sorted ids as deltas from the previous id.
fn write_ids(out: &mut Vec<u8>, ids: &[EntryId]) {
    let mut previous = 0u64;
    for id in ids {
        write_packed(out, id.as_u64() - previous);
        previous = id.as_u64();
    }
}

struct WriterHandle {
    sender: Sender<IndexOutputBuffer>,
    join: JoinHandle<CoreResult<()>>,
    manager: Arc<IndexManager>,
}

/// The scratch writers of a run, started on first use.
pub(crate) struct ScratchWriters {
    ctx: Arc<ImportContext>,
    free: Sender<IndexOutputBuffer>,
    queue_len: usize,
    writers: Mutex<HashMap<IndexKey, WriterHandle>>,
}

impl ScratchWriters {
    pub(crate) fn new(ctx: Arc<ImportContext>, free: Sender<IndexOutputBuffer>, queue_len: usize) -> Self {
        Self {
            ctx,
            free,
            queue_len: queue_len.max(1),
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// Queues a sorted buffer on its stream's writer.
    pub(crate) fn enqueue(&self, buffer: IndexOutputBuffer) -> CoreResult<()> {
        let key = buffer
            .index_key()
            .cloned()
            .ok_or_else(|| CoreError::scratch_corruption("sorted buffer without an index key"))?;
        let sender = self.sender_for(&key)?;
        let mut pending = buffer;
        loop {
            match sender.send_timeout(pending, POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(buffer)) => {
                    self.ctx.check_canceled()?;
                    pending = buffer;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.ctx.check_canceled()?;
                    return Err(CoreError::TaskFailed {
                        task: format!("scratch writer {}", key.name()),
                    });
                }
            }
        }
    }

    fn sender_for(&self, key: &IndexKey) -> CoreResult<Sender<IndexOutputBuffer>> {
        let mut writers = self.writers.lock();
        if let Some(handle) = writers.get(key) {
            return Ok(handle.sender.clone());
        }

        let name = key.name();
        let data = self.ctx.scratch.create(&name)?;
        let offsets = self.ctx.scratch.create(&format!("{name}.offsets"))?;
        let manager = Arc::new(IndexManager::new(key.clone()));
        let writer = ScratchFileWriter::new(Arc::clone(&manager), data, offsets, Arc::clone(&self.ctx));
        let (sender, receiver) = bounded(self.queue_len);
        let free = self.free.clone();
        let join = thread::Builder::new()
            .name(format!("dirload-scratch-{name}"))
            .spawn(move || writer.run(receiver, free))?;
        debug!(index = %name, "started scratch writer");

        writers.insert(
            key.clone(),
            WriterHandle {
                sender: sender.clone(),
                join,
                manager,
            },
        );
        Ok(sender)
    }

    /// Stops every writer and returns the managers of the finished files.
    pub(crate) fn stop_and_join(&self) -> CoreResult<Vec<Arc<IndexManager>>> {
        let handles: Vec<WriterHandle> = self.writers.lock().drain().map(|(_, handle)| handle).collect();
        for handle in &handles {
            if handle.sender.send(IndexOutputBuffer::poison()).is_err() {
                debug!(index = %handle.manager.name(), "scratch writer already stopped");
            }
        }

        let mut managers = Vec::with_capacity(handles.len());
        let mut failure: Option<CoreError> = None;
        for handle in handles {
            let outcome = handle.join.join().unwrap_or_else(|_| {
                warn!(index = %handle.manager.name(), "scratch writer panicked");
                Err(CoreError::TaskFailed {
                    task: format!("scratch writer {}", handle.manager.name()),
                })
            });
            match outcome {
                Ok(()) => managers.push(handle.manager),
                Err(err) => {
                    handle.manager.cleanup();
                    failure = Some(prefer_fatal(failure, err));
                }
            }
        }
        if let Some(err) = failure {
            for manager in &managers {
                manager.cleanup();
            }
            return Err(err);
        }
        managers.sort_by_key(|manager| manager.name().to_string());
        Ok(managers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexKind;
    use crate::packed::{read_packed, unzigzag};
    use crate::registry::{IndexRegistry, IndexTarget};
    use crate::store::memory::MemoryIndexTree;
    use crate::types::IndexId;
    use crossbeam_channel::unbounded;

    fn key() -> IndexKey {
        IndexKey::new("cn", IndexKind::Equality, 2, true)
    }

    fn context() -> Arc<ImportContext> {
        let mut registry = IndexRegistry::default();
        registry.register(
            key(),
            IndexTarget::Tree(Arc::new(MemoryIndexTree::new("cn.equality", 2, true))),
        );
        ImportContext::for_tests(registry)
    }

    fn sorted(records: &[(&[u8], u64, bool)]) -> IndexOutputBuffer {
        let mut buffer = IndexOutputBuffer::new(1 << 16);
        buffer.set_index_key(key());
        for &(k, id, insert) in records {
            buffer.add(k, EntryId::new(id), IndexId::new(0), insert);
        }
        buffer.sort();
        buffer
    }

    struct Decoded {
        key: Vec<u8>,
        inserts: Result<Vec<u64>, u64>,
        deletes: Vec<u64>,
    }

    fn take(bytes: &[u8], pos: &mut usize) -> u64 {
        let (value, used) = read_packed(&bytes[*pos..]).unwrap().unwrap();
        *pos += used;
        value
    }

    fn take_ids(bytes: &[u8], pos: &mut usize, count: u64) -> Vec<u64> {
        let mut previous = 0;
        (0..count)
            .map(|_| {
                previous += take(bytes, pos);
                previous
            })
            .collect()
    }

    fn decode(bytes: &[u8]) -> Vec<Decoded> {
        let mut pos = 0;
        let mut out = Vec::new();
        while pos < bytes.len() {
            assert_eq!(&bytes[pos..pos + 4], &[0, 0, 0, 0]);
            pos += 4;
            let len = take(bytes, &mut pos) as usize;
            let key = bytes[pos..pos + len].to_vec();
            pos += len;
            let count = unzigzag(take(bytes, &mut pos));
            let inserts = if count < 0 {
                Err(take(bytes, &mut pos))
            } else {
                Ok(take_ids(bytes, &mut pos, count as u64))
            };
            let delete_count = take(bytes, &mut pos);
            let deletes = take_ids(bytes, &mut pos, delete_count);
            out.push(Decoded { key, inserts, deletes });
        }
        out
    }

    #[test]
    fn batch_collapses_records_per_key() {
        let ctx = context();
        let manager = Arc::new(IndexManager::new(key()));
        let mut writer = ScratchFileWriter::new(
            Arc::clone(&manager),
            ctx.scratch.create("cn.equality").unwrap(),
            ctx.scratch.create("cn.equality.offsets").unwrap(),
            Arc::clone(&ctx),
        );
        let first = sorted(&[(b"bob", 7, true), (b"al", 3, true), (b"bob", 2, false)]);
        let second = sorted(&[(b"bob", 5, true), (b"cy", 1, true), (b"cy", 4, true), (b"cy", 9, true)]);
        writer.write_batch(&[first, second]).unwrap();
        writer.finish().unwrap();

        assert_eq!(manager.buffer_count(), 1);
        let ranges = manager.ranges().unwrap();
        assert_eq!(ranges, vec![(0, manager.file_size())]);
        let bytes = manager.data().unwrap().read_at(0, manager.file_size() as usize).unwrap();
        let records = decode(&bytes);

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key, b"al");
        assert_eq!(records[0].inserts, Ok(vec![3]));
        assert_eq!(records[1].key, b"bob");
        assert_eq!(records[1].inserts, Ok(vec![5, 7]));
        assert_eq!(records[1].deletes, vec![2]);
        assert_eq!(records[2].key, b"cy");
        assert_eq!(records[2].inserts, Err(3));
        assert!(ctx.stats.scratch_bytes() > 0);
    }

    #[test]
    fn registry_starts_writers_and_recycles_buffers() {
        let ctx = context();
        let (free_tx, free_rx) = unbounded();
        let writers = ScratchWriters::new(Arc::clone(&ctx), free_tx, 4);
        writers.enqueue(sorted(&[(b"a", 1, true)])).unwrap();
        let mut discard = sorted(&[(b"b", 2, true)]);
        discard.set_discard();
        writers.enqueue(discard).unwrap();

        let managers = writers.stop_and_join().unwrap();
        assert_eq!(managers.len(), 1);
        assert!(managers[0].buffer_count() >= 1);
        assert_eq!(free_rx.try_iter().count(), 1);
    }

    #[test]
    fn buffers_without_a_key_are_refused() {
        let ctx = context();
        let (free_tx, _free_rx) = unbounded();
        let writers = ScratchWriters::new(ctx, free_tx, 1);
        assert!(writers.enqueue(IndexOutputBuffer::new(16)).is_err());
        assert!(writers.stop_and_join().unwrap().is_empty());
    }
}
