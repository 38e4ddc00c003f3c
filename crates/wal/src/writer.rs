//! Append/force writer (spec §4.3): `append` assigns the next LSN and
//! buffers the framed record without forcing a flush; `force(upto_lsn)`
//! drains every buffered record up to and including `upto_lsn` in one
//! write + fsync (group commit). Records already appended but not yet
//! forced remain readable in memory, so an in-flight transaction can be
//! rolled back before anything hits disk.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use numstore_common::{Lsn, Txid};
use tracing::{debug, trace};

use crate::record::{Record, RecordBody};
use crate::segment::{SegmentId, SegmentManager};
use crate::{frame, WalResult};

struct Inner {
    segments: SegmentManager,
    next_lsn: Lsn,
    /// Records appended since the last `force`, in order.
    tail: Vec<Record>,
    /// Where a flushed LSN lives: `(segment, offset)`. Populated only
    /// once a record has actually been forced to disk.
    lsn_index: HashMap<Lsn, (SegmentId, u64)>,
    /// Highest LSN durably forced to disk. 0 means none yet.
    durable_upto: Lsn,
}

/// The write-ahead log's append/force interface. Cheap to clone-share
/// via `Arc`; all mutable state lives behind one mutex, matching the
/// single-writer-many-readers pattern the WAL's callers expect.
pub struct WalWriter {
    inner: Mutex<Inner>,
}

impl WalWriter {
    pub fn open(base_dir: &Path, basename: &str, max_segment_bytes: u64) -> WalResult<Self> {
        let segments = SegmentManager::open(base_dir, basename, max_segment_bytes)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                segments,
                next_lsn: 1,
                tail: Vec::new(),
                lsn_index: HashMap::new(),
                durable_upto: 0,
            }),
        })
    }

    /// Reopen against an existing log, continuing LSN assignment after
    /// the highest LSN already present on disk (used by recovery).
    pub fn resume_after(base_dir: &Path, basename: &str, max_segment_bytes: u64, last_lsn: Lsn) -> WalResult<Self> {
        let writer = Self::open(base_dir, basename, max_segment_bytes)?;
        writer.inner.lock().unwrap().next_lsn = last_lsn + 1;
        Ok(writer)
    }

    /// Append one record body for `txid`, chained after `prev_lsn` (the
    /// caller's last LSN for this transaction, or 0). Returns the
    /// assigned LSN without forcing a flush.
    pub fn append(&self, txid: Txid, prev_lsn: Lsn, body: RecordBody) -> WalResult<Lsn> {
        let mut inner = self.inner.lock().unwrap();
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        let record = Record {
            lsn,
            prev_lsn,
            txid,
            body,
        };
        trace!(lsn, txid, "wal record appended to tail buffer");
        inner.tail.push(record);
        Ok(lsn)
    }

    /// Force every buffered record up to and including `upto_lsn` to
    /// disk in one batched write, then fsync. A no-op if `upto_lsn` is
    /// already durable.
    pub fn force(&self, upto_lsn: Lsn) -> WalResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if upto_lsn <= inner.durable_upto {
            return Ok(());
        }
        let split = inner
            .tail
            .iter()
            .position(|r| r.lsn > upto_lsn)
            .unwrap_or(inner.tail.len());
        let to_flush: Vec<Record> = inner.tail.drain(..split).collect();
        if to_flush.is_empty() {
            return Ok(());
        }

        let mut batch = Vec::new();
        let mut offsets = Vec::with_capacity(to_flush.len());
        for record in &to_flush {
            let start = batch.len();
            batch.extend_from_slice(&frame::encode_frame(record));
            offsets.push((record.lsn, start));
        }

        let (seg_id, base_offset) = inner.segments.append(&batch)?;
        for (lsn, rel) in offsets {
            inner.lsn_index.insert(lsn, (seg_id, base_offset + rel as u64));
        }
        inner.segments.sync()?;

        let highest = to_flush.last().unwrap().lsn;
        inner.durable_upto = highest;
        debug!(upto = highest, count = to_flush.len(), "wal group commit forced");
        Ok(())
    }

    /// Force everything buffered so far.
    pub fn force_all(&self) -> WalResult<()> {
        let upto = self.inner.lock().unwrap().tail.last().map(|r| r.lsn).unwrap_or(0);
        if upto == 0 {
            return Ok(());
        }
        self.force(upto)
    }

    pub fn durable_upto(&self) -> Lsn {
        self.inner.lock().unwrap().durable_upto
    }

    /// Peek a record still sitting in the unflushed tail, without
    /// touching disk (used by pre-force rollback).
    pub fn peek_tail(&self, lsn: Lsn) -> Option<Record> {
        self.inner.lock().unwrap().tail.iter().find(|r| r.lsn == lsn).cloned()
    }

    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().unwrap().next_lsn
    }

    pub(crate) fn locate(&self, lsn: Lsn) -> Option<(SegmentId, u64)> {
        self.inner.lock().unwrap().lsn_index.get(&lsn).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_then_force_makes_record_durable() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path(), "wal", 1 << 20).unwrap();

        let lsn1 = writer.append(1, 0, RecordBody::Begin).unwrap();
        assert_eq!(writer.durable_upto(), 0);

        writer.force(lsn1).unwrap();
        assert_eq!(writer.durable_upto(), lsn1);
    }

    #[test]
    fn group_commit_flushes_multiple_records_at_once() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path(), "wal", 1 << 20).unwrap();

        let l1 = writer.append(1, 0, RecordBody::Begin).unwrap();
        let l2 = writer.append(2, 0, RecordBody::Begin).unwrap();
        let l3 = writer.append(1, l1, RecordBody::Commit).unwrap();

        writer.force(l3).unwrap();
        assert_eq!(writer.durable_upto(), l3);
        assert!(writer.locate(l1).is_some());
        assert!(writer.locate(l2).is_some());
    }

    #[test]
    fn unforced_record_is_visible_in_tail_but_not_durable() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path(), "wal", 1 << 20).unwrap();
        let lsn = writer.append(1, 0, RecordBody::Begin).unwrap();

        assert!(writer.peek_tail(lsn).is_some());
        assert_eq!(writer.durable_upto(), 0);
        assert!(writer.locate(lsn).is_none());
    }
}
