//! Forward and backward scanning over the segmented log (spec §4.3,
//! §4.8.2). Forward scans drive the ARIES analysis/redo passes; backward
//! scans (following each record's `prev_lsn`) drive per-transaction undo.

use std::collections::HashMap;

use numstore_common::Lsn;

use crate::frame;
use crate::record::Record;
use crate::segment::{SegmentId, SegmentManager};
use crate::{WalError, WalResult};

/// Read-only cursor over every segment the manifest knows about, in
/// creation order. Shares nothing with [`crate::writer::WalWriter`] —
/// recovery opens its own `SegmentManager` over the same files.
pub struct WalReader {
    segments: SegmentManager,
}

impl WalReader {
    pub fn new(segments: SegmentManager) -> Self {
        Self { segments }
    }

    /// Decode every record across all segments, in on-disk order. This
    /// is the backbone of the ARIES analysis pass: a full forward sweep
    /// from the checkpoint's start LSN to the end of the log.
    pub fn scan_forward(&mut self) -> WalResult<Vec<Record>> {
        let mut out = Vec::new();
        let segment_ids: Vec<SegmentId> = self.segments.all_segments().to_vec();
        for seg_id in segment_ids {
            let len = self.segments.segment_len(seg_id)?;
            let mut offset = 0u64;
            while offset < len {
                let (record, next) = self.read_frame_at(seg_id, offset)?;
                out.push(record);
                offset = next;
            }
        }
        Ok(out)
    }

    /// Scan forward, returning only records with `lsn >= from_lsn`.
    pub fn scan_forward_from(&mut self, from_lsn: Lsn) -> WalResult<Vec<Record>> {
        Ok(self
            .scan_forward()?
            .into_iter()
            .filter(|r| r.lsn >= from_lsn)
            .collect())
    }

    fn read_frame_at(&mut self, seg_id: SegmentId, offset: u64) -> WalResult<(Record, u64)> {
        let mut len_buf = [0u8; 4];
        self.segments.read(seg_id, offset, &mut len_buf)?;
        let total_length = u32::from_le_bytes(len_buf) as usize;
        if total_length < 4 {
            return Err(WalError::Corrupt(format!(
                "segment {seg_id} offset {offset}: implausible frame length {total_length}"
            )));
        }
        let mut frame_buf = vec![0u8; total_length];
        self.segments.read(seg_id, offset, &mut frame_buf)?;
        let record = frame::decode_frame(&frame_buf)
            .map_err(|e| WalError::Corrupt(format!("segment {seg_id} offset {offset}: {e}")))?;
        Ok((record, offset + total_length as u64))
    }

    /// Build an `lsn -> record` index by scanning the whole log once,
    /// then follow `prev_lsn` backward from `start_lsn` until exhausted
    /// (an LSN of 0). Used to undo one transaction's updates in reverse
    /// order.
    pub fn read_backward_chain(&mut self, start_lsn: Lsn) -> WalResult<Vec<Record>> {
        let all = self.scan_forward()?;
        let by_lsn: HashMap<Lsn, Record> = all.into_iter().map(|r| (r.lsn, r)).collect();

        let mut chain = Vec::new();
        let mut cursor = start_lsn;
        while cursor != 0 {
            let record = by_lsn
                .get(&cursor)
                .ok_or_else(|| WalError::Corrupt(format!("dangling prev_lsn {cursor}")))?
                .clone();
            cursor = record.prev_lsn;
            chain.push(record);
        }
        Ok(chain)
    }
}
