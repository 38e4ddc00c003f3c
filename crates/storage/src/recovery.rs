//! ARIES redo/undo orchestration (spec §4.8.3–§4.8.5). The analysis
//! pass itself lives in `numstore-wal` (it only needs the log); this
//! module drives the pager through redo and undo, since only the
//! storage crate has both the WAL and the buffer pool in hand.

use std::collections::{BinaryHeap, HashMap};
use std::path::Path;
use std::sync::Arc;

use numstore_common::{Lsn, Result, Txid};
use numstore_pagestore::BufferPool;
use numstore_wal::{analyze, AnalysisResult, ClrBody, Record, RecordBody, SegmentManager, WalReader, WalWriter};
use tracing::{debug, info};

/// Run the full ARIES recovery procedure against `pool`/`wal`: analyze
/// the log, redo from `redo_start_lsn`, then undo every loser
/// transaction. Returns the analysis result for the caller to log or
/// fold into a post-recovery checkpoint.
pub fn recover(pool: &Arc<BufferPool>, wal: &WalWriter, base_dir: &Path, basename: &str, max_segment_bytes: u64) -> Result<AnalysisResult> {
    let mut reader = open_reader(base_dir, basename, max_segment_bytes)?;
    let analysis = analyze(&mut reader)?;
    info!(
        redo_start_lsn = analysis.redo_start_lsn,
        dpt_len = analysis.dpt.len(),
        losers = analysis.losers().len(),
        "recovery analysis complete"
    );

    redo(pool, &mut reader, &analysis)?;
    undo(pool, wal, &mut reader, &analysis)?;
    Ok(analysis)
}

fn open_reader(base_dir: &Path, basename: &str, max_segment_bytes: u64) -> Result<WalReader> {
    let segments = SegmentManager::open(base_dir, basename, max_segment_bytes)?;
    Ok(WalReader::new(segments))
}

/// Spec §4.8.3: replay every UPDATE/CLR from `redo_start_lsn` onward,
/// applying each only if the page's reconstructed `rec_lsn` says it
/// could still be dirty and the page's on-disk `page_lsn` hasn't
/// already absorbed it.
fn redo(pool: &Arc<BufferPool>, reader: &mut WalReader, analysis: &AnalysisResult) -> Result<()> {
    let dpt: HashMap<_, _> = analysis.dpt.iter().map(|e| (e.page_id, e.rec_lsn)).collect();
    let records = reader.scan_forward_from(analysis.redo_start_lsn)?;
    let mut applied = 0usize;

    for record in &records {
        let (page_id, offset, image) = match &record.body {
            RecordBody::Update(u) => (u.page_id, u.page_offset as usize, &u.after_image),
            RecordBody::Clr(c) => (c.page_id, c.page_offset as usize, &c.restored_image),
            _ => continue,
        };
        let Some(&rec_lsn) = dpt.get(&page_id) else { continue };
        if record.lsn < rec_lsn {
            continue;
        }
        if pool.apply_logged_image(page_id, offset, image, record.lsn)? {
            applied += 1;
        }
    }
    debug!(applied, "redo pass applied records");
    Ok(())
}

/// Spec §4.8.4: roll back every loser transaction in strict reverse
/// LSN order across all of them at once, via a max-heap keyed by each
/// transaction's current `undo_next_lsn`.
fn undo(pool: &Arc<BufferPool>, wal: &WalWriter, reader: &mut WalReader, analysis: &AnalysisResult) -> Result<()> {
    let losers = analysis.losers();
    if losers.is_empty() {
        return Ok(());
    }

    let all = reader.scan_forward()?;
    let by_lsn: HashMap<Lsn, Record> = all.into_iter().map(|r| (r.lsn, r)).collect();

    let mut heap: BinaryHeap<(Lsn, Txid)> = BinaryHeap::new();
    let mut last_lsn_for: HashMap<Txid, Lsn> = HashMap::new();
    for loser in &losers {
        heap.push((loser.undo_next_lsn, loser.txid));
        last_lsn_for.insert(loser.txid, loser.last_lsn);
    }

    while let Some((lsn, txid)) = heap.pop() {
        if lsn == 0 {
            continue;
        }
        let record = by_lsn
            .get(&lsn)
            .ok_or_else(|| numstore_common::NumStoreError::corrupt_wal(lsn, "undo target missing from log"))?
            .clone();
        let prev = *last_lsn_for.get(&txid).unwrap_or(&0);

        match &record.body {
            RecordBody::Clr(c) => {
                if c.undo_next_lsn == 0 {
                    let end_lsn = wal.append(txid, prev, RecordBody::End)?;
                    last_lsn_for.insert(txid, end_lsn);
                } else {
                    heap.push((c.undo_next_lsn, txid));
                }
            }
            RecordBody::Update(u) => {
                let clr_lsn = wal.append(
                    txid,
                    prev,
                    RecordBody::Clr(ClrBody {
                        page_id: u.page_id,
                        compensates_lsn: record.lsn,
                        undo_next_lsn: record.prev_lsn,
                        page_offset: u.page_offset,
                        restored_image: u.before_image.clone(),
                    }),
                )?;
                pool.apply_logged_image(u.page_id, u.page_offset as usize, &u.before_image, clr_lsn)?;
                last_lsn_for.insert(txid, clr_lsn);
                heap.push((record.prev_lsn, txid));
            }
            RecordBody::Begin => {
                let end_lsn = wal.append(txid, prev, RecordBody::End)?;
                last_lsn_for.insert(txid, end_lsn);
            }
            _ => {}
        }
    }
    wal.force_all()?;
    debug!(count = losers.len(), "undo pass rolled back loser transactions");
    Ok(())
}

/// Spec §4.8.5: identical to the undo pass, but scoped to one
/// transaction's own chain and stopping once `undo_next_lsn` reaches
/// `savepoint_lsn`, so the rest of the transaction survives.
pub fn rollback_to_savepoint(
    pool: &Arc<BufferPool>,
    wal: &WalWriter,
    base_dir: &Path,
    basename: &str,
    max_segment_bytes: u64,
    txid: Txid,
    current_last_lsn: Lsn,
    savepoint_lsn: Lsn,
) -> Result<Lsn> {
    let mut reader = open_reader(base_dir, basename, max_segment_bytes)?;
    let chain = reader.read_backward_chain(current_last_lsn)?;
    let mut last_lsn = current_last_lsn;

    for record in chain {
        if record.lsn <= savepoint_lsn {
            break;
        }
        match &record.body {
            RecordBody::Update(u) => {
                let clr_lsn = wal.append(
                    txid,
                    last_lsn,
                    RecordBody::Clr(ClrBody {
                        page_id: u.page_id,
                        compensates_lsn: record.lsn,
                        undo_next_lsn: record.prev_lsn,
                        page_offset: u.page_offset,
                        restored_image: u.before_image.clone(),
                    }),
                )?;
                pool.apply_logged_image(u.page_id, u.page_offset as usize, &u.before_image, clr_lsn)?;
                last_lsn = clr_lsn;
            }
            RecordBody::Clr(_) | RecordBody::Begin | RecordBody::Commit | RecordBody::Abort | RecordBody::End | RecordBody::Checkpoint(_) => {}
        }
    }
    Ok(last_lsn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn redo_reapplies_committed_update_after_simulated_crash() {
        let dir = TempDir::new().unwrap();
        let wal = Arc::new(WalWriter::open(dir.path(), "wal", 1 << 20).unwrap());
        let pool = BufferPool::open(dir.path(), "db.bin", Arc::clone(&wal), 4).unwrap();

        let begin_lsn = wal.append(1, 0, RecordBody::Begin).unwrap();
        let handle = pool.allocate_page().unwrap();
        let pgno = handle.pgno();
        let update_lsn = handle.write_range(0, &[1, 2, 3, 4], 1, begin_lsn).unwrap();
        let commit_lsn = wal.append(1, update_lsn, RecordBody::Commit).unwrap();
        let end_lsn = wal.append(1, commit_lsn, RecordBody::End).unwrap();
        wal.force(end_lsn).unwrap();
        drop(handle);

        // Simulate a crash: the page's in-memory image never made it to
        // disk (we never called flush_page), but the WAL record is durable.
        let analysis = {
            let mut reader = open_reader(dir.path(), "wal", 1 << 20).unwrap();
            analyze(&mut reader).unwrap()
        };
        assert!(analysis.losers().is_empty());

        // A fresh pool over the same file, as recovery would open.
        let fresh_wal = Arc::new(WalWriter::resume_after(dir.path(), "wal", 1 << 20, end_lsn).unwrap());
        let fresh_pool = BufferPool::open(dir.path(), "db.bin", Arc::clone(&fresh_wal), 4).unwrap();
        let report = recover(&fresh_pool, &fresh_wal, dir.path(), "wal", 1 << 20).unwrap();
        assert_eq!(report.redo_start_lsn, update_lsn);

        let handle2 = fresh_pool.get_shared(pgno).unwrap();
        assert_eq!(handle2.read_range(0, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn undo_rolls_back_uncommitted_write() {
        let dir = TempDir::new().unwrap();
        let wal = Arc::new(WalWriter::open(dir.path(), "wal", 1 << 20).unwrap());
        let pool = BufferPool::open(dir.path(), "db.bin", Arc::clone(&wal), 4).unwrap();

        let begin_lsn = wal.append(1, 0, RecordBody::Begin).unwrap();
        let handle = pool.allocate_page().unwrap();
        let pgno = handle.pgno();
        let init_lsn = handle.write_range(0, &[0, 0, 0, 0], 1, begin_lsn).unwrap();
        let write_lsn = handle.write_range(0, &[9, 9, 9, 9], 1, init_lsn).unwrap();
        wal.force(write_lsn).unwrap();
        drop(handle);

        let fresh_wal = Arc::new(WalWriter::resume_after(dir.path(), "wal", 1 << 20, write_lsn).unwrap());
        let fresh_pool = BufferPool::open(dir.path(), "db.bin", Arc::clone(&fresh_wal), 4).unwrap();
        let analysis = recover(&fresh_pool, &fresh_wal, dir.path(), "wal", 1 << 20).unwrap();
        assert_eq!(analysis.losers().len(), 1);

        let handle2 = fresh_pool.get_shared(pgno).unwrap();
        assert_eq!(handle2.read_range(0, 4).unwrap(), vec![0, 0, 0, 0]);
    }
}
