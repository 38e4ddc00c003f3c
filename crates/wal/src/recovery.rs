//! ARIES analysis pass (spec §4.8.2): reconstruct the Dirty Page Table
//! and Transaction Table as they stood at the moment of a crash, by
//! replaying the log from the last checkpoint forward. The redo pass
//! that follows (owned by `numstore-storage`, which also owns the
//! pager) starts at `redo_start_lsn`; the undo pass rolls back every
//! "loser" transaction this analysis finds.

use std::collections::HashMap;

use numstore_common::{Lsn, Pgno, TxState, Txid};

use crate::reader::WalReader;
use crate::record::{Record, RecordBody};
use crate::WalResult;

/// One entry of the reconstructed Dirty Page Table: the earliest LSN
/// that could have dirtied this page since the last time it was
/// flushed (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DptEntry {
    pub page_id: Pgno,
    pub rec_lsn: Lsn,
}

/// One entry of the reconstructed Transaction Table (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtEntry {
    pub txid: Txid,
    pub last_lsn: Lsn,
    pub undo_next_lsn: Lsn,
    pub state: TxState,
}

#[derive(Debug, Default)]
pub struct AnalysisResult {
    pub dpt: Vec<DptEntry>,
    pub tt: Vec<TtEntry>,
    /// LSN the redo pass should start from: the minimum `rec_lsn` across
    /// the reconstructed DPT, or the analysis start point if the DPT is
    /// empty (nothing was left dirty).
    pub redo_start_lsn: Lsn,
}

impl AnalysisResult {
    /// Transactions that must be rolled back: still `Running` or marked
    /// `CandidateForUndo` when the crash happened (spec §3.5, §4.8.4).
    pub fn losers(&self) -> Vec<TtEntry> {
        self.tt.iter().copied().filter(|e| e.state.is_loser()).collect()
    }
}

/// Run the ARIES analysis pass over the full log. `reader` must be
/// positioned over every segment; this replays from the start, using
/// the last [`RecordBody::Checkpoint`] (if any) as the DPT/TT baseline,
/// matching how a fuzzy checkpoint is meant to be consumed: the
/// checkpoint record itself always lands before the tail it snapshots
/// is guaranteed stable, so analysis must still walk records after it.
pub fn analyze(reader: &mut WalReader) -> WalResult<AnalysisResult> {
    let records = reader.scan_forward()?;

    let mut dpt: HashMap<Pgno, Lsn> = HashMap::new();
    let mut tt: HashMap<Txid, TtEntry> = HashMap::new();
    let mut analysis_start = records.first().map(|r| r.lsn).unwrap_or(0);

    for record in &records {
        apply(&mut dpt, &mut tt, record, &mut analysis_start);
    }

    let redo_start_lsn = dpt.values().copied().min().unwrap_or(analysis_start);

    let mut dpt_out: Vec<DptEntry> = dpt
        .into_iter()
        .map(|(page_id, rec_lsn)| DptEntry { page_id, rec_lsn })
        .collect();
    dpt_out.sort_by_key(|e| e.page_id);

    let mut tt_out: Vec<TtEntry> = tt.into_values().collect();
    tt_out.sort_by_key(|e| e.txid);

    Ok(AnalysisResult {
        dpt: dpt_out,
        tt: tt_out,
        redo_start_lsn,
    })
}

fn apply(
    dpt: &mut HashMap<Pgno, Lsn>,
    tt: &mut HashMap<Txid, TtEntry>,
    record: &Record,
    analysis_start: &mut Lsn,
) {
    match &record.body {
        RecordBody::Checkpoint(body) => {
            dpt.clear();
            for &(page_id, rec_lsn) in &body.dpt_snapshot {
                dpt.insert(page_id, rec_lsn);
            }
            tt.clear();
            for &(txid, last_lsn, undo_next_lsn) in &body.tt_snapshot {
                tt.insert(
                    txid,
                    TtEntry {
                        txid,
                        last_lsn,
                        undo_next_lsn,
                        state: TxState::Running,
                    },
                );
            }
            *analysis_start = record.lsn;
        }
        RecordBody::Begin => {
            tt.insert(
                record.txid,
                TtEntry {
                    txid: record.txid,
                    last_lsn: record.lsn,
                    undo_next_lsn: record.lsn,
                    state: TxState::Running,
                },
            );
        }
        RecordBody::Commit => {
            let entry = tt.entry(record.txid).or_insert(TtEntry {
                txid: record.txid,
                last_lsn: record.lsn,
                undo_next_lsn: record.lsn,
                state: TxState::Running,
            });
            entry.last_lsn = record.lsn;
            entry.state = TxState::Committed;
        }
        RecordBody::Abort => {
            let entry = tt.entry(record.txid).or_insert(TtEntry {
                txid: record.txid,
                last_lsn: record.lsn,
                undo_next_lsn: record.lsn,
                state: TxState::Running,
            });
            entry.last_lsn = record.lsn;
            entry.state = TxState::CandidateForUndo;
        }
        RecordBody::End => {
            tt.remove(&record.txid);
        }
        RecordBody::Update(u) => {
            dpt.entry(u.page_id).or_insert(record.lsn);
            let entry = tt.entry(record.txid).or_insert(TtEntry {
                txid: record.txid,
                last_lsn: record.lsn,
                undo_next_lsn: record.lsn,
                state: TxState::Running,
            });
            entry.last_lsn = record.lsn;
            entry.undo_next_lsn = record.lsn;
        }
        RecordBody::Clr(c) => {
            dpt.entry(c.page_id).or_insert(record.lsn);
            let entry = tt.entry(record.txid).or_insert(TtEntry {
                txid: record.txid,
                last_lsn: record.lsn,
                undo_next_lsn: record.lsn,
                state: TxState::CandidateForUndo,
            });
            entry.last_lsn = record.lsn;
            entry.undo_next_lsn = c.undo_next_lsn;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::UpdateBody;
    use crate::segment::SegmentManager;
    use crate::writer::WalWriter;
    use tempfile::TempDir;

    #[test]
    fn committed_transaction_leaves_no_loser() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path(), "wal", 1 << 20).unwrap();
        let l1 = writer.append(1, 0, RecordBody::Begin).unwrap();
        let l2 = writer
            .append(
                1,
                l1,
                RecordBody::Update(UpdateBody {
                    page_id: 3,
                    page_offset: 0,
                    before_image: vec![0],
                    after_image: vec![9],
                }),
            )
            .unwrap();
        let l3 = writer.append(1, l2, RecordBody::Commit).unwrap();
        writer.force(l3).unwrap();
        drop(writer);

        let segments = SegmentManager::open(dir.path(), "wal", 1 << 20).unwrap();
        let mut reader = WalReader::new(segments);
        let analysis = analyze(&mut reader).unwrap();

        assert!(analysis.losers().is_empty());
        assert_eq!(analysis.redo_start_lsn, l2);
        assert_eq!(analysis.dpt, vec![DptEntry { page_id: 3, rec_lsn: l2 }]);
    }

    #[test]
    fn uncommitted_transaction_is_a_loser() {
        let dir = TempDir::new().unwrap();
        let writer = WalWriter::open(dir.path(), "wal", 1 << 20).unwrap();
        let l1 = writer.append(7, 0, RecordBody::Begin).unwrap();
        let l2 = writer
            .append(
                7,
                l1,
                RecordBody::Update(UpdateBody {
                    page_id: 5,
                    page_offset: 0,
                    before_image: vec![0],
                    after_image: vec![1],
                }),
            )
            .unwrap();
        writer.force(l2).unwrap();
        drop(writer);

        let segments = SegmentManager::open(dir.path(), "wal", 1 << 20).unwrap();
        let mut reader = WalReader::new(segments);
        let analysis = analyze(&mut reader).unwrap();

        let losers = analysis.losers();
        assert_eq!(losers.len(), 1);
        assert_eq!(losers[0].txid, 7);
        assert_eq!(losers[0].state, TxState::Running);
        assert_eq!(losers[0].undo_next_lsn, l2);
    }
}
