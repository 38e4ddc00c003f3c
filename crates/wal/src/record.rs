use numstore_common::{Lsn, Pgno, Txid, PGNO_NULL};
use serde::{Deserialize, Serialize};

/// WAL record kinds (spec §3.4). Every record carries `lsn`, `prev_lsn`
/// (the previous record written by the same transaction) and `txid`;
/// the kind-specific payload is framed separately (see [`crate::writer`]).
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    Begin,
    Commit,
    Abort,
    End,
    /// Physical redo + physical undo over one page's byte range.
    Update(UpdateBody),
    /// Compensation log record: a non-undoable record of an undo action.
    Clr(ClrBody),
    /// Fuzzy checkpoint carrying DPT/TT snapshots.
    Checkpoint(CheckpointBody),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateBody {
    pub page_id: Pgno,
    pub page_offset: u32,
    pub before_image: Vec<u8>,
    pub after_image: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClrBody {
    pub page_id: Pgno,
    /// LSN of the UPDATE record this CLR compensates.
    pub compensates_lsn: Lsn,
    /// Value to which the undoing transaction's `undo_next_lsn` should
    /// advance once this CLR is processed (the compensated record's
    /// `prev_lsn`, or 0 once the chain is exhausted).
    pub undo_next_lsn: Lsn,
    pub page_offset: u32,
    /// The before-image being restored (this CLR's physical redo payload).
    pub restored_image: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointBody {
    /// Serialized `(pgno, rec_lsn)` pairs — the Dirty Page Table snapshot.
    pub dpt_snapshot: Vec<(Pgno, Lsn)>,
    /// Serialized `(txid, last_lsn, undo_next_lsn)` triples — the
    /// Transaction Table snapshot, restricted to active transactions.
    pub tt_snapshot: Vec<(Txid, Lsn, Lsn)>,
}

/// A full WAL record as it exists once assigned an LSN.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub txid: Txid,
    pub body: RecordBody,
}

impl Record {
    pub fn page_id(&self) -> Pgno {
        match &self.body {
            RecordBody::Update(u) => u.page_id,
            RecordBody::Clr(c) => c.page_id,
            _ => PGNO_NULL,
        }
    }

    pub fn kind_tag(&self) -> u8 {
        match &self.body {
            RecordBody::Begin => KIND_BEGIN,
            RecordBody::Commit => KIND_COMMIT,
            RecordBody::Abort => KIND_ABORT,
            RecordBody::End => KIND_END,
            RecordBody::Update(_) => KIND_UPDATE,
            RecordBody::Clr(_) => KIND_CLR,
            RecordBody::Checkpoint(_) => KIND_CHECKPOINT,
        }
    }

    pub fn is_mtr_boundary(&self) -> bool {
        matches!(self.body, RecordBody::Commit | RecordBody::Abort)
    }
}

pub const KIND_BEGIN: u8 = 0;
pub const KIND_COMMIT: u8 = 1;
pub const KIND_ABORT: u8 = 2;
pub const KIND_END: u8 = 3;
pub const KIND_UPDATE: u8 = 4;
pub const KIND_CLR: u8 = 5;
pub const KIND_CHECKPOINT: u8 = 6;
