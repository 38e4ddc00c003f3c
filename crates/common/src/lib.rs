//! Shared types for the NumStore storage core: primitive identifiers,
//! the stride-resolution algorithm, the error taxonomy, and the bounded
//! file-descriptor pool that both the WAL and the pager build on.

pub mod error;
pub mod file_pool;
pub mod stride;

pub use error::{NumStoreError, Result};
pub use file_pool::{FileId, FilePool};
pub use stride::{Stride, UserStride};

/// 32-bit page number. `PGNO_NULL` is the reserved sentinel meaning "no page".
pub type Pgno = u32;

/// The null page number sentinel (spec §3.1).
pub const PGNO_NULL: Pgno = u32::MAX;

/// 64-bit monotonic log sequence number. LSN 0 means "none".
pub type Lsn = u64;

/// 64-bit monotonic transaction id.
pub type Txid = u64;

/// Byte count (spec `b_size`).
pub type BSize = u64;

/// Element size in bytes (spec `t_size`).
pub type TSize = u32;

/// Fixed page size in bytes. 4096 matches spec §8.2's scenario default.
pub const PAGE_SIZE: usize = 4096;

/// Header page of the DB file and variable-directory page are reserved.
pub const PGNO_HEADER: Pgno = 0;
pub const PGNO_VAR_DIR: Pgno = 1;

/// Transaction lifecycle states (spec §3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Running,
    CandidateForUndo,
    Committed,
    Done,
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TxState::Running => "RUNNING",
            TxState::CandidateForUndo => "CANDIDATE_FOR_UNDO",
            TxState::Committed => "COMMITTED",
            TxState::Done => "DONE",
        };
        write!(f, "{s}")
    }
}

impl TxState {
    /// Whether a transaction in this state, seen at recovery time, is a
    /// "loser" that must be rolled back (spec §3.5, §4.8.4).
    pub fn is_loser(self) -> bool {
        matches!(self, TxState::Running | TxState::CandidateForUndo)
    }
}
