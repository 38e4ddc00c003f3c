use crate::{Lsn, Pgno};

/// Error taxonomy for the storage core (spec §7). Every public function
/// across the workspace returns `Result<T, NumStoreError>`.
#[derive(Debug, thiserror::Error)]
pub enum NumStoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("allocation failure: {0}")]
    NoMem(String),

    #[error("corrupt on-disk state: {0}")]
    Corrupt(String),

    #[error("deadlock detected, transaction {txid} aborted")]
    Deadlock { txid: u64 },

    #[error("lock conflict on resource, retry may succeed: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal invariant violated: {0}")]
    FailedInvariant(String),
}

impl NumStoreError {
    pub fn corrupt_page(pgno: Pgno, why: impl std::fmt::Display) -> Self {
        NumStoreError::Corrupt(format!("page {pgno}: {why}"))
    }

    pub fn corrupt_wal(lsn: Lsn, why: impl std::fmt::Display) -> Self {
        NumStoreError::Corrupt(format!("wal record at lsn {lsn}: {why}"))
    }

    pub fn invariant(what: impl std::fmt::Display) -> Self {
        NumStoreError::FailedInvariant(what.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NumStoreError>;
