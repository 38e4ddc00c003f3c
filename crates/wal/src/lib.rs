//! Write-ahead log: on-disk framing, append/force writer, forward/backward
//! reader, segment rotation, and the ARIES analysis pass (spec §3.4, §4.3,
//! §4.8.2).

pub mod frame;
pub mod reader;
pub mod record;
pub mod recovery;
pub mod segment;
pub mod writer;

pub use reader::WalReader;
pub use record::{CheckpointBody, ClrBody, Record, RecordBody, UpdateBody};
pub use recovery::{analyze, AnalysisResult, DptEntry, TtEntry};
pub use segment::{SegmentId, SegmentManager};
pub use writer::WalWriter;

/// WAL-local error type; converts losslessly into `NumStoreError::Corrupt`
/// / `::Io` at the crate boundary (see `From` impl below).
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt WAL: {0}")]
    Corrupt(String),
}

pub type WalResult<T> = std::result::Result<T, WalError>;

impl From<WalError> for numstore_common::NumStoreError {
    fn from(e: WalError) -> Self {
        match e {
            WalError::Io(io) => numstore_common::NumStoreError::Io(io),
            WalError::Corrupt(s) => numstore_common::NumStoreError::Corrupt(s),
        }
    }
}
