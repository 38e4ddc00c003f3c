//! Transactional storage core: engine configuration, the hierarchical
//! lock table, the transaction table, the range-partitioned tree, and
//! ARIES-style crash recovery (spec §3–§4).

pub mod config;
pub mod engine;
pub mod lock;
pub mod recovery;
pub mod rpt;
pub mod txn;

pub use config::EngineConfig;
pub use engine::StorageEngine;
pub use lock::{LockMode, LockResource, LockTable};
pub use rpt::{InsertOutcome, RemoveOutcome};
pub use txn::{Transaction, TransactionTable};
