//! Page layouts, the dirty page table, and the pager (buffer pool):
//! the pieces that turn a WAL-backed file into addressable, pinnable
//! pages (spec §3.2–§3.3, §4.1–§4.2, §4.5).

pub mod buffer_pool;
pub mod dpt;
pub mod free_list;
pub mod page;

pub use buffer_pool::{BufferPool, PageHandle};
pub use dpt::DirtyPageTable;
