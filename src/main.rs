//! Minimal demonstration binary (spec §6.3): not part of the core
//! contract — embedders link against `numstore-compute` directly.
//! Opens a NumStore file under a temp-or-given directory, runs a
//! handful of array operations, and logs what happened.

use std::path::PathBuf;

use numstore_common::Stride;
use numstore_compute::NumStore;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let db_path = std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./numstore-data"));
    tracing::info!(path = %db_path.display(), "opening NumStore file");

    let store = NumStore::open(&db_path)?;

    let tx = store.begin_txn()?;
    let root = store.new_array(tx)?;
    let root = store.insert(tx, root, 0, &(0i32..10).flat_map(i32::to_le_bytes).collect::<Vec<u8>>())?;
    store.commit(tx)?;
    tracing::info!(root, size = store.size(root)?, "created and populated array");

    let mut dst = vec![0u8; 40];
    let stride = Stride { start: 0, step: 1, nelems: 10 };
    store.read(root, &mut dst, 4, &stride)?;
    let values: Vec<i32> = dst.chunks_exact(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect();
    tracing::info!(?values, "read array back");

    store.close()?;
    Ok(())
}
