//! Spec §8.1 property 3: an in-memory reference model (a flat
//! `Vec<u8>`) must agree byte-for-byte with the RPT after any sequence
//! of insert/write/remove. Driven by `quickcheck` over randomly
//! generated operation sequences, each clamped against the reference's
//! current length so every op is always in-bounds.

use numstore_common::Stride;
use numstore_storage::{EngineConfig, StorageEngine};
use quickcheck::{quickcheck, Arbitrary, Gen};
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Insert { offset_frac: u8, bytes: Vec<u8> },
    Write { offset_frac: u8, bytes: Vec<u8> },
    Remove { offset_frac: u8, len: u8 },
}

fn small_bytes(g: &mut Gen) -> Vec<u8> {
    let len = 1 + (u8::arbitrary(g) as usize % 16);
    (0..len).map(|_| u8::arbitrary(g)).collect()
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Self {
        match u8::arbitrary(g) % 3 {
            0 => Op::Insert { offset_frac: u8::arbitrary(g), bytes: small_bytes(g) },
            1 => Op::Write { offset_frac: u8::arbitrary(g), bytes: small_bytes(g) },
            _ => Op::Remove { offset_frac: u8::arbitrary(g), len: 1 + (u8::arbitrary(g) % 8) },
        }
    }
}

fn clamp_offset(frac: u8, len: usize) -> usize {
    if len == 0 {
        0
    } else {
        (frac as usize * len) / 256
    }
}

fn matches_reference(ops: Vec<Op>) -> bool {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(dir.path(), EngineConfig::default()).unwrap();
    let tx = engine.begin_txn().unwrap();
    let mut root = engine.array_new(tx).unwrap();
    engine.commit(tx).unwrap();
    let mut reference: Vec<u8> = Vec::new();

    for op in ops.iter().take(40) {
        match op {
            Op::Insert { offset_frac, bytes } => {
                let offset = clamp_offset(*offset_frac, reference.len());
                let tx = engine.begin_txn().unwrap();
                root = engine.array_insert(tx, root, offset as u64, bytes).unwrap();
                engine.commit(tx).unwrap();
                reference.splice(offset..offset, bytes.iter().copied());
            }
            Op::Write { offset_frac, bytes } => {
                if reference.is_empty() {
                    continue;
                }
                let offset = clamp_offset(*offset_frac, reference.len() - 1);
                let n = bytes.len().min(reference.len() - offset);
                let stride = Stride { start: offset as u64, step: 1, nelems: n as u64 };
                let tx = engine.begin_txn().unwrap();
                let written = engine.array_write(tx, root, &bytes[..n], 1, &stride).unwrap();
                engine.commit(tx).unwrap();
                assert_eq!(written, n as u64);
                reference[offset..offset + n].copy_from_slice(&bytes[..n]);
            }
            Op::Remove { offset_frac, len } => {
                if reference.is_empty() {
                    continue;
                }
                let offset = clamp_offset(*offset_frac, reference.len() - 1);
                let n = (*len as usize).min(reference.len() - offset);
                let stride = Stride { start: offset as u64, step: 1, nelems: n as u64 };
                let tx = engine.begin_txn().unwrap();
                let (new_root, removed) = engine.array_remove(tx, root, 1, &stride).unwrap();
                engine.commit(tx).unwrap();
                root = new_root;
                let expected: Vec<u8> = reference[offset..offset + n].to_vec();
                assert_eq!(removed, expected);
                reference.drain(offset..offset + n);
            }
        }

        let mut dst = vec![0u8; reference.len()];
        if !reference.is_empty() {
            let stride = Stride { start: 0, step: 1, nelems: reference.len() as u64 };
            let tx = engine.begin_txn().unwrap();
            engine.array_read(tx, root, &mut dst, 1, &stride).unwrap();
            engine.commit(tx).unwrap();
        }
        if dst != reference {
            return false;
        }
        if engine.validate_array(root).is_err() {
            return false;
        }
    }
    true
}

#[test]
fn rpt_matches_vec_reference_model() {
    quickcheck(matches_reference as fn(Vec<Op>) -> bool);
}
