//! Bit-exact on-disk framing for WAL records (spec §6.1):
//!
//! ```text
//! total_length : u32   — full framed length, including this field
//! lsn          : u64
//! prev_lsn     : u64
//! txid         : u64
//! kind         : u8
//! page_id      : u32   (pgno; PGNO_NULL sentinel when the record has none)
//! payload_length : u32
//! payload      : [u8; payload_length]
//! crc32        : u32   — over everything from `lsn` through `payload`
//! ```

use crc32fast::Hasher;
use numstore_common::{Lsn, Pgno, Txid};

use crate::record::{ClrBody, CheckpointBody, Record, RecordBody, UpdateBody};
use crate::record::{KIND_ABORT, KIND_BEGIN, KIND_CHECKPOINT, KIND_CLR, KIND_COMMIT, KIND_END, KIND_UPDATE};

/// Fixed-size prefix before `total_length` is known is not constant —
/// `total_length` itself is the first four bytes — so this is the size
/// of everything *after* `total_length` and before `payload`.
pub const FRAME_PREFIX_SIZE: usize = 4 + 8 + 8 + 8 + 1 + 4 + 4; // total_length..=payload_length
pub const FRAME_SUFFIX_SIZE: usize = 4; // crc32

#[derive(Debug)]
pub struct DecodedFrame {
    pub lsn: Lsn,
    pub prev_lsn: Lsn,
    pub txid: Txid,
    pub kind: u8,
    pub page_id: Pgno,
    pub payload: Vec<u8>,
}

/// Serialize a record's kind-specific payload to bytes.
fn encode_payload(body: &RecordBody) -> Vec<u8> {
    match body {
        RecordBody::Begin | RecordBody::Commit | RecordBody::Abort | RecordBody::End => Vec::new(),
        RecordBody::Update(UpdateBody {
            page_offset,
            before_image,
            after_image,
            ..
        }) => {
            let mut buf = Vec::with_capacity(4 + 4 + 4 + before_image.len() + after_image.len());
            buf.extend_from_slice(&page_offset.to_le_bytes());
            buf.extend_from_slice(&(before_image.len() as u32).to_le_bytes());
            buf.extend_from_slice(before_image);
            buf.extend_from_slice(&(after_image.len() as u32).to_le_bytes());
            buf.extend_from_slice(after_image);
            buf
        }
        RecordBody::Clr(ClrBody {
            compensates_lsn,
            undo_next_lsn,
            page_offset,
            restored_image,
            ..
        }) => {
            let mut buf = Vec::with_capacity(8 + 8 + 4 + 4 + restored_image.len());
            buf.extend_from_slice(&compensates_lsn.to_le_bytes());
            buf.extend_from_slice(&undo_next_lsn.to_le_bytes());
            buf.extend_from_slice(&page_offset.to_le_bytes());
            buf.extend_from_slice(&(restored_image.len() as u32).to_le_bytes());
            buf.extend_from_slice(restored_image);
            buf
        }
        RecordBody::Checkpoint(body) => {
            serde_json::to_vec(body).expect("checkpoint snapshot serialization cannot fail")
        }
    }
}

fn decode_payload(kind: u8, page_id: Pgno, payload: &[u8]) -> Result<RecordBody, String> {
    match kind {
        KIND_BEGIN => Ok(RecordBody::Begin),
        KIND_COMMIT => Ok(RecordBody::Commit),
        KIND_ABORT => Ok(RecordBody::Abort),
        KIND_END => Ok(RecordBody::End),
        KIND_UPDATE => {
            let mut p = payload;
            let page_offset = take_u32(&mut p)?;
            let before_len = take_u32(&mut p)? as usize;
            let before_image = take_bytes(&mut p, before_len)?;
            let after_len = take_u32(&mut p)? as usize;
            let after_image = take_bytes(&mut p, after_len)?;
            Ok(RecordBody::Update(UpdateBody {
                page_id,
                page_offset,
                before_image,
                after_image,
            }))
        }
        KIND_CLR => {
            let mut p = payload;
            let compensates_lsn = take_u64(&mut p)?;
            let undo_next_lsn = take_u64(&mut p)?;
            let page_offset = take_u32(&mut p)?;
            let restored_len = take_u32(&mut p)? as usize;
            let restored_image = take_bytes(&mut p, restored_len)?;
            Ok(RecordBody::Clr(ClrBody {
                page_id,
                compensates_lsn,
                undo_next_lsn,
                page_offset,
                restored_image,
            }))
        }
        KIND_CHECKPOINT => {
            let body: CheckpointBody =
                serde_json::from_slice(payload).map_err(|e| format!("bad checkpoint payload: {e}"))?;
            Ok(RecordBody::Checkpoint(body))
        }
        other => Err(format!("unknown record kind tag {other}")),
    }
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, String> {
    if buf.len() < 4 {
        return Err("truncated u32 field".into());
    }
    let (head, tail) = buf.split_at(4);
    *buf = tail;
    Ok(u32::from_le_bytes(head.try_into().unwrap()))
}

fn take_u64(buf: &mut &[u8]) -> Result<u64, String> {
    if buf.len() < 8 {
        return Err("truncated u64 field".into());
    }
    let (head, tail) = buf.split_at(8);
    *buf = tail;
    Ok(u64::from_le_bytes(head.try_into().unwrap()))
}

fn take_bytes(buf: &mut &[u8], n: usize) -> Result<Vec<u8>, String> {
    if buf.len() < n {
        return Err("truncated byte field".into());
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head.to_vec())
}

/// Encode a full record (minus `total_length`, which the writer prepends
/// once it knows the final length) into a byte buffer ready to append.
pub fn encode_frame(record: &Record) -> Vec<u8> {
    let payload = encode_payload(&record.body);
    let total_length = (FRAME_PREFIX_SIZE + payload.len() + FRAME_SUFFIX_SIZE) as u32;

    let mut buf = Vec::with_capacity(total_length as usize);
    buf.extend_from_slice(&total_length.to_le_bytes());
    buf.extend_from_slice(&record.lsn.to_le_bytes());
    buf.extend_from_slice(&record.prev_lsn.to_le_bytes());
    buf.extend_from_slice(&record.txid.to_le_bytes());
    buf.push(record.kind_tag());
    buf.extend_from_slice(&record.page_id().to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);

    let crc = compute_crc(&buf[4..]); // everything from `lsn` through `payload`
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn compute_crc(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Decode a `total_length`-prefixed frame already read fully into memory.
/// `frame` must span exactly one record, `total_length` bytes long.
pub fn decode_frame(frame: &[u8]) -> Result<Record, String> {
    if frame.len() < FRAME_PREFIX_SIZE + FRAME_SUFFIX_SIZE {
        return Err("frame too short".into());
    }
    let body_and_crc = &frame[4..]; // skip total_length
    let crc_offset = body_and_crc.len() - FRAME_SUFFIX_SIZE;
    let expected_crc = u32::from_le_bytes(body_and_crc[crc_offset..].try_into().unwrap());
    let actual_crc = compute_crc(&body_and_crc[..crc_offset]);
    if expected_crc != actual_crc {
        return Err(format!(
            "crc mismatch: expected {expected_crc:#x}, computed {actual_crc:#x}"
        ));
    }

    let mut p = &body_and_crc[..crc_offset];
    let lsn = take_u64(&mut p)?;
    let prev_lsn = take_u64(&mut p)?;
    let txid = take_u64(&mut p)?;
    if p.is_empty() {
        return Err("truncated kind byte".into());
    }
    let kind = p[0];
    p = &p[1..];
    let page_id = take_u32(&mut p)?;
    let payload_len = take_u32(&mut p)? as usize;
    let payload = take_bytes(&mut p, payload_len)?;

    let body = decode_payload(kind, page_id, &payload)?;
    Ok(Record {
        lsn,
        prev_lsn,
        txid,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_roundtrips() {
        let record = Record {
            lsn: 7,
            prev_lsn: 3,
            txid: 1,
            body: RecordBody::Update(UpdateBody {
                page_id: 42,
                page_offset: 10,
                before_image: vec![0, 0, 0],
                after_image: vec![1, 2, 3],
            }),
        };
        let bytes = encode_frame(&record);
        let decoded = decode_frame(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn begin_commit_roundtrip() {
        for body in [RecordBody::Begin, RecordBody::Commit, RecordBody::Abort, RecordBody::End] {
            let record = Record {
                lsn: 1,
                prev_lsn: 0,
                txid: 9,
                body,
            };
            let bytes = encode_frame(&record);
            assert_eq!(decode_frame(&bytes).unwrap(), record);
        }
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let record = Record {
            lsn: 1,
            prev_lsn: 0,
            txid: 1,
            body: RecordBody::Begin,
        };
        let mut bytes = encode_frame(&record);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(decode_frame(&bytes).is_err());
    }
}
