//! WAL segmenting (spec §4.3, §4.1): the log may be partitioned across
//! numbered files (`basename.0`, `basename.1`, ...). The [`SegmentManager`]
//! tracks which segment is active, rotates when it grows past
//! `max_segment_bytes`, and persists a small manifest so a reopened
//! database can find every segment again.

use std::fs;
use std::path::{Path, PathBuf};

use numstore_common::{FileId, FilePool};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{WalError, WalResult};

pub type SegmentId = u32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    /// Ordered oldest-first; the last entry is the active (unsealed) segment.
    segments: Vec<SegmentId>,
}

impl Manifest {
    fn load_or_new(path: &Path) -> WalResult<Manifest> {
        if path.exists() {
            let text = fs::read_to_string(path)?;
            serde_json::from_str(&text)
                .map_err(|e| WalError::Corrupt(format!("bad segment manifest: {e}")))
        } else {
            Ok(Manifest { segments: vec![0] })
        }
    }

    fn save(&self, path: &Path) -> WalResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| WalError::Corrupt(format!("cannot serialize manifest: {e}")))?;
        fs::write(path, text)?;
        Ok(())
    }
}

fn segment_filename(basename: &str, id: SegmentId) -> String {
    format!("{basename}.{id}")
}

/// Manages the set of WAL segment files backing one database's log.
pub struct SegmentManager {
    basename: String,
    manifest_path: PathBuf,
    manifest: Manifest,
    max_segment_bytes: u64,
    pool: FilePool,
    active_id: SegmentId,
    active_len: u64,
}

impl SegmentManager {
    pub fn open(base_dir: &Path, basename: &str, max_segment_bytes: u64) -> WalResult<Self> {
        fs::create_dir_all(base_dir)?;
        let manifest_path = base_dir.join(format!("{basename}.manifest.json"));
        let manifest = Manifest::load_or_new(&manifest_path)?;

        let mut pool = FilePool::new(base_dir, (manifest.segments.len() + 4).max(8));
        for &id in &manifest.segments {
            pool.register(FileId(id), segment_filename(basename, id));
        }

        let active_id = *manifest.segments.last().unwrap();
        let active_len = pool.file_len(FileId(active_id))?;

        manifest.save(&manifest_path)?;

        Ok(Self {
            basename: basename.to_string(),
            manifest_path,
            manifest,
            max_segment_bytes,
            pool,
            active_id,
            active_len,
        })
    }

    pub fn active_id(&self) -> SegmentId {
        self.active_id
    }

    pub fn active_len(&self) -> u64 {
        self.active_len
    }

    pub fn all_segments(&self) -> &[SegmentId] {
        &self.manifest.segments
    }

    /// Append raw bytes to the active segment, rotating first if they
    /// would not fit under `max_segment_bytes`.
    pub fn append(&mut self, bytes: &[u8]) -> WalResult<(SegmentId, u64)> {
        if self.active_len > 0 && self.active_len + bytes.len() as u64 > self.max_segment_bytes {
            self.rotate()?;
        }
        let offset = self.active_len;
        self.pool.pwrite(FileId(self.active_id), bytes, offset)?;
        self.active_len += bytes.len() as u64;
        Ok((self.active_id, offset))
    }

    pub fn sync(&mut self) -> WalResult<()> {
        self.pool.sync(FileId(self.active_id))?;
        Ok(())
    }

    fn rotate(&mut self) -> WalResult<()> {
        let new_id = self.active_id + 1;
        self.pool
            .register(FileId(new_id), segment_filename(&self.basename, new_id));
        self.manifest.segments.push(new_id);
        self.manifest.save(&self.manifest_path)?;
        debug!(from = self.active_id, to = new_id, "wal segment rotated");
        self.active_id = new_id;
        self.active_len = 0;
        Ok(())
    }

    pub fn read(&mut self, id: SegmentId, offset: u64, dest: &mut [u8]) -> WalResult<()> {
        self.pool.pread(FileId(id), dest, offset)?;
        Ok(())
    }

    pub fn segment_len(&mut self, id: SegmentId) -> WalResult<u64> {
        Ok(self.pool.file_len(FileId(id))?)
    }
}
