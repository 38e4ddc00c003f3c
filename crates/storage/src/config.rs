//! Engine configuration: the tunables spec.md leaves
//! implementation-chosen (page size, buffer pool sizing, fanout/fill
//! bounds, WAL segmenting, checkpoint cadence).

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub page_size: usize,
    pub buffer_pool_frames: usize,
    pub min_fill_ratio: f64,
    pub max_fanout: usize,
    pub wal_segment_bytes: u64,
    pub checkpoint_interval_records: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: numstore_common::PAGE_SIZE,
            buffer_pool_frames: 256,
            min_fill_ratio: 0.5,
            max_fanout: numstore_pagestore::page::internal::MAX_FANOUT,
            wal_segment_bytes: 16 * 1024 * 1024,
            checkpoint_interval_records: 1000,
        }
    }
}

impl EngineConfig {
    pub fn load_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn min_fill_bytes(&self, leaf_capacity: usize) -> usize {
        (leaf_capacity as f64 * self.min_fill_ratio) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_scenario_page_size() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.page_size, 4096);
    }

    #[test]
    fn loads_partial_overrides_from_toml() {
        let cfg = EngineConfig::load_toml("checkpoint_interval_records = 50\n").unwrap();
        assert_eq!(cfg.checkpoint_interval_records, 50);
        assert_eq!(cfg.page_size, 4096);
    }
}
