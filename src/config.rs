//! Database configuration
//!
//! All options are programmatic; every component receives the shared
//! config at construction time instead of reaching for process globals.
//! Deserializable so an embedding application can lift the options out of
//! its own config file.

use crate::storage::compression::Compression;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`crate::Tsdb`] instance
#[derive(Debug, Clone, Deserialize)]
pub struct TsdbConfig {
    /// Root directory for segment storage: `seg-<minTs>-<maxTs>/{data, meta.json}`
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,

    /// Freeze threshold on the head segment's time span, in seconds
    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: i64,

    /// Age of a segment's max timestamp beyond which it is deleted, in seconds
    #[serde(default = "default_retention")]
    pub retention_secs: i64,

    /// Upper bound on how long `insert_rows` may wait for queue space
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Keep everything in memory: disables flush, bootstrap and retention
    #[serde(default)]
    pub only_memory_mode: bool,

    /// Buffer out-of-order points instead of dropping them
    #[serde(default = "default_enable_outdated")]
    pub enable_outdated: bool,

    /// Hard ceiling on a single segment's point count
    #[serde(default = "default_max_rows_per_segment")]
    pub max_rows_per_segment: u64,

    /// Byte compressor applied to series streams and the metadata block
    #[serde(default)]
    pub compression: Compression,
}

fn default_data_path() -> PathBuf {
    PathBuf::from("tessera_data")
}

fn default_segment_duration() -> i64 {
    2 * 60 * 60 // 2 hours
}

fn default_retention() -> i64 {
    7 * 24 * 60 * 60 // 7 days
}

fn default_write_timeout_ms() -> u64 {
    30_000
}

fn default_enable_outdated() -> bool {
    true
}

fn default_max_rows_per_segment() -> u64 {
    20_000_000
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            segment_duration_secs: default_segment_duration(),
            retention_secs: default_retention(),
            write_timeout_ms: default_write_timeout_ms(),
            only_memory_mode: false,
            enable_outdated: default_enable_outdated(),
            max_rows_per_segment: default_max_rows_per_segment(),
            compression: Compression::default(),
        }
    }
}

impl TsdbConfig {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            ..Default::default()
        }
    }

    pub fn with_segment_duration(mut self, d: Duration) -> Self {
        self.segment_duration_secs = d.as_secs() as i64;
        self
    }

    pub fn with_retention(mut self, d: Duration) -> Self {
        self.retention_secs = d.as_secs() as i64;
        self
    }

    pub fn with_write_timeout(mut self, d: Duration) -> Self {
        self.write_timeout_ms = d.as_millis() as u64;
        self
    }

    pub fn with_only_memory_mode(mut self, on: bool) -> Self {
        self.only_memory_mode = on;
        self
    }

    pub fn with_enable_outdated(mut self, on: bool) -> Self {
        self.enable_outdated = on;
        self
    }

    pub fn with_max_rows_per_segment(mut self, n: u64) -> Self {
        self.max_rows_per_segment = n;
        self
    }

    pub fn with_compression(mut self, c: Compression) -> Self {
        self.compression = c;
        self
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Directory of the segment covering `[min_ts, max_ts]`.
    pub fn segment_dir(&self, min_ts: i64, max_ts: i64) -> PathBuf {
        self.data_path.join(format!("seg-{}-{}", min_ts, max_ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TsdbConfig::default();
        assert_eq!(cfg.segment_duration_secs, 7200);
        assert_eq!(cfg.retention_secs, 604_800);
        assert_eq!(cfg.write_timeout(), Duration::from_secs(30));
        assert!(cfg.enable_outdated);
        assert!(!cfg.only_memory_mode);
        assert_eq!(cfg.compression, Compression::Lz4);
    }

    #[test]
    fn test_builders() {
        let cfg = TsdbConfig::new("/tmp/x")
            .with_segment_duration(Duration::from_secs(60))
            .with_retention(Duration::from_secs(3600))
            .with_only_memory_mode(true)
            .with_compression(Compression::Zstd);

        assert_eq!(cfg.data_path, PathBuf::from("/tmp/x"));
        assert_eq!(cfg.segment_duration_secs, 60);
        assert_eq!(cfg.retention_secs, 3600);
        assert!(cfg.only_memory_mode);
        assert_eq!(cfg.compression, Compression::Zstd);
    }

    #[test]
    fn test_segment_dir_naming() {
        let cfg = TsdbConfig::new("/data");
        assert_eq!(
            cfg.segment_dir(100, 200),
            PathBuf::from("/data/seg-100-200")
        );
    }

    #[test]
    fn test_deserialize_partial() {
        let cfg: TsdbConfig =
            serde_json::from_str(r#"{"data_path": "/d", "compression": "zstd"}"#).unwrap();
        assert_eq!(cfg.data_path, PathBuf::from("/d"));
        assert_eq!(cfg.compression, Compression::Zstd);
        assert_eq!(cfg.segment_duration_secs, 7200);
    }
}
