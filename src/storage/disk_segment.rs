//! Memory-mapped frozen segments
//!
//! A disk segment is read-only: a mapped `data` file plus lazily decoded
//! metadata (roaring inverted index, label-value catalog, series table).
//! Concurrent readers are safe; `close` waits for in-flight queries to
//! drain before the mapping is dropped.

use crate::config::TsdbConfig;
use crate::index::DiskIndex;
use crate::label::{split_separator, LabelMatcherSet, LabelSet, LabelValueSet};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::gorilla::GorillaBlock;
use crate::storage::metadata::{self, MetaSeries, TOC_SIZE};
use crate::storage::types::{MetricResult, Point};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

#[derive(Debug)]
struct LoadedMeta {
    index: DiskIndex,
    label_values: LabelValueSet,
    series: Vec<MetaSeries>,
}

/// Immutable mmap-backed segment
#[derive(Debug)]
pub struct DiskSegment {
    config: Arc<TsdbConfig>,
    mmap: Mmap,
    dir: PathBuf,

    min_ts: i64,
    max_ts: i64,

    loaded: OnceLock<LoadedMeta>,
    readers: AtomicUsize,
}

/// Scope guard counting an in-flight reader of the mapped file.
struct ReaderGuard<'a>(&'a AtomicUsize);

impl<'a> ReaderGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl DiskSegment {
    /// Map `dir/data` read-only. Metadata stays unparsed until
    /// [`DiskSegment::load`].
    pub fn open(
        dir: impl Into<PathBuf>,
        min_ts: i64,
        max_ts: i64,
        config: Arc<TsdbConfig>,
    ) -> StorageResult<Self> {
        let dir = dir.into();
        let file = File::open(dir.join("data"))?;

        // SAFETY: the file is opened read-only and mapped read-only; the
        // segment layout is validated against the magic trailer before any
        // slice of the mapping is interpreted.
        let mmap = unsafe { Mmap::map(&file)? };

        Ok(Self {
            config,
            mmap,
            dir,
            min_ts,
            max_ts,
            loaded: OnceLock::new(),
            readers: AtomicUsize::new(0),
        })
    }

    pub fn min_ts(&self) -> i64 {
        self.min_ts
    }

    pub fn max_ts(&self) -> i64 {
        self.max_ts
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Parse the metadata block on first use; subsequent calls are no-ops.
    pub fn load(&self) -> StorageResult<()> {
        if self.loaded.get().is_some() {
            return Ok(());
        }

        let t0 = Instant::now();
        let (data_len, meta_len) = metadata::read_toc(&self.mmap)?;

        let meta_start = TOC_SIZE + data_len as usize;
        let meta_end = meta_start + meta_len as usize;
        if meta_end > self.mmap.len() {
            return Err(StorageError::InvalidSize);
        }

        let meta = metadata::unmarshal_meta(&self.mmap[meta_start..meta_end], self.config.compression)?;

        let label_values = LabelValueSet::new();
        for record in &meta.labels {
            if let Some((name, value)) = split_separator(&record.name) {
                if !name.is_empty() && !value.is_empty() {
                    label_values.set(name, value);
                }
            }
        }

        let loaded = LoadedMeta {
            index: DiskIndex::new(&meta.labels),
            label_values,
            series: meta.series,
        };
        let _ = self.loaded.set(loaded);

        tracing::info!(
            dir = %self.dir.display(),
            elapsed = ?t0.elapsed(),
            "loaded disk segment"
        );
        Ok(())
    }

    fn meta(&self) -> StorageResult<&LoadedMeta> {
        self.load()?;
        self.loaded
            .get()
            .ok_or_else(|| StorageError::InvalidSegment("metadata not loaded".into()))
    }

    fn series_points(&self, series: &MetaSeries, start: i64, end: i64) -> StorageResult<Vec<Point>> {
        let lo = series.start_offset as usize + TOC_SIZE;
        let hi = series.end_offset as usize + TOC_SIZE;
        if hi > self.mmap.len() || lo > hi {
            return Err(StorageError::InvalidSize);
        }

        let raw = self.config.compression.decompress(&self.mmap[lo..hi])?;

        let mut points = Vec::new();
        for (ts, value) in GorillaBlock::decode(&raw)? {
            if ts > end {
                break;
            }
            if ts >= start {
                points.push(Point::new(ts, value));
            }
        }
        Ok(points)
    }

    /// Matching series with their points inside `[start, end]`.
    pub fn query_range(
        &self,
        matchers: &LabelMatcherSet,
        start: i64,
        end: i64,
    ) -> StorageResult<Vec<MetricResult>> {
        let _guard = ReaderGuard::new(&self.readers);
        let meta = self.meta()?;

        let sids = meta.index.match_sids(&meta.label_values, matchers);
        let mut results = Vec::with_capacity(sids.len());

        for sid in sids {
            let Some(series) = meta.series.get(sid as usize) else {
                continue;
            };

            results.push(MetricResult {
                labels: meta.index.labels_for(&series.label_ordinals),
                points: self.series_points(series, start, end)?,
            });
        }
        Ok(results)
    }

    /// Distinct label sets of matching series.
    pub fn query_series(&self, matchers: &LabelMatcherSet) -> StorageResult<Vec<LabelSet>> {
        let _guard = ReaderGuard::new(&self.readers);
        let meta = self.meta()?;

        Ok(meta
            .index
            .match_sids(&meta.label_values, matchers)
            .into_iter()
            .filter_map(|sid| meta.series.get(sid as usize))
            .map(|series| meta.index.labels_for(&series.label_ordinals))
            .collect())
    }

    /// Every value recorded for `label` in this segment.
    pub fn query_label_values(&self, label: &str) -> Vec<String> {
        match self.meta() {
            Ok(meta) => meta.label_values.get(label),
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "label values on unloadable segment");
                Vec::new()
            }
        }
    }

    /// Wait for in-flight readers to drain. The mapping itself is released
    /// when the segment is dropped.
    pub async fn close(&self) {
        while self.readers.load(Ordering::Acquire) > 0 {
            tokio::task::yield_now().await;
        }
    }

    /// Delete the segment's directory. Used by retention.
    pub fn cleanup(&self) -> StorageResult<()> {
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }
}
