//! The mutable head segment
//!
//! All writes land here. Series live in a concurrent map keyed by sid;
//! out-of-order points are shunted to a side buffer and folded back in at
//! query and flush time. Min/max timestamps and counters are atomics so
//! ingest workers never serialize on a segment-wide lock.

use crate::config::TsdbConfig;
use crate::index::MemoryIndex;
use crate::label::{LabelMatcherSet, LabelSet, LabelValueSet, METRIC_NAME};
use crate::storage::error::StorageResult;
use crate::storage::metadata;
use crate::storage::series::MemorySeries;
use crate::storage::types::{series_id, MetricResult, Point, Row};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Mutable in-memory segment
#[derive(Debug)]
pub struct MemorySegment {
    config: Arc<TsdbConfig>,

    series: DashMap<String, Arc<MemorySeries>>,
    index: MemoryIndex,
    label_values: LabelValueSet,

    // sid → points keyed by ts, populated only for outdated appends
    outdated: Mutex<HashMap<String, BTreeMap<i64, f64>>>,

    min_ts: AtomicI64,
    max_ts: AtomicI64,
    series_count: AtomicU64,
    points_count: AtomicU64,
}

impl MemorySegment {
    pub fn new(config: Arc<TsdbConfig>) -> Self {
        Self {
            config,
            series: DashMap::new(),
            index: MemoryIndex::new(),
            label_values: LabelValueSet::new(),
            outdated: Mutex::new(HashMap::new()),
            min_ts: AtomicI64::new(i64::MAX),
            max_ts: AtomicI64::new(i64::MIN),
            series_count: AtomicU64::new(0),
            points_count: AtomicU64::new(0),
        }
    }

    /// Minimum timestamp seen, or `i64::MAX` while empty so the segment
    /// never overlaps a query range.
    pub fn min_ts(&self) -> i64 {
        self.min_ts.load(Ordering::Relaxed)
    }

    /// Maximum timestamp seen, or `i64::MIN` while empty.
    pub fn max_ts(&self) -> i64 {
        self.max_ts.load(Ordering::Relaxed)
    }

    pub fn series_count(&self) -> u64 {
        self.series_count.load(Ordering::Relaxed)
    }

    pub fn points_count(&self) -> u64 {
        self.points_count.load(Ordering::Relaxed)
    }

    /// True once the head spans more than the configured segment duration
    /// or hits the per-segment point ceiling. Always false in
    /// memory-only mode.
    pub fn frozen(&self) -> bool {
        if self.config.only_memory_mode {
            return false;
        }
        self.max_ts().saturating_sub(self.min_ts()) > self.config.segment_duration_secs
            || self.points_count() >= self.config.max_rows_per_segment
    }

    fn get_or_create_series(&self, sid: &str, labels: &LabelSet) -> Arc<MemorySeries> {
        if let Some(series) = self.series.get(sid) {
            return Arc::clone(series.value());
        }

        match self.series.entry(sid.to_string()) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(v) => {
                self.series_count.fetch_add(1, Ordering::Relaxed);
                let series = Arc::new(MemorySeries::new(labels.clone()));
                v.insert(series.clone());
                series
            }
        }
    }

    /// Append a batch of rows.
    pub fn insert_rows(&self, rows: Vec<Row>) {
        for Row {
            metric,
            labels,
            point,
        } in rows
        {
            self.label_values.set(METRIC_NAME, &metric);
            for label in labels.iter() {
                self.label_values.set(&label.name, &label.value);
            }

            let mut labels = labels.add_metric_name(&metric);
            labels.sort();
            let sid = series_id(&metric, &labels);

            let series = self.get_or_create_series(&sid, &labels);

            if let Some(outdated) = series.append(point) {
                if self.config.enable_outdated {
                    let mut buf = self.outdated.lock().unwrap_or_else(|e| e.into_inner());
                    buf.entry(sid.clone())
                        .or_default()
                        .insert(outdated.ts, outdated.value);
                } else {
                    continue; // dropped: counters and bounds stay untouched
                }
            }

            self.min_ts.fetch_min(point.ts, Ordering::Relaxed);
            self.max_ts.fetch_max(point.ts, Ordering::Relaxed);
            self.points_count.fetch_add(1, Ordering::Relaxed);
            self.index.update(&sid, &labels);
        }
    }

    /// Matching series with their points inside `[start, end]`. Points
    /// from the out-of-order buffer are appended after the block's; the
    /// coordinator's merge step sorts each series.
    pub fn query_range(
        &self,
        matchers: &LabelMatcherSet,
        start: i64,
        end: i64,
    ) -> StorageResult<Vec<MetricResult>> {
        let sids = self.index.match_sids(&self.label_values, matchers);
        let mut results = Vec::with_capacity(sids.len());

        for sid in sids {
            let Some(series) = self.series.get(&sid).map(|s| Arc::clone(s.value())) else {
                continue;
            };

            let mut points = series.points_between(start, end);

            {
                let buf = self.outdated.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(tree) = buf.get(&sid) {
                    for (&ts, &value) in tree.range(start..=end) {
                        points.push(Point::new(ts, value));
                    }
                }
            }

            results.push(MetricResult {
                labels: series.labels().clone(),
                points,
            });
        }

        Ok(results)
    }

    /// Distinct label sets of matching series.
    pub fn query_series(&self, matchers: &LabelMatcherSet) -> StorageResult<Vec<LabelSet>> {
        let sids = self.index.match_sids(&self.label_values, matchers);
        Ok(sids
            .into_iter()
            .filter_map(|sid| self.series.get(&sid).map(|s| s.value().labels().clone()))
            .collect())
    }

    /// Every value seen for `label` in this segment.
    pub fn query_label_values(&self, label: &str) -> Vec<String> {
        self.label_values.get(label)
    }

    /// Serialize to disk. A no-op for an empty segment or in memory-only
    /// mode.
    pub fn close(&self) -> StorageResult<()> {
        if self.points_count() == 0 || self.config.only_memory_mode {
            return Ok(());
        }
        metadata::write_segment(self, &self.config)
    }

    // serializer accessors

    pub(crate) fn compression(&self) -> crate::storage::compression::Compression {
        self.config.compression
    }

    pub(crate) fn series_snapshot(&self) -> Vec<(String, Arc<MemorySeries>)> {
        self.series
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub(crate) fn outdated_snapshot(&self, sid: &str) -> Option<BTreeMap<i64, f64>> {
        let buf = self.outdated.lock().unwrap_or_else(|e| e.into_inner());
        buf.get(sid).cloned()
    }

    pub(crate) fn index_entries(&self) -> Vec<(String, Vec<String>)> {
        self.index.entries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::{Label, LabelMatcher};

    fn segment() -> MemorySegment {
        MemorySegment::new(Arc::new(TsdbConfig::default()))
    }

    fn row(metric: &str, pairs: &[(&str, &str)], ts: i64, value: f64) -> Row {
        let labels: LabelSet = pairs.iter().map(|&(n, v)| Label::new(n, v)).collect();
        Row::new(metric, labels, Point::new(ts, value))
    }

    #[test]
    fn test_insert_and_query_range() {
        let seg = segment();
        let rows: Vec<Row> = (1..=10)
            .map(|k| row("cpu.busy", &[("core", "1")], k * 10, k as f64))
            .collect();
        seg.insert_rows(rows);

        assert_eq!(seg.series_count(), 1);
        assert_eq!(seg.points_count(), 10);
        assert_eq!(seg.min_ts(), 10);
        assert_eq!(seg.max_ts(), 100);

        let ms = LabelMatcherSet::default().add_metric_name("cpu.busy");
        let results = seg.query_range(&ms, 30, 60).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].points,
            vec![
                Point::new(30, 3.0),
                Point::new(40, 4.0),
                Point::new(50, 5.0),
                Point::new(60, 6.0)
            ]
        );
    }

    #[test]
    fn test_label_selectivity() {
        let seg = segment();
        let mut rows = Vec::new();
        for node in ["vm1", "vm2", "vm3"] {
            for core in 0..4 {
                rows.push(row(
                    "cpu.busy",
                    &[("node", node), ("core", &core.to_string())],
                    100,
                    1.0,
                ));
            }
        }
        seg.insert_rows(rows);
        assert_eq!(seg.series_count(), 12);

        let ms = LabelMatcherSet::new(vec![LabelMatcher::equal("core", "2")])
            .add_metric_name("cpu.busy");
        assert_eq!(seg.query_range(&ms, 0, 200).unwrap().len(), 3);

        let ms = LabelMatcherSet::new(vec![
            LabelMatcher::equal("core", "2"),
            LabelMatcher::equal("node", "vm1"),
        ])
        .add_metric_name("cpu.busy");
        assert_eq!(seg.query_range(&ms, 0, 200).unwrap().len(), 1);
    }

    #[test]
    fn test_outdated_points_buffered_and_merged() {
        let seg = segment();
        seg.insert_rows(vec![
            row("m", &[("a", "1")], 100, 1.0),
            row("m", &[("a", "1")], 90, 0.9),
            row("m", &[("a", "1")], 110, 1.1),
        ]);

        // all three counted, bounds span the outdated point too
        assert_eq!(seg.points_count(), 3);
        assert_eq!(seg.min_ts(), 90);
        assert_eq!(seg.max_ts(), 110);

        let ms = LabelMatcherSet::default().add_metric_name("m");
        let results = seg.query_range(&ms, 0, 200).unwrap();
        assert_eq!(results.len(), 1);

        let mut points = results[0].points.clone();
        points.sort_by_key(|p| p.ts);
        assert_eq!(
            points,
            vec![
                Point::new(90, 0.9),
                Point::new(100, 1.0),
                Point::new(110, 1.1)
            ]
        );
    }

    #[test]
    fn test_outdated_dropped_when_disabled() {
        let cfg = TsdbConfig::default().with_enable_outdated(false);
        let seg = MemorySegment::new(Arc::new(cfg));
        seg.insert_rows(vec![
            row("m", &[], 100, 1.0),
            row("m", &[], 90, 0.9),
        ]);

        assert_eq!(seg.points_count(), 1);
        assert_eq!(seg.min_ts(), 100);

        let ms = LabelMatcherSet::default().add_metric_name("m");
        let results = seg.query_range(&ms, 0, 200).unwrap();
        assert_eq!(results[0].points, vec![Point::new(100, 1.0)]);
    }

    #[test]
    fn test_frozen_by_span_and_cap() {
        let cfg = Arc::new(TsdbConfig::default());
        let seg = MemorySegment::new(cfg.clone());
        assert!(!seg.frozen());

        seg.insert_rows(vec![row("m", &[], 0, 0.0)]);
        assert!(!seg.frozen());

        seg.insert_rows(vec![row("m", &[], cfg.segment_duration_secs + 1, 0.0)]);
        assert!(seg.frozen());

        let capped = MemorySegment::new(Arc::new(
            TsdbConfig::default().with_max_rows_per_segment(2),
        ));
        capped.insert_rows(vec![row("m", &[], 1, 0.0), row("m", &[], 2, 0.0)]);
        assert!(capped.frozen());
    }

    #[test]
    fn test_memory_only_never_freezes() {
        let cfg = TsdbConfig::default().with_only_memory_mode(true);
        let seg = MemorySegment::new(Arc::new(cfg));
        seg.insert_rows(vec![row("m", &[], 0, 0.0), row("m", &[], 1_000_000, 0.0)]);
        assert!(!seg.frozen());
    }

    #[test]
    fn test_metric_only_labels_accepted() {
        // a label set collapsing to just __name__ after filtering is fine
        let seg = segment();
        seg.insert_rows(vec![row("m", &[("", "x"), ("y", "")], 10, 1.0)]);
        assert_eq!(seg.series_count(), 1);

        let ms = LabelMatcherSet::default().add_metric_name("m");
        let series = seg.query_series(&ms).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].len(), 1);
        assert_eq!(series[0].get(METRIC_NAME), Some("m"));
    }

    #[test]
    fn test_query_label_values() {
        let seg = segment();
        seg.insert_rows(vec![
            row("m", &[("dc", "0")], 1, 0.0),
            row("m", &[("dc", "1")], 2, 0.0),
        ]);

        let mut values = seg.query_label_values("dc");
        values.sort();
        assert_eq!(values, vec!["0", "1"]);
        assert!(seg.query_label_values("missing").is_empty());
        let metrics = seg.query_label_values(METRIC_NAME);
        assert_eq!(metrics, vec!["m"]);
    }

    #[test]
    fn test_empty_segment_sentinels() {
        let seg = segment();
        assert_eq!(seg.min_ts(), i64::MAX);
        assert_eq!(seg.max_ts(), i64::MIN);
    }
}
