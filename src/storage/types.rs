//! Core row and result types for the storage engine

use crate::label::{join_separator, LabelSet};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

/// A single observation: unix-second timestamp and value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub ts: i64,
    pub value: f64,
}

impl Point {
    pub fn new(ts: i64, value: f64) -> Self {
        Self { ts, value }
    }
}

/// One row of input: a metric name, its labels, and one point
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub metric: String,
    pub labels: LabelSet,
    pub point: Point,
}

impl Row {
    pub fn new(metric: impl Into<String>, labels: LabelSet, point: Point) -> Self {
        Self {
            metric: metric.into(),
            labels,
            point,
        }
    }
}

/// Stable series identifier: `"{xxh64(metric)}/-/{labelset hash}"`.
///
/// `labels` must already be in canonical form (metric name appended,
/// sorted) so the identity survives restarts and label permutations.
pub fn series_id(metric: &str, labels: &LabelSet) -> String {
    join_separator(xxh64(metric.as_bytes(), 0), labels.hash())
}

/// One series' worth of query output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricResult {
    pub labels: LabelSet,
    pub points: Vec<Point>,
}
