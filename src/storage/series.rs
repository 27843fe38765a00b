//! Per-series value store
//!
//! A series couples its canonical label set with a Gorilla block guarded
//! by a mutex. Appends that run backwards in time are rejected here and
//! routed to the segment's out-of-order buffer by the caller.

use crate::label::LabelSet;
use crate::storage::gorilla::GorillaBlock;
use crate::storage::types::Point;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct StoreInner {
    // block is created lazily on the first accepted append
    block: Option<GorillaBlock>,
    max_ts: i64,
    count: u64,
}

/// An in-memory series: canonical labels plus the compressed value store
#[derive(Debug)]
pub struct MemorySeries {
    labels: LabelSet,
    store: Mutex<StoreInner>,
}

impl MemorySeries {
    pub fn new(labels: LabelSet) -> Self {
        Self {
            labels,
            store: Mutex::new(StoreInner::default()),
        }
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn count(&self) -> u64 {
        let inner = self.store.lock().unwrap_or_else(|e| e.into_inner());
        inner.count
    }

    /// Append a point. Returns the point back when it is outdated
    /// (`ts <= max_ts` of this series), leaving the block untouched.
    pub fn append(&self, point: Point) -> Option<Point> {
        let mut inner = self.store.lock().unwrap_or_else(|e| e.into_inner());

        if inner.count > 0 && point.ts <= inner.max_ts {
            return Some(point);
        }

        inner
            .block
            .get_or_insert_with(GorillaBlock::new)
            .push(point.ts, point.value);
        inner.max_ts = point.ts;
        inner.count += 1;
        None
    }

    /// Points with `start <= ts <= end`, ascending.
    pub fn points_between(&self, start: i64, end: i64) -> Vec<Point> {
        let inner = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let Some(block) = inner.block.as_ref() else {
            return Vec::new();
        };

        let mut points = Vec::new();
        for (ts, value) in block.iter() {
            if ts > end {
                break;
            }
            if ts >= start {
                points.push(Point::new(ts, value));
            }
        }
        points
    }

    /// Every point in the block, ascending.
    pub fn all_points(&self) -> Vec<Point> {
        self.points_between(i64::MIN, i64::MAX)
    }

    /// Serialized block bytes as currently encoded.
    pub fn encoded_bytes(&self) -> Vec<u8> {
        let inner = self.store.lock().unwrap_or_else(|e| e.into_inner());
        match inner.block.as_ref() {
            Some(block) => block.bytes(),
            None => GorillaBlock::new().bytes(),
        }
    }

    /// Serialized block bytes with an out-of-order buffer folded in:
    /// all points are materialized, sorted ascending by timestamp, and
    /// re-encoded into a fresh block. Used at flush time only.
    pub fn merged_bytes(&self, outdated: &BTreeMap<i64, f64>) -> Vec<u8> {
        let mut points: Vec<(i64, f64)> = self
            .all_points()
            .into_iter()
            .map(|p| (p.ts, p.value))
            .collect();
        points.extend(outdated.iter().map(|(&ts, &value)| (ts, value)));
        points.sort_by_key(|&(ts, _)| ts);

        GorillaBlock::from_sorted_points(&points).bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::Label;

    fn series() -> MemorySeries {
        let mut labels: LabelSet = [Label::new("core", "0")].into_iter().collect();
        labels = labels.add_metric_name("cpu.busy");
        labels.sort();
        MemorySeries::new(labels)
    }

    #[test]
    fn test_append_and_read() {
        let s = series();
        for i in 0..10 {
            assert!(s.append(Point::new(100 + i * 10, i as f64)).is_none());
        }

        assert_eq!(s.count(), 10);
        let points = s.points_between(120, 150);
        assert_eq!(points.len(), 4);
        assert_eq!(points[0], Point::new(120, 2.0));
        assert_eq!(points[3], Point::new(150, 5.0));
    }

    #[test]
    fn test_outdated_append_rejected() {
        let s = series();
        assert!(s.append(Point::new(100, 1.0)).is_none());

        // equal and older timestamps bounce back
        assert_eq!(s.append(Point::new(100, 2.0)), Some(Point::new(100, 2.0)));
        assert_eq!(s.append(Point::new(90, 3.0)), Some(Point::new(90, 3.0)));

        assert_eq!(s.count(), 1);
        assert_eq!(s.all_points(), vec![Point::new(100, 1.0)]);
    }

    #[test]
    fn test_merged_bytes_sorts_everything() {
        let s = series();
        s.append(Point::new(100, 1.0));
        s.append(Point::new(110, 2.0));

        let mut outdated = BTreeMap::new();
        outdated.insert(90, 0.5);
        outdated.insert(105, 1.5);

        let bytes = s.merged_bytes(&outdated);
        let decoded: Vec<(i64, f64)> = crate::storage::gorilla::GorillaBlock::decode(&bytes)
            .unwrap()
            .collect();
        assert_eq!(
            decoded,
            vec![(90, 0.5), (100, 1.0), (105, 1.5), (110, 2.0)]
        );
    }

    #[test]
    fn test_empty_series_encodes_empty_block() {
        let s = series();
        let bytes = s.encoded_bytes();
        let decoded: Vec<_> = crate::storage::gorilla::GorillaBlock::decode(&bytes)
            .unwrap()
            .collect();
        assert!(decoded.is_empty());
    }
}
