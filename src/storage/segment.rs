//! Segment variant and the time-ordered segment list
//!
//! The mutable head and frozen disk segments share one operation set
//! behind a tagged variant. The coordinator only ever writes through the
//! head it got from the freeze-checked accessor, so an insert into a disk
//! segment is a programming error, not an I/O error.

use crate::label::{LabelMatcherSet, LabelSet};
use crate::storage::disk_segment::DiskSegment;
use crate::storage::error::StorageResult;
use crate::storage::memory_segment::MemorySegment;
use crate::storage::types::{MetricResult, Row};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A time-bounded slice of the database: either the mutable in-memory
/// head or a frozen on-disk segment
#[derive(Debug, Clone)]
pub enum Segment {
    Memory(Arc<MemorySegment>),
    Disk(Arc<DiskSegment>),
}

impl Segment {
    pub fn min_ts(&self) -> i64 {
        match self {
            Segment::Memory(s) => s.min_ts(),
            Segment::Disk(s) => s.min_ts(),
        }
    }

    pub fn max_ts(&self) -> i64 {
        match self {
            Segment::Memory(s) => s.max_ts(),
            Segment::Disk(s) => s.max_ts(),
        }
    }

    pub fn frozen(&self) -> bool {
        match self {
            Segment::Memory(s) => s.frozen(),
            Segment::Disk(_) => true,
        }
    }

    /// Variant tag, for logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Segment::Memory(_) => "memory",
            Segment::Disk(_) => "disk",
        }
    }

    /// Parse on-disk metadata if needed; a no-op for memory segments.
    pub fn load(&self) -> StorageResult<()> {
        match self {
            Segment::Memory(_) => Ok(()),
            Segment::Disk(s) => s.load(),
        }
    }

    /// Append rows. Only the memory variant is writable.
    pub fn insert_rows(&self, rows: Vec<Row>) {
        match self {
            Segment::Memory(s) => s.insert_rows(rows),
            Segment::Disk(_) => unreachable!("BUG: insert into a read-only disk segment"),
        }
    }

    pub fn query_range(
        &self,
        matchers: &LabelMatcherSet,
        start: i64,
        end: i64,
    ) -> StorageResult<Vec<MetricResult>> {
        match self {
            Segment::Memory(s) => s.query_range(matchers, start, end),
            Segment::Disk(s) => s.query_range(matchers, start, end),
        }
    }

    pub fn query_series(&self, matchers: &LabelMatcherSet) -> StorageResult<Vec<LabelSet>> {
        match self {
            Segment::Memory(s) => s.query_series(matchers),
            Segment::Disk(s) => s.query_series(matchers),
        }
    }

    pub fn query_label_values(&self, label: &str) -> Vec<String> {
        match self {
            Segment::Memory(s) => s.query_label_values(label),
            Segment::Disk(s) => s.query_label_values(label),
        }
    }

    /// Memory: serialize to disk if non-empty. Disk: wait for readers.
    pub async fn close(&self) -> StorageResult<()> {
        match self {
            Segment::Memory(s) => s.close(),
            Segment::Disk(s) => {
                s.close().await;
                Ok(())
            }
        }
    }

    /// Remove on-disk artifacts. A no-op for memory segments.
    pub fn cleanup(&self) -> StorageResult<()> {
        match self {
            Segment::Memory(_) => Ok(()),
            Segment::Disk(s) => s.cleanup(),
        }
    }
}

/// Frozen segments ordered by min timestamp, plus the single mutable head
#[derive(Debug)]
pub struct SegmentList {
    head: Arc<MemorySegment>,
    list: BTreeMap<i64, Segment>,
}

impl SegmentList {
    pub fn new(head: Arc<MemorySegment>) -> Self {
        Self {
            head,
            list: BTreeMap::new(),
        }
    }

    pub fn head(&self) -> Arc<MemorySegment> {
        self.head.clone()
    }

    pub fn set_head(&mut self, head: Arc<MemorySegment>) {
        self.head = head;
    }

    pub fn add(&mut self, segment: Segment) {
        self.list.insert(segment.min_ts(), segment);
    }

    pub fn remove(&mut self, min_ts: i64) -> Option<Segment> {
        self.list.remove(&min_ts)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// All frozen segments, ascending by min timestamp.
    pub fn frozen_segments(&self) -> Vec<Segment> {
        self.list.values().cloned().collect()
    }

    fn overlaps(segment: &Segment, start: i64, end: i64) -> bool {
        let (min, max) = (segment.min_ts(), segment.max_ts());
        if min > max {
            // empty segment sentinels never overlap anything
            return false;
        }

        (min <= start && max >= start) // straddles the range start
            || (min >= start && max <= end) // inside the range
            || (min <= end && max >= end) // straddles the range end
    }

    /// Every segment overlapping `[start, end]`, frozen ones first in time
    /// order, the head last so merge logic sees the freshest data last.
    pub fn get(&self, start: i64, end: i64) -> Vec<Segment> {
        let mut segments: Vec<Segment> = self
            .list
            .values()
            .filter(|s| Self::overlaps(s, start, end))
            .cloned()
            .collect();

        let head = Segment::Memory(self.head.clone());
        if Self::overlaps(&head, start, end) {
            segments.push(head);
        }

        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TsdbConfig;
    use crate::label::Label;
    use crate::storage::types::{Point, Row};

    fn mem_segment(ts: &[i64]) -> Arc<MemorySegment> {
        let seg = Arc::new(MemorySegment::new(Arc::new(TsdbConfig::default())));
        let rows = ts
            .iter()
            .map(|&t| {
                Row::new(
                    "m",
                    [Label::new("a", "1")].into_iter().collect(),
                    Point::new(t, 1.0),
                )
            })
            .collect();
        seg.insert_rows(rows);
        seg
    }

    fn list_with(bounds: &[(i64, i64)]) -> SegmentList {
        let mut list = SegmentList::new(Arc::new(MemorySegment::new(Arc::new(
            TsdbConfig::default(),
        ))));
        for &(lo, hi) in bounds {
            list.add(Segment::Memory(mem_segment(&[lo, hi])));
        }
        list
    }

    #[test]
    fn test_overlap_selection() {
        let list = list_with(&[(0, 100), (100, 200), (300, 400)]);

        // strictly inside one segment
        assert_eq!(list.get(10, 20).len(), 1);
        // straddling two segments
        assert_eq!(list.get(90, 110).len(), 2);
        // covering everything
        assert_eq!(list.get(0, 400).len(), 3);
        // gap between segments
        assert_eq!(list.get(210, 290).len(), 0);
        // boundary timestamps are inclusive
        assert_eq!(list.get(200, 200).len(), 1);
        assert_eq!(list.get(400, 500).len(), 1);
    }

    #[test]
    fn test_empty_head_never_selected() {
        let list = list_with(&[]);
        assert!(list.get(i64::MIN, i64::MAX).is_empty());
    }

    #[test]
    fn test_head_comes_last() {
        let mut list = list_with(&[(0, 100)]);
        list.set_head(mem_segment(&[50, 60]));

        let got = list.get(0, 100);
        assert_eq!(got.len(), 2);
        assert!(matches!(&got[1], Segment::Memory(s) if s.min_ts() == 50));
        assert_eq!(got[0].kind(), "memory");
    }

    #[test]
    fn test_remove_by_min_ts() {
        let mut list = list_with(&[(0, 100), (200, 300)]);
        assert_eq!(list.len(), 2);

        assert!(list.remove(0).is_some());
        assert_eq!(list.len(), 1);
        assert!(list.remove(999).is_none());
    }

    #[test]
    fn test_frozen_segments_time_ordered() {
        let list = list_with(&[(200, 300), (0, 100)]);
        let frozen = list.frozen_segments();
        assert_eq!(frozen[0].min_ts(), 0);
        assert_eq!(frozen[1].min_ts(), 200);
    }
}
