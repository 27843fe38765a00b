//! Database coordinator
//!
//! Owns the segment list, the bounded ingest queue and its worker pool,
//! the freeze/flush lifecycle of the head segment, query fan-out and
//! merging, and the retention sweeper.

use crate::config::TsdbConfig;
use crate::label::{LabelMatcherSet, LabelSet};
use crate::storage::disk_segment::DiskSegment;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::memory_segment::MemorySegment;
use crate::storage::metadata::{self, SegmentDesc};
use crate::storage::segment::{Segment, SegmentList};
use crate::storage::types::{MetricResult, Row};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

const INGEST_QUEUE_SIZE: usize = 128;
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Point-in-time counters, mostly useful for tests and monitoring hooks
#[derive(Debug, Clone, Copy)]
pub struct TsdbStats {
    pub frozen_segments: usize,
    pub head_series: u64,
    pub head_points: u64,
}

struct TsdbInner {
    config: Arc<TsdbConfig>,
    segs: RwLock<SegmentList>,
    queue: StdMutex<Option<mpsc::Sender<Vec<Row>>>>,
    shutdown: AtomicBool,
    stop_sweeper: Notify,
    flush_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// An embeddable time-series database
///
/// Cheap to clone; all clones share one engine. Writes are queued to a
/// worker pool, so a successful [`Tsdb::insert_rows`] means accepted, not
/// yet queryable: the batch becomes visible once a worker drains it.
#[derive(Clone)]
pub struct Tsdb {
    inner: Arc<TsdbInner>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Tsdb {
    /// Open a database: bootstrap segments from the data path, then start
    /// the ingest workers and the retention sweeper.
    pub fn open(config: TsdbConfig) -> StorageResult<Self> {
        let config = Arc::new(config);

        let mut list = SegmentList::new(Arc::new(MemorySegment::new(config.clone())));
        if !config.only_memory_mode {
            std::fs::create_dir_all(&config.data_path)?;
            for segment in load_segments(&config) {
                list.add(segment);
            }
        }

        let (tx, rx) = mpsc::channel::<Vec<Row>>(INGEST_QUEUE_SIZE);

        let inner = Arc::new(TsdbInner {
            config: config.clone(),
            segs: RwLock::new(list),
            queue: StdMutex::new(Some(tx)),
            shutdown: AtomicBool::new(false),
            stop_sweeper: Notify::new(),
            flush_tasks: Mutex::new(Vec::new()),
        });

        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(worker_count + 1);
        for _ in 0..worker_count {
            workers.push(tokio::spawn(ingest_rows(inner.clone(), rx.clone())));
        }

        if !config.only_memory_mode {
            tokio::spawn(remove_expired(inner.clone()));
        }

        Ok(Self {
            inner,
            workers: Arc::new(Mutex::new(workers)),
        })
    }

    /// Enqueue a batch of rows, waiting at most the configured write
    /// timeout for queue space.
    pub async fn insert_rows(&self, rows: Vec<Row>) -> StorageResult<()> {
        let tx = {
            let queue = self
                .inner
                .queue
                .lock()
                .map_err(|e| StorageError::Lock(e.to_string()))?;
            queue.as_ref().ok_or(StorageError::Closed)?.clone()
        };

        let timeout = self.inner.config.write_timeout();
        match tx.send_timeout(rows, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(StorageError::WriteOverloaded(timeout)),
            Err(SendTimeoutError::Closed(_)) => Err(StorageError::Closed),
        }
    }

    /// Points of every series matching `metric` + `matchers` within
    /// `[start, end]`, merged across segments, each series ascending by
    /// timestamp.
    pub async fn query_range(
        &self,
        metric: &str,
        matchers: LabelMatcherSet,
        start: i64,
        end: i64,
    ) -> StorageResult<Vec<MetricResult>> {
        let matchers = matchers.add_metric_name(metric);

        let segments = self.inner.segs.read().await.get(start, end);
        let mut partial = Vec::new();
        for segment in segments {
            segment.load()?;
            partial.extend(segment.query_range(&matchers, start, end)?);
        }

        Ok(merge_query_range_result(partial))
    }

    /// Distinct label sets of series matching `matchers` within
    /// `[start, end]`.
    pub async fn query_series(
        &self,
        matchers: LabelMatcherSet,
        start: i64,
        end: i64,
    ) -> StorageResult<Vec<HashMap<String, String>>> {
        let segments = self.inner.segs.read().await.get(start, end);
        let mut partial = Vec::new();
        for segment in segments {
            segment.load()?;
            partial.extend(segment.query_series(&matchers)?);
        }

        Ok(merge_query_series_result(partial))
    }

    /// Sorted union of every value of `label` across segments overlapping
    /// `[start, end]`.
    pub async fn query_label_values(
        &self,
        label: &str,
        start: i64,
        end: i64,
    ) -> StorageResult<Vec<String>> {
        let segments = self.inner.segs.read().await.get(start, end);

        let mut values = std::collections::BTreeSet::new();
        for segment in segments {
            segment.load()?;
            values.extend(segment.query_label_values(label));
        }

        Ok(values.into_iter().collect())
    }

    pub async fn stats(&self) -> TsdbStats {
        let segs = self.inner.segs.read().await;
        let head = segs.head();
        TsdbStats {
            frozen_segments: segs.len(),
            head_series: head.series_count(),
            head_points: head.points_count(),
        }
    }

    /// Drain in-flight writes and flushes, stop background tasks, close
    /// every segment (serializing the head if it holds data), and release
    /// the mappings.
    pub async fn close(&self) -> StorageResult<()> {
        {
            let mut queue = self
                .inner
                .queue
                .lock()
                .map_err(|e| StorageError::Lock(e.to_string()))?;
            if queue.take().is_none() {
                return Err(StorageError::Closed);
            }
        }
        self.inner.shutdown.store(true, Ordering::SeqCst);

        // workers exit once the queue is drained and closed
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            let _ = handle.await;
        }

        // wait for every in-flight segment flush
        let flushes: Vec<_> = self.inner.flush_tasks.lock().await.drain(..).collect();
        for handle in flushes {
            let _ = handle.await;
        }

        self.inner.stop_sweeper.notify_waiters();

        let (frozen, head) = {
            let segs = self.inner.segs.read().await;
            (segs.frozen_segments(), segs.head())
        };
        for segment in frozen {
            if let Err(e) = segment.close().await {
                tracing::warn!(error = %e, "failed to close segment");
            }
        }

        head.close()
    }
}

/// Freeze-checked accessor for the writable head.
///
/// Under the segment-list write lock: if the head is frozen, park it in
/// the list (still memory-backed), install a fresh head, and spawn the
/// flush task that will swap the parked snapshot for its disk form. The
/// brief window with both forms visible is resolved at query time by the
/// per-series timestamp dedup in the merge step.
async fn head_partition(inner: &Arc<TsdbInner>) -> Arc<MemorySegment> {
    let mut segs = inner.segs.write().await;

    if segs.head().frozen() {
        let frozen = segs.head();
        segs.add(Segment::Memory(frozen.clone()));
        segs.set_head(Arc::new(MemorySegment::new(inner.config.clone())));

        let task = tokio::spawn(flush_segment(inner.clone(), frozen));
        inner.flush_tasks.lock().await.push(task);
    }

    segs.head()
}

/// Ingest worker: drain row batches into the current head.
async fn ingest_rows(inner: Arc<TsdbInner>, rx: Arc<Mutex<mpsc::Receiver<Vec<Row>>>>) {
    loop {
        let batch = rx.lock().await.recv().await;
        match batch {
            Some(rows) => {
                let head = head_partition(&inner).await;
                head.insert_rows(rows);
            }
            None => return,
        }
    }
}

/// Serialize a frozen head, reopen it memory-mapped, and swap the list
/// entry from the memory snapshot to the disk segment.
async fn flush_segment(inner: Arc<TsdbInner>, frozen: Arc<MemorySegment>) {
    let t0 = Instant::now();
    let (min_ts, max_ts) = (frozen.min_ts(), frozen.max_ts());

    if let Err(e) = metadata::write_segment(&frozen, &inner.config) {
        tracing::error!(error = %e, "failed to flush segment to disk");
        return;
    }

    let dir = inner.config.segment_dir(min_ts, max_ts);
    match DiskSegment::open(&dir, min_ts, max_ts, inner.config.clone()) {
        Ok(disk) => {
            let mut segs = inner.segs.write().await;
            segs.remove(min_ts);
            segs.add(Segment::Disk(Arc::new(disk)));
            tracing::info!(dir = %dir.display(), elapsed = ?t0.elapsed(), "wrote segment");
        }
        Err(e) => {
            tracing::error!(dir = %dir.display(), error = %e, "failed to mmap segment");
        }
    }
}

/// Periodic retention sweep: drop frozen disk segments whose newest point
/// is older than the retention window.
async fn remove_expired(inner: Arc<TsdbInner>) {
    let mut tick = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
    tick.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = inner.stop_sweeper.notified() => return,
        }
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let now = Utc::now().timestamp();
        let expired: Vec<Segment> = inner
            .segs
            .read()
            .await
            .frozen_segments()
            .into_iter()
            .filter(|s| matches!(s, Segment::Disk(_)))
            .filter(|s| now - s.max_ts() > inner.config.retention_secs)
            .collect();

        if expired.is_empty() {
            continue;
        }

        {
            let mut segs = inner.segs.write().await;
            for segment in &expired {
                segs.remove(segment.min_ts());
            }
        }

        for segment in expired {
            tracing::info!(
                min_ts = segment.min_ts(),
                max_ts = segment.max_ts(),
                "removing expired segment"
            );
            if let Err(e) = segment.close().await {
                tracing::warn!(error = %e, "failed to close expired segment");
                continue;
            }
            if let Err(e) = segment.cleanup() {
                tracing::warn!(error = %e, "failed to clean up expired segment");
            }
        }
    }
}

/// Register a lazily-loaded disk segment for every `seg-*` directory
/// under the data path. Unreadable segments are skipped with a warning so
/// the database starts with whatever loads cleanly.
fn load_segments(config: &Arc<TsdbConfig>) -> Vec<Segment> {
    let mut segments = Vec::new();

    let entries = match std::fs::read_dir(&config.data_path) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %config.data_path.display(), error = %e, "cannot read data path");
            return segments;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !path.is_dir() || !name.starts_with("seg-") {
            continue;
        }

        let desc = std::fs::read(path.join("meta.json"))
            .map_err(StorageError::from)
            .and_then(|bytes| serde_json::from_slice::<SegmentDesc>(&bytes).map_err(Into::into));
        let desc = match desc {
            Ok(desc) => desc,
            Err(e) => {
                tracing::warn!(dir = %path.display(), error = %e, "skipping segment: bad descriptor");
                continue;
            }
        };

        match DiskSegment::open(&path, desc.min_ts, desc.max_ts, config.clone()) {
            Ok(segment) => segments.push(Segment::Disk(Arc::new(segment))),
            Err(e) => {
                tracing::warn!(dir = %path.display(), error = %e, "skipping segment: mmap failed");
            }
        }
    }

    tracing::info!(count = segments.len(), "loaded segments");
    segments
}

/// Group per-segment results by label-set hash, concatenate the point
/// lists, sort each group by timestamp, and drop duplicate timestamps
/// (the same interval can briefly be visible in memory and on disk).
fn merge_query_range_result(partial: Vec<MetricResult>) -> Vec<MetricResult> {
    let mut groups: HashMap<u64, MetricResult> = HashMap::new();
    for result in partial {
        match groups.entry(result.labels.hash()) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                e.get_mut().points.extend(result.points);
            }
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(result);
            }
        }
    }

    let mut merged: Vec<MetricResult> = groups.into_values().collect();
    for result in &mut merged {
        // stable sort keeps concatenation order within a timestamp; the
        // head contributes last, so keep the last duplicate (freshest)
        result.points.sort_by_key(|p| p.ts);
        result.points.reverse();
        result.points.dedup_by_key(|p| p.ts);
        result.points.reverse();
    }
    merged
}

fn merge_query_series_result(partial: Vec<LabelSet>) -> Vec<HashMap<String, String>> {
    let mut distinct: HashMap<u64, LabelSet> = HashMap::new();
    for labels in partial {
        distinct.insert(labels.hash(), labels);
    }
    distinct.into_values().map(|l| l.map()).collect()
}
