//! # Tessera
//!
//! An embeddable time-series database: labeled numeric samples in, fast
//! time-range, series-match, and label-value queries out.
//!
//! ## Features
//!
//! - **Gorilla compression**: delta-of-delta timestamps + XOR values,
//!   ~1-2 bytes per point on monitoring workloads
//! - **Partitioned segments**: a mutable in-memory head frozen into
//!   memory-mapped, read-only on-disk segments
//! - **Inverted label index**: hash sets in the head, roaring bitmaps on
//!   disk, with a literal fast path for regex matchers
//! - **Concurrent ingest**: batched writes through a bounded queue and a
//!   worker pool
//! - **Time-based retention**: expired segments swept off disk
//!
//! ## Modules
//!
//! - [`storage`]: segments, value blocks, the binary segment format
//! - [`index`]: inverted label indexes
//! - [`label`]: labels, label sets, and matchers
//! - [`config`]: database options
//! - [`tsdb`]: the coordinator tying it all together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tessera::{Label, LabelMatcherSet, Point, Row, Tsdb, TsdbConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Tsdb::open(TsdbConfig::new("./data"))?;
//!
//!     let labels = [Label::new("core", "0")].into_iter().collect();
//!     db.insert_rows(vec![Row::new(
//!         "cpu.busy",
//!         labels,
//!         Point::new(1_700_000_000, 0.63),
//!     )])
//!     .await?;
//!
//!     let results = db
//!         .query_range(
//!             "cpu.busy",
//!             LabelMatcherSet::default(),
//!             1_700_000_000 - 3600,
//!             1_700_000_000,
//!         )
//!         .await?;
//!     println!("{} series", results.len());
//!
//!     db.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod index;
pub mod label;
pub mod storage;
pub mod tsdb;

// Re-export top-level types for convenience
pub use config::TsdbConfig;
pub use label::{Label, LabelMatcher, LabelMatcherSet, LabelSet};
pub use storage::{Compression, MetricResult, Point, Row, StorageError, StorageResult};
pub use tsdb::{Tsdb, TsdbStats};
