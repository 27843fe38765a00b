//! Inverted label indexes
//!
//! Two forms share one query shape: the mutable head segment keeps
//! `label=value → set<sid>` in plain hash sets, frozen disk segments keep
//! `label=value → roaring bitmap` over positional series ids. Matcher
//! evaluation walks the matcher set right to left (the metric matcher is
//! appended last and is usually the most selective), unions posting sets
//! within a matcher and intersects across matchers, short-circuiting on
//! the first empty union.

mod disk_index;
mod mem_index;

pub use disk_index::DiskIndex;
pub use mem_index::MemoryIndex;
