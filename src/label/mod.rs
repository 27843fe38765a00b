//! Label model: named string pairs identifying a series
//!
//! A [`LabelSet`] in canonical form (filtered, metric name appended,
//! sorted by name) hashes to the stable 64-bit series identity used
//! everywhere else in the engine.

mod matcher;

pub use matcher::{FastRegexMatcher, LabelMatcher, LabelMatcherSet};

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use xxhash_rust::xxh64::xxh64;

/// Reserved label carrying the metric identity.
pub const METRIC_NAME: &str = "__name__";

/// Separator joining label names to values (and metric hash to label hash)
/// in string keys.
pub const SEPARATOR: &str = "/-/";

pub(crate) fn join_separator(a: impl fmt::Display, b: impl fmt::Display) -> String {
    format!("{}{}{}", a, SEPARATOR, b)
}

/// Split a `"name/-/value"` key back into its parts.
pub(crate) fn split_separator(s: &str) -> Option<(&str, &str)> {
    s.split_once(SEPARATOR)
}

thread_local! {
    // reusable hash buffer, one per ingest worker
    static HASH_BUF: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(1024));
}

/// A single name/value pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// String key of this pair in the inverted index: `"name/-/value"`.
    pub fn marshal_name(&self) -> String {
        join_separator(&self.name, &self.value)
    }
}

/// An ordered collection of labels
///
/// Canonical form is produced by [`LabelSet::add_metric_name`] followed by
/// [`LabelSet::sort`]: empty and duplicate names dropped, metric identity
/// present, ascending name order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSet(Vec<Label>);

impl LabelSet {
    pub fn new(labels: Vec<Label>) -> Self {
        Self(labels)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn push(&mut self, label: Label) {
        self.0.push(label);
    }

    /// Drop empty names/values and deduplicate by name, keeping the first
    /// occurrence.
    fn filter(mut self) -> Self {
        let mut seen = HashSet::new();
        self.0.retain(|l| {
            let keep = !l.name.is_empty() && !l.value.is_empty() && !seen.contains(&l.name);
            seen.insert(l.name.clone());
            keep
        });
        self
    }

    /// Filter, then append the metric identity as the reserved label.
    pub fn add_metric_name(self, metric: &str) -> Self {
        let mut labels = self.filter();
        labels.0.push(Label::new(METRIC_NAME, metric));
        labels
    }

    /// Sort ascending by name.
    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| a.name.cmp(&b.name));
    }

    /// 64-bit identity hash over `name\xFFvalue\xFF…` in current order.
    pub fn hash(&self) -> u64 {
        HASH_BUF.with(|buf| {
            let mut b = buf.borrow_mut();
            b.clear();
            for l in &self.0 {
                b.extend_from_slice(l.name.as_bytes());
                b.push(0xff);
                b.extend_from_slice(l.value.as_bytes());
                b.push(0xff);
            }
            xxh64(&b, 0)
        })
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.iter().any(|l| l.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    /// Name → value map, used by series query results.
    pub fn map(&self) -> HashMap<String, String> {
        self.0
            .iter()
            .map(|l| (l.name.clone(), l.value.clone()))
            .collect()
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, l) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", l.name, l.value)?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<Label> for LabelSet {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for LabelSet {
    type Item = Label;
    type IntoIter = std::vec::IntoIter<Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Catalog of every value seen per label name within one segment
#[derive(Debug, Default)]
pub struct LabelValueSet {
    values: Mutex<HashMap<String, HashSet<String>>>,
}

impl LabelValueSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: &str, value: &str) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values
            .entry(name.to_string())
            .or_default()
            .insert(value.to_string());
    }

    pub fn get(&self, name: &str) -> Vec<String> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values
            .get(name)
            .map(|vs| vs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Values of `matcher.name` that satisfy the matcher.
    ///
    /// Non-regex matchers short-circuit to the literal value. A pattern
    /// that fails to compile degrades to a literal comparison as well.
    pub fn matched_values(&self, matcher: &LabelMatcher) -> Vec<String> {
        if !matcher.is_regex {
            return vec![matcher.value.clone()];
        }

        match FastRegexMatcher::new(&matcher.value) {
            Ok(pattern) => self
                .get(&matcher.name)
                .into_iter()
                .filter(|v| pattern.is_match(v))
                .collect(),
            Err(_) => vec![matcher.value.clone()],
        }
    }
}
