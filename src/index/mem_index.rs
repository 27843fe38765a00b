//! In-memory inverted index for the mutable head segment

use crate::label::{join_separator, LabelMatcherSet, LabelSet, LabelValueSet};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// `"name/-/value" → set<sid>` posting map
#[derive(Debug, Default)]
pub struct MemoryIndex {
    idx: Mutex<HashMap<String, HashSet<String>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `sid` under every label of a (canonical) label set.
    pub fn update(&self, sid: &str, labels: &LabelSet) {
        let mut idx = self.idx.lock().unwrap_or_else(|e| e.into_inner());
        for label in labels.iter() {
            idx.entry(label.marshal_name())
                .or_default()
                .insert(sid.to_string());
        }
    }

    /// Series ids satisfying every matcher.
    ///
    /// Right-to-left over the matcher set: union the posting sets of all
    /// catalog values a matcher accepts, then intersect across matchers.
    /// An empty union short-circuits to no results.
    pub fn match_sids(&self, lvs: &LabelValueSet, matchers: &LabelMatcherSet) -> Vec<String> {
        let idx = self.idx.lock().unwrap_or_else(|e| e.into_inner());

        let mut acc: Option<HashSet<String>> = None;
        for matcher in matchers.iter().rev() {
            let mut union: HashSet<String> = HashSet::new();
            for value in lvs.matched_values(matcher) {
                if let Some(sids) = idx.get(&join_separator(&matcher.name, &value)) {
                    union.extend(sids.iter().cloned());
                }
            }

            if union.is_empty() {
                return Vec::new();
            }

            acc = Some(match acc {
                None => union,
                Some(prev) => prev.intersection(&union).cloned().collect(),
            });
        }

        acc.map(|s| s.into_iter().collect()).unwrap_or_default()
    }

    /// Snapshot of every posting entry, used by the segment serializer.
    pub fn entries(&self) -> Vec<(String, Vec<String>)> {
        let idx = self.idx.lock().unwrap_or_else(|e| e.into_inner());
        idx.iter()
            .map(|(k, sids)| (k.clone(), sids.iter().cloned().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::{Label, LabelMatcher, METRIC_NAME};

    fn canonical(metric: &str, pairs: &[(&str, &str)]) -> LabelSet {
        let mut ls: LabelSet = pairs.iter().map(|&(n, v)| Label::new(n, v)).collect();
        ls = ls.add_metric_name(metric);
        ls.sort();
        ls
    }

    fn seed() -> (MemoryIndex, LabelValueSet) {
        let index = MemoryIndex::new();
        let lvs = LabelValueSet::new();

        for (sid, metric, node) in [
            ("s1", "cpu.busy", "vm1"),
            ("s2", "cpu.busy", "vm2"),
            ("s3", "mem.used", "vm1"),
        ] {
            let labels = canonical(metric, &[("node", node)]);
            for l in labels.iter() {
                lvs.set(&l.name, &l.value);
            }
            index.update(sid, &labels);
        }
        (index, lvs)
    }

    #[test]
    fn test_single_matcher() {
        let (index, lvs) = seed();
        let ms = LabelMatcherSet::default().add_metric_name("cpu.busy");

        let mut sids = index.match_sids(&lvs, &ms);
        sids.sort();
        assert_eq!(sids, vec!["s1", "s2"]);
    }

    #[test]
    fn test_intersection_across_matchers() {
        let (index, lvs) = seed();
        let ms = LabelMatcherSet::new(vec![LabelMatcher::equal("node", "vm1")])
            .add_metric_name("cpu.busy");

        assert_eq!(index.match_sids(&lvs, &ms), vec!["s1"]);
    }

    #[test]
    fn test_regex_union_within_matcher() {
        let (index, lvs) = seed();
        let ms = LabelMatcherSet::new(vec![LabelMatcher::regex("node", "vm[0-9]")])
            .add_metric_name("cpu.busy");

        let mut sids = index.match_sids(&lvs, &ms);
        sids.sort();
        assert_eq!(sids, vec!["s1", "s2"]);
    }

    #[test]
    fn test_empty_union_short_circuits() {
        let (index, lvs) = seed();
        let ms = LabelMatcherSet::new(vec![LabelMatcher::equal("node", "vm9")])
            .add_metric_name("cpu.busy");

        assert!(index.match_sids(&lvs, &ms).is_empty());

        let ms = LabelMatcherSet::default().add_metric_name("missing.metric");
        assert!(index.match_sids(&lvs, &ms).is_empty());
    }

    #[test]
    fn test_matcher_soundness() {
        // exactly the series carrying (name, v) are returned
        let (index, lvs) = seed();
        let ms = LabelMatcherSet::new(vec![LabelMatcher::equal("node", "vm1")]);
        let mut got = index.match_sids(&lvs, &ms);
        got.sort();
        assert_eq!(got, vec!["s1", "s3"]);
    }

    #[test]
    fn test_entries_snapshot() {
        let (index, _) = seed();
        let entries = index.entries();
        let metric_key = crate::label::join_separator(METRIC_NAME, "cpu.busy");
        let entry = entries.iter().find(|(k, _)| *k == metric_key).unwrap();
        assert_eq!(entry.1.len(), 2);
    }
}
