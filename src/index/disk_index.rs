//! Roaring-bitmap inverted index for frozen disk segments

use crate::label::{join_separator, split_separator, Label, LabelMatcherSet, LabelSet, LabelValueSet};
use crate::storage::metadata::SeriesWithLabel;
use rayon::prelude::*;
use roaring::RoaringBitmap;
use std::collections::HashMap;

/// `"name/-/value" → bitmap<series ordinal>` plus the order-preserving
/// ordinal → label-pair table reconstructed from the metadata block.
#[derive(Debug, Default)]
pub struct DiskIndex {
    label_to_sids: HashMap<String, RoaringBitmap>,
    ordered: Vec<String>,
}

impl DiskIndex {
    /// Build from the labels section of a segment's metadata. The record
    /// index becomes the label ordinal referenced by the series section.
    pub fn new(records: &[SeriesWithLabel]) -> Self {
        let mut label_to_sids = HashMap::with_capacity(records.len());
        let mut ordered = Vec::with_capacity(records.len());

        for record in records {
            let mut bitmap = RoaringBitmap::new();
            for &sid in &record.sids {
                bitmap.insert(sid);
            }
            label_to_sids.insert(record.name.clone(), bitmap);
            ordered.push(record.name.clone());
        }

        Self {
            label_to_sids,
            ordered,
        }
    }

    /// Resolve label ordinals back into a canonical (name-sorted) label
    /// set, so the result hashes identically to the series' in-memory
    /// form and merges with it across segments.
    pub fn labels_for(&self, ordinals: &[u32]) -> LabelSet {
        let mut labels: LabelSet = ordinals
            .iter()
            .filter_map(|&lid| {
                let pair = self.ordered.get(lid as usize)?;
                let (name, value) = split_separator(pair)?;
                Some(Label::new(name, value))
            })
            .collect();
        labels.sort();
        labels
    }

    /// Series ordinals satisfying every matcher, ascending.
    ///
    /// Same shape as the memory index: per-matcher bitmap union over the
    /// accepted catalog values, bitmap intersection across matchers, with
    /// the reductions running in parallel.
    pub fn match_sids(&self, lvs: &LabelValueSet, matchers: &LabelMatcherSet) -> Vec<u32> {
        let mut unions = Vec::with_capacity(matchers.len());
        for matcher in matchers.iter().rev() {
            let candidates: Vec<&RoaringBitmap> = lvs
                .matched_values(matcher)
                .into_iter()
                .filter_map(|v| self.label_to_sids.get(&join_separator(&matcher.name, &v)))
                .filter(|b| !b.is_empty())
                .collect();

            let union = candidates
                .into_par_iter()
                .cloned()
                .reduce(RoaringBitmap::new, |a, b| a | b);

            if union.is_empty() {
                return Vec::new();
            }
            unions.push(union);
        }

        unions
            .into_par_iter()
            .reduce_with(|a, b| a & b)
            .unwrap_or_default()
            .iter()
            .collect()
    }
}
