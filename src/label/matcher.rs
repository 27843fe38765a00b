//! Label matchers: literal equality or anchored regular expressions

use crate::label::{LabelSet, METRIC_NAME};
use regex::Regex;
use regex_syntax::hir::{Hir, HirKind, Look};
use std::collections::HashSet;

/// A single matcher over one label name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatcher {
    pub name: String,
    pub value: String,
    pub is_regex: bool,
}

impl LabelMatcher {
    /// Literal equality matcher.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            is_regex: false,
        }
    }

    /// Regular-expression matcher; the pattern is matched fully anchored.
    pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: pattern.into(),
            is_regex: true,
        }
    }
}

/// A conjunction of label matchers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelMatcherSet(Vec<LabelMatcher>);

impl LabelMatcherSet {
    pub fn new(matchers: Vec<LabelMatcher>) -> Self {
        Self(matchers)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LabelMatcher> {
        self.0.iter()
    }

    fn filter(mut self) -> Self {
        let mut seen = HashSet::new();
        self.0.retain(|m| {
            let keep = !m.name.is_empty() && !m.value.is_empty() && !seen.contains(&m.name);
            seen.insert(m.name.clone());
            keep
        });
        self
    }

    /// Filter, then append an equality matcher on the metric identity.
    ///
    /// The metric matcher lands last so the right-to-left index walk
    /// evaluates the most selective matcher first.
    pub fn add_metric_name(self, metric: &str) -> Self {
        let mut matchers = self.filter();
        matchers.0.push(LabelMatcher::equal(METRIC_NAME, metric));
        matchers
    }

    /// True when `labels` satisfies every matcher (used in tests and by
    /// callers that bypass the index).
    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.0.iter().all(|m| match labels.get(&m.name) {
            Some(v) if !m.is_regex => v == m.value,
            Some(v) => match FastRegexMatcher::new(&m.value) {
                Ok(p) => p.is_match(v),
                Err(_) => v == m.value,
            },
            None => false,
        })
    }
}

impl FromIterator<LabelMatcher> for LabelMatcherSet {
    fn from_iter<T: IntoIterator<Item = LabelMatcher>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Anchored regex matcher with a literal fast path
///
/// The pattern's syntax tree yields any literal prefix, suffix, and
/// contained substring; a candidate must pass those string checks before
/// the regex engine runs. Case-insensitive literals never surface as
/// plain literals in the tree, so the fast path stays sound.
#[derive(Debug)]
pub struct FastRegexMatcher {
    re: Regex,
    prefix: String,
    suffix: String,
    contains: String,
}

impl FastRegexMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let re = Regex::new(&format!("^(?:{})$", pattern))?;

        let mut matcher = Self {
            re,
            prefix: String::new(),
            suffix: String::new(),
            contains: String::new(),
        };

        if let Ok(hir) = regex_syntax::Parser::new().parse(pattern) {
            if let HirKind::Concat(subs) = hir.kind() {
                let (prefix, suffix, contains) = optimize_concat(subs);
                matcher.prefix = prefix;
                matcher.suffix = suffix;
                matcher.contains = contains;
            }
        }

        Ok(matcher)
    }

    pub fn is_match(&self, s: &str) -> bool {
        if !self.prefix.is_empty() && !s.starts_with(&self.prefix) {
            return false;
        }
        if !self.suffix.is_empty() && !s.ends_with(&self.suffix) {
            return false;
        }
        if !self.contains.is_empty() && !s.contains(&self.contains) {
            return false;
        }
        self.re.is_match(s)
    }
}

fn literal_str(hir: &Hir) -> Option<&str> {
    match hir.kind() {
        HirKind::Literal(lit) => std::str::from_utf8(&lit.0).ok(),
        _ => None,
    }
}

/// Extract anchored literal prefix/suffix and one contained literal from a
/// concatenation node.
fn optimize_concat(subs: &[Hir]) -> (String, String, String) {
    let mut subs = subs;

    // explicit anchors at the edges can be dropped
    if matches!(subs.first().map(|h| h.kind()), Some(HirKind::Look(Look::Start))) {
        subs = &subs[1..];
    }
    if matches!(subs.last().map(|h| h.kind()), Some(HirKind::Look(Look::End))) {
        subs = &subs[..subs.len() - 1];
    }

    if subs.is_empty() {
        return Default::default();
    }

    let prefix = literal_str(&subs[0]).unwrap_or_default().to_string();
    let suffix = literal_str(&subs[subs.len() - 1])
        .unwrap_or_default()
        .to_string();

    // keep the first interior literal only; one check is enough to prune
    let mut contains = String::new();
    for sub in subs.iter().take(subs.len().saturating_sub(1)).skip(1) {
        if let Some(s) = literal_str(sub) {
            contains = s.to_string();
            break;
        }
    }

    (prefix, suffix, contains)
}
