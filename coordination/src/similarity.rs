//! Pluggable text similarity used by loop detection, convergence checks and
//! arbitration weighting.
//!
//! Every oracle must return a value in [0, 1] and be symmetric. Empty input
//! (no tokens on either side) scores 0.0 so that two blank responses never
//! register as a loop.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A symmetric similarity measure over response text.
pub trait SimilarityOracle: Send + Sync {
    /// Similarity of `a` and `b` in [0, 1].
    fn similarity(&self, a: &str, b: &str) -> f64;

    /// Short identifier used in logs.
    fn name(&self) -> &'static str;
}

/// Shared handle to an oracle.
pub type SharedOracle = Arc<dyn SimilarityOracle>;

/// Which built-in oracle to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleKind {
    /// Token-set Jaccard index.
    #[default]
    Jaccard,
    /// Term-frequency cosine similarity.
    Cosine,
}

impl OracleKind {
    pub fn build(self) -> SharedOracle {
        match self {
            OracleKind::Jaccard => Arc::new(JaccardOracle),
            OracleKind::Cosine => Arc::new(CosineOracle),
        }
    }
}

impl std::fmt::Display for OracleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OracleKind::Jaccard => write!(f, "jaccard"),
            OracleKind::Cosine => write!(f, "cosine"),
        }
    }
}

impl FromStr for OracleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "jaccard" => Ok(OracleKind::Jaccard),
            "cosine" => Ok(OracleKind::Cosine),
            other => Err(format!(
                "unknown similarity oracle '{}' (expected jaccard or cosine)",
                other
            )),
        }
    }
}

/// Lowercased words with surrounding punctuation stripped.
fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
}

/// |A ∩ B| / |A ∪ B| over word sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct JaccardOracle;

impl SimilarityOracle for JaccardOracle {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let left: HashSet<String> = words(a).collect();
        let right: HashSet<String> = words(b).collect();
        if left.is_empty() || right.is_empty() {
            return 0.0;
        }
        let intersection = left.intersection(&right).count();
        let union = left.union(&right).count();
        intersection as f64 / union as f64
    }

    fn name(&self) -> &'static str {
        "jaccard"
    }
}

/// Cosine similarity of term-frequency vectors.
///
/// Terms are kept in a `BTreeMap` so the dot product is summed in the same
/// order regardless of argument order.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineOracle;

impl CosineOracle {
    fn term_frequencies(text: &str) -> BTreeMap<String, f64> {
        let mut tf = BTreeMap::new();
        for word in words(text) {
            *tf.entry(word).or_insert(0.0) += 1.0;
        }
        tf
    }
}

impl SimilarityOracle for CosineOracle {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let left = Self::term_frequencies(a);
        let right = Self::term_frequencies(b);
        if left.is_empty() || right.is_empty() {
            return 0.0;
        }

        let dot: f64 = left
            .iter()
            .filter_map(|(term, l)| right.get(term).map(|r| l * r))
            .sum();
        let norm = |tf: &BTreeMap<String, f64>| tf.values().map(|v| v * v).sum::<f64>().sqrt();
        let denom = norm(&left) * norm(&right);
        if denom == 0.0 {
            return 0.0;
        }
        (dot / denom).clamp(0.0, 1.0)
    }

    fn name(&self) -> &'static str {
        "cosine"
    }
}
