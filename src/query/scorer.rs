//! Relevance scoring and top-k selection.
//!
//! A query's score for an organization is the sum over matched query tokens
//! of `name_weight * (1 + log2(name_tf)) + secondary_weight * (1 + log2(secondary_tf))`,
//! where a zero frequency contributes nothing. Term frequencies are capped at
//! index time, so repeating a word in a name stops paying off quickly.

use crate::index::types::{DocId, Posting};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Configurable weights for scoring factors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// Weight of a token found in the legal name
    pub name_weight: f32,
    /// Weight of a token found in EIN, street or city
    pub secondary_weight: f32,
    /// Added when the whole query equals the whole name
    pub exact_name_bonus: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            name_weight: 2.0,
            secondary_weight: 1.0,
            exact_name_bonus: 5.0,
        }
    }
}

pub struct Scorer {
    weights: ScoringWeights,
}

impl Scorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn with_defaults() -> Self {
        Self::new(ScoringWeights::default())
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Contribution of one query token to one organization
    #[inline]
    pub fn posting_score(&self, posting: &Posting) -> f32 {
        tf_weight(posting.name_tf, self.weights.name_weight)
            + tf_weight(posting.secondary_tf, self.weights.secondary_weight)
    }

    /// Bonus when the normalized query equals the normalized name
    #[inline]
    pub fn exact_name_bonus(&self, query_key: &str, name_key: &str) -> f32 {
        if !query_key.is_empty() && query_key == name_key {
            self.weights.exact_name_bonus
        } else {
            0.0
        }
    }
}

#[inline]
fn tf_weight(tf: u8, weight: f32) -> f32 {
    if tf == 0 {
        0.0
    } else {
        weight * (1.0 + (tf as f32).log2())
    }
}

/// A scored document. Orders worst-first: lower score, then higher doc id,
/// so a `BinaryHeap` keeps the current worst entry on top.
#[derive(Debug, Clone, Copy)]
pub struct TopKEntry {
    pub score: f32,
    pub doc_id: DocId,
}

impl PartialEq for TopKEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TopKEntry {}

impl PartialOrd for TopKEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TopKEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.doc_id.cmp(&other.doc_id))
    }
}

/// Keeps the best `k` entries seen (score descending, doc id ascending)
pub struct TopKHeap {
    heap: BinaryHeap<TopKEntry>,
    capacity: usize,
}

impl TopKHeap {
    pub fn new(k: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(k.min(1 << 16) + 1),
            capacity: k,
        }
    }

    /// Insert if the entry belongs in the top k. Returns true if inserted.
    pub fn try_insert(&mut self, entry: TopKEntry) -> bool {
        if self.capacity == 0 {
            return false;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(entry);
            return true;
        }
        match self.heap.peek() {
            Some(worst) if entry < *worst => {
                self.heap.pop();
                self.heap.push(entry);
                true
            }
            _ => false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Consume the heap and return entries best first
    pub fn into_sorted_vec(self) -> Vec<TopKEntry> {
        let mut entries = self.heap.into_vec();
        entries.sort_unstable();
        entries
    }
}
