use crate::index::types::*;
use crate::utils::Tokenizer;
use roaring::RoaringBitmap;
use std::collections::HashMap;

/// Hash map keyed by strings, hashed with ahash
pub type StrMap<V> = HashMap<String, V, ahash::RandomState>;

/// Sorted `(value, doc)` pairs for range filters and value ordering
#[derive(Debug, Clone, Default)]
pub struct RangeColumn {
    /// Ascending by value, then doc id
    sorted: Vec<(u64, DocId)>,
    /// Doc ids by value descending, then doc id ascending
    desc: Vec<DocId>,
}

impl RangeColumn {
    pub fn new(mut sorted: Vec<(u64, DocId)>) -> Self {
        sorted.sort_unstable();
        let mut desc = Vec::with_capacity(sorted.len());
        // Walk equal-value groups from the top, keeping each group in doc order
        let mut end = sorted.len();
        while end > 0 {
            let value = sorted[end - 1].0;
            let start = sorted[..end].partition_point(|&(v, _)| v < value);
            desc.extend(sorted[start..end].iter().map(|&(_, doc)| doc));
            end = start;
        }
        Self { sorted, desc }
    }

    /// Docs with `min <= value <= max` (either bound optional)
    pub fn range(&self, min: Option<u64>, max: Option<u64>) -> RoaringBitmap {
        let start = match min {
            Some(min) => self.sorted.partition_point(|&(v, _)| v < min),
            None => 0,
        };
        let end = match max {
            Some(max) => self.sorted.partition_point(|&(v, _)| v <= max),
            None => self.sorted.len(),
        };
        if start >= end {
            return RoaringBitmap::new();
        }
        self.sorted[start..end].iter().map(|&(_, doc)| doc).collect()
    }

    /// Number of docs a range would select, without materializing it
    pub fn count(&self, min: Option<u64>, max: Option<u64>) -> u64 {
        let start = min.map_or(0, |min| self.sorted.partition_point(|&(v, _)| v < min));
        let end = max.map_or(self.sorted.len(), |max| {
            self.sorted.partition_point(|&(v, _)| v <= max)
        });
        end.saturating_sub(start) as u64
    }

    pub fn ascending(&self) -> impl Iterator<Item = DocId> + '_ {
        self.sorted.iter().map(|&(_, doc)| doc)
    }

    pub fn descending(&self) -> impl Iterator<Item = DocId> + '_ {
        self.desc.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }
}

/// One immutable, complete index generation.
///
/// Documents are stored in EIN order and a doc id is the position in that
/// order, so iterating any bitmap yields organizations in EIN order.
#[derive(Debug)]
pub struct SearchIndex {
    pub(crate) meta: IndexMeta,
    pub(crate) tokenizer: Tokenizer,
    pub(crate) docs: Vec<Organization>,
    pub(crate) terms: StrMap<Vec<Posting>>,
    pub(crate) states: StrMap<RoaringBitmap>,
    pub(crate) categories: HashMap<NteeCategory, RoaringBitmap, ahash::RandomState>,
    /// Keyed by lowercased city
    pub(crate) cities: StrMap<RoaringBitmap>,
    pub(crate) revenue: RangeColumn,
    pub(crate) assets: RangeColumn,
    /// Doc ids by lowercased name, then EIN
    pub(crate) name_order: Vec<DocId>,
    pub(crate) all: RoaringBitmap,
}

impl SearchIndex {
    /// The pre-import generation 0
    pub fn empty(tokenizer: Tokenizer) -> Self {
        Self {
            meta: IndexMeta::default(),
            tokenizer,
            docs: Vec::new(),
            terms: StrMap::default(),
            states: StrMap::default(),
            categories: HashMap::default(),
            cities: StrMap::default(),
            revenue: RangeColumn::default(),
            assets: RangeColumn::default(),
            name_order: Vec::new(),
            all: RoaringBitmap::new(),
        }
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn generation(&self) -> Generation {
        self.meta.generation
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn doc(&self, doc_id: DocId) -> Option<&Organization> {
        self.docs.get(doc_id as usize)
    }

    /// All organizations in EIN order
    pub fn documents(&self) -> &[Organization] {
        &self.docs
    }

    /// Doc id of an EIN (binary search over EIN order)
    pub fn find(&self, ein: &Ein) -> Option<DocId> {
        self.docs
            .binary_search_by(|org| org.ein.cmp(ein))
            .ok()
            .map(|idx| idx as DocId)
    }

    pub fn postings(&self, term: &str) -> &[Posting] {
        self.terms.get(term).map(|p| p.as_slice()).unwrap_or(&[])
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    pub fn state(&self, code: &str) -> Option<&RoaringBitmap> {
        self.states.get(code)
    }

    pub fn category(&self, category: NteeCategory) -> Option<&RoaringBitmap> {
        self.categories.get(&category)
    }

    pub fn city(&self, city: &str) -> Option<&RoaringBitmap> {
        self.cities.get(&city.trim().to_lowercase())
    }

    pub fn revenue(&self) -> &RangeColumn {
        &self.revenue
    }

    pub fn assets(&self) -> &RangeColumn {
        &self.assets
    }

    pub fn name_order(&self) -> &[DocId] {
        &self.name_order
    }

    /// Every doc id in this generation
    pub fn all(&self) -> &RoaringBitmap {
        &self.all
    }

    /// Per-category document counts, in category order
    pub fn category_counts(&self) -> Vec<(NteeCategory, u64)> {
        NteeCategory::ALL
            .iter()
            .map(|c| (*c, self.categories.get(c).map(|b| b.len()).unwrap_or(0)))
            .collect()
    }

    /// Per-state document counts, largest first
    pub fn state_counts(&self) -> Vec<(String, u64)> {
        let mut counts: Vec<(String, u64)> = self
            .states
            .iter()
            .map(|(state, bitmap)| (state.clone(), bitmap.len()))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts
    }
}
