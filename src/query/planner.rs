//! Filter planning: validate the structured filters once, then intersect them
//! against a generation most selective first.

use crate::error::QueryError;
use crate::index::search_index::SearchIndex;
use crate::index::types::{NteeCategory, Organization};
use crate::query::{Filters, Range};
use roaring::RoaringBitmap;

/// One validated filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterStep {
    /// Uppercased two-letter code
    State(String),
    Category(NteeCategory),
    /// Uppercased NTEE code prefix of two or more characters
    NteePrefix(String),
    /// Lowercased, trimmed
    City(String),
    Revenue(Range),
    Assets(Range),
}

impl FilterStep {
    /// Number of docs the step selects on its own
    pub fn estimate(&self, index: &SearchIndex) -> u64 {
        match self {
            FilterStep::State(code) => index.state(code).map_or(0, |b| b.len()),
            FilterStep::Category(category) => index.category(*category).map_or(0, |b| b.len()),
            // Upper bound: the prefix's major group
            FilterStep::NteePrefix(prefix) => index
                .category(NteeCategory::from_code(prefix))
                .map_or(0, |b| b.len()),
            FilterStep::City(city) => index.city(city).map_or(0, |b| b.len()),
            FilterStep::Revenue(range) => index.revenue().count(range.min, range.max),
            FilterStep::Assets(range) => index.assets().count(range.min, range.max),
        }
    }

    /// Materialize the docs the step selects
    pub fn bitmap(&self, index: &SearchIndex) -> RoaringBitmap {
        match self {
            FilterStep::State(code) => index.state(code).cloned().unwrap_or_default(),
            FilterStep::Category(category) => index.category(*category).cloned().unwrap_or_default(),
            FilterStep::NteePrefix(prefix) => match index.category(NteeCategory::from_code(prefix)) {
                Some(group) => group
                    .iter()
                    .filter(|&doc| {
                        index
                            .doc(doc)
                            .is_some_and(|org| org.ntee_code.starts_with(prefix.as_str()))
                    })
                    .collect(),
                None => RoaringBitmap::new(),
            },
            FilterStep::City(city) => index.city(city).cloned().unwrap_or_default(),
            FilterStep::Revenue(range) => index.revenue().range(range.min, range.max),
            FilterStep::Assets(range) => index.assets().range(range.min, range.max),
        }
    }

    /// Check a single organization against the step
    pub fn matches(&self, org: &Organization) -> bool {
        match self {
            FilterStep::State(code) => org.state == *code,
            FilterStep::Category(category) => org.category == *category,
            FilterStep::NteePrefix(prefix) => org.ntee_code.starts_with(prefix.as_str()),
            FilterStep::City(city) => org.city.trim().to_lowercase() == *city,
            FilterStep::Revenue(range) => range.contains(org.revenue),
            FilterStep::Assets(range) => range.contains(org.assets),
        }
    }
}

/// Validated, ANDed filter steps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPlan {
    steps: Vec<FilterStep>,
}

impl FilterPlan {
    pub fn from_filters(filters: &Filters) -> Result<Self, QueryError> {
        let mut steps = Vec::new();

        if let Some(state) = &filters.state {
            let code = state.trim();
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(QueryError::InvalidState(state.clone()));
            }
            steps.push(FilterStep::State(code.to_ascii_uppercase()));
        }

        if let Some(category) = &filters.category {
            let parsed = NteeCategory::parse(category)
                .ok_or_else(|| QueryError::UnknownCategory(category.clone()))?;
            steps.push(FilterStep::Category(parsed));
        }

        if let Some(ntee) = &filters.ntee {
            steps.push(ntee_step(ntee)?);
        }

        if let Some(city) = &filters.city {
            let city = city.trim().to_lowercase();
            if city.is_empty() {
                return Err(QueryError::MalformedFilter {
                    field: "city".to_string(),
                    value: String::new(),
                });
            }
            steps.push(FilterStep::City(city));
        }

        if !filters.revenue.is_open() {
            check_range("revenue", &filters.revenue)?;
            steps.push(FilterStep::Revenue(filters.revenue));
        }
        if !filters.assets.is_open() {
            check_range("assets", &filters.assets)?;
            steps.push(FilterStep::Assets(filters.assets));
        }

        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[FilterStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Docs passing every step, or `None` when there are no filters.
    ///
    /// The smallest step seeds the candidate set. Later steps are checked per
    /// document once the candidates are fewer than the step would select.
    pub fn execute(&self, index: &SearchIndex) -> Option<RoaringBitmap> {
        if self.steps.is_empty() {
            return None;
        }

        let mut ordered: Vec<(u64, &FilterStep)> =
            self.steps.iter().map(|s| (s.estimate(index), s)).collect();
        ordered.sort_by_key(|(estimate, _)| *estimate);

        let mut candidates = ordered[0].1.bitmap(index);
        for (estimate, step) in &ordered[1..] {
            if candidates.is_empty() {
                break;
            }
            if candidates.len() < *estimate {
                let rejected: RoaringBitmap = candidates
                    .iter()
                    .filter(|&doc| !index.doc(doc).is_some_and(|org| step.matches(org)))
                    .collect();
                candidates -= rejected;
            } else {
                candidates &= step.bitmap(index);
            }
        }
        Some(candidates)
    }
}

/// Longest NTEE code, including the optional suffix letter
const MAX_NTEE_PREFIX: usize = 5;

/// A single letter is the major group and uses its bitmap directly
fn ntee_step(raw: &str) -> Result<FilterStep, QueryError> {
    let prefix = raw.trim().to_ascii_uppercase();
    if prefix.is_empty()
        || prefix.len() > MAX_NTEE_PREFIX
        || !prefix.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(QueryError::MalformedFilter {
            field: "ntee".to_string(),
            value: raw.to_string(),
        });
    }
    if let Some(category) = NteeCategory::parse(&prefix)
        && prefix.len() == 1
    {
        return Ok(FilterStep::Category(category));
    }
    Ok(FilterStep::NteePrefix(prefix))
}

fn check_range(field: &'static str, range: &Range) -> Result<(), QueryError> {
    if let (Some(min), Some(max)) = (range.min, range.max)
        && min > max
    {
        return Err(QueryError::InvalidRange { field, min, max });
    }
    Ok(())
}
