//! Search, filter, paginate and export against one pinned generation.

pub mod executor;
pub mod export;
pub mod parser;
pub mod planner;
pub mod scorer;

pub use executor::QueryEngine;
pub use export::{ExportFormat, ExportStream};
pub use parser::parse_query;
pub use planner::{FilterPlan, FilterStep};
pub use scorer::{Scorer, ScoringWeights, TopKEntry, TopKHeap};

use crate::error::QueryError;
use crate::index::types::{Generation, Organization};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Inclusive numeric bounds; either side may be open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
}

impl Range {
    pub fn new(min: Option<u64>, max: Option<u64>) -> Self {
        Self { min, max }
    }

    pub fn is_open(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn contains(&self, value: u64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

/// Structured filters, ANDed together
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Filters {
    /// Two-letter state code
    pub state: Option<String>,
    /// NTEE major group: a letter, "other", or a description
    pub category: Option<String>,
    /// NTEE code prefix: `K3` matches K30 through K36
    pub ntee: Option<String>,
    pub city: Option<String>,
    pub revenue: Range,
    pub assets: Range,
}

impl Filters {
    /// Check if any filter is set
    pub fn has_any(&self) -> bool {
        self.state.is_some()
            || self.category.is_some()
            || self.ntee.is_some()
            || self.city.is_some()
            || !self.revenue.is_open()
            || !self.assets.is_open()
    }
}

/// Result ordering. EIN is always the final tie-break.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Score descending with a text term, EIN order without one
    #[default]
    Relevance,
    Ein,
    Name,
    Revenue,
    RevenueDesc,
    Assets,
    AssetsDesc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Relevance => "relevance",
            SortOrder::Ein => "ein",
            SortOrder::Name => "name",
            SortOrder::Revenue => "revenue",
            SortOrder::RevenueDesc => "-revenue",
            SortOrder::Assets => "assets",
            SortOrder::AssetsDesc => "-assets",
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortOrder {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "relevance" | "score" | "" => Ok(SortOrder::Relevance),
            "ein" => Ok(SortOrder::Ein),
            "name" => Ok(SortOrder::Name),
            "revenue" | "+revenue" => Ok(SortOrder::Revenue),
            "-revenue" | "revenue_desc" => Ok(SortOrder::RevenueDesc),
            "assets" | "+assets" => Ok(SortOrder::Assets),
            "-assets" | "assets_desc" => Ok(SortOrder::AssetsDesc),
            _ => Err(QueryError::UnknownSort(s.to_string())),
        }
    }
}

/// A search as submitted by a caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    pub term: Option<String>,
    pub filters: Filters,
    pub sort: SortOrder,
    pub offset: usize,
    /// Page size; the configured default when absent
    pub limit: Option<usize>,
}

impl SearchRequest {
    pub fn term(term: impl Into<String>) -> Self {
        Self {
            term: Some(term.into()),
            ..Default::default()
        }
    }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub organization: Organization,
    /// Relevance score when a text term was given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    /// Generation every hit was read from
    pub generation: Generation,
    pub results: Vec<SearchHit>,
    pub total_matched: u64,
    /// Offset of the next page, if there is one
    pub next_offset: Option<usize>,
}
