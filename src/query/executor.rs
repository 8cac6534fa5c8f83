use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::index::search_index::SearchIndex;
use crate::index::types::{DocId, Ein, Organization};
use crate::query::planner::FilterPlan;
use crate::query::scorer::{Scorer, TopKEntry, TopKHeap};
use crate::query::{Filters, SearchHit, SearchRequest, SearchResults, SortOrder};
use roaring::RoaringBitmap;
use std::borrow::Cow;
use std::collections::HashMap;

type ScoreMap = HashMap<DocId, f32, ahash::RandomState>;

/// A request that passed validation
#[derive(Debug, Clone)]
pub struct ValidatedQuery {
    /// Trimmed text term; `None` when absent or blank
    pub term: Option<String>,
    pub plan: FilterPlan,
    pub sort: SortOrder,
    pub offset: usize,
    pub limit: usize,
}

/// Runs searches against one generation at a time.
///
/// The engine holds no index reference; callers pass the snapshot they
/// pinned, so a whole query reads a single generation.
pub struct QueryEngine {
    scorer: Scorer,
    default_limit: usize,
    max_limit: usize,
}

impl QueryEngine {
    pub fn new(config: &QueryConfig) -> Self {
        Self {
            scorer: Scorer::new(config.scoring.clone()),
            default_limit: config.default_limit,
            max_limit: config.max_limit,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(&QueryConfig::default())
    }

    pub fn max_limit(&self) -> usize {
        self.max_limit
    }

    /// Check a request without touching any index
    pub fn validate(&self, request: &SearchRequest) -> Result<ValidatedQuery, QueryError> {
        let limit = request
            .limit
            .unwrap_or_else(|| self.default_limit.clamp(1, self.max_limit.max(1)));
        if limit == 0 || limit > self.max_limit {
            return Err(QueryError::InvalidLimit {
                limit,
                max: self.max_limit,
            });
        }

        Ok(ValidatedQuery {
            term: clean_term(request.term.as_deref()),
            plan: FilterPlan::from_filters(&request.filters)?,
            sort: request.sort,
            offset: request.offset,
            limit,
        })
    }

    /// Validate and run a request against a pinned generation
    pub fn search(
        &self,
        index: &SearchIndex,
        request: &SearchRequest,
    ) -> Result<SearchResults, QueryError> {
        let query = self.validate(request)?;
        Ok(self.execute(index, &query))
    }

    pub fn execute(&self, index: &SearchIndex, query: &ValidatedQuery) -> SearchResults {
        let filtered = query.plan.execute(index);

        let (page, scores, total_matched) = match &query.term {
            Some(term) => {
                let scores = self.score_term(index, term, filtered.as_ref());
                let total = scores.len() as u64;
                let page = if query.sort == SortOrder::Relevance {
                    top_by_score(&scores, query.offset, query.limit)
                } else {
                    let matched: RoaringBitmap = scores.keys().copied().collect();
                    ordered_page(index, &matched, query.sort, query.offset, query.limit)
                };
                (page, Some(scores), total)
            }
            None => {
                let matched = match &filtered {
                    Some(bitmap) => Cow::Borrowed(bitmap),
                    None => Cow::Borrowed(index.all()),
                };
                let page = ordered_page(index, &matched, query.sort, query.offset, query.limit);
                (page, None, matched.len())
            }
        };

        let end = query.offset.saturating_add(page.len());
        let results: Vec<SearchHit> = page
            .into_iter()
            .filter_map(|doc| {
                index.doc(doc).map(|org| SearchHit {
                    organization: org.clone(),
                    score: scores.as_ref().and_then(|s| s.get(&doc).copied()),
                })
            })
            .collect();

        SearchResults {
            generation: index.generation(),
            results,
            total_matched,
            next_offset: ((end as u64) < total_matched).then_some(end),
        }
    }

    /// Every doc matching a term and filters, for export
    pub fn matching(
        &self,
        index: &SearchIndex,
        term: Option<&str>,
        filters: &Filters,
    ) -> Result<RoaringBitmap, QueryError> {
        let plan = FilterPlan::from_filters(filters)?;
        let filtered = plan.execute(index);
        Ok(match clean_term(term) {
            Some(term) => self
                .score_term(index, &term, filtered.as_ref())
                .into_keys()
                .collect(),
            None => filtered.unwrap_or_else(|| index.all().clone()),
        })
    }

    /// Direct lookup by EIN
    pub fn organization<'a>(&self, index: &'a SearchIndex, ein: &str) -> Option<&'a Organization> {
        let ein = Ein::parse(ein)?;
        index.find(&ein).and_then(|doc| index.doc(doc))
    }

    /// Score every doc containing at least one query token
    fn score_term(&self, index: &SearchIndex, term: &str, filtered: Option<&RoaringBitmap>) -> ScoreMap {
        let tokenizer = index.tokenizer();
        let mut scores = ScoreMap::default();

        for token in tokenizer.query_terms(term) {
            for posting in index.postings(&token) {
                if filtered.is_some_and(|f| !f.contains(posting.doc_id)) {
                    continue;
                }
                *scores.entry(posting.doc_id).or_insert(0.0) += self.scorer.posting_score(posting);
            }
        }

        if self.scorer.weights().exact_name_bonus != 0.0 {
            let key = tokenizer.phrase_key(term);
            for (doc, score) in scores.iter_mut() {
                if let Some(org) = index.doc(*doc) {
                    *score += self.scorer.exact_name_bonus(&key, &tokenizer.phrase_key(&org.name));
                }
            }
        }

        scores
    }
}

fn clean_term(term: Option<&str>) -> Option<String> {
    term.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// One page of the best-scoring docs, score descending then EIN
fn top_by_score(scores: &ScoreMap, offset: usize, limit: usize) -> Vec<DocId> {
    let mut heap = TopKHeap::new(offset.saturating_add(limit));
    for (&doc_id, &score) in scores {
        heap.try_insert(TopKEntry { score, doc_id });
    }
    heap.into_sorted_vec()
        .into_iter()
        .skip(offset)
        .map(|entry| entry.doc_id)
        .collect()
}

/// One page of `matched` in a value order. Doc ids follow EIN order, so every
/// ordering below already breaks ties by EIN.
fn ordered_page(
    index: &SearchIndex,
    matched: &RoaringBitmap,
    sort: SortOrder,
    offset: usize,
    limit: usize,
) -> Vec<DocId> {
    let ordered: Box<dyn Iterator<Item = DocId> + '_> = match sort {
        SortOrder::Relevance | SortOrder::Ein => {
            return matched.iter().skip(offset).take(limit).collect();
        }
        SortOrder::Name => Box::new(index.name_order().iter().copied()),
        SortOrder::Revenue => Box::new(index.revenue().ascending()),
        SortOrder::RevenueDesc => Box::new(index.revenue().descending()),
        SortOrder::Assets => Box::new(index.assets().ascending()),
        SortOrder::AssetsDesc => Box::new(index.assets().descending()),
    };

    ordered
        .filter(|doc| matched.contains(*doc))
        .skip(offset)
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::build::{BuildOptions, IndexBuilder};
    use crate::index::types::{NteeCategory, StagedRecord};
    use crate::query::Range;
    use crate::utils::CancelToken;

    fn org(ein: &str, name: &str, state: &str, ntee: &str, revenue: u64) -> Organization {
        let mut org = Organization::new(Ein::parse(ein).unwrap(), name);
        org.state = state.to_string();
        org.city = "Springfield".to_string();
        org.ntee_code = ntee.to_string();
        org.category = NteeCategory::from_code(ntee);
        org.revenue = revenue;
        org.assets = revenue * 2;
        org
    }

    fn index() -> SearchIndex {
        let orgs = vec![
            org("000000005", "Food Bank", "CA", "K31", 500),
            org("000000001", "Springfield Food Bank Food Pantry", "IL", "K31", 9000),
            org("000000003", "City Animal Shelter", "CA", "D20", 1200),
            org("000000002", "Helping Hands", "TX", "P20", 0),
            org("000000004", "Food Rescue Alliance", "CA", "K30", 70),
        ];
        let records = orgs
            .into_iter()
            .enumerate()
            .map(|(i, org)| Ok(StagedRecord { seq: i as u64, org }));
        IndexBuilder::new(BuildOptions::default(), CancelToken::new())
            .build(records, 1, None)
            .unwrap()
            .index
    }

    fn eins(results: &SearchResults) -> Vec<&str> {
        results
            .results
            .iter()
            .map(|h| h.organization.ein.as_str())
            .collect()
    }

    #[test]
    fn test_exact_name_ranks_first() {
        let engine = QueryEngine::with_defaults();
        let results = engine.search(&index(), &SearchRequest::term("food bank")).unwrap();
        assert_eq!(results.total_matched, 3);
        assert_eq!(eins(&results)[0], "000000005");
        assert!(results.results.iter().all(|h| h.score.is_some()));
    }

    #[test]
    fn test_state_filter_without_term_is_ein_order() {
        let engine = QueryEngine::with_defaults();
        let request = SearchRequest {
            filters: Filters {
                state: Some("ca".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let results = engine.search(&index(), &request).unwrap();
        assert_eq!(eins(&results), vec!["000000003", "000000004", "000000005"]);
        assert!(results.results.iter().all(|h| h.score.is_none()));
        assert_eq!(results.next_offset, None);
    }

    #[test]
    fn test_ntee_prefix_filter() {
        let engine = QueryEngine::with_defaults();
        let index = index();
        let matching = |ntee: &str, state: Option<&str>| {
            let request = SearchRequest::default().with_filters(Filters {
                ntee: Some(ntee.to_string()),
                state: state.map(str::to_string),
                ..Default::default()
            });
            eins(&engine.search(&index, &request).unwrap())
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>()
        };

        assert_eq!(matching("k3", None), vec!["000000001", "000000004", "000000005"]);
        assert_eq!(matching("K31", None), vec!["000000001", "000000005"]);
        assert_eq!(matching("K", None), matching("K3", None));
        assert_eq!(matching("K3", Some("CA")), vec!["000000004", "000000005"]);
        assert!(matching("K4", None).is_empty());
        assert!(matching("Q", None).is_empty());
    }

    #[test]
    fn test_sorts_break_ties_by_ein() {
        let engine = QueryEngine::with_defaults();
        let index = index();
        let sorted = |sort| {
            let request = SearchRequest::default().with_sort(sort);
            eins(&engine.search(&index, &request).unwrap())
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>()
        };
        assert_eq!(
            sorted(SortOrder::RevenueDesc),
            vec!["000000001", "000000003", "000000005", "000000004", "000000002"]
        );
        assert_eq!(
            sorted(SortOrder::Name),
            vec!["000000003", "000000005", "000000004", "000000002", "000000001"]
        );
    }

    #[test]
    fn test_pagination() {
        let engine = QueryEngine::with_defaults();
        let index = index();
        let first = engine
            .search(&index, &SearchRequest::default().page(0, 2))
            .unwrap();
        assert_eq!(first.total_matched, 5);
        assert_eq!(first.next_offset, Some(2));
        let last = engine
            .search(&index, &SearchRequest::default().page(4, 2))
            .unwrap();
        assert_eq!(eins(&last), vec!["000000005"]);
        assert_eq!(last.next_offset, None);
        let beyond = engine
            .search(&index, &SearchRequest::default().page(10, 2))
            .unwrap();
        assert!(beyond.results.is_empty());
    }

    #[test]
    fn test_filters_combine_with_term() {
        let engine = QueryEngine::with_defaults();
        let request = SearchRequest::term("food").with_filters(Filters {
            state: Some("CA".to_string()),
            revenue: Range::new(Some(100), None),
            ..Default::default()
        });
        let results = engine.search(&index(), &request).unwrap();
        assert_eq!(eins(&results), vec!["000000005"]);
    }

    #[test]
    fn test_term_without_tokens_matches_nothing() {
        let engine = QueryEngine::with_defaults();
        let results = engine.search(&index(), &SearchRequest::term("a")).unwrap();
        assert_eq!(results.total_matched, 0);
        let blank = engine.search(&index(), &SearchRequest::term("   ")).unwrap();
        assert_eq!(blank.total_matched, 5);
    }

    #[test]
    fn test_invalid_limit() {
        let engine = QueryEngine::with_defaults();
        assert_eq!(
            engine.validate(&SearchRequest::default().page(0, 0)).unwrap_err(),
            QueryError::InvalidLimit { limit: 0, max: 500 }
        );
        assert!(engine.validate(&SearchRequest::default().page(0, 501)).is_err());
        assert_eq!(engine.validate(&SearchRequest::default()).unwrap().limit, 50);
    }

    #[test]
    fn test_organization_lookup() {
        let engine = QueryEngine::with_defaults();
        let index = index();
        assert_eq!(
            engine.organization(&index, "00-0000003").map(|o| o.name.as_str()),
            Some("City Animal Shelter")
        );
        assert!(engine.organization(&index, "999999999").is_none());
    }

    #[test]
    fn test_matching_set() {
        let engine = QueryEngine::with_defaults();
        let index = index();
        let matched = engine
            .matching(&index, Some("food"), &Filters::default())
            .unwrap();
        assert_eq!(matched.len(), 3);
        let all = engine.matching(&index, None, &Filters::default()).unwrap();
        assert_eq!(all.len(), 5);
    }
}
