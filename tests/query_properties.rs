//! Property tests for query semantics over randomly generated registries.

use npsearch::NonprofitIndex;
use npsearch::config::AppConfig;
use npsearch::fetch::{FileTransport, SourceDescriptor};
use npsearch::index::{BuildOptions, Ein, IndexBuilder, NteeCategory, Organization, SearchIndex, StagedRecord};
use npsearch::query::{Filters, QueryEngine, Range, SearchRequest, SortOrder};
use npsearch::utils::CancelToken;
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

const WORDS: [&str; 6] = ["food", "bank", "arts", "river", "health", "youth"];
const STATES: [&str; 3] = ["CA", "NY", "TX"];
const CODES: [&str; 3] = ["K31", "A20", "E40"];

#[derive(Debug, Clone)]
struct Row {
    ein: u32,
    words: Vec<usize>,
    state: usize,
    code: usize,
    revenue: u64,
}

fn row() -> impl Strategy<Value = Row> {
    (
        0u32..40,
        prop::collection::vec(0..WORDS.len(), 1..4),
        0..STATES.len(),
        0..CODES.len(),
        0u64..1000,
    )
        .prop_map(|(ein, words, state, code, revenue)| Row {
            ein,
            words,
            state,
            code,
            revenue,
        })
}

fn organization(row: &Row) -> Organization {
    let name = row.words.iter().map(|w| WORDS[*w]).collect::<Vec<_>>().join(" ");
    let mut org = Organization::new(Ein::parse(&format!("{:09}", row.ein + 1)).unwrap(), name);
    org.state = STATES[row.state].to_string();
    org.ntee_code = CODES[row.code].to_string();
    org.category = NteeCategory::from_code(&org.ntee_code);
    org.revenue = row.revenue;
    org
}

fn build(rows: &[Row]) -> SearchIndex {
    let records = rows.iter().enumerate().map(|(i, row)| {
        Ok(StagedRecord {
            seq: i as u64,
            org: organization(row),
        })
    });
    let options = BuildOptions {
        shard_workers: 3,
        ..Default::default()
    };
    IndexBuilder::new(options, CancelToken::new())
        .build(records, 1, None)
        .unwrap()
        .index
}

fn sort_order() -> impl Strategy<Value = SortOrder> {
    prop::sample::select(vec![
        SortOrder::Relevance,
        SortOrder::Ein,
        SortOrder::Name,
        SortOrder::Revenue,
        SortOrder::RevenueDesc,
    ])
}

fn term() -> impl Strategy<Value = Option<String>> {
    prop::option::of(prop::sample::select(WORDS.to_vec()).prop_map(str::to_string))
}

fn eins(index: &SearchIndex, engine: &QueryEngine, request: &SearchRequest) -> Vec<String> {
    let results = engine
        .search(index, &request.clone().page(0, engine.max_limit()))
        .unwrap();
    results
        .results
        .iter()
        .map(|hit| hit.organization.ein.to_string())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn pages_concatenate_to_full_result(
        rows in prop::collection::vec(row(), 1..60),
        term in term(),
        sort in sort_order(),
        limit in 1usize..7,
    ) {
        let index = build(&rows);
        let engine = QueryEngine::with_defaults();
        let base = SearchRequest { term, sort, ..Default::default() };
        let full = eins(&index, &engine, &base);

        let mut paged = Vec::new();
        let mut offset = 0;
        loop {
            let page = engine.search(&index, &base.clone().page(offset, limit)).unwrap();
            prop_assert!(page.results.len() <= limit);
            paged.extend(page.results.iter().map(|hit| hit.organization.ein.to_string()));
            match page.next_offset {
                Some(next) => {
                    prop_assert_eq!(next, offset + limit);
                    offset = next;
                }
                None => break,
            }
        }
        prop_assert_eq!(paged, full);
    }

    #[test]
    fn adding_a_filter_never_widens(
        rows in prop::collection::vec(row(), 1..60),
        term in term(),
        state in 0..STATES.len(),
        code in 0..CODES.len(),
        min in 0u64..1000,
    ) {
        let index = build(&rows);
        let engine = QueryEngine::with_defaults();

        let loose = SearchRequest {
            term: term.clone(),
            filters: Filters { state: Some(STATES[state].to_string()), ..Default::default() },
            ..Default::default()
        };
        let strict = SearchRequest {
            term,
            filters: Filters {
                state: Some(STATES[state].to_string()),
                category: Some(CODES[code][..1].to_string()),
                revenue: Range::new(Some(min), None),
                ..Default::default()
            },
            ..Default::default()
        };

        let loose_total = engine.search(&index, &loose).unwrap().total_matched;
        let strict_total = engine.search(&index, &strict).unwrap().total_matched;
        prop_assert!(strict_total <= loose_total);

        let loose_set: BTreeSet<_> = eins(&index, &engine, &loose).into_iter().collect();
        let strict_set: BTreeSet<_> = eins(&index, &engine, &strict).into_iter().collect();
        prop_assert!(strict_set.is_subset(&loose_set));
    }

    #[test]
    fn last_duplicate_wins(rows in prop::collection::vec(row(), 1..60)) {
        let index = build(&rows);
        let engine = QueryEngine::with_defaults();

        let mut last: HashMap<u32, &Row> = HashMap::new();
        for row in &rows {
            last.insert(row.ein, row);
        }
        prop_assert_eq!(index.len(), last.len());
        for (ein, row) in last {
            let stored = engine.organization(&index, &format!("{:09}", ein + 1)).unwrap();
            prop_assert_eq!(stored, &organization(row));
        }
    }
}

fn write_source(path: &std::path::Path, prefix: u32, count: u32) {
    let mut csv = String::from("EIN,NAME,STATE\n");
    for i in 0..count {
        csv.push_str(&format!("{:09},Shared Mission {},CA\n", prefix * 1000 + i, i));
    }
    std::fs::write(path, csv).unwrap();
}

#[test]
fn searches_see_one_generation_during_rebuilds() {
    let dir = tempfile::tempdir().unwrap();
    let small = dir.path().join("small.csv");
    let large = dir.path().join("large.csv");
    write_source(&small, 1, 20);
    write_source(&large, 2, 70);

    let mut config = AppConfig::default();
    config.import.chunk_rows = 7;
    let index = Arc::new(
        NonprofitIndex::open_with_transport(&config, &dir.path().join("data"), Arc::new(FileTransport))
            .unwrap(),
    );

    // Odd generations come from the small source, even ones from the large
    let expected = |generation: u64| match generation {
        0 => 0,
        g if g % 2 == 1 => 20,
        _ => 70,
    };

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let index = Arc::clone(&index);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut checked = 0u64;
                while !done.load(Ordering::Relaxed) {
                    let results = index
                        .search(&SearchRequest::term("shared mission").page(0, 5))
                        .unwrap();
                    assert_eq!(results.total_matched, expected(results.generation));
                    checked += 1;
                }
                checked
            })
        })
        .collect();

    for round in 0..6 {
        let source = if round % 2 == 0 { &small } else { &large };
        index
            .start_import(SourceDescriptor::new(vec![source.display().to_string()]))
            .unwrap();
        let job = index.wait_for_import().unwrap();
        assert_eq!(job.target_generation, Some(round + 1));
    }
    done.store(true, Ordering::Relaxed);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert_eq!(index.health().active_generation, 6);
}
