//! Index build and query benchmarks over a synthetic registry.
//!
//! Run with: `cargo bench`
//! Save baseline: `cargo bench -- --save-baseline main`
//! Compare: `cargo bench -- --baseline main`

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use npsearch::index::{BuildOptions, Ein, IndexBuilder, NteeCategory, Organization, SearchIndex, StagedRecord};
use npsearch::normalize::{Schema, SchemaVersion, normalize_row, parse_line};
use npsearch::query::{Filters, QueryEngine, Range, SearchRequest, SortOrder, parse_query};
use npsearch::utils::CancelToken;
use std::hint::black_box;

const WORDS: [&str; 16] = [
    "community", "food", "bank", "arts", "foundation", "river", "valley", "health",
    "education", "youth", "league", "church", "animal", "rescue", "historical", "society",
];
const STATES: [&str; 8] = ["CA", "NY", "TX", "FL", "WA", "IL", "OH", "MA"];
const CATEGORIES: [&str; 6] = ["A20", "B30", "E40", "K31", "P20", "X20"];

fn organizations(count: usize) -> Vec<StagedRecord> {
    (0..count)
        .map(|i| {
            let name = format!(
                "{} {} {}",
                WORDS[i % WORDS.len()],
                WORDS[(i / 7) % WORDS.len()],
                WORDS[(i / 53) % WORDS.len()]
            );
            let mut org = Organization::new(Ein::parse(&format!("{:09}", i + 1)).unwrap(), name);
            org.state = STATES[i % STATES.len()].to_string();
            org.city = format!("City {}", i % 97);
            org.ntee_code = CATEGORIES[i % CATEGORIES.len()].to_string();
            org.category = NteeCategory::from_code(&org.ntee_code);
            org.revenue = (i as u64 * 7919) % 5_000_000;
            org.assets = (i as u64 * 104_729) % 20_000_000;
            StagedRecord { seq: i as u64, org }
        })
        .collect()
}

fn build(records: &[StagedRecord]) -> SearchIndex {
    IndexBuilder::new(BuildOptions::default(), CancelToken::new())
        .build(records.iter().cloned().map(Ok), 1, None)
        .unwrap()
        .index
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    group.sample_size(10);
    for count in [10_000usize, 100_000] {
        let records = organizations(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &records, |b, records| {
            b.iter(|| black_box(build(records)))
        });
    }
    group.finish();
}

fn bench_normalize(c: &mut Criterion) {
    let header = "EIN,NAME,STREET,CITY,STATE,ZIP,NTEE_CD,ASSET_AMT,INCOME_AMT,REVENUE_AMT";
    let schema = Schema::from_header(header, SchemaVersion::default(), b',').unwrap();
    let rows: Vec<_> = (0..1000)
        .map(|i| {
            format!(
                "{:09},\"Helping Hands, Inc.\",1 Main St,Springfield,IL,62701-0001,P20,{},{},{}",
                i + 1,
                i * 100,
                i * 50,
                i * 25
            )
        })
        .map(|line| parse_line(line.as_bytes(), b','))
        .collect();

    let mut group = c.benchmark_group("normalize");
    group.throughput(Throughput::Elements(rows.len() as u64));
    group.bench_function("1000_rows", |b| {
        b.iter(|| {
            for (i, row) in rows.iter().enumerate() {
                let _ = black_box(normalize_row(row, &schema, i as u64));
            }
        })
    });
    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let index = build(&organizations(100_000));
    let engine = QueryEngine::with_defaults();

    let requests = [
        ("term", SearchRequest::term("food bank")),
        (
            "term_state",
            SearchRequest::term("community health").with_filters(Filters {
                state: Some("CA".to_string()),
                ..Default::default()
            }),
        ),
        (
            "filter_only_revenue_sort",
            SearchRequest::default()
                .with_filters(Filters {
                    revenue: Range::new(Some(1_000_000), None),
                    ..Default::default()
                })
                .with_sort(SortOrder::RevenueDesc),
        ),
        ("parsed", parse_query("youth league state:TX ntee:N rev:>100000").unwrap()),
    ];

    let mut group = c.benchmark_group("query");
    for (name, request) in &requests {
        group.bench_function(*name, |b| {
            b.iter(|| black_box(engine.search(&index, request).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_build, bench_normalize, bench_query);
criterion_main!(benches);
