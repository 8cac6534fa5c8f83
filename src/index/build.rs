use crate::config::IndexConfig;
use crate::error::IndexBuildError;
use crate::index::search_index::{RangeColumn, SearchIndex, StrMap};
use crate::index::shard::{PartialIndex, ShardBuilder, shard_of};
use crate::index::types::*;
use crate::utils::{CancelToken, Tokenizer};
use crossbeam_channel::bounded;
use rayon::prelude::*;
use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::thread;
use std::time::Instant;
use tracing::{debug, info};

/// Knobs for a build, usually taken from [`IndexConfig`]
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub shard_workers: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub tokenizer: Tokenizer,
    pub tf_cap: u8,
}

impl BuildOptions {
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            shard_workers: config.effective_shard_workers(),
            queue_capacity: config.shard_queue_capacity.max(1),
            batch_size: config.shard_batch_size.max(1),
            tokenizer: Tokenizer::new(config.min_token_len, config.max_token_len),
            tf_cap: config.tf_cap.max(1),
        }
    }
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self::from_config(&IndexConfig::default())
    }
}

/// A finished generation plus what it took to build it
#[derive(Debug)]
pub struct BuiltIndex {
    pub index: SearchIndex,
    /// Records consumed from the input
    pub records: u64,
    /// Records replaced by a later occurrence of the same EIN
    pub duplicates: u64,
}

/// Builds immutable generations from a stream of staged records.
///
/// Records are dispatched in batches to shard workers over bounded channels,
/// so a slow shard blocks the producer instead of buffering. Any failure
/// (input error, shard error or panic, cancellation) discards everything.
pub struct IndexBuilder {
    options: BuildOptions,
    cancel: CancelToken,
}

impl IndexBuilder {
    pub fn new(options: BuildOptions, cancel: CancelToken) -> Self {
        Self { options, cancel }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn build<I>(
        &self,
        records: I,
        generation: Generation,
        source_job: Option<String>,
    ) -> Result<BuiltIndex, IndexBuildError>
    where
        I: IntoIterator<Item = Result<StagedRecord, IndexBuildError>>,
    {
        let start = Instant::now();
        let shards = self.options.shard_workers.max(1);
        let batch_size = self.options.batch_size.max(1);

        let (dispatched, results) = thread::scope(|scope| {
            let mut senders = Vec::with_capacity(shards);
            let mut handles = Vec::with_capacity(shards);

            for shard in 0..shards {
                let (tx, rx) = bounded::<Vec<StagedRecord>>(self.options.queue_capacity.max(1));
                senders.push(tx);
                let cancel = self.cancel.clone();
                let tokenizer = self.options.tokenizer;
                let tf_cap = self.options.tf_cap;

                handles.push(scope.spawn(move || -> Result<PartialIndex, IndexBuildError> {
                    let mut builder = ShardBuilder::new(shard);
                    for batch in rx {
                        if cancel.is_cancelled() {
                            return Err(IndexBuildError::Cancelled);
                        }
                        for record in batch {
                            builder.add(record);
                        }
                    }
                    debug!(shard, docs = builder.len(), "Shard input drained");
                    Ok(builder.finish(&tokenizer, tf_cap))
                }));
            }

            let dispatched = (|| -> Result<u64, IndexBuildError> {
                let mut batches: Vec<Vec<StagedRecord>> =
                    (0..shards).map(|_| Vec::with_capacity(batch_size)).collect();
                let mut count = 0u64;

                for record in records {
                    let record = record?;
                    count += 1;
                    let shard = shard_of(&record.org.ein, shards);
                    batches[shard].push(record);

                    if batches[shard].len() >= batch_size {
                        if self.cancel.is_cancelled() {
                            return Err(IndexBuildError::Cancelled);
                        }
                        let batch = std::mem::replace(&mut batches[shard], Vec::with_capacity(batch_size));
                        if senders[shard].send(batch).is_err() {
                            // Worker is gone; its join result carries the cause
                            return Ok(count);
                        }
                    }
                }

                for (shard, batch) in batches.into_iter().enumerate() {
                    if !batch.is_empty() && senders[shard].send(batch).is_err() {
                        return Ok(count);
                    }
                }
                Ok(count)
            })();

            // Closing the channels lets workers finish (or notice the error)
            drop(senders);

            let results: Vec<Result<PartialIndex, IndexBuildError>> = handles
                .into_iter()
                .enumerate()
                .map(|(shard, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(IndexBuildError::ShardFailed {
                            shard,
                            reason: "worker panicked".to_string(),
                        })
                    })
                })
                .collect();

            (dispatched, results)
        });

        let records = dispatched?;
        let partials = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        if self.cancel.is_cancelled() {
            return Err(IndexBuildError::Cancelled);
        }

        let received: u64 = partials.iter().map(|p| p.records).sum();
        if received != records {
            return Err(IndexBuildError::ShardFailed {
                shard: 0,
                reason: format!("dispatched {} records but shards received {}", records, received),
            });
        }
        let duplicates = partials.iter().map(|p| p.duplicates).sum();

        let meta = IndexMeta {
            generation,
            source_job,
            built_at: chrono::Utc::now().timestamp(),
            ..Default::default()
        };
        let index = merge(partials, self.options.tokenizer, meta);

        info!(
            generation,
            records,
            duplicates,
            docs = index.len(),
            terms = index.term_count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Index generation built"
        );

        Ok(BuiltIndex {
            index,
            records,
            duplicates,
        })
    }
}

/// Combine shard partials into one generation with global EIN-ordered doc ids
pub fn merge(mut partials: Vec<PartialIndex>, tokenizer: Tokenizer, mut meta: IndexMeta) -> SearchIndex {
    // Global EIN order. Shards never share an EIN, and each shard is already
    // sorted, so the order is consistent with every shard's local order.
    let mut order: Vec<(usize, DocId)> = partials
        .iter()
        .enumerate()
        .flat_map(|(shard, p)| (0..p.docs.len() as DocId).map(move |local| (shard, local)))
        .collect();
    order.par_sort_unstable_by(|a, b| {
        partials[a.0].docs[a.1 as usize]
            .ein
            .cmp(&partials[b.0].docs[b.1 as usize].ein)
    });

    let mut remap: Vec<Vec<DocId>> = partials
        .iter()
        .map(|p| Vec::with_capacity(p.docs.len()))
        .collect();
    for (global, &(shard, _)) in order.iter().enumerate() {
        remap[shard].push(global as DocId);
    }

    let mut shard_docs: Vec<std::vec::IntoIter<Organization>> = partials
        .iter_mut()
        .map(|p| std::mem::take(&mut p.docs).into_iter())
        .collect();
    let docs: Vec<Organization> = order
        .iter()
        .filter_map(|&(shard, _)| shard_docs[shard].next())
        .collect();

    // Local -> global doc ids
    partials
        .par_iter_mut()
        .zip(remap.par_iter())
        .for_each(|(partial, ids)| {
            for list in partial.postings.values_mut() {
                for posting in list.iter_mut() {
                    posting.doc_id = ids[posting.doc_id as usize];
                }
            }
        });

    let mut terms: StrMap<Vec<Posting>> = StrMap::default();
    for partial in partials.iter_mut() {
        for (term, list) in partial.postings.drain() {
            terms.entry(term).or_default().extend(list);
        }
    }
    terms
        .par_iter_mut()
        .for_each(|(_, list)| list.sort_unstable_by_key(|p| p.doc_id));

    let ((states, categories, cities), (revenue, assets, name_order)) = rayon::join(
        || {
            let mut states: StrMap<RoaringBitmap> = StrMap::default();
            let mut categories: HashMap<NteeCategory, RoaringBitmap, ahash::RandomState> =
                HashMap::default();
            let mut cities: StrMap<RoaringBitmap> = StrMap::default();
            for (partial, ids) in partials.iter().zip(remap.iter()) {
                let global = |local: &DocId| ids[*local as usize];
                for (state, locals) in &partial.states {
                    states.entry(state.clone()).or_default().extend(locals.iter().map(global));
                }
                for (category, locals) in &partial.categories {
                    categories.entry(*category).or_default().extend(locals.iter().map(global));
                }
                for (city, locals) in &partial.cities {
                    cities.entry(city.clone()).or_default().extend(locals.iter().map(global));
                }
            }
            (states, categories, cities)
        },
        || {
            let column = |value: fn(&Organization) -> u64| {
                let mut pairs: Vec<(u64, DocId)> = docs
                    .par_iter()
                    .enumerate()
                    .map(|(i, org)| (value(org), i as DocId))
                    .collect();
                pairs.par_sort_unstable();
                RangeColumn::new(pairs)
            };
            let revenue = column(|org| org.revenue);
            let assets = column(|org| org.assets);

            let mut names: Vec<(String, DocId)> = docs
                .par_iter()
                .enumerate()
                .map(|(i, org)| (org.name.to_lowercase(), i as DocId))
                .collect();
            names.par_sort_unstable();
            let name_order = names.into_iter().map(|(_, doc)| doc).collect::<Vec<_>>();
            (revenue, assets, name_order)
        },
    );

    let all: RoaringBitmap = (0..docs.len() as DocId).collect();
    meta.doc_count = docs.len() as u32;
    meta.term_count = terms.len() as u32;

    SearchIndex {
        meta,
        tokenizer,
        docs,
        terms,
        states,
        categories,
        cities,
        revenue,
        assets,
        name_order,
        all,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(seq: u64, ein: &str, name: &str, state: &str, revenue: u64) -> StagedRecord {
        let mut org = Organization::new(Ein::parse(ein).unwrap(), name);
        org.state = state.to_string();
        org.revenue = revenue;
        StagedRecord { seq, org }
    }

    fn options(shards: usize) -> BuildOptions {
        BuildOptions {
            shard_workers: shards,
            queue_capacity: 2,
            batch_size: 2,
            ..Default::default()
        }
    }

    fn sample() -> Vec<StagedRecord> {
        vec![
            staged(0, "300000000", "Zeta Food Bank", "CA", 500),
            staged(1, "100000000", "Alpha Food Pantry", "NY", 1_000),
            staged(2, "200000000", "Beta Arts Council", "CA", 50),
            staged(3, "100000000", "Alpha Food Pantry Renamed", "NY", 2_000),
            staged(4, "400000000", "Gamma Shelter", "", 0),
        ]
    }

    fn build(shards: usize, records: Vec<StagedRecord>) -> BuiltIndex {
        IndexBuilder::new(options(shards), CancelToken::new())
            .build(records.into_iter().map(Ok), 7, Some("job".to_string()))
            .unwrap()
    }

    #[test]
    fn test_docs_in_ein_order_with_last_write_wins() {
        let built = build(3, sample());
        let index = &built.index;

        assert_eq!(built.records, 5);
        assert_eq!(built.duplicates, 1);
        assert_eq!(index.generation(), 7);
        assert_eq!(index.meta().doc_count, 4);
        let eins: Vec<&str> = index.documents().iter().map(|o| o.ein.as_str()).collect();
        assert_eq!(eins, vec!["100000000", "200000000", "300000000", "400000000"]);
        assert_eq!(index.documents()[0].name, "Alpha Food Pantry Renamed");
    }

    #[test]
    fn test_shard_count_does_not_change_result() {
        let one = build(1, sample()).index;
        let many = build(4, sample()).index;

        assert_eq!(one.documents(), many.documents());
        for term in ["food", "alpha", "renamed", "shelter"] {
            assert_eq!(
                one.postings(term).iter().map(|p| p.doc_id).collect::<Vec<_>>(),
                many.postings(term).iter().map(|p| p.doc_id).collect::<Vec<_>>()
            );
        }
        assert_eq!(one.name_order(), many.name_order());
    }

    #[test]
    fn test_structured_maps() {
        let index = build(2, sample()).index;
        let ca: Vec<u32> = index.state("CA").unwrap().iter().collect();
        assert_eq!(ca, vec![1, 2]);
        assert!(index.state("TX").is_none());
        assert_eq!(index.revenue().range(Some(100), None).len(), 2);
        assert_eq!(index.revenue().descending().collect::<Vec<_>>(), vec![0, 2, 1, 3]);
        assert_eq!(index.all().len(), 4);
        // alpha, beta, gamma, zeta
        assert_eq!(index.name_order(), &[0, 1, 3, 2]);
    }

    #[test]
    fn test_input_error_discards_build() {
        let records = vec![
            Ok(staged(0, "100000000", "A", "", 0)),
            Err(IndexBuildError::Corrupt {
                path: "staged.bin".into(),
                reason: "torn".to_string(),
            }),
        ];
        let result = IndexBuilder::new(options(2), CancelToken::new()).build(records, 1, None);
        assert!(matches!(result, Err(IndexBuildError::Corrupt { .. })));
    }

    #[test]
    fn test_cancelled_build() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = IndexBuilder::new(options(2), cancel)
            .build(sample().into_iter().map(Ok), 1, None);
        assert!(matches!(result, Err(IndexBuildError::Cancelled)));
    }

    #[test]
    fn test_empty_input() {
        let built = build(2, Vec::new());
        assert!(built.index.is_empty());
        assert_eq!(built.index.term_count(), 0);
    }
}
