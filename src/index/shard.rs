//! Per-shard accumulation.
//!
//! Each shard worker owns one [`ShardBuilder`]. Records for a given EIN always
//! land on the same shard, so last-write-wins is settled locally by comparing
//! pass positions. `finish` turns the survivors into a [`PartialIndex`] whose
//! doc ids are local to the shard.

use crate::index::search_index::StrMap;
use crate::index::types::*;
use crate::utils::Tokenizer;
use rustc_hash::FxHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Deterministic shard for an EIN
pub fn shard_of(ein: &Ein, shards: usize) -> usize {
    let mut hasher = FxHasher::default();
    ein.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

pub struct ShardBuilder {
    shard: usize,
    latest: HashMap<Ein, StagedRecord, ahash::RandomState>,
    records: u64,
    duplicates: u64,
}

/// A shard's slice of the index, with doc ids local to the shard
#[derive(Debug, Default)]
pub struct PartialIndex {
    pub shard: usize,
    /// Sorted by EIN; local doc id = position
    pub docs: Vec<Organization>,
    pub postings: StrMap<Vec<Posting>>,
    pub states: StrMap<Vec<DocId>>,
    pub categories: HashMap<NteeCategory, Vec<DocId>, ahash::RandomState>,
    pub cities: StrMap<Vec<DocId>>,
    pub records: u64,
    pub duplicates: u64,
}

impl ShardBuilder {
    pub fn new(shard: usize) -> Self {
        Self {
            shard,
            latest: HashMap::default(),
            records: 0,
            duplicates: 0,
        }
    }

    /// Add a record; a later pass position replaces an earlier one
    pub fn add(&mut self, record: StagedRecord) {
        self.records += 1;
        match self.latest.get_mut(&record.org.ein) {
            Some(existing) => {
                self.duplicates += 1;
                if record.seq >= existing.seq {
                    *existing = record;
                }
            }
            None => {
                self.latest.insert(record.org.ein.clone(), record);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    pub fn finish(self, tokenizer: &Tokenizer, tf_cap: u8) -> PartialIndex {
        let mut docs: Vec<Organization> = self.latest.into_values().map(|r| r.org).collect();
        docs.sort_unstable_by(|a, b| a.ein.cmp(&b.ein));

        let mut partial = PartialIndex {
            shard: self.shard,
            records: self.records,
            duplicates: self.duplicates,
            ..Default::default()
        };

        for (local, org) in docs.iter().enumerate() {
            let doc_id = local as DocId;
            index_text(&mut partial.postings, doc_id, org, tokenizer, tf_cap);

            if !org.state.is_empty() {
                push_key(&mut partial.states, &org.state, doc_id);
            }
            partial.categories.entry(org.category).or_default().push(doc_id);
            let city = org.city.trim().to_lowercase();
            if !city.is_empty() {
                push_key(&mut partial.cities, &city, doc_id);
            }
        }

        partial.docs = docs;
        partial
    }
}

fn push_key(map: &mut StrMap<Vec<DocId>>, key: &str, doc_id: DocId) {
    match map.get_mut(key) {
        Some(ids) => ids.push(doc_id),
        None => {
            map.insert(key.to_string(), vec![doc_id]);
        }
    }
}

/// Name tokens feed `name_tf`; EIN, street and city feed `secondary_tf`
fn index_text(
    postings: &mut StrMap<Vec<Posting>>,
    doc_id: DocId,
    org: &Organization,
    tokenizer: &Tokenizer,
    tf_cap: u8,
) {
    let cap = |n: u32| n.min(tf_cap.max(1) as u32) as u8;

    let mut fields: StrMap<(u8, u8)> = StrMap::default();
    for (term, tf) in tokenizer.term_frequencies(&org.name) {
        fields.entry(term).or_default().0 = cap(tf);
    }
    let secondary = format!("{} {} {}", org.ein, org.street, org.city);
    for (term, tf) in tokenizer.term_frequencies(&secondary) {
        fields.entry(term).or_default().1 = cap(tf);
    }

    for (term, (name_tf, secondary_tf)) in fields {
        let posting = Posting {
            doc_id,
            name_tf,
            secondary_tf,
        };
        match postings.get_mut(&term) {
            Some(list) => list.push(posting),
            None => {
                postings.insert(term, vec![posting]);
            }
        }
    }
}
