//! # npsearch - Nonprofit Registry Search
//!
//! npsearch ingests the IRS Exempt Organizations Business Master File (and
//! compatible CSV extracts), normalizes each row into an [`index::Organization`],
//! builds an immutable in-memory search index and answers full-text and
//! filtered queries against it.
//!
//! ## Architecture
//!
//! - [`fetch`] - Resumable, retrying retrieval of raw source files
//! - [`normalize`] - Row parsing and coercion into canonical records
//! - [`import`] - Job state machine, staging and the fetch/normalize pipeline
//! - [`index`] - Sharded index build, generations and the atomic swap
//! - [`query`] - Query parsing, filter planning, ranking and export
//! - [`service`] - [`NonprofitIndex`], the facade over all of the above
//! - [`server`] - Unix daemon keeping the index warm (feature `daemon`)
//! - [`output`] - Terminal rendering
//! - [`utils`] - Tokenizer, framing, app data paths
//!
//! ## Quick Start
//!
//! ```no_run
//! use npsearch::config::AppConfig;
//! use npsearch::fetch::SourceDescriptor;
//! use npsearch::query::SearchRequest;
//! use npsearch::NonprofitIndex;
//! use std::path::Path;
//!
//! let config = AppConfig::default();
//! let index = NonprofitIndex::open(&config, Path::new("/var/lib/npsearch")).unwrap();
//!
//! index
//!     .start_import(SourceDescriptor::new(config.fetch.default_sources.clone()))
//!     .unwrap();
//! index.wait_for_import();
//!
//! let results = index.search(&SearchRequest::term("food bank")).unwrap();
//! for hit in results.results {
//!     println!("{} {}", hit.organization.ein, hit.organization.name);
//! }
//! ```
//!
//! ## Consistency
//!
//! Readers pin one generation per request. An import builds the next
//! generation beside the active one and swaps it in with a single atomic
//! store, so every search and export sees exactly one complete generation.

pub mod config;
pub mod error;
pub mod fetch;
pub mod import;
pub mod index;
pub mod normalize;
pub mod output;
pub mod query;
#[cfg(all(unix, feature = "daemon"))]
pub mod server;
pub mod service;
pub mod utils;

pub use service::{Health, NonprofitIndex};
