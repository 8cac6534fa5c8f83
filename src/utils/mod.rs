//! Utility functions and data structures.
//!
//! This module provides shared utilities used throughout npsearch:
//!
//! ## Modules
//!
//! - [`app_data`] - Application data directory management and atomic file writes
//! - [`cancel`] - Cancellation flag shared by pipeline stages
//! - [`framing`] - Length-prefixed JSON frames (daemon protocol, staging, generations)
//! - [`progress`] - Progress bars that compile away without the `progress` feature
//! - [`tokenizer`] - Full-text tokenization shared by indexing and querying
//!
//! ## Key Functions
//!
//! ```no_run
//! use npsearch::utils::Tokenizer;
//!
//! let tokens = Tokenizer::default().tokens("Helping Hands Food Bank");
//! // Returns: ["helping", "hands", "food", "bank"]
//! ```

pub mod app_data;
pub mod cancel;
pub mod framing;
pub mod progress;
pub mod tokenizer;

pub use app_data::*;
pub use cancel::CancelToken;
pub use framing::*;
pub use tokenizer::*;
