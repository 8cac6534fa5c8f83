pub mod build;
pub mod search_index;
pub mod shard;
pub mod stats;
pub mod store;
pub mod types;
pub mod writer;

pub use build::{BuildOptions, BuiltIndex, IndexBuilder};
pub use search_index::{RangeColumn, SearchIndex};
pub use store::IndexStore;
pub use types::*;
