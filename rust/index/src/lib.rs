pub mod config;
mod fixup;
pub mod format;
mod index;
pub mod kmeans;
mod metrics;
pub mod partition;
pub mod quantization;
pub mod randomize;
mod search;
pub mod search_set;
pub mod store;
mod types;

// Re-export types

pub use config::*;
pub use format::{FormatOptions, IndexStats, LevelStats};
pub use index::*;
pub use metrics::FixupStats;
pub use partition::Partition;
pub use quantization::{QuantizedVectorSet, Quantizer};
pub use randomize::RandomOrthoTransformer;
pub use search_set::{calculate_recall, SearchResult, SearchSet, SearchStats};
pub use store::{InMemoryStore, InMemoryTxn, Store, StoreError, Txn};
pub use types::*;
