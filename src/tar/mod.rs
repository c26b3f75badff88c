//! TAR format parsing and one-pass indexing — spec.md §4.4.

pub mod header;
pub mod indexer;

pub use header::{RawHeader, TarError, TarResult, TypeFlag, BLOCK_SIZE};
pub use indexer::{IndexBuild, IndexWarning, IndexerOptions, TarIndexer};
