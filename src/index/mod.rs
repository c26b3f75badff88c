//! Persistent metadata index: in-memory row shapes (`model`) over a
//! SQLite-backed store (`sqlite`), per spec.md §3/§4.5.

pub mod model;
pub mod sqlite;

pub use model::{EntryKind, FileEntry, IndexMeta, OverlayState, SparseRun, SCHEMA_VERSION};
pub use sqlite::{default_index_path, IndexError, IndexResult, SqliteIndex};
