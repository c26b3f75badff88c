//! ratar-core — random-access indexing core for mounting large, possibly
//! compressed TAR archives read-only without ever extracting them.
//!
//! Layering (leaves first): `seekable` → `block_index` → `stencil` →
//! `index` → `tar` → `mount` (incl. `UnionMountSource`/`AutoMountLayer`/
//! `WriteOverlay`) → `fuse_adapter`.

pub mod block_index;
pub mod cache;
pub mod config;
pub mod error;
pub mod fuse_adapter;
pub mod index;
pub mod mount;
pub mod open;
pub mod perf;
pub mod recovery;
pub mod seekable;
pub mod stencil;
pub mod tar;

pub use config::Config;
pub use error::{ErrnoClass, RatarError, Result};
pub use fuse_adapter::FuseAdapter;
pub use index::{EntryKind, FileEntry, IndexMeta, SqliteIndex};
pub use mount::{MountSource, SeekableReader, StatFs};
pub use open::{open_or_build_index, open_seekable_stream, Backend};
pub use perf::CancellationToken;
pub use stencil::StenciledFile;
