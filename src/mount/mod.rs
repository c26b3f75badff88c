//! `MountSource` — the uniform filesystem contract every backing
//! implements, spec.md §4.6. A single trait with several implementers
//! dispatched as `Box<dyn MountSource>`, the re-architecting called for in
//! spec.md §9 in place of runtime-type-tagged dynamic composition, mirrored
//! on the teacher's `codec::Codec` trait + `get_codec` factory dispatch.

pub mod auto_mount;
pub mod folder_source;
pub mod overlay;
pub mod squashfs_stub;
pub mod tar_source;
pub mod union_source;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::index::FileEntry;
use crate::stencil::StenciledFile;

#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub block_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
}

pub type SeekableReader = Arc<Mutex<StenciledFile>>;

/// All backings expose this surface; `UnionMountSource`, `AutoMountLayer`,
/// and `WriteOverlay` each wrap a `Box<dyn MountSource>` (or several) and
/// implement it themselves, so composition is just nesting boxed trait
/// objects.
pub trait MountSource: Send + Sync {
    fn lookup(&self, path: &str) -> Result<Option<FileEntry>>;

    /// One directory level, attributes included so `readdir+` needs only
    /// one pass (spec.md §4.6).
    fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    fn open(&self, entry: &FileEntry) -> Result<SeekableReader>;

    fn versions(&self, path: &str) -> Result<u32>;

    fn get_version(&self, path: &str, n: u32) -> Result<Option<FileEntry>>;

    fn statfs(&self) -> Result<StatFs>;

    /// Optional; backings without extended attribute support return an
    /// empty map rather than an error.
    fn extended_attrs(&self, _entry: &FileEntry) -> Result<HashMap<String, Vec<u8>>> {
        Ok(HashMap::new())
    }
}

/// Split `/a/b/c` into parent dir `/a/b` and base name `c`, the inverse of
/// `FileEntry::full_path`.
pub fn split_mount_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return ("/", "");
    }
    match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None => ("/", trimmed),
    }
}
