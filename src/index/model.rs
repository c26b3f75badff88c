//! In-memory shapes of the persisted index rows — spec.md §3's data model,
//! kept separate from `sqlite.rs` so the schema mapping is the only place
//! that knows about column order, the same separation the teacher draws
//! between `block.rs`'s `BlockHeader` and its on-disk byte layout.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryKind {
    Regular = 0,
    Directory = 1,
    Symlink = 2,
    Hardlink = 3,
    BlockDevice = 4,
    CharDevice = 5,
    Fifo = 6,
    Sparse = 7,
}

impl EntryKind {
    pub fn from_db(v: i64) -> Option<Self> {
        Some(match v {
            0 => Self::Regular,
            1 => Self::Directory,
            2 => Self::Symlink,
            3 => Self::Hardlink,
            4 => Self::BlockDevice,
            5 => Self::CharDevice,
            6 => Self::Fifo,
            7 => Self::Sparse,
            _ => return None,
        })
    }
}

/// One `(data_offset, data_length, hole_length)` run in a GNU sparse file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SparseRun {
    pub data_offset: u64,
    pub data_length: u64,
    pub hole_length: u64,
}

/// One row of `files` — spec.md §3's `FileEntry`.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: String,
    pub name: String,
    pub offset_header: u64,
    pub offset_data: u64,
    pub size: u64,
    pub mtime: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub kind: EntryKind,
    pub linkname: Option<String>,
    pub is_nested_archive: bool,
    pub version: u32,
    pub sparsity_map: Option<Vec<SparseRun>>,
    /// Supplements spec.md's base `FileEntry`: reported to the FUSE host's
    /// `getattr` nlink field, which the spec's §6 callback mapping fixes at
    /// 1 for regular files but which must reflect the true hardlink count
    /// for directories (`2 + number of subdirectories`, the POSIX
    /// convention every `stat(2)` caller expects).
    pub nlink: u32,
    /// Byte offset into the `files` staging blob where this entry's
    /// extended attribute map (if any) is stored; `None` when the entry has
    /// none. Kept out of the hot `FileEntry` struct itself so the common
    /// case doesn't carry a `HashMap` per row.
    pub extended_attrs_offset: Option<u64>,
}

impl FileEntry {
    pub fn full_path(&self) -> String {
        if self.path.is_empty() || self.path == "/" {
            format!("/{}", self.name)
        } else {
            format!("{}/{}", self.path.trim_end_matches('/'), self.name)
        }
    }
}

/// One row of `meta` — spec.md §3's `IndexMeta`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub archive_size: u64,
    pub archive_mtime: i64,
    pub backend_name: String,
    pub backend_version: String,
    pub gnu_incremental: bool,
    pub ignore_zeros: bool,
    pub gzip_checkpoint_spacing: u64,
    pub schema_version: u32,
    pub options: std::collections::BTreeMap<String, String>,
}

pub const SCHEMA_VERSION: u32 = 1;

/// spec.md §3's `OverlayState`: deletions + renames, materialized from
/// `overlay.sqlite`'s two tables.
#[derive(Debug, Clone, Default)]
pub struct OverlayState {
    pub deletions: std::collections::BTreeSet<String>,
    pub renames: std::collections::BTreeMap<String, String>,
}

impl OverlayState {
    /// Resolve `path` through the renames map, recursively rewriting the
    /// longest matching ancestor prefix (directory renames are recursive
    /// per spec.md §4.9).
    pub fn resolve(&self, path: &str) -> Option<String> {
        if self.deletions.contains(path) {
            return None;
        }
        if let Some(new) = self.renames.get(path) {
            return Some(new.clone());
        }
        let mut best: Option<(&str, &str)> = None;
        for (old, new) in &self.renames {
            let prefix = format!("{old}/");
            if path.starts_with(&prefix) {
                if best.map(|(o, _)| o.len() < old.len()).unwrap_or(true) {
                    best = Some((old, new));
                }
            }
        }
        match best {
            Some((old, new)) => Some(path.replacen(old, new, 1)),
            None => Some(path.to_string()),
        }
    }
}
