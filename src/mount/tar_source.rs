//! `TarMountSource` — a `MountSource` backed by `TarIndexer` + `SqliteIndex`
//! over one `SeekableStream` (spec.md §4.4/§4.6).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{RatarError, Result};
use crate::index::{EntryKind, FileEntry, SqliteIndex};
use crate::mount::{split_mount_path, MountSource, SeekableReader, StatFs};
use crate::seekable::SeekableStream;
use crate::stencil::{Hole, Segment, StenciledFile};

pub struct TarMountSource {
    index: SqliteIndex,
    stream: Arc<Mutex<dyn SeekableStream>>,
}

impl TarMountSource {
    pub fn new(index: SqliteIndex, stream: Arc<Mutex<dyn SeekableStream>>) -> Self {
        Self { index, stream }
    }

    fn lookup_linked_entry(&self, linkname: &str) -> Result<Option<FileEntry>> {
        let normalized = if linkname.starts_with('/') {
            linkname.to_string()
        } else {
            format!("/{linkname}")
        };
        let (path, name) = split_mount_path(&normalized);
        Ok(self.index.lookup(path, name)?)
    }

    fn build_stencil(&self, entry: &FileEntry) -> Result<StenciledFile> {
        if entry.kind == EntryKind::Hardlink {
            let Some(linkname) = &entry.linkname else {
                return Err(RatarError::NotFound(format!(
                    "hardlink {} has no linkname",
                    entry.full_path()
                )));
            };
            let target = self
                .lookup_linked_entry(linkname)?
                .ok_or_else(|| RatarError::NotFound(format!("hardlink target {linkname} not found")))?;
            return Ok(StenciledFile::single(
                self.stream.clone(),
                target.offset_data,
                target.size,
            ));
        }

        if entry.kind == EntryKind::Sparse {
            let runs = entry.sparsity_map.as_deref().unwrap_or(&[]);
            if runs.is_empty() {
                return Err(RatarError::Unsupported(format!(
                    "{}: GNU sparse entry has no parseable sparse map",
                    entry.full_path()
                )));
            }
            let mut segments = Vec::new();
            let mut holes = Vec::new();
            let mut virtual_offset = 0u64;
            for run in runs {
                if run.hole_length > 0 {
                    holes.push(Hole {
                        virtual_offset,
                        len: run.hole_length,
                    });
                    virtual_offset += run.hole_length;
                }
                if run.data_length > 0 {
                    segments.push(Segment {
                        source: self.stream.clone(),
                        source_offset: entry.offset_data + run.data_offset,
                        virtual_offset,
                        len: run.data_length,
                    });
                    virtual_offset += run.data_length;
                }
            }
            return Ok(StenciledFile::new(segments, holes));
        }

        Ok(StenciledFile::single(self.stream.clone(), entry.offset_data, entry.size))
    }
}

impl MountSource for TarMountSource {
    fn lookup(&self, path: &str) -> Result<Option<FileEntry>> {
        let (dir, name) = split_mount_path(path);
        Ok(self.index.lookup(dir, name)?)
    }

    fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let dir = path.trim_end_matches('/');
        let dir = if dir.is_empty() { "/" } else { dir };
        Ok(self.index.list(dir)?)
    }

    fn open(&self, entry: &FileEntry) -> Result<SeekableReader> {
        let stencil = self.build_stencil(entry)?;
        Ok(Arc::new(Mutex::new(stencil)))
    }

    fn versions(&self, path: &str) -> Result<u32> {
        let (dir, name) = split_mount_path(path);
        Ok(self.index.version_count(dir, name)?)
    }

    fn get_version(&self, path: &str, n: u32) -> Result<Option<FileEntry>> {
        let (dir, name) = split_mount_path(path);
        Ok(self.index.get_version(dir, name, n)?)
    }

    fn statfs(&self) -> Result<StatFs> {
        let meta = self.index.read_meta()?;
        Ok(StatFs {
            block_size: 512,
            total_blocks: (meta.archive_size + 511) / 512,
            free_blocks: 0,
        })
    }

    fn extended_attrs(&self, _entry: &FileEntry) -> Result<HashMap<String, Vec<u8>>> {
        Ok(HashMap::new())
    }
}
