//! `SquashFsMountSource` — illustrative stub showing how a non-TAR format
//! plugs into the `MountSource` trait without touching `UnionMountSource`,
//! `AutoMountLayer`, or `WriteOverlay`. A real implementation would parse
//! the SquashFS superblock and inode table the way `tar::indexer` parses
//! TAR headers; this stub only proves the seam exists, matching spec.md
//! §4.6's list of backings sharing "the same trait" without each one being
//! in scope here.

use std::collections::HashMap;

use crate::error::{RatarError, Result};
use crate::index::FileEntry;
use crate::mount::{MountSource, SeekableReader, StatFs};

pub struct SquashFsMountSource {
    archive_path: std::path::PathBuf,
}

impl SquashFsMountSource {
    pub fn new(archive_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            archive_path: archive_path.into(),
        }
    }
}

impl MountSource for SquashFsMountSource {
    fn lookup(&self, _path: &str) -> Result<Option<FileEntry>> {
        Err(RatarError::Unsupported(format!(
            "SquashFS parsing not implemented ({})",
            self.archive_path.display()
        )))
    }

    fn list(&self, _path: &str) -> Result<Vec<FileEntry>> {
        Err(RatarError::Unsupported("SquashFS parsing not implemented".to_string()))
    }

    fn open(&self, _entry: &FileEntry) -> Result<SeekableReader> {
        Err(RatarError::Unsupported("SquashFS parsing not implemented".to_string()))
    }

    fn versions(&self, _path: &str) -> Result<u32> {
        Ok(0)
    }

    fn get_version(&self, _path: &str, _n: u32) -> Result<Option<FileEntry>> {
        Ok(None)
    }

    fn statfs(&self) -> Result<StatFs> {
        Ok(StatFs {
            block_size: 131072,
            total_blocks: 0,
            free_blocks: 0,
        })
    }

    fn extended_attrs(&self, _entry: &FileEntry) -> Result<HashMap<String, Vec<u8>>> {
        Ok(HashMap::new())
    }
}
