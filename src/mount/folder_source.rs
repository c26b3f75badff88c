//! `FolderMountSource` — a `MountSource` over a host directory, for
//! bind-mounting a real filesystem subtree into a union alongside archives
//! (spec.md §4.6).

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{RatarError, Result};
use crate::index::{EntryKind, FileEntry};
use crate::mount::{MountSource, SeekableReader, StatFs};
use crate::seekable::plain::PlainStream;
use crate::stencil::StenciledFile;

pub struct FolderMountSource {
    root: PathBuf,
}

impl FolderMountSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn host_path(&self, mount_path: &str) -> PathBuf {
        self.root.join(mount_path.trim_start_matches('/'))
    }

    fn entry_for(&self, mount_path: &str, host: &Path) -> Result<FileEntry> {
        let metadata = fs::symlink_metadata(host).map_err(|e| map_io_err(e, mount_path))?;
        let (path, name) = crate::mount::split_mount_path(mount_path);
        let kind = if metadata.is_dir() {
            EntryKind::Directory
        } else if metadata.file_type().is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::Regular
        };
        let linkname = if kind == EntryKind::Symlink {
            fs::read_link(host).ok().and_then(|p| p.to_str().map(str::to_owned))
        } else {
            None
        };
        Ok(FileEntry {
            path: path.to_string(),
            name: name.to_string(),
            offset_header: 0,
            offset_data: 0,
            size: metadata.len(),
            mtime: metadata.mtime(),
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            kind,
            linkname,
            is_nested_archive: false,
            version: 1,
            sparsity_map: None,
            nlink: metadata.nlink() as u32,
            extended_attrs_offset: None,
        })
    }
}

fn map_io_err(e: std::io::Error, path: &str) -> RatarError {
    match e.kind() {
        std::io::ErrorKind::NotFound => RatarError::NotFound(path.to_string()),
        std::io::ErrorKind::PermissionDenied => RatarError::PermissionDenied(path.to_string()),
        _ => RatarError::Io(e),
    }
}

impl MountSource for FolderMountSource {
    fn lookup(&self, path: &str) -> Result<Option<FileEntry>> {
        let host = self.host_path(path);
        match fs::symlink_metadata(&host) {
            Ok(_) => Ok(Some(self.entry_for(path, &host)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_io_err(e, path)),
        }
    }

    fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let host = self.host_path(path);
        let dir = path.trim_end_matches('/');
        let mut out = Vec::new();
        for entry in fs::read_dir(&host).map_err(|e| map_io_err(e, path))? {
            let entry = entry.map_err(|e| map_io_err(e, path))?;
            let child_path = format!("{dir}/{}", entry.file_name().to_string_lossy());
            out.push(self.entry_for(&child_path, &entry.path())?);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn open(&self, entry: &FileEntry) -> Result<SeekableReader> {
        let host = self.host_path(&entry.full_path());
        let file = fs::File::open(&host).map_err(|e| map_io_err(e, &entry.full_path()))?;
        let stream = Arc::new(Mutex::new(PlainStream::with_len(file, entry.size)));
        Ok(Arc::new(Mutex::new(StenciledFile::single(stream, 0, entry.size))))
    }

    fn versions(&self, _path: &str) -> Result<u32> {
        Ok(1)
    }

    fn get_version(&self, path: &str, n: u32) -> Result<Option<FileEntry>> {
        if n == 1 {
            self.lookup(path)
        } else {
            Ok(None)
        }
    }

    fn statfs(&self) -> Result<StatFs> {
        Ok(StatFs {
            block_size: 4096,
            total_blocks: 0,
            free_blocks: 0,
        })
    }

    fn extended_attrs(&self, _entry: &FileEntry) -> Result<HashMap<String, Vec<u8>>> {
        Ok(HashMap::new())
    }
}
