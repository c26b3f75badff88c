//! Minimal mapping of FUSE-style filesystem callbacks to `MountSource`
//! operations, spec.md §6. The FUSE host binding itself (fuser/libfuse
//! glue, request plumbing) is out of scope; this module is the contract a
//! host adapter calls into.

use std::sync::Arc;

use crate::error::{ErrnoClass, RatarError, Result};
use crate::index::{EntryKind, FileEntry};
use crate::mount::{split_mount_path, MountSource, SeekableReader};

#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blocks: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

impl From<&FileEntry> for Attr {
    fn from(e: &FileEntry) -> Self {
        Self {
            size: e.size,
            mode: e.mode,
            mtime: e.mtime,
            nlink: e.nlink.max(1),
            uid: e.uid,
            gid: e.gid,
            blocks: (e.size + 511) / 512,
            is_dir: e.kind == EntryKind::Directory,
            is_symlink: e.kind == EntryKind::Symlink,
        }
    }
}

/// Parses `<name>.versions/<N>` out of a lookup path, since it isn't a
/// real entry in any index — spec.md §6 "special paths".
fn parse_versions_suffix(path: &str) -> Option<(String, u32)> {
    let (dir, name) = split_mount_path(path);
    let (base, n) = name.split_once('/')?;
    let base = base.strip_suffix(".versions")?;
    let n: u32 = n.parse().ok()?;
    let base_path = if dir == "/" {
        format!("/{base}")
    } else {
        format!("{dir}/{base}")
    };
    Some((base_path, n))
}

pub struct FuseAdapter {
    root: Arc<dyn MountSource>,
}

impl FuseAdapter {
    pub fn new(root: Arc<dyn MountSource>) -> Self {
        Self { root }
    }

    /// `getattr(path) <- lookup(path)`.
    pub fn getattr(&self, path: &str) -> Result<Attr> {
        if let Some((base_path, n)) = parse_versions_suffix(path) {
            let (dir, name) = split_mount_path(&base_path);
            let count = self.root.versions(&base_path)?;
            if n == 0 || n > count {
                return Err(RatarError::NotFound(path.to_string()));
            }
            let entry = self
                .root
                .get_version(&format!("{dir}/{name}"), n)?
                .ok_or_else(|| RatarError::NotFound(path.to_string()))?;
            return Ok(Attr::from(&entry));
        }
        let entry = self
            .root
            .lookup(path)?
            .ok_or_else(|| RatarError::NotFound(path.to_string()))?;
        Ok(Attr::from(&entry))
    }

    /// `readdir(path)` — emits attributes inline to avoid N x `getattr`.
    pub fn readdir(&self, path: &str) -> Result<Vec<(String, Attr)>> {
        let entries = self.root.list(path)?;
        Ok(entries.iter().map(|e| (e.name.clone(), Attr::from(e))).collect())
    }

    /// `open(path, flags)` — write flags are rejected unless an overlay is
    /// configured, which in this layering means `root` must itself be a
    /// `WriteOverlay`; enforcing that is the caller's responsibility when
    /// constructing the mount stack, not this adapter's.
    pub fn open(&self, path: &str, write_requested: bool, overlay_configured: bool) -> Result<SeekableReader> {
        if write_requested && !overlay_configured {
            return Err(RatarError::PermissionDenied(format!(
                "{path}: mount has no write overlay configured"
            )));
        }
        let entry = self
            .root
            .lookup(path)?
            .ok_or_else(|| RatarError::NotFound(path.to_string()))?;
        self.root.open(&entry)
    }

    pub fn read(&self, reader: &SeekableReader, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut stream = reader.lock().expect("stencil mutex poisoned");
        stream
            .seek(offset as i64, crate::seekable::Whence::Start)
            .map_err(RatarError::from)?;
        let mut buf = vec![0u8; len];
        let mut total = 0;
        while total < len {
            let n = stream.read(&mut buf[total..]).map_err(RatarError::from)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        buf.truncate(total);
        Ok(buf)
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        let entry = self
            .root
            .lookup(path)?
            .ok_or_else(|| RatarError::NotFound(path.to_string()))?;
        entry
            .linkname
            .ok_or_else(|| RatarError::Unsupported(format!("{path} is not a symlink")))
    }

    pub fn listxattr(&self, path: &str) -> Result<Vec<String>> {
        let entry = self
            .root
            .lookup(path)?
            .ok_or_else(|| RatarError::NotFound(path.to_string()))?;
        Ok(self.root.extended_attrs(&entry)?.into_keys().collect())
    }

    pub fn getxattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
        let entry = self
            .root
            .lookup(path)?
            .ok_or_else(|| RatarError::NotFound(path.to_string()))?;
        self.root
            .extended_attrs(&entry)?
            .remove(name)
            .ok_or_else(|| RatarError::NotFound(format!("{path}: xattr {name}")))
    }
}

/// §6 recoverable-error → host errno-class mapping, exposed here so a host
/// binding doesn't need to reach into `crate::error` directly.
pub fn errno_class_for(err: &RatarError) -> ErrnoClass {
    err.errno_class()
}
