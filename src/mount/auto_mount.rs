//! `AutoMountLayer` — lazy recursive mounting of archives-within-archives,
//! spec.md §4.8.
//!
//! Sub-mounts live in a flat arena owned by the layer; children are
//! referenced by index rather than by pointer, so there's no parent
//! back-reference to manage for teardown — the arena-plus-index scheme
//! spec.md §9 calls for in place of reference-counted back-pointers from
//! nested mounts to their parent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::config::Config;
use crate::error::{RatarError, Result};
use crate::index::{EntryKind, FileEntry, IndexMeta, SqliteIndex, SCHEMA_VERSION};
use crate::mount::tar_source::TarMountSource;
use crate::mount::{split_mount_path, MountSource, SeekableReader, StatFs};
use crate::seekable::SeekableStream;
use crate::tar::{IndexerOptions, TarIndexer};

pub struct AutoMountLayer {
    inner: Arc<dyn MountSource>,
    arena: RwLock<Vec<Arc<dyn MountSource>>>,
    cache: RwLock<HashMap<String, usize>>,
    strip_suffix: bool,
    depth: u32,
    max_recursion_depth: u32,
}

impl AutoMountLayer {
    pub fn new(inner: Arc<dyn MountSource>, config: &Config) -> Self {
        Self {
            inner,
            arena: RwLock::new(Vec::new()),
            cache: RwLock::new(HashMap::new()),
            strip_suffix: config.strip_suffix,
            depth: 0,
            max_recursion_depth: config.max_recursion_depth,
        }
    }

    fn child(inner: Arc<dyn MountSource>, strip_suffix: bool, depth: u32, max_recursion_depth: u32) -> Self {
        Self {
            inner,
            arena: RwLock::new(Vec::new()),
            cache: RwLock::new(HashMap::new()),
            strip_suffix,
            depth,
            max_recursion_depth,
        }
    }

    /// Strip a known archive suffix off `name`, if present, for the
    /// virtualized directory name (`foo.tar` -> `foo`).
    fn strip_known_suffix(name: &str) -> Option<&str> {
        const SUFFIXES: &[&str] = &[
            ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz", ".tar.zst", ".tar", ".zip",
            ".rar", ".squashfs", ".7z",
        ];
        SUFFIXES.iter().find(|s| name.ends_with(*s)).map(|s| &name[..name.len() - s.len()])
    }

    fn get_or_build_submount(&self, entry: &FileEntry) -> Result<Arc<dyn MountSource>> {
        let key = entry.full_path();
        if let Some(&idx) = self.cache.read().expect("auto-mount cache poisoned").get(&key) {
            return Ok(self.arena.read().expect("auto-mount arena poisoned")[idx].clone());
        }
        if self.depth + 1 > self.max_recursion_depth {
            return Err(RatarError::Unsupported(format!(
                "nested archive {key} exceeds max recursion depth {}",
                self.max_recursion_depth
            )));
        }

        let reader = self.inner.open(entry)?;
        let stream: Arc<Mutex<dyn SeekableStream>> = reader;
        let build = {
            let mut guard = stream.lock().expect("nested stream mutex poisoned");
            TarIndexer::new(IndexerOptions::default()).scan(&mut *guard)?
        };

        let index = SqliteIndex::build_in_memory()?;
        for file_entry in &build.entries {
            index.stage_entry(file_entry)?;
        }
        index.finalize_staging()?;
        index.write_meta(&IndexMeta {
            archive_size: build.stream_size,
            archive_mtime: entry.mtime,
            backend_name: "tar".to_string(),
            backend_version: env!("CARGO_PKG_VERSION").to_string(),
            gnu_incremental: false,
            ignore_zeros: false,
            gzip_checkpoint_spacing: crate::config::DEFAULT_GZIP_CHECKPOINT_SPACING,
            schema_version: SCHEMA_VERSION,
            options: Default::default(),
        })?;

        let tar_source = Arc::new(TarMountSource::new(index, stream));
        let wrapped: Arc<dyn MountSource> = Arc::new(Self::child(
            tar_source,
            self.strip_suffix,
            self.depth + 1,
            self.max_recursion_depth,
        ));

        let mut arena = self.arena.write().expect("auto-mount arena poisoned");
        let idx = arena.len();
        arena.push(wrapped.clone());
        self.cache.write().expect("auto-mount cache poisoned").insert(key, idx);
        Ok(wrapped)
    }

    /// Resolve `path` against `self.inner`, transparently descending into
    /// a nested archive's sub-mount whenever a path component matches a
    /// virtualized archive directory instead of a real directory.
    fn resolve(&self, path: &str) -> Result<(Arc<dyn MountSource>, String)> {
        if let Some(entry) = self.inner.lookup(path)? {
            if !entry.is_nested_archive {
                return Ok((self.inner.clone(), path.to_string()));
            }
            // Exact hit on the archive file itself: when not stripping the
            // suffix, or the caller wants the raw file, report it as-is —
            // the caller inspects `is_nested_archive`, not this layer.
            if !self.strip_suffix {
                return Ok((self.inner.clone(), path.to_string()));
            }
        }

        if !self.strip_suffix {
            return Ok((self.inner.clone(), path.to_string()));
        }

        // Walk the path from the root looking for a prefix whose stripped
        // form matches a virtualized directory while the unstripped
        // archive file exists in `self.inner`.
        let trimmed = path.trim_matches('/');
        let components: Vec<&str> = trimmed.split('/').filter(|c| !c.is_empty()).collect();
        let mut current_dir = String::from("/");
        for (i, component) in components.iter().enumerate() {
            let direct_path = format!("{}/{}", current_dir.trim_end_matches('/'), component);
            match self.inner.lookup(&direct_path)? {
                Some(e) if !e.is_nested_archive => {
                    current_dir = direct_path;
                    continue;
                }
                Some(e) if e.is_nested_archive => {
                    let sub = self.get_or_build_submount(&e)?;
                    let remainder = components[i + 1..].join("/");
                    let sub_path = if remainder.is_empty() {
                        "/".to_string()
                    } else {
                        format!("/{remainder}")
                    };
                    return Ok((sub, sub_path));
                }
                _ => {
                    // No direct entry: maybe a sibling's stripped-suffix
                    // directory collided and lost (spec.md §4.8: the
                    // existing real directory always wins), or the path
                    // truly doesn't exist under any virtualization.
                    if let Some((archive_name, _)) = self
                        .inner
                        .list(&current_dir)?
                        .into_iter()
                        .filter(|e| e.is_nested_archive)
                        .find_map(|e| Self::strip_known_suffix(&e.name).map(|stem| (e.name.clone(), stem.to_string())))
                        .filter(|(_, stem)| stem == component)
                    {
                        let entry = self
                            .inner
                            .lookup(&format!("{}/{}", current_dir.trim_end_matches('/'), archive_name))?
                            .expect("listed entry must be lookupable");
                        let sub = self.get_or_build_submount(&entry)?;
                        let remainder = components[i + 1..].join("/");
                        let sub_path = if remainder.is_empty() {
                            "/".to_string()
                        } else {
                            format!("/{remainder}")
                        };
                        return Ok((sub, sub_path));
                    }
                    return Ok((self.inner.clone(), path.to_string()));
                }
            }
        }
        Ok((self.inner.clone(), path.to_string()))
    }
}

impl MountSource for AutoMountLayer {
    fn lookup(&self, path: &str) -> Result<Option<FileEntry>> {
        let (source, resolved) = self.resolve(path)?;
        let mut entry = source.lookup(&resolved)?;
        if let Some(e) = &mut entry {
            // Rewrite path/name to the caller's original request rather
            // than the submount-relative ones `source` knows about, so
            // `e.full_path()` round-trips through `open()` regardless of
            // how many archive layers `resolve` descended through.
            let (dir, name) = split_mount_path(path);
            e.path = dir.to_string();
            e.name = name.to_string();
            if self.strip_suffix && e.kind == EntryKind::Regular && e.is_nested_archive {
                if let Some(stem) = Self::strip_known_suffix(&e.name) {
                    e.name = stem.to_string();
                    e.kind = EntryKind::Directory;
                }
            }
        }
        Ok(entry)
    }

    fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let (source, resolved) = self.resolve(path)?;
        let mut entries = source.list(&resolved)?;
        let parent = {
            let trimmed = path.trim_end_matches('/');
            if trimmed.is_empty() {
                "/".to_string()
            } else {
                trimmed.to_string()
            }
        };
        for e in entries.iter_mut() {
            e.path = parent.clone();
        }
        if self.strip_suffix {
            let existing_names: std::collections::HashSet<String> =
                entries.iter().filter(|e| !e.is_nested_archive).map(|e| e.name.clone()).collect();
            for e in entries.iter_mut() {
                if e.is_nested_archive {
                    if let Some(stem) = Self::strip_known_suffix(&e.name) {
                        if !existing_names.contains(stem) {
                            e.name = stem.to_string();
                            e.kind = EntryKind::Directory;
                        }
                        // else: a sibling directory named `stem` already
                        // exists; leave the archive entry as a plain file,
                        // the collision resolution spec.md §4.8 calls for.
                    }
                }
            }
        }
        Ok(entries)
    }

    fn open(&self, entry: &FileEntry) -> Result<SeekableReader> {
        let full_path = entry.full_path();
        let (_dir, _name) = split_mount_path(&full_path);
        let (source, resolved) = self.resolve(&full_path)?;
        let real_entry = source
            .lookup(&resolved)?
            .ok_or_else(|| RatarError::NotFound(full_path.clone()))?;
        source.open(&real_entry)
    }

    fn versions(&self, path: &str) -> Result<u32> {
        let (source, resolved) = self.resolve(path)?;
        source.versions(&resolved)
    }

    fn get_version(&self, path: &str, n: u32) -> Result<Option<FileEntry>> {
        let (source, resolved) = self.resolve(path)?;
        source.get_version(&resolved, n)
    }

    fn statfs(&self) -> Result<StatFs> {
        self.inner.statfs()
    }
}
