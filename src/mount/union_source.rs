//! `UnionMountSource` — rightmost-wins composition of several
//! `MountSource`s, spec.md §4.7.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::index::FileEntry;
use crate::mount::{MountSource, SeekableReader, StatFs};

struct BitmapEntry {
    /// `present[i]` is true if ancestor directory `dir` is known to exist
    /// in `sources[i]`, short-circuiting a probe of sources that certainly
    /// don't contain a deeper path.
    present: Vec<bool>,
    inserted_at: Instant,
}

pub struct UnionMountSource {
    sources: Vec<Arc<dyn MountSource>>,
    cache: RwLock<HashMap<String, BitmapEntry>>,
    cache_ttl: Duration,
    cache_max_depth: usize,
}

impl UnionMountSource {
    pub fn new(sources: Vec<Arc<dyn MountSource>>, cache_ttl: Duration, cache_max_depth: usize) -> Self {
        Self {
            sources,
            cache: RwLock::new(HashMap::new()),
            cache_ttl,
            cache_max_depth,
        }
    }

    fn ancestor_for_cache(path: &str, max_depth: usize) -> String {
        let components: Vec<&str> = path.trim_matches('/').split('/').filter(|c| !c.is_empty()).collect();
        let depth = components.len().min(max_depth);
        if depth == 0 {
            "/".to_string()
        } else {
            format!("/{}", components[..depth].join("/"))
        }
    }

    /// Bitmap of which sources have the ancestor directory for `path`,
    /// rebuilding it (and evicting stale entries) when missing or expired.
    fn bitmap_for(&self, path: &str) -> Vec<bool> {
        let key = Self::ancestor_for_cache(path, self.cache_max_depth);
        if let Some(entry) = self.cache.read().expect("union cache poisoned").get(&key) {
            if entry.inserted_at.elapsed() < self.cache_ttl {
                return entry.present.clone();
            }
        }
        let present: Vec<bool> = self
            .sources
            .iter()
            .map(|s| s.lookup(&key).ok().flatten().is_some() || key == "/")
            .collect();
        self.cache.write().expect("union cache poisoned").insert(
            key,
            BitmapEntry {
                present: present.clone(),
                inserted_at: Instant::now(),
            },
        );
        present
    }
}

impl MountSource for UnionMountSource {
    fn lookup(&self, path: &str) -> Result<Option<FileEntry>> {
        let bitmap = self.bitmap_for(path);
        for (i, source) in self.sources.iter().enumerate().rev() {
            if !bitmap.get(i).copied().unwrap_or(true) {
                continue;
            }
            if let Some(entry) = source.lookup(path)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let mut merged: HashMap<String, FileEntry> = HashMap::new();
        for source in &self.sources {
            for entry in source.list(path)? {
                merged.insert(entry.name.clone(), entry);
            }
        }
        let mut out: Vec<FileEntry> = merged.into_values().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn open(&self, entry: &FileEntry) -> Result<SeekableReader> {
        let full_path = entry.full_path();
        for source in self.sources.iter().rev() {
            if let Some(found) = source.lookup(&full_path)? {
                if found.version == entry.version {
                    return source.open(&found);
                }
            }
        }
        self.sources
            .last()
            .expect("union has at least one source")
            .open(entry)
    }

    fn versions(&self, path: &str) -> Result<u32> {
        // Concatenate per-source version counts preserving order, so
        // `<name>.versions/1` is the oldest across the whole union
        // (spec.md §4.7).
        let mut total = 0u32;
        for source in &self.sources {
            total += source.versions(path)?;
        }
        Ok(total)
    }

    fn get_version(&self, path: &str, n: u32) -> Result<Option<FileEntry>> {
        let mut remaining = n;
        for source in &self.sources {
            let count = source.versions(path)?;
            if remaining <= count {
                return source.get_version(path, remaining);
            }
            remaining -= count;
        }
        Ok(None)
    }

    fn statfs(&self) -> Result<StatFs> {
        self.sources
            .last()
            .expect("union has at least one source")
            .statfs()
    }

    fn extended_attrs(&self, entry: &FileEntry) -> Result<std::collections::HashMap<String, Vec<u8>>> {
        for source in self.sources.iter().rev() {
            if let Some(found) = source.lookup(&entry.full_path())? {
                if found.version == entry.version {
                    return source.extended_attrs(&found);
                }
            }
        }
        Ok(std::collections::HashMap::new())
    }
}
