//! `WriteOverlay` — copy-on-write shim atop an otherwise read-only stack,
//! spec.md §4.9.
//!
//! Creations and modifications land in a host folder; deletions and
//! renames are recorded in `overlay.sqlite`'s `deletions`/`renames`
//! tables per spec.md §6. Writes are serialized per path via a sharded
//! lock table, never held across a call into the underlying source —
//! the same "no lock across a decoder invocation" discipline spec.md §5
//! requires everywhere else.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use crate::error::{RatarError, Result};
use crate::index::{FileEntry, OverlayState};
use crate::mount::folder_source::FolderMountSource;
use crate::mount::{MountSource, SeekableReader, StatFs};

pub struct WriteOverlay {
    inner: Arc<dyn MountSource>,
    overlay: FolderMountSource,
    overlay_dir: PathBuf,
    state: Mutex<OverlayState>,
    conn: Mutex<Connection>,
    path_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

const OVERLAY_DDL: &str = "
CREATE TABLE IF NOT EXISTS deletions (path TEXT PRIMARY KEY);
CREATE TABLE IF NOT EXISTS renames (old_path TEXT PRIMARY KEY, new_path TEXT NOT NULL);
";

impl WriteOverlay {
    pub fn open(inner: Arc<dyn MountSource>, overlay_dir: impl Into<PathBuf>) -> Result<Self> {
        let overlay_dir = overlay_dir.into();
        fs::create_dir_all(&overlay_dir)?;
        let conn = Connection::open(overlay_dir.join("overlay.sqlite")).map_err(|e| RatarError::Io(
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        ))?;
        conn.execute_batch(OVERLAY_DDL)
            .map_err(|e| RatarError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

        let mut state = OverlayState::default();
        {
            let mut stmt = conn.prepare("SELECT path FROM deletions").unwrap();
            let rows = stmt.query_map([], |r| r.get::<_, String>(0)).unwrap();
            for r in rows.flatten() {
                state.deletions.insert(r);
            }
        }
        {
            let mut stmt = conn.prepare("SELECT old_path, new_path FROM renames").unwrap();
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))).unwrap();
            for r in rows.flatten() {
                state.renames.insert(r.0, r.1);
            }
        }

        let overlay = FolderMountSource::new(overlay_dir.clone());
        Ok(Self {
            inner,
            overlay,
            overlay_dir,
            state: Mutex::new(state),
            conn: Mutex::new(conn),
            path_locks: Mutex::new(HashMap::new()),
        })
    }

    fn lock_for(&self, path: &str) -> Arc<Mutex<()>> {
        self.path_locks
            .lock()
            .expect("overlay lock table poisoned")
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Copy a file out of the underlying union into the overlay folder
    /// before it is modified in place.
    pub fn copy_on_write(&self, path: &str) -> Result<()> {
        let per_path = self.lock_for(path);
        let _guard = per_path.lock().expect("per-path overlay lock poisoned");

        let Some(entry) = self.inner.lookup(path)? else {
            return Ok(());
        };
        let host_path = self.overlay_dir.join(path.trim_start_matches('/'));
        if let Some(parent) = host_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let reader = self.inner.open(&entry)?;
        let buf = {
            let stream = reader.lock().expect("stencil mutex poisoned");
            stream
                .read_all_parallel(&crate::perf::CancellationToken::new())
                .map_err(|e| RatarError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?
        };
        fs::write(&host_path, &buf)?;
        Ok(())
    }

    pub fn create(&self, path: &str, data: &[u8]) -> Result<()> {
        let per_path = self.lock_for(path);
        let _guard = per_path.lock().expect("per-path overlay lock poisoned");
        let host_path = self.overlay_dir.join(path.trim_start_matches('/'));
        if let Some(parent) = host_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::File::create(&host_path)?;
        f.write_all(data)?;
        let mut state = self.state.lock().expect("overlay state poisoned");
        state.deletions.remove(path);
        self.conn
            .lock()
            .expect("overlay conn poisoned")
            .execute("DELETE FROM deletions WHERE path = ?1", params![path])
            .ok();
        Ok(())
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        let per_path = self.lock_for(path);
        let _guard = per_path.lock().expect("per-path overlay lock poisoned");
        let host_path = self.overlay_dir.join(path.trim_start_matches('/'));
        let _ = fs::remove_file(&host_path);
        let mut state = self.state.lock().expect("overlay state poisoned");
        state.deletions.insert(path.to_string());
        self.conn
            .lock()
            .expect("overlay conn poisoned")
            .execute("INSERT OR REPLACE INTO deletions (path) VALUES (?1)", params![path])
            .ok();
        Ok(())
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        let mut state = self.state.lock().expect("overlay state poisoned");
        state.renames.insert(old_path.to_string(), new_path.to_string());
        self.conn
            .lock()
            .expect("overlay conn poisoned")
            .execute(
                "INSERT OR REPLACE INTO renames (old_path, new_path) VALUES (?1, ?2)",
                params![old_path, new_path],
            )
            .ok();
        Ok(())
    }

    /// Produce `append.lst`/`deletions.lst` for an external archiver to
    /// apply, then clear the in-memory overlay tables — the batch commit
    /// operation spec.md §4.9 describes as separate from mounting.
    pub fn commit(&self, mount_root: impl Fn(&str) -> Result<Vec<FileEntry>>) -> Result<()> {
        let mut state = self.state.lock().expect("overlay state poisoned");
        let mut append_list = fs::File::create(self.overlay_dir.join("append.lst"))?;
        let mut deletions_list = fs::File::create(self.overlay_dir.join("deletions.lst"))?;

        for entry in mount_root("/")? {
            if !entry.is_nested_archive {
                writeln!(append_list, "{}", entry.full_path())?;
            }
        }
        for path in &state.deletions {
            writeln!(deletions_list, "{path}")?;
        }

        state.deletions.clear();
        state.renames.clear();
        let conn = self.conn.lock().expect("overlay conn poisoned");
        conn.execute("DELETE FROM deletions", [])
            .map_err(|e| RatarError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        conn.execute("DELETE FROM renames", [])
            .map_err(|e| RatarError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
        Ok(())
    }
}

impl MountSource for WriteOverlay {
    fn lookup(&self, path: &str) -> Result<Option<FileEntry>> {
        let resolved = {
            let state = self.state.lock().expect("overlay state poisoned");
            match state.resolve(path) {
                None => return Ok(None),
                Some(p) => p,
            }
        };
        if let Some(entry) = self.overlay.lookup(&resolved)? {
            return Ok(Some(entry));
        }
        self.inner.lookup(&resolved)
    }

    fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let resolved = {
            let state = self.state.lock().expect("overlay state poisoned");
            match state.resolve(path) {
                None => return Ok(Vec::new()),
                Some(p) => p,
            }
        };
        let mut merged: HashMap<String, FileEntry> = HashMap::new();
        for entry in self.inner.list(&resolved).unwrap_or_default() {
            merged.insert(entry.name.clone(), entry);
        }
        for entry in self.overlay.list(&resolved).unwrap_or_default() {
            merged.insert(entry.name.clone(), entry);
        }
        let state = self.state.lock().expect("overlay state poisoned");
        merged.retain(|name, _| {
            let full = format!("{}/{name}", resolved.trim_end_matches('/'));
            !state.deletions.contains(&full)
        });
        let mut out: Vec<FileEntry> = merged.into_values().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn open(&self, entry: &FileEntry) -> Result<SeekableReader> {
        let full_path = entry.full_path();
        if self.overlay.lookup(&full_path)?.is_some() {
            return self.overlay.open(entry);
        }
        self.inner.open(entry)
    }

    fn versions(&self, path: &str) -> Result<u32> {
        self.inner.versions(path)
    }

    fn get_version(&self, path: &str, n: u32) -> Result<Option<FileEntry>> {
        self.inner.get_version(path, n)
    }

    fn statfs(&self) -> Result<StatFs> {
        self.inner.statfs()
    }
}
