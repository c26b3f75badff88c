//! On-disk index: a single SQLite database per archive, schema from
//! spec.md §4.5. Grounded in the teacher's atomic-rebuild discipline
//! (`block.rs`/old `index/mod.rs`: write to a temp path, `fsync`, rename
//! over the final path) applied here to index builds instead of block
//! writes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::index::model::{EntryKind, FileEntry, IndexMeta, SparseRun, SCHEMA_VERSION};
use crate::block_index::{BlockCheckpoint, BlockIndex};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index schema version {found} is incompatible with this build ({expected})")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("index was built with backend {found:?}, this build uses {expected:?}")]
    BackendMismatch { found: String, expected: String },
    #[error("index archive_size {found} does not match on-disk size {expected}")]
    SizeMismatch { found: u64, expected: u64 },
    #[error("serialize error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// Default path: `<archive>.index.sqlite`. Fallback is the caller's job
/// (spec.md §4.5's `~/.ratarmount/<escaped-path>.index.sqlite` applies only
/// when the archive's own directory isn't writable).
pub fn default_index_path(archive_path: &Path) -> PathBuf {
    let mut p = archive_path.as_os_str().to_owned();
    p.push(".index.sqlite");
    PathBuf::from(p)
}

pub struct SqliteIndex {
    conn: Connection,
}

const DDL: &str = "
CREATE TABLE IF NOT EXISTS files (
    path TEXT NOT NULL,
    name TEXT NOT NULL,
    offset_header INTEGER NOT NULL,
    offset_data INTEGER NOT NULL,
    size INTEGER NOT NULL,
    mtime INTEGER NOT NULL,
    mode INTEGER NOT NULL,
    uid INTEGER NOT NULL,
    gid INTEGER NOT NULL,
    kind INTEGER NOT NULL,
    linkname TEXT,
    is_nested_archive INTEGER NOT NULL,
    version INTEGER NOT NULL,
    sparsity BLOB,
    nlink INTEGER NOT NULL,
    extended_attrs_offset INTEGER,
    PRIMARY KEY (path, name, version)
);
CREATE TABLE IF NOT EXISTS block_index (
    stream_id INTEGER NOT NULL,
    comp_bit INTEGER NOT NULL,
    decomp_byte INTEGER NOT NULL,
    state BLOB NOT NULL,
    PRIMARY KEY (stream_id, decomp_byte)
);
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
";

impl SqliteIndex {
    /// Create a fresh index at `path`, replacing any existing file only on
    /// a successful atomic rename — a half-built index must never be
    /// visible to a concurrent reader.
    pub fn build_new(path: &Path) -> IndexResult<(Self, PathBuf)> {
        let tmp_path = path.with_extension("sqlite.tmp");
        let _ = std::fs::remove_file(&tmp_path);
        let conn = Connection::open(&tmp_path)?;
        conn.execute_batch(DDL)?;
        conn.execute_batch("CREATE TABLE staging_files AS SELECT * FROM files WHERE 0;")?;
        Ok((Self { conn }, tmp_path))
    }

    /// An ephemeral, unpersisted index — used by `AutoMountLayer` to index
    /// a nested archive's contents for the lifetime of the mount without a
    /// backing file of its own.
    pub fn build_in_memory() -> IndexResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(DDL)?;
        conn.execute_batch("CREATE TABLE staging_files AS SELECT * FROM files WHERE 0;")?;
        Ok(Self { conn })
    }

    pub fn open_readonly(path: &Path) -> IndexResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    /// Insert into the unindexed staging table during the scan — no
    /// primary-key B-tree maintenance per row.
    pub fn stage_entry(&self, entry: &FileEntry) -> IndexResult<()> {
        let sparsity = entry
            .sparsity_map
            .as_ref()
            .map(|runs| serde_json::to_vec(runs))
            .transpose()?;
        self.conn.execute(
            "INSERT INTO staging_files
             (path, name, offset_header, offset_data, size, mtime, mode, uid, gid,
              kind, linkname, is_nested_archive, version, sparsity, nlink, extended_attrs_offset)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
            params![
                entry.path,
                entry.name,
                entry.offset_header as i64,
                entry.offset_data as i64,
                entry.size as i64,
                entry.mtime,
                entry.mode as i64,
                entry.uid as i64,
                entry.gid as i64,
                entry.kind as i64,
                entry.linkname,
                entry.is_nested_archive,
                entry.version as i64,
                sparsity,
                entry.nlink as i64,
                entry.extended_attrs_offset.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    /// Bulk-sort the staging rows into the primary-keyed `files` table.
    /// Measured ~10x faster than per-row inserts into the keyed table and
    /// ~50% smaller on disk than a surrogate integer key, per spec.md
    /// §4.5.
    pub fn finalize_staging(&self) -> IndexResult<()> {
        self.conn.execute_batch(
            "INSERT INTO files SELECT * FROM staging_files ORDER BY path, name, version;
             DROP TABLE staging_files;",
        )?;
        Ok(())
    }

    pub fn write_meta(&self, meta: &IndexMeta) -> IndexResult<()> {
        let options = serde_json::to_vec(&meta.options)?;
        let rows: &[(&str, Vec<u8>)] = &[
            ("archive_size", meta.archive_size.to_string().into_bytes()),
            ("archive_mtime", meta.archive_mtime.to_string().into_bytes()),
            ("backend_name", meta.backend_name.clone().into_bytes()),
            ("backend_version", meta.backend_version.clone().into_bytes()),
            ("gnu_incremental", (meta.gnu_incremental as u8).to_string().into_bytes()),
            ("ignore_zeros", (meta.ignore_zeros as u8).to_string().into_bytes()),
            (
                "gzip_checkpoint_spacing",
                meta.gzip_checkpoint_spacing.to_string().into_bytes(),
            ),
            ("schema_version", meta.schema_version.to_string().into_bytes()),
            ("options", options),
        ];
        for (k, v) in rows {
            self.conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![k, v],
            )?;
        }
        Ok(())
    }

    pub fn read_meta(&self) -> IndexResult<IndexMeta> {
        let get = |key: &str| -> IndexResult<Vec<u8>> {
            Ok(self
                .conn
                .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |r| {
                    r.get::<_, Vec<u8>>(0)
                })?)
        };
        let parse_u64 = |b: Vec<u8>| -> u64 { String::from_utf8_lossy(&b).parse().unwrap_or(0) };
        let parse_bool = |b: Vec<u8>| -> bool { parse_u64(b) != 0 };

        let options_raw = get("options")?;
        let options: BTreeMap<String, String> = serde_json::from_slice(&options_raw)?;

        Ok(IndexMeta {
            archive_size: parse_u64(get("archive_size")?),
            archive_mtime: parse_u64(get("archive_mtime")?) as i64,
            backend_name: String::from_utf8_lossy(&get("backend_name")?).into_owned(),
            backend_version: String::from_utf8_lossy(&get("backend_version")?).into_owned(),
            gnu_incremental: parse_bool(get("gnu_incremental")?),
            ignore_zeros: parse_bool(get("ignore_zeros")?),
            gzip_checkpoint_spacing: parse_u64(get("gzip_checkpoint_spacing")?),
            schema_version: parse_u64(get("schema_version")?) as u32,
            options,
        })
    }

    /// Accept this index for reuse only if schema, archive size, and
    /// backend all match — a mismatch means the on-disk offsets may not
    /// mean what this build thinks they mean, which is a hard error per
    /// spec.md §4.5, not a warning.
    pub fn validate_for_reuse(
        &self,
        current_archive_size: u64,
        current_backend: &str,
    ) -> IndexResult<IndexMeta> {
        let meta = self.read_meta()?;
        if meta.schema_version != SCHEMA_VERSION {
            return Err(IndexError::VersionMismatch {
                found: meta.schema_version,
                expected: SCHEMA_VERSION,
            });
        }
        if meta.backend_name != current_backend {
            return Err(IndexError::BackendMismatch {
                found: meta.backend_name,
                expected: current_backend.to_string(),
            });
        }
        if meta.archive_size != current_archive_size {
            return Err(IndexError::SizeMismatch {
                found: meta.archive_size,
                expected: current_archive_size,
            });
        }
        Ok(meta)
    }

    pub fn lookup(&self, path: &str, name: &str) -> IndexResult<Option<FileEntry>> {
        self.conn
            .query_row(
                "SELECT path,name,offset_header,offset_data,size,mtime,mode,uid,gid,kind,
                        linkname,is_nested_archive,version,sparsity,nlink,extended_attrs_offset
                 FROM files WHERE path = ?1 AND name = ?2
                 ORDER BY version DESC LIMIT 1",
                params![path, name],
                row_to_entry,
            )
            .optional()
            .map_err(IndexError::from)
    }

    pub fn get_version(&self, path: &str, name: &str, version: u32) -> IndexResult<Option<FileEntry>> {
        self.conn
            .query_row(
                "SELECT path,name,offset_header,offset_data,size,mtime,mode,uid,gid,kind,
                        linkname,is_nested_archive,version,sparsity,nlink,extended_attrs_offset
                 FROM files WHERE path = ?1 AND name = ?2 AND version = ?3",
                params![path, name, version as i64],
                row_to_entry,
            )
            .optional()
            .map_err(IndexError::from)
    }

    pub fn version_count(&self, path: &str, name: &str) -> IndexResult<u32> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM files WHERE path = ?1 AND name = ?2",
            params![path, name],
            |r| r.get(0),
        )?;
        Ok(n as u32)
    }

    /// One directory level: every distinct `name` whose `path` equals
    /// `dir`, at its highest version.
    pub fn list(&self, dir: &str) -> IndexResult<Vec<FileEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT path,name,offset_header,offset_data,size,mtime,mode,uid,gid,kind,
                    linkname,is_nested_archive,version,sparsity,nlink,extended_attrs_offset
             FROM files f
             WHERE path = ?1 AND version = (
                 SELECT MAX(version) FROM files WHERE path = f.path AND name = f.name
             )
             ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![dir], row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn push_checkpoint(&self, stream_id: i64, cp: &BlockCheckpoint) -> IndexResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO block_index (stream_id, comp_bit, decomp_byte, state)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                stream_id,
                cp.compressed_bit_offset as i64,
                cp.decompressed_byte_offset as i64,
                cp.decoder_state_blob
            ],
        )?;
        Ok(())
    }

    pub fn load_checkpoints(&self, stream_id: i64) -> IndexResult<BlockIndex> {
        let mut stmt = self.conn.prepare(
            "SELECT comp_bit, decomp_byte, state FROM block_index
             WHERE stream_id = ?1 ORDER BY decomp_byte",
        )?;
        let mut idx = BlockIndex::new();
        let rows = stmt.query_map(params![stream_id], |r| {
            Ok(BlockCheckpoint {
                compressed_bit_offset: r.get::<_, i64>(0)? as u64,
                decompressed_byte_offset: r.get::<_, i64>(1)? as u64,
                decoder_state_blob: r.get(2)?,
            })
        })?;
        for row in rows {
            idx.push(row?);
        }
        Ok(idx)
    }

    /// Finish a build: fsync the connection's file and rename the temp
    /// path into place, replacing any prior index atomically.
    pub fn commit_build(self, tmp_path: &Path, final_path: &Path) -> IndexResult<()> {
        self.conn.pragma_update(None, "journal_mode", "DELETE")?;
        self.conn.execute_batch("PRAGMA synchronous = FULL;")?;
        drop(self.conn);
        std::fs::rename(tmp_path, final_path)?;
        Ok(())
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<FileEntry> {
    let sparsity_raw: Option<Vec<u8>> = row.get(13)?;
    let sparsity_map = sparsity_raw
        .map(|b| serde_json::from_slice::<Vec<SparseRun>>(&b))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(13, rusqlite::types::Type::Blob, Box::new(e)))?;
    let kind_raw: i64 = row.get(9)?;
    let kind = EntryKind::from_db(kind_raw).ok_or(rusqlite::Error::InvalidColumnType(
        9,
        "kind".to_string(),
        rusqlite::types::Type::Integer,
    ))?;
    Ok(FileEntry {
        path: row.get(0)?,
        name: row.get(1)?,
        offset_header: row.get::<_, i64>(2)? as u64,
        offset_data: row.get::<_, i64>(3)? as u64,
        size: row.get::<_, i64>(4)? as u64,
        mtime: row.get(5)?,
        mode: row.get::<_, i64>(6)? as u32,
        uid: row.get::<_, i64>(7)? as u32,
        gid: row.get::<_, i64>(8)? as u32,
        kind,
        linkname: row.get(10)?,
        is_nested_archive: row.get(11)?,
        version: row.get::<_, i64>(12)? as u32,
        sparsity_map,
        nlink: row.get::<_, i64>(14)? as u32,
        extended_attrs_offset: row.get::<_, Option<i64>>(15)?.map(|v| v as u64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entry(path: &str, name: &str, version: u32, size: u64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            name: name.to_string(),
            offset_header: 0,
            offset_data: 512,
            size,
            mtime: 0,
            mode: 0o644,
            uid: 0,
            gid: 0,
            kind: EntryKind::Regular,
            linkname: None,
            is_nested_archive: false,
            version,
            sparsity_map: None,
            nlink: 1,
            extended_attrs_offset: None,
        }
    }

    #[test]
    fn stage_finalize_and_lookup_roundtrip() {
        let dir = tempdir().unwrap();
        let final_path = dir.path().join("a.tar.index.sqlite");
        let (idx, tmp) = SqliteIndex::build_new(&final_path).unwrap();
        idx.stage_entry(&sample_entry("/foo", "bar", 1, 123)).unwrap();
        idx.finalize_staging().unwrap();
        idx.write_meta(&IndexMeta {
            archive_size: 10240,
            archive_mtime: 0,
            backend_name: "tar".into(),
            backend_version: "1".into(),
            gnu_incremental: false,
            ignore_zeros: false,
            gzip_checkpoint_spacing: crate::config::DEFAULT_GZIP_CHECKPOINT_SPACING,
            schema_version: SCHEMA_VERSION,
            options: BTreeMap::new(),
        })
        .unwrap();
        idx.commit_build(&tmp, &final_path).unwrap();

        let reopened = SqliteIndex::open_readonly(&final_path).unwrap();
        let entry = reopened.lookup("/foo", "bar").unwrap().unwrap();
        assert_eq!(entry.size, 123);
        let meta = reopened.validate_for_reuse(10240, "tar").unwrap();
        assert_eq!(meta.archive_size, 10240);
    }
}
