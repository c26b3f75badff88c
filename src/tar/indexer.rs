//! One-pass TAR stream scanner — spec.md §4.4.
//!
//! Reads 512-byte headers sequentially off a `SeekableStream`, using each
//! entry's `size` to skip its payload rather than parsing it, the same
//! "skip what you don't need to touch" approach the teacher's
//! `recovery::scanner` uses to walk past block payloads while only
//! inspecting headers.

use std::collections::BTreeMap;

use crate::index::model::{EntryKind, FileEntry, SparseRun};
use crate::seekable::{SeekableStream, StreamResult, Whence};
use crate::tar::header::{blocks_for_size, parse_header, parse_pax_records, TarResult, TypeFlag, BLOCK_SIZE};

/// Tier-2 recoverable conditions collected alongside a successful build —
/// never fatal to the whole scan (spec.md §7 tier 2).
#[derive(Debug, Clone)]
pub enum IndexWarning {
    UnknownPaxKeyword { offset: u64, keyword: String },
    TruncatedEntry { offset: u64, name: String },
    DuplicatePath { path: String, name: String, version: u32 },
    /// A `GnuSparse` entry carried no `GNU.sparse.map` PAX record — the
    /// legacy in-header sparse format, which this indexer doesn't parse.
    /// The entry is recorded with an empty sparsity map and reads as
    /// unsupported rather than as wrongly-reconstructed full-size content.
    UnsupportedSparseFormat { offset: u64, name: String },
}

pub struct IndexerOptions {
    pub ignore_zeros: bool,
    pub known_archive_suffixes: Vec<&'static str>,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            ignore_zeros: false,
            known_archive_suffixes: vec![
                ".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz", ".tar.zst",
                ".zip", ".rar", ".squashfs", ".7z",
            ],
        }
    }
}

pub struct TarIndexer {
    options: IndexerOptions,
}

/// Archive magic-byte predicates, tried in suffix order (spec.md §4.4:
/// "matches that archive's magic"). Only the prefix bytes needed to
/// distinguish formats are checked; full parsing is each format's own
/// `MountSource`'s job.
fn magic_matches(suffix: &str, head: &[u8]) -> bool {
    match suffix {
        s if s.ends_with(".gz") || s == ".tgz" => head.starts_with(&[0x1f, 0x8b]),
        s if s.ends_with(".bz2") || s == ".tbz2" => head.starts_with(b"BZh"),
        s if s.ends_with(".xz") || s == ".txz" => head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0]),
        s if s.ends_with(".zst") => head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]),
        ".zip" => head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06"),
        ".rar" => head.starts_with(b"Rar!\x1a\x07"),
        ".7z" => head.starts_with(&[b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c]),
        ".squashfs" => head.starts_with(b"hsqs") || head.starts_with(&[0x73, 0x71, 0x73, 0x68]),
        ".tar" => head.len() >= 263 && (&head[257..262] == b"ustar"),
        _ => false,
    }
}

pub struct IndexBuild {
    pub entries: Vec<FileEntry>,
    pub warnings: Vec<IndexWarning>,
    pub stream_size: u64,
}

impl TarIndexer {
    pub fn new(options: IndexerOptions) -> Self {
        Self { options }
    }

    pub fn scan(&self, stream: &mut dyn SeekableStream) -> TarResult<IndexBuild> {
        let mut entries = Vec::new();
        let mut warnings = Vec::new();
        // path -> (name -> highest version seen), used to assign the next
        // version number for duplicate paths (spec.md §3 I2).
        let mut versions: BTreeMap<(String, String), u32> = BTreeMap::new();
        let mut implicit_dirs: BTreeMap<String, ()> = BTreeMap::new();

        let mut pending_long_name: Option<String> = None;
        let mut pending_long_link: Option<String> = None;
        let mut pending_pax: BTreeMap<String, String> = BTreeMap::new();

        let mut consecutive_zero_blocks = 0u32;
        let mut offset = stream.seek(0, Whence::Start)?;

        loop {
            let mut block = [0u8; BLOCK_SIZE];
            let header_offset = offset;
            let n = read_full(stream, &mut block)?;
            if n == 0 {
                break;
            }
            if n < BLOCK_SIZE {
                warnings.push(IndexWarning::TruncatedEntry {
                    offset: header_offset,
                    name: "<incomplete header>".to_string(),
                });
                break;
            }
            offset += BLOCK_SIZE as u64;

            let Some(raw) = parse_header(&block, header_offset)? else {
                consecutive_zero_blocks += 1;
                if !self.options.ignore_zeros && consecutive_zero_blocks >= 2 {
                    break;
                }
                continue;
            };
            consecutive_zero_blocks = 0;

            match raw.typeflag {
                TypeFlag::GnuLongName => {
                    pending_long_name = Some(read_name_payload(stream, &mut offset, raw.size)?);
                    continue;
                }
                TypeFlag::GnuLongLink => {
                    pending_long_link = Some(read_name_payload(stream, &mut offset, raw.size)?);
                    continue;
                }
                TypeFlag::PaxExtendedHeader | TypeFlag::PaxGlobalExtendedHeader => {
                    let payload = read_name_payload_bytes(stream, &mut offset, raw.size)?;
                    for (key, value) in parse_pax_records(&payload)? {
                        match key.as_str() {
                            "path" | "linkpath" | "size" | "mtime" | "uid" | "gid"
                            | "GNU.sparse.map" | "GNU.sparse.realsize" => {
                                pending_pax.insert(key, value);
                            }
                            other => warnings.push(IndexWarning::UnknownPaxKeyword {
                                offset: header_offset,
                                keyword: other.to_string(),
                            }),
                        }
                    }
                    continue;
                }
                TypeFlag::GnuSparse => {
                    // The legacy in-header sparse format (extra sparse-run
                    // blocks following this header) isn't parsed; modern GNU
                    // tar instead emits a PAX `GNU.sparse.map` record, read
                    // above into pending_pax.
                }
                _ => {}
            }

            let name = pending_pax
                .remove("path")
                .or_else(|| pending_long_name.take())
                .unwrap_or(raw.name.clone());
            let linkname = pending_pax
                .remove("linkpath")
                .or_else(|| pending_long_link.take())
                .unwrap_or(raw.linkname.clone());
            let size = pending_pax
                .remove("size")
                .and_then(|s| s.parse().ok())
                .unwrap_or(raw.size);
            let mtime = pending_pax
                .remove("mtime")
                .and_then(|s| s.parse::<f64>().ok())
                .map(|f| f as i64)
                .unwrap_or(raw.mtime);
            let uid = pending_pax
                .remove("uid")
                .and_then(|s| s.parse().ok())
                .unwrap_or(raw.uid);
            let gid = pending_pax
                .remove("gid")
                .and_then(|s| s.parse().ok())
                .unwrap_or(raw.gid);
            let sparse_map_raw = pending_pax.remove("GNU.sparse.map");
            let sparse_real_size = pending_pax.remove("GNU.sparse.realsize").and_then(|s| s.parse::<u64>().ok());
            pending_pax.clear();

            let data_offset = offset;
            let data_blocks = blocks_for_size(size);
            offset += data_blocks * BLOCK_SIZE as u64;
            if stream.size().map(|total| offset > total).unwrap_or(false) {
                warnings.push(IndexWarning::TruncatedEntry {
                    offset: header_offset,
                    name: name.clone(),
                });
            }
            stream.seek(offset as i64, Whence::Start)?;

            let kind = match raw.typeflag {
                TypeFlag::Directory => EntryKind::Directory,
                TypeFlag::Symlink => EntryKind::Symlink,
                TypeFlag::Link => EntryKind::Hardlink,
                TypeFlag::BlockDevice => EntryKind::BlockDevice,
                TypeFlag::CharDevice => EntryKind::CharDevice,
                TypeFlag::Fifo => EntryKind::Fifo,
                TypeFlag::GnuSparse => EntryKind::Sparse,
                _ => EntryKind::Regular,
            };

            let (path, base_name) = split_path(&name);
            for dir in ancestor_dirs(&path) {
                implicit_dirs.insert(dir, ());
            }

            let key = (path.clone(), base_name.clone());
            let version = versions.entry(key.clone()).or_insert(0);
            *version += 1;
            if *version > 1 {
                warnings.push(IndexWarning::DuplicatePath {
                    path: path.clone(),
                    name: base_name.clone(),
                    version: *version,
                });
            }

            let is_nested_archive = kind == EntryKind::Regular
                && self
                    .options
                    .known_archive_suffixes
                    .iter()
                    .any(|suf| name.ends_with(suf));

            let real_size = sparse_real_size.unwrap_or(size);
            let sparsity_map = if kind == EntryKind::Sparse {
                match &sparse_map_raw {
                    Some(raw_map) => Some(build_sparse_runs(&parse_gnu_sparse_map(raw_map), real_size)),
                    None => {
                        warnings.push(IndexWarning::UnsupportedSparseFormat {
                            offset: header_offset,
                            name: name.clone(),
                        });
                        Some(Vec::new())
                    }
                }
            } else {
                None
            };

            entries.push(FileEntry {
                path,
                name: base_name,
                offset_header: header_offset,
                offset_data: if kind == EntryKind::Hardlink { 0 } else { data_offset },
                size: if kind == EntryKind::Hardlink {
                    0
                } else if kind == EntryKind::Sparse {
                    real_size
                } else {
                    size
                },
                mtime,
                mode: raw.mode,
                uid,
                gid,
                kind,
                linkname: if linkname.is_empty() { None } else { Some(linkname) },
                is_nested_archive,
                version: *version,
                sparsity_map,
                nlink: if kind == EntryKind::Directory { 2 } else { 1 },
                extended_attrs_offset: None,
            });
        }

        let stream_size = offset;
        add_missing_implicit_dirs(&mut entries, implicit_dirs);
        fixup_directory_nlinks(&mut entries);

        Ok(IndexBuild {
            entries,
            warnings,
            stream_size,
        })
    }
}

/// Parse a PAX 0.1 `GNU.sparse.map` value — comma-separated
/// `offset,numbytes` pairs, each giving a run of real data at
/// reconstructed-file offset `offset`. Malformed pairs are dropped rather
/// than failing the whole scan; a sparse entry with no usable pairs ends up
/// with an empty map, same as one with no `GNU.sparse.map` at all.
fn parse_gnu_sparse_map(raw: &str) -> Vec<(u64, u64)> {
    let nums: Vec<u64> = raw.split(',').filter(|s| !s.is_empty()).filter_map(|s| s.parse().ok()).collect();
    nums.chunks_exact(2).map(|c| (c[0], c[1])).collect()
}

/// Turn `GNU.sparse.map` pairs into the `SparseRun`s a stencil expects.
/// The archive stores only the real (non-hole) bytes, back to back in map
/// order, so each run's `data_offset` is the running total of real bytes
/// already consumed rather than anything in the pair itself; `hole_length`
/// is however far the reconstructed offset jumped ahead of the previous
/// run's end. A final hole is appended if the last run doesn't reach
/// `real_size`.
fn build_sparse_runs(pairs: &[(u64, u64)], real_size: u64) -> Vec<SparseRun> {
    let mut runs = Vec::new();
    let mut stored_pos = 0u64;
    let mut reconstructed_pos = 0u64;
    for &(offset, numbytes) in pairs {
        if numbytes == 0 {
            continue;
        }
        let hole_length = offset.saturating_sub(reconstructed_pos);
        runs.push(SparseRun {
            data_offset: stored_pos,
            data_length: numbytes,
            hole_length,
        });
        stored_pos += numbytes;
        reconstructed_pos = offset + numbytes;
    }
    if reconstructed_pos < real_size {
        runs.push(SparseRun {
            data_offset: stored_pos,
            data_length: 0,
            hole_length: real_size - reconstructed_pos,
        });
    }
    runs
}

fn read_full(stream: &mut dyn SeekableStream, buf: &mut [u8]) -> TarResult<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = stream.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn read_name_payload_bytes(stream: &mut dyn SeekableStream, offset: &mut u64, size: u64) -> TarResult<Vec<u8>> {
    let mut buf = vec![0u8; size as usize];
    read_full(stream, &mut buf)?;
    let blocks = blocks_for_size(size);
    *offset += blocks * BLOCK_SIZE as u64;
    stream.seek(*offset as i64, Whence::Start)?;
    Ok(buf)
}

fn read_name_payload(stream: &mut dyn SeekableStream, offset: &mut u64, size: u64) -> TarResult<String> {
    let buf = read_name_payload_bytes(stream, offset, size)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Split a TAR entry name into `(parent_path, base_name)`, normalizing the
/// common `./foo/bar` prefix that GNU/BSD tar emit for relative archives.
fn split_path(raw_name: &str) -> (String, String) {
    let name = raw_name.trim_start_matches("./").trim_end_matches('/');
    match name.rfind('/') {
        Some(i) => (format!("/{}", &name[..i]), name[i + 1..].to_string()),
        None => ("/".to_string(), name.to_string()),
    }
}

fn ancestor_dirs(path: &str) -> Vec<String> {
    let mut dirs = Vec::new();
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return dirs;
    }
    let mut acc = String::new();
    for component in trimmed.split('/') {
        acc.push('/');
        acc.push_str(component);
        dirs.push(acc.clone());
    }
    dirs
}

fn add_missing_implicit_dirs(entries: &mut Vec<FileEntry>, implicit_dirs: BTreeMap<String, ()>) {
    let existing: std::collections::BTreeSet<String> = entries
        .iter()
        .filter(|e| e.kind == EntryKind::Directory)
        .map(|e| e.full_path())
        .collect();

    for dir_path in implicit_dirs.keys() {
        if existing.contains(dir_path) {
            continue;
        }
        let (path, name) = split_path(dir_path);
        entries.push(FileEntry {
            path,
            name,
            offset_header: 0,
            offset_data: 0,
            size: 0,
            mtime: 0,
            mode: 0o755,
            uid: 0,
            gid: 0,
            kind: EntryKind::Directory,
            linkname: None,
            is_nested_archive: false,
            version: 1,
            sparsity_map: None,
            nlink: 2,
            extended_attrs_offset: None,
        });
    }
}

fn fixup_directory_nlinks(entries: &mut [FileEntry]) {
    let mut subdir_counts: BTreeMap<String, u32> = BTreeMap::new();
    for e in entries.iter() {
        if e.kind == EntryKind::Directory {
            *subdir_counts.entry(e.path.clone()).or_insert(0) += 1;
        }
    }
    for e in entries.iter_mut() {
        if e.kind == EntryKind::Directory {
            let full = e.full_path();
            e.nlink = 2 + subdir_counts.get(&full).copied().unwrap_or(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seekable::plain::PlainStream;
    use std::io::Cursor;

    fn checksummed_block(name: &str, size: u64, typeflag: u8) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[..name.len()].copy_from_slice(name.as_bytes());
        let mode = format!("{:07o}\0", 0o644);
        block[100..100 + mode.len()].copy_from_slice(mode.as_bytes());
        let size_oct = format!("{:011o}\0", size);
        block[124..124 + size_oct.len()].copy_from_slice(size_oct.as_bytes());
        let mtime_oct = format!("{:011o}\0", 0);
        block[136..136 + mtime_oct.len()].copy_from_slice(mtime_oct.as_bytes());
        block[156] = typeflag;
        block[257..263].copy_from_slice(b"ustar\0");
        block[263..265].copy_from_slice(b"00");
        block[148..156].copy_from_slice(b"        ");
        let sum: u64 = block.iter().map(|&b| b as u64).sum();
        let checksum = format!("{sum:06o}\0 ");
        block[148..156].copy_from_slice(checksum.as_bytes());
        block
    }

    fn single_file_tar(name: &str, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&checksummed_block(name, payload.len() as u64, b'0'));
        out.extend_from_slice(payload);
        let pad = (BLOCK_SIZE - (payload.len() % BLOCK_SIZE)) % BLOCK_SIZE;
        out.extend(std::iter::repeat(0u8).take(pad));
        out.extend(std::iter::repeat(0u8).take(BLOCK_SIZE * 2));
        out
    }

    #[test]
    fn indexes_a_single_regular_file() {
        let tar = single_file_tar("bar", b"hello world");
        let mut stream = PlainStream::with_len(Cursor::new(tar), 0);
        let build = TarIndexer::new(IndexerOptions::default()).scan(&mut stream).unwrap();
        let bar = build
            .entries
            .iter()
            .find(|e| e.name == "bar" && e.kind == EntryKind::Regular)
            .unwrap();
        assert_eq!(bar.size, 11);
        assert_eq!(bar.path, "/");
    }

    #[test]
    fn implicit_parent_directories_are_materialized() {
        let tar = single_file_tar("foo/bar", b"x");
        let mut stream = PlainStream::with_len(Cursor::new(tar), 0);
        let build = TarIndexer::new(IndexerOptions::default()).scan(&mut stream).unwrap();
        assert!(build
            .entries
            .iter()
            .any(|e| e.kind == EntryKind::Directory && e.full_path() == "/foo"));
    }

    fn pax_record(key: &str, value: &str) -> Vec<u8> {
        let mut len = key.len() + value.len() + 3;
        loop {
            let candidate = len.to_string().len() + key.len() + value.len() + 3;
            if candidate == len {
                break;
            }
            len = candidate;
        }
        format!("{len} {key}={value}\n").into_bytes()
    }

    fn pad_to_block(buf: &mut Vec<u8>) {
        let pad = (BLOCK_SIZE - (buf.len() % BLOCK_SIZE)) % BLOCK_SIZE;
        buf.extend(std::iter::repeat(0u8).take(pad));
    }

    #[test]
    fn gnu_sparse_map_pax_record_yields_real_runs_and_true_size() {
        let mut pax_payload = Vec::new();
        pax_payload.extend(pax_record("GNU.sparse.map", "0,4,10,6"));
        pax_payload.extend(pax_record("GNU.sparse.realsize", "20"));

        let mut tar = Vec::new();
        tar.extend_from_slice(&checksummed_block("pax_hdr", pax_payload.len() as u64, b'x'));
        tar.extend_from_slice(&pax_payload);
        pad_to_block(&mut tar);

        let stored_data = b"AAAABBBBBB"; // 4 bytes + 6 bytes of real data, back to back
        tar.extend_from_slice(&checksummed_block("sparsefile", stored_data.len() as u64, b'S'));
        tar.extend_from_slice(stored_data);
        pad_to_block(&mut tar);
        tar.extend(std::iter::repeat(0u8).take(BLOCK_SIZE * 2));

        let mut stream = PlainStream::with_len(Cursor::new(tar), 0);
        let build = TarIndexer::new(IndexerOptions::default()).scan(&mut stream).unwrap();
        let entry = build.entries.iter().find(|e| e.name == "sparsefile").unwrap();

        assert_eq!(entry.kind, EntryKind::Sparse);
        assert_eq!(entry.size, 20);
        let runs = entry.sparsity_map.as_ref().unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!((runs[0].hole_length, runs[0].data_offset, runs[0].data_length), (0, 0, 4));
        assert_eq!((runs[1].hole_length, runs[1].data_offset, runs[1].data_length), (6, 4, 6));
        assert_eq!((runs[2].hole_length, runs[2].data_length), (4, 0));
    }

    #[test]
    fn gnu_sparse_without_a_pax_map_warns_and_leaves_an_empty_map() {
        let tar = single_file_tar_with_typeflag("legacy_sparse", b"whatever", b'S');
        let mut stream = PlainStream::with_len(Cursor::new(tar), 0);
        let build = TarIndexer::new(IndexerOptions::default()).scan(&mut stream).unwrap();
        let entry = build.entries.iter().find(|e| e.name == "legacy_sparse").unwrap();
        assert!(entry.sparsity_map.as_ref().unwrap().is_empty());
        assert!(build
            .warnings
            .iter()
            .any(|w| matches!(w, IndexWarning::UnsupportedSparseFormat { name, .. } if name == "legacy_sparse")));
    }

    fn single_file_tar_with_typeflag(name: &str, payload: &[u8], typeflag: u8) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&checksummed_block(name, payload.len() as u64, typeflag));
        out.extend_from_slice(payload);
        let pad = (BLOCK_SIZE - (payload.len() % BLOCK_SIZE)) % BLOCK_SIZE;
        out.extend(std::iter::repeat(0u8).take(pad));
        out.extend(std::iter::repeat(0u8).take(BLOCK_SIZE * 2));
        out
    }

    #[test]
    fn duplicate_paths_become_successive_versions() {
        let mut tar = Vec::new();
        for (payload, _) in [(&b"123"[..], 1), (&b"abcdef"[..], 2)] {
            let mut block = checksummed_block("dup", payload.len() as u64, b'0');
            tar.extend_from_slice(&mut block);
            tar.extend_from_slice(payload);
            let pad = (BLOCK_SIZE - (payload.len() % BLOCK_SIZE)) % BLOCK_SIZE;
            tar.extend(std::iter::repeat(0u8).take(pad));
        }
        tar.extend(std::iter::repeat(0u8).take(BLOCK_SIZE * 2));
        let mut stream = PlainStream::with_len(Cursor::new(tar), 0);
        let build = TarIndexer::new(IndexerOptions::default()).scan(&mut stream).unwrap();
        let dups: Vec<_> = build.entries.iter().filter(|e| e.name == "dup").collect();
        assert_eq!(dups.len(), 2);
        assert!(dups.iter().any(|e| e.version == 1));
        assert!(dups.iter().any(|e| e.version == 2));
    }
}
