//! `StenciledFile` — a virtual file assembled from segments of one or more
//! underlying `SeekableStream`s.
//!
//! Most TAR members are a single contiguous segment. Sparse files, split
//! archives, and hardlinks all reduce to the same shape: a list of
//! `(source, offset, length)` pieces concatenated into one logical byte
//! range. Modelled the same way the teacher's `block.rs` treats a logical
//! file as an ordered sequence of `BlockRef`s rather than special-casing
//! "whole file in one block".

use std::sync::{Arc, Mutex};

use crate::block_index::BlockIndex;
use crate::perf::{decode_blocks_in_order, CancellationToken, DecodeTaskError};
use crate::seekable::{SeekableStream, StreamError, StreamResult, Whence};

/// One contiguous run of bytes drawn from `source`, starting at
/// `source_offset` within it, `len` bytes long, placed at `virtual_offset`
/// in the logical file.
#[derive(Clone)]
pub struct Segment {
    pub source: Arc<Mutex<dyn SeekableStream>>,
    pub source_offset: u64,
    pub virtual_offset: u64,
    pub len: u64,
}

/// A sparse-file hole: reads in this range must synthesize zero bytes
/// rather than touch any backing source.
#[derive(Clone, Copy)]
pub struct Hole {
    pub virtual_offset: u64,
    pub len: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PieceKind {
    Segment(usize),
    Hole(usize),
}

struct Piece {
    virtual_offset: u64,
    len: u64,
    kind: PieceKind,
}

pub struct StenciledFile {
    segments: Vec<Segment>,
    holes: Vec<Hole>,
    pieces: Vec<Piece>,
    total_len: u64,
    pos: u64,
    /// Always empty: a stencil composes already-checkpointed sources, so it
    /// never builds restart points of its own. Exists only so a stencil
    /// can be re-indexed as a fresh `SeekableStream` (`AutoMountLayer`
    /// mounting a nested archive's contents).
    checkpoints: BlockIndex,
}

impl StenciledFile {
    /// Build from segments and holes, sorting both by virtual offset and
    /// interleaving them into one piece list for binary search. Panics if
    /// segments and holes overlap or leave a gap — a caller bug in the TAR
    /// indexer, not a data condition.
    pub fn new(mut segments: Vec<Segment>, mut holes: Vec<Hole>) -> Self {
        segments.sort_by_key(|s| s.virtual_offset);
        holes.sort_by_key(|h| h.virtual_offset);

        let mut pieces = Vec::with_capacity(segments.len() + holes.len());
        for (i, s) in segments.iter().enumerate() {
            pieces.push(Piece {
                virtual_offset: s.virtual_offset,
                len: s.len,
                kind: PieceKind::Segment(i),
            });
        }
        for (i, h) in holes.iter().enumerate() {
            pieces.push(Piece {
                virtual_offset: h.virtual_offset,
                len: h.len,
                kind: PieceKind::Hole(i),
            });
        }
        pieces.sort_by_key(|p| p.virtual_offset);

        let mut expected = 0u64;
        for p in &pieces {
            debug_assert_eq!(
                p.virtual_offset, expected,
                "stencil pieces must tile the logical file with no gap or overlap"
            );
            expected += p.len;
        }

        let total_len = expected;
        Self {
            segments,
            holes,
            pieces,
            total_len,
            pos: 0,
            checkpoints: BlockIndex::new(),
        }
    }

    /// Single contiguous segment over one source — the common case.
    pub fn single(source: Arc<Mutex<dyn SeekableStream>>, source_offset: u64, len: u64) -> Self {
        Self::new(
            vec![Segment {
                source,
                source_offset,
                virtual_offset: 0,
                len,
            }],
            Vec::new(),
        )
    }

    pub fn len(&self) -> u64 {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    fn piece_at(&self, virtual_offset: u64) -> Option<&Piece> {
        if virtual_offset >= self.total_len {
            return None;
        }
        let idx = match self
            .pieces
            .binary_search_by_key(&virtual_offset, |p| p.virtual_offset)
        {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        Some(&self.pieces[idx])
    }

    pub fn seek(&mut self, offset: i64, whence: Whence) -> StreamResult<u64> {
        let base = match whence {
            Whence::Start => 0i64,
            Whence::Current => self.pos as i64,
            Whence::End => self.total_len as i64,
        };
        self.pos = (base + offset).max(0) as u64;
        Ok(self.pos)
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    pub fn read(&mut self, buf: &mut [u8]) -> StreamResult<usize> {
        if self.pos >= self.total_len || buf.is_empty() {
            return Ok(0);
        }
        let Some(piece) = self.piece_at(self.pos) else {
            return Ok(0);
        };
        let within_piece = self.pos - piece.virtual_offset;
        let available = piece.len - within_piece;
        let want = (buf.len() as u64).min(available) as usize;

        match piece.kind {
            PieceKind::Hole(_) => {
                buf[..want].fill(0);
            }
            PieceKind::Segment(i) => {
                let seg = &self.segments[i];
                let mut source = seg.source.lock().expect("stencil source mutex poisoned");
                source.seek(
                    (seg.source_offset + within_piece) as i64,
                    Whence::Start,
                )?;
                let mut read_total = 0usize;
                while read_total < want {
                    let n = source.read(&mut buf[read_total..want])?;
                    if n == 0 {
                        break;
                    }
                    read_total += n;
                }
                self.pos += read_total as u64;
                return Ok(read_total);
            }
        }

        self.pos += want as u64;
        Ok(want)
    }

    pub fn holes(&self) -> &[Hole] {
        &self.holes
    }

    /// Read the whole logical file by decoding every piece concurrently and
    /// reassembling in virtual-offset order — spec.md §5's parallel
    /// decode-and-reassemble model, applied to a stencil's segments instead
    /// of a single compressed stream's blocks. Worthwhile once a file spans
    /// more than one segment (sparse files, split archives); a single-piece
    /// file just runs one task.
    pub fn read_all_parallel(&self, cancel: &CancellationToken) -> StreamResult<Vec<u8>> {
        let chunks = decode_blocks_in_order(&self.pieces, cancel, |_, piece| match piece.kind {
            PieceKind::Hole(_) => Ok(vec![0u8; piece.len as usize]),
            PieceKind::Segment(i) => {
                let seg = &self.segments[i];
                let mut out = vec![0u8; piece.len as usize];
                let mut source = seg.source.lock().expect("stencil source mutex poisoned");
                source.seek(seg.source_offset as i64, Whence::Start)?;
                let mut read_total = 0usize;
                while read_total < out.len() {
                    let n = source.read(&mut out[read_total..])?;
                    if n == 0 {
                        break;
                    }
                    read_total += n;
                }
                Ok(out)
            }
        })
        .map_err(|e| match e {
            DecodeTaskError::Failed { source, .. } => source,
            DecodeTaskError::Cancelled => StreamError::Cancelled,
        })?;

        Ok(chunks.into_iter().flatten().collect())
    }
}

/// Lets a stencil stand in for a fresh compressed source — `AutoMountLayer`
/// re-indexes a nested archive's stencil the same way it would any other
/// `SeekableStream`.
impl SeekableStream for StenciledFile {
    fn read(&mut self, buf: &mut [u8]) -> StreamResult<usize> {
        StenciledFile::read(self, buf)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> StreamResult<u64> {
        StenciledFile::seek(self, offset, whence)
    }

    fn tell(&self) -> u64 {
        StenciledFile::tell(self)
    }

    fn size(&self) -> Option<u64> {
        Some(self.total_len)
    }

    fn supports_random_access(&self) -> bool {
        true
    }

    fn checkpoints(&self) -> &BlockIndex {
        &self.checkpoints
    }
}
