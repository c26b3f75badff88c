//! `SeekableStream` — uniform seek/read over possibly-compressed bytes.
//!
//! One trait, several back-ends, dispatched as `Box<dyn SeekableStream>` —
//! the same shape as the teacher's `codec::Codec` trait + `get_codec`
//! factory, just read-oriented instead of whole-buffer compress/decompress.
//!
//! # Checkpoints
//!
//! Every back-end that *can* support random access builds a `BlockIndex`
//! (see `crate::block_index`) of `(compressed_offset, decompressed_offset,
//! decoder_state_blob)` checkpoints during its first full sequential
//! traversal. To seek to decompressed offset `D`: binary-search the nearest
//! checkpoint `<= D`, restore the decoder there, discard `D - checkpoint`
//! bytes of output. A back-end that cannot produce checkpoints (e.g. a
//! single-frame xz stream) reports `supports_random_access() == false`;
//! upper layers then refuse to mount it with an actionable error instead of
//! silently falling back to linear scans on every seek.

pub mod bzip2_stream;
pub mod gzip;
mod materialized;
pub mod plain;
pub mod xz_stream;
pub mod zstd_stream;

pub use materialized::{CheckpointedStream, FrameDecoder};

use std::io;
use thiserror::Error;

use crate::block_index::BlockIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("corrupt stream at offset {offset}")]
    Corrupt { offset: u64 },
    #[error("truncated stream")]
    Truncated,
    #[error("unsupported: {feature}")]
    Unsupported { feature: String },
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("decode cancelled")]
    Cancelled,
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// A seekable decompressor over a (possibly compressed) byte stream.
///
/// All offsets at this API surface are decompressed-stream *byte* offsets,
/// never bit offsets — checkpoint bit offsets are a back-end implementation
/// detail hidden inside `BlockIndex`.
pub trait SeekableStream: Send {
    /// Read up to `buf.len()` bytes at the current position. Reads past
    /// end return a short read (including zero), never an error.
    fn read(&mut self, buf: &mut [u8]) -> StreamResult<usize>;

    /// Seek to `offset` relative to `whence`. Seeking past the end is
    /// allowed; subsequent reads from there return 0 bytes.
    fn seek(&mut self, offset: i64, whence: Whence) -> StreamResult<u64>;

    /// Current decompressed-stream position.
    fn tell(&self) -> u64;

    /// Total decompressed size, if known up front (compressed formats that
    /// must be scanned to determine size may return it lazily after the
    /// first full traversal).
    fn size(&self) -> Option<u64>;

    /// Whether this back-end can restore a checkpoint and therefore
    /// support true random access, vs. only forward-sequential decode.
    fn supports_random_access(&self) -> bool;

    /// The checkpoint table built so far (read-only view for `BlockIndex`
    /// persistence into the SQLite index).
    fn checkpoints(&self) -> &BlockIndex;
}

/// Read the full decompressed contents of a stream. Used by tests and by
/// the CLI's `cat` command; production code paths read through
/// `StenciledFile` instead.
pub fn read_all<S: SeekableStream + ?Sized>(stream: &mut S) -> StreamResult<Vec<u8>> {
    stream.seek(0, Whence::Start)?;
    let mut out = Vec::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}
