//! Checkpointed bzip2 back-end.
//!
//! bzip2 already splits its payload into independent ~900 KiB blocks
//! internally, but `libbz2` doesn't surface block boundaries through the
//! high-level stream API. We get the same effect the same way `bzip2
//! --multistream`-produced archives allow reassembly: by concatenating
//! independent single-block bzip2 streams, each a clean checkpoint with no
//! restart state to carry. A single-stream (ordinary) `.bz2` file still
//! decodes correctly, just without extra checkpoints beyond offset 0.

use std::io::{Cursor, Read};

use bzip2::bufread::BzDecoder;

use crate::seekable::{CheckpointedStream, FrameDecoder, StreamError, StreamResult};

struct Bzip2FrameDecoder;

impl FrameDecoder for Bzip2FrameDecoder {
    fn decode_one(&self, compressed: &[u8], start: u64) -> StreamResult<(Vec<u8>, u64)> {
        let cursor = Cursor::new(&compressed[start as usize..]);
        let mut decoder = BzDecoder::new(cursor);

        let mut out = Vec::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = decoder.read(&mut buf).map_err(|_| StreamError::Corrupt { offset: start })?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }

        let consumed = decoder.into_inner().position();
        if consumed == 0 {
            return Err(StreamError::Truncated);
        }
        Ok((out, start + consumed))
    }
}

/// Every stream boundary is its own checkpoint — bzip2 streams are already
/// ~900 KiB by convention, so no extra spacing throttle is needed.
pub fn open(compressed: Vec<u8>) -> StreamResult<CheckpointedStream> {
    CheckpointedStream::open(compressed, Box::new(Bzip2FrameDecoder), 0)
}
