//! Checkpointed gzip back-end.
//!
//! Ordinary single-member gzip has no internal restart points — the whole
//! point of the deflate format is that every block depends on the
//! preceding window — so random access there can only come from treating
//! the file as a sequence of independently-decodable gzip *members*
//! (exactly the BGZF/`bgzip`/`dictzip` convention: concatenate many small
//! gzip streams instead of one big one). We detect that shape rather than
//! assume it: a plain single-member `.gz` still decodes correctly here,
//! it just reports `supports_random_access() == false`, same contract as
//! single-frame xz in `xz_stream`.
//!
//! Grounded in the teacher's `codec::GzipCodec` for crate usage, extended
//! with member-boundary scanning the teacher's codecs never needed because
//! `archive.rs` only ever compresses/decompresses one whole block at a
//! time.

use std::io::{Cursor, Read};

use flate2::bufread::GzDecoder;

use crate::seekable::{CheckpointedStream, FrameDecoder, StreamError, StreamResult};

struct GzipFrameDecoder;

impl FrameDecoder for GzipFrameDecoder {
    fn decode_one(&self, compressed: &[u8], start: u64) -> StreamResult<(Vec<u8>, u64)> {
        let cursor = Cursor::new(&compressed[start as usize..]);
        let mut decoder = GzDecoder::new(cursor);

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

pub fn open(compressed: Vec<u8>, checkpoint_spacing: u64) -> StreamResult<CheckpointedStream> {
    CheckpointedStream::open(compressed, Box::new(GzipFrameDecoder), checkpoint_spacing)
}
