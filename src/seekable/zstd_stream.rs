//! Checkpointed zstd back-end.
//!
//! Unlike gzip/bzip2/xz, concatenated zstd frames are the *normal* shape
//! zstd already produces for streaming compression (`zstd --long` and the
//! reference CLI both emit multi-frame output above a size threshold), so
//! this back-end needs no special archive convention — it just has to find
//! the frame boundaries. `zstd_safe::find_frame_compressed_size` gives the
//! exact compressed length of one frame without decoding it, so the next
//! frame's start is known up front rather than derived from decoder
//! position.

use std::io::Read;

use crate::seekable::{CheckpointedStream, FrameDecoder, StreamError, StreamResult};

struct ZstdFrameDecoder;

impl FrameDecoder for ZstdFrameDecoder {
    fn decode_one(&self, compressed: &[u8], start: u64) -> StreamResult<(Vec<u8>, u64)> {
        let remaining = &compressed[start as usize..];
        let frame_len = zstd_safe::find_frame_compressed_size(remaining)
            .map_err(|_| StreamError::Corrupt { offset: start })?;

        let mut decoder = zstd::stream::read::Decoder::new(&remaining[..frame_len])
            .map_err(StreamError::Io)?
            .single_frame();

        let mut out = Vec::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = decoder.read(&mut buf).map_err(|_| StreamError::Corrupt { offset: start })?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }

        Ok((out, start + frame_len as u64))
    }
}

pub fn open(compressed: Vec<u8>) -> StreamResult<CheckpointedStream> {
    CheckpointedStream::open(compressed, Box::new(ZstdFrameDecoder), 0)
}
