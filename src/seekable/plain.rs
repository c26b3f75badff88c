//! Identity back-end for uncompressed members — the explicit no-op variant
//! in the registry rather than special-casing "no compression" at call
//! sites, the same shape as the teacher's `CodecId::None` in `codec/mod.rs`.

use std::io::{Read, Seek, SeekFrom};

use crate::block_index::BlockIndex;
use crate::seekable::{SeekableStream, StreamError, StreamResult, Whence};

pub struct PlainStream<R> {
    inner: R,
    pos: u64,
    len: Option<u64>,
    checkpoints: BlockIndex,
}

impl<R: Read + Seek> PlainStream<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pos: 0,
            len: None,
            checkpoints: BlockIndex::new(),
        }
    }

    pub fn with_len(inner: R, len: u64) -> Self {
        Self {
            inner,
            pos: 0,
            len: Some(len),
            checkpoints: BlockIndex::new(),
        }
    }
}

impl<R: Read + Seek + Send> SeekableStream for PlainStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> StreamResult<usize> {
        let n = self.inner.read(buf).map_err(StreamError::Io)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, offset: i64, whence: Whence) -> StreamResult<u64> {
        let from = match whence {
            Whence::Start => SeekFrom::Start(offset.max(0) as u64),
            Whence::Current => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(offset),
        };
        self.pos = self.inner.seek(from).map_err(StreamError::Io)?;
        Ok(self.pos)
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn size(&self) -> Option<u64> {
        self.len
    }

    fn supports_random_access(&self) -> bool {
        true
    }

    fn checkpoints(&self) -> &BlockIndex {
        &self.checkpoints
    }
}
