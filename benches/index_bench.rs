//! Retargeted from the teacher's compression-throughput benchmark at the
//! two hot paths random-access reads actually take: checkpoint lookup
//! (`BlockIndex::nearest_checkpoint_at_or_before`, binary search over
//! however many restart points a long seekable stream accumulates) and
//! `StenciledFile` segment reads (the binary search over pieces plus the
//! underlying source read).

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use ratar_core::block_index::{BlockCheckpoint, BlockIndex};
use ratar_core::seekable::plain::PlainStream;
use ratar_core::seekable::SeekableStream;
use ratar_core::stencil::{Segment, StenciledFile};

fn build_block_index(checkpoint_count: usize, stride: u64) -> BlockIndex {
    let mut idx = BlockIndex::new();
    for i in 0..checkpoint_count {
        idx.push(BlockCheckpoint {
            compressed_bit_offset: (i as u64) * stride * 8 / 10,
            decompressed_byte_offset: (i as u64) * stride,
            decoder_state_blob: Vec::new(),
        });
    }
    idx
}

fn bench_checkpoint_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_index_lookup");
    for &count in &[16usize, 256, 4096, 65536] {
        let idx = build_block_index(count, 4096);
        let probe = (count as u64) * 4096 / 2;
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| idx.nearest_checkpoint_at_or_before(black_box(probe)))
        });
    }
    group.finish();
}

/// A stencil built from `segment_count` equal-sized segments over one
/// shared in-memory source, read sequentially start to end.
fn build_stencil(segment_count: usize, segment_len: u64) -> StenciledFile {
    let total = segment_count as u64 * segment_len;
    let backing = vec![0xabu8; total as usize];
    let source: Arc<Mutex<dyn SeekableStream>> =
        Arc::new(Mutex::new(PlainStream::with_len(Cursor::new(backing), total)));

    let segments = (0..segment_count)
        .map(|i| Segment {
            source: source.clone(),
            source_offset: i as u64 * segment_len,
            virtual_offset: i as u64 * segment_len,
            len: segment_len,
        })
        .collect();

    StenciledFile::new(segments, Vec::new())
}

fn bench_stenciled_sequential_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("stenciled_file_sequential_read");
    for &segment_count in &[1usize, 64, 1024] {
        let segment_len = 4096u64;
        group.bench_with_input(BenchmarkId::from_parameter(segment_count), &segment_count, |b, &segment_count| {
            b.iter_batched(
                || build_stencil(segment_count, segment_len),
                |mut stencil| {
                    let mut buf = [0u8; 4096];
                    loop {
                        let n = stencil.read(&mut buf).unwrap();
                        if n == 0 {
                            break;
                        }
                        black_box(&buf[..n]);
                    }
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_checkpoint_lookup, bench_stenciled_sequential_read);
criterion_main!(benches);
