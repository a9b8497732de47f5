//! Throughput benchmarks for the segmenter and the block codecs.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use dwarfs::codec::{CompressionConstraints, CompressionSpec};
use dwarfs::segmenter::{Segmenter, SegmenterConfig};
use dwarfs::writer::block_manager::BlockManager;

fn pseudo_random(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        out.push((seed >> 33) as u8);
    }
    out
}

fn segment(data: &[u8], cfg: &SegmenterConfig) -> u64 {
    let mut seg = Segmenter::new(
        cfg,
        &CompressionConstraints::default(),
        Arc::new(BlockManager::new()),
        Box::new(|_, _| {}),
    );
    let chunks = seg.add_chunkable(data);
    let stats = seg.finish();
    chunks.len() as u64 + stats.blocks_closed
}

fn bench_segmenter(c: &mut Criterion) {
    let cfg = SegmenterConfig { block_size_bits: 20, ..Default::default() };
    let random = pseudo_random(8 << 20, 1);
    let mut duplicated = pseudo_random(4 << 20, 2);
    duplicated.extend_from_within(..);

    let mut group = c.benchmark_group("segmenter");
    group.throughput(Throughput::Bytes(random.len() as u64));
    group.bench_function("random_input", |b| {
        b.iter(|| segment(black_box(&random), &cfg));
    });
    group.throughput(Throughput::Bytes(duplicated.len() as u64));
    group.bench_function("duplicated_input", |b| {
        b.iter(|| segment(black_box(&duplicated), &cfg));
    });
    group.finish();
}

fn bench_codecs(c: &mut Criterion) {
    let data = pseudo_random(1 << 20, 3);
    let mut group = c.benchmark_group("compress_1MiB");
    group.throughput(Throughput::Bytes(data.len() as u64));
    for spec in ["null", "zstd", "lz4"] {
        let compressor = CompressionSpec::parse(spec).unwrap().make_compressor().unwrap();
        group.bench_function(spec, |b| {
            b.iter(|| compressor.compress(black_box(&data), None).unwrap().len());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_segmenter, bench_codecs);
criterion_main!(benches);
