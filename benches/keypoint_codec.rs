//! Benchmarks for keypoint encoding and decoding
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use visionflow::codec::{decode, encode_position, optimize_encoder_size, KeypointEncoder, RecordLayout};
use visionflow::config::{EngineConfig, PyramidSettings, ReaderSettings};
use visionflow::gpu::{AsyncReader, Gpu};

/// Encoder texture holding `count` records followed by the end sentinel
fn encoded_stream(count: usize, layout: RecordLayout) -> (Vec<u8>, u32) {
    let length = optimize_encoder_size(count, layout);
    let mut bytes = vec![0xFF; (length * length * 4) as usize];
    for (i, record) in bytes
        .chunks_exact_mut(layout.bytes_per_record())
        .take(count)
        .enumerate()
    {
        record.fill(0);
        record[..4].copy_from_slice(&encode_position((i % 640) as f32, (i / 640) as f32));
        record[4..8].copy_from_slice(&[0, 32, 200, 0]);
    }
    (bytes, length)
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    let pyramid = PyramidSettings::default();

    for count in [64, 1024, 8192] {
        for layout in [RecordLayout::default(), RecordLayout::new(32, 0)] {
            let (bytes, length) = encoded_stream(count, layout);
            group.throughput(Throughput::Elements(count as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("descriptor_{}", layout.descriptor_size), count),
                &bytes,
                |b, bytes| {
                    b.iter(|| black_box(decode(bytes, layout, length, length, &pyramid)));
                },
            );
        }
    }

    group.finish();
}

fn bench_optimize_encoder_size(c: &mut Criterion) {
    let layout = RecordLayout::new(32, 8);
    c.bench_function("optimize_encoder_size", |b| {
        let mut count = 0usize;
        b.iter(|| {
            count = (count + 97) % 8192;
            black_box(optimize_encoder_size(black_box(count), layout))
        });
    });
}

fn bench_software_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("software_encode");
    group.sample_size(10);

    let config = EngineConfig::default();
    let layout = RecordLayout::default();
    for side in [32u32, 64] {
        let gpu = Gpu::software(&config).expect("software backend");
        let mut encoder = KeypointEncoder::new(&gpu, &config.encoder).expect("encoder");
        let mut reader = AsyncReader::new(&gpu, &ReaderSettings::default()).expect("reader");

        // one keypoint every 7 pixels
        let mut pixels = vec![0u8; (side * side * 4) as usize];
        for pixel in pixels.chunks_exact_mut(4).step_by(7) {
            pixel.copy_from_slice(&[255, 0, 0, 0]);
        }
        let texture = gpu.create_texture(side, side).expect("texture");
        let texture = gpu.upload(&texture, side, side, &pixels).expect("upload");
        encoder.optimize(pixels.len() / 28 + 1, layout);

        group.bench_with_input(BenchmarkId::from_parameter(side), &texture, |b, texture| {
            b.iter(|| {
                let encoded = encoder.encode_default(texture, layout).expect("encode");
                black_box(reader.read_sync(&encoded, None).expect("read").len())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decode, bench_optimize_encoder_size, bench_software_encode);
criterion_main!(benches);
