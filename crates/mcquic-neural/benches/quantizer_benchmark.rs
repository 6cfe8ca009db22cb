//! Benchmarks for nearest-entry search and full-image coding.
//!
//! Run with: `cargo bench -p mcquic-neural`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use mcquic_core::{DistanceKind, ImageCodec, ImageTensor, QualityLevel};
use mcquic_neural::{Codebook, CompressorModel, ModelConfig, MultiCodebookQuantizer};

fn bench_quantize(c: &mut Criterion) {
    let mut group = c.benchmark_group("quantize");
    let mut rng = StdRng::seed_from_u64(42);
    let n = 4096;

    for &k in &[128usize, 512, 2048] {
        let books = vec![Codebook::lattice(k, 3, -0.5, 0.5); 4];
        let q = MultiCodebookQuantizer::new(12, DistanceKind::Euclidean, vec![books]).unwrap();
        let latents: Vec<f32> = (0..n * 12).map(|_| rng.gen_range(-0.5..0.5)).collect();

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("k", k), &latents, |b, z| {
            b.iter(|| q.quantize(0, black_box(z)).unwrap())
        });
    }
    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    group.sample_size(10);
    let model = CompressorModel::new(ModelConfig::default()).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let side = 128;
    let data: Vec<f32> = (0..side * side * 3).map(|_| rng.gen_range(0.0..1.0)).collect();
    let image = ImageTensor::from_vec(side, side, 3, data).unwrap();
    let bytes = model.compress(&image, QualityLevel::full(3)).unwrap();

    group.throughput(Throughput::Elements((side * side) as u64));
    group.bench_function("compress_128", |b| {
        b.iter(|| model.compress(black_box(&image), QualityLevel::full(3)).unwrap())
    });
    group.bench_function("decompress_128", |b| {
        b.iter(|| model.decompress(black_box(&bytes)).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_quantize, bench_codec);
criterion_main!(benches);
