//! Benchmarks for rANS level coding.
//!
//! Run with: `cargo bench -p mcquic-entropy`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use mcquic_entropy::{EntropyCoder, FrequencyModel, DEFAULT_EMA};

/// Index map with a geometric-ish distribution over `k` codes.
fn generate_indices(len: usize, k: usize) -> Vec<u16> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..len)
        .map(|_| {
            let u: f64 = rng.gen_range(0.0..1.0);
            ((u * u * u) * k as f64) as u16
        })
        .collect()
}

fn bench_level_coding(c: &mut Criterion) {
    let mut group = c.benchmark_group("rans_level");
    let m = 4;

    for &(side, k) in &[(32usize, 128usize), (64, 512), (128, 2048)] {
        let plane = side * side;
        let indices = generate_indices(m * plane, k);
        let model = FrequencyModel::from_name("ema", m, &[k], DEFAULT_EMA).unwrap();
        let mut coder = EntropyCoder::new(m, vec![k], model).unwrap();
        let mut counts = vec![vec![0.0; k]; m];
        for (i, &s) in indices.iter().enumerate() {
            counts[i / plane][s as usize] += 1.0;
        }
        coder.observe(0, &counts).unwrap();
        let tables = coder.cdf_tables().unwrap();
        let encoded = coder.encode_level(0, &tables[0], &indices, plane).unwrap();

        group.throughput(Throughput::Elements(indices.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", side), &indices, |b, idx| {
            b.iter(|| coder.encode_level(0, &tables[0], black_box(idx), plane).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decode", side), &encoded, |b, bytes| {
            b.iter(|| {
                coder
                    .decode_level(0, &tables[0], black_box(bytes), side, side)
                    .unwrap()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_level_coding);
criterion_main!(benches);
