//! Property-based tests for multi-codebook quantization.
//!
//! - Indices always land in `[0, k)`
//! - Dequantizing the indices gives back the quantized latents
//! - The chosen entry is never farther than any other entry
//!
//! Run with: cargo test -p mcquic-neural --test proptest_quantizer

use proptest::prelude::*;

use mcquic_core::DistanceKind;
use mcquic_neural::{Codebook, MultiCodebookQuantizer};

fn setup_strategy() -> impl Strategy<Value = (usize, usize, usize, Vec<f32>)> {
    // (m, d, k, latents)
    (1usize..4, 1usize..4, 2usize..40, 1usize..20).prop_flat_map(|(m, d, k, n)| {
        prop::collection::vec(-2.0f32..2.0, n * m * d).prop_map(move |z| (m, d, k, z))
    })
}

fn quantizer(m: usize, d: usize, k: usize, distance: DistanceKind) -> MultiCodebookQuantizer {
    let books = (0..m)
        .map(|g| Codebook::lattice(k, d, -1.0 - g as f32 * 0.1, 1.0))
        .collect();
    MultiCodebookQuantizer::new(m * d, distance, vec![books]).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 100,
        ..ProptestConfig::default()
    })]

    /// Property: every index is a valid entry.
    #[test]
    fn prop_indices_in_range(
        (m, d, k, z) in setup_strategy(),
        cosine in any::<bool>(),
    ) {
        let distance = if cosine { DistanceKind::Cosine } else { DistanceKind::Euclidean };
        let q = quantizer(m, d, k, distance);
        let out = q.quantize(0, &z).unwrap();
        prop_assert_eq!(out.indices.len(), m * out.n);
        prop_assert!(out.indices.iter().all(|&i| (i as usize) < k));
    }

    /// Property: dequantize(quantize(z).indices) == quantize(z).values.
    #[test]
    fn prop_dequantize_matches(
        (m, d, k, z) in setup_strategy(),
    ) {
        let q = quantizer(m, d, k, DistanceKind::Euclidean);
        let out = q.quantize(0, &z).unwrap();
        prop_assert_eq!(q.dequantize(0, &out.indices).unwrap(), out.values);
    }

    /// Property: the selected entry minimises the squared distance.
    #[test]
    fn prop_nearest_is_minimal(
        (m, d, k, z) in setup_strategy(),
    ) {
        let q = quantizer(m, d, k, DistanceKind::Euclidean);
        let out = q.quantize(0, &z).unwrap();
        for (i, latent) in z.chunks(m * d).enumerate() {
            for (g, part) in latent.chunks(d).enumerate() {
                let book = &q.codebooks(0)[g];
                let dist = |e: &[f32]| -> f32 {
                    part.iter().zip(e).map(|(a, b)| (a - b) * (a - b)).sum()
                };
                let chosen = dist(book.entry(out.indices[g * out.n + i] as usize).unwrap());
                for j in 0..k {
                    prop_assert!(chosen <= dist(book.entry(j).unwrap()));
                }
            }
        }
    }
}
