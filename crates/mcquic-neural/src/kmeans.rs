//! K-means codebook warm start

use mcquic_core::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::codebook::{squared_distance, Codebook};

/// Configuration for k-means fitting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeansConfig {
    /// Maximum Lloyd iterations
    pub max_iterations: usize,
    /// Convergence threshold (change in MSE)
    pub convergence_threshold: f32,
    /// Seed for reproducibility
    pub seed: u64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            convergence_threshold: 1e-6,
            seed: 0,
        }
    }
}

/// Result of a k-means fit
#[derive(Debug, Clone)]
pub struct KMeansFit {
    /// Fitted codebook
    pub codebook: Codebook,
    /// Final mean squared error per vector
    pub mse: f32,
    /// Lloyd iterations performed
    pub iterations: usize,
}

/// Lloyd's algorithm with k-means++ seeding
pub struct KMeans {
    config: KMeansConfig,
}

impl KMeans {
    /// Create a new fitter
    pub fn new(config: KMeansConfig) -> Self {
        Self { config }
    }

    /// Fit `k` centroids of dimension `d` to `data`.
    ///
    /// With fewer than `k` vectors the surplus centroids keep the entries of
    /// `fallback`.
    pub fn fit(&self, data: &[f32], k: usize, d: usize, fallback: &Codebook) -> Result<KMeansFit> {
        if d == 0 || data.len() % d != 0 {
            return Err(Error::shape(format!("multiple of {}", d), data.len()));
        }
        if fallback.k() != k || fallback.d() != d {
            return Err(Error::shape(
                format!("{}x{}", k, d),
                format!("{}x{}", fallback.k(), fallback.d()),
            ));
        }
        let n = data.len() / d;
        if n == 0 {
            return Ok(KMeansFit {
                codebook: fallback.clone(),
                mse: 0.0,
                iterations: 0,
            });
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let seeded = k.min(n);
        let mut centroids = kmeans_pp_init(seeded, data, d, &mut rng);
        centroids.extend_from_slice(&fallback.entries()[seeded * d..]);

        let mut prev_mse = f32::INFINITY;
        let mut iterations = 0;
        let mut assignments = assign_clusters(&centroids, data, d);

        for iter in 0..self.config.max_iterations {
            iterations = iter + 1;
            update_centroids(&mut centroids, &assignments, data, seeded, d);
            assignments = assign_clusters(&centroids, data, d);

            let mse = compute_mse(&centroids, &assignments, data, d);
            if (prev_mse - mse).abs() < self.config.convergence_threshold {
                break;
            }
            prev_mse = mse;
        }

        let mse = compute_mse(&centroids, &assignments, data, d);
        Ok(KMeansFit {
            codebook: Codebook::from_entries(k, d, centroids)?,
            mse,
            iterations,
        })
    }
}

impl Codebook {
    /// Fit a codebook to `data` from scratch.
    ///
    /// Entries that cannot be seeded from data (fewer vectors than `k`) come
    /// from a lattice over the data's value range.
    pub fn kmeans_init(k: usize, d: usize, data: &[f32], seed: u64) -> Result<Self> {
        let lo = data.iter().copied().fold(f32::INFINITY, f32::min);
        let hi = data.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let (lo, hi) = if lo < hi { (lo, hi) } else { (0.0, 1.0) };
        let fallback = Codebook::lattice(k, d, lo, hi);
        let fitter = KMeans::new(KMeansConfig {
            seed,
            ..Default::default()
        });
        Ok(fitter.fit(data, k, d, &fallback)?.codebook)
    }
}

/// K-means++ seeding
fn kmeans_pp_init(k: usize, data: &[f32], dim: usize, rng: &mut StdRng) -> Vec<f32> {
    let num_vectors = data.len() / dim;
    let mut centroids = Vec::with_capacity(k * dim);
    let mut distances = vec![f32::INFINITY; num_vectors];

    let first_idx = rng.gen_range(0..num_vectors);
    centroids.extend_from_slice(&data[first_idx * dim..(first_idx + 1) * dim]);

    for _ in 1..k {
        let last = centroids.len() - dim;
        for (i, dist) in distances.iter_mut().enumerate() {
            let d = squared_distance(&data[i * dim..(i + 1) * dim], &centroids[last..]);
            *dist = dist.min(d);
        }

        // Sample proportional to squared distance
        let total: f32 = distances.iter().sum();
        let chosen = if total > 0.0 {
            let threshold = rng.gen_range(0.0..1.0f32) * total;
            let mut cumsum = 0.0;
            let mut chosen = num_vectors - 1;
            for (i, &d) in distances.iter().enumerate() {
                cumsum += d;
                if cumsum >= threshold {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            rng.gen_range(0..num_vectors)
        };

        centroids.extend_from_slice(&data[chosen * dim..(chosen + 1) * dim]);
    }

    centroids
}

fn assign_clusters(centroids: &[f32], data: &[f32], dim: usize) -> Vec<usize> {
    data.chunks_exact(dim)
        .map(|v| {
            let mut best = 0;
            let mut best_dist = f32::INFINITY;
            for (i, c) in centroids.chunks_exact(dim).enumerate() {
                let dist = squared_distance(v, c);
                if dist < best_dist {
                    best_dist = dist;
                    best = i;
                }
            }
            best
        })
        .collect()
}

/// Move the first `active` centroids to the mean of their members.
/// Empty clusters keep their position.
fn update_centroids(
    centroids: &mut [f32],
    assignments: &[usize],
    data: &[f32],
    active: usize,
    dim: usize,
) {
    let mut sums = vec![0.0f64; active * dim];
    let mut counts = vec![0usize; active];

    for (v, &a) in data.chunks_exact(dim).zip(assignments) {
        if a >= active {
            continue;
        }
        counts[a] += 1;
        for (s, &x) in sums[a * dim..(a + 1) * dim].iter_mut().zip(v) {
            *s += x as f64;
        }
    }

    for (c, &count) in counts.iter().enumerate() {
        if count > 0 {
            for j in 0..dim {
                centroids[c * dim + j] = (sums[c * dim + j] / count as f64) as f32;
            }
        }
    }
}

fn compute_mse(centroids: &[f32], assignments: &[usize], data: &[f32], dim: usize) -> f32 {
    if assignments.is_empty() {
        return 0.0;
    }
    let total: f32 = data
        .chunks_exact(dim)
        .zip(assignments)
        .map(|(v, &a)| squared_distance(v, &centroids[a * dim..(a + 1) * dim]))
        .sum();
    total / assignments.len() as f32
}
