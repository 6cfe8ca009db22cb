//! Codebooks for multi-codebook quantization

use mcquic_core::{DistanceKind, Error, Result, EPS};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// A codebook of `k` entries of dimension `d`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Codebook {
    /// Number of entries
    k: usize,
    /// Dimension of each entry
    d: usize,
    /// Entry vectors [k × d]
    entries: Vec<f32>,
}

impl Codebook {
    /// Create from existing entries
    pub fn from_entries(k: usize, d: usize, entries: Vec<f32>) -> Result<Self> {
        if k == 0 || d == 0 {
            return Err(Error::config(format!("codebook {}x{} is empty", k, d)));
        }
        if entries.len() != k * d {
            return Err(Error::shape(k * d, entries.len()));
        }
        Ok(Self { k, d, entries })
    }

    /// Regular grid over `[lo, hi]^d`.
    ///
    /// The first `n^d` entries form the grid (largest `n` with `n^d <= k`).
    /// Entries beyond the grid are drawn from a generator seeded by the
    /// shape, so the result is fully deterministic.
    pub fn lattice(k: usize, d: usize, lo: f32, hi: f32) -> Self {
        let mut n = 1usize;
        while (n + 1).checked_pow(d as u32).is_some_and(|v| v <= k) {
            n += 1;
        }

        let mut rng = StdRng::seed_from_u64(((k as u64) << 16) ^ d as u64);
        let mut entries = Vec::with_capacity(k * d);
        let grid = if n >= 2 { n.pow(d as u32) } else { 0 };
        let step = if n >= 2 { (hi - lo) / (n - 1) as f32 } else { 0.0 };

        for i in 0..grid {
            let mut rest = i;
            for _ in 0..d {
                entries.push(lo + (rest % n) as f32 * step);
                rest /= n;
            }
        }
        for _ in grid * d..k * d {
            entries.push(rng.gen_range(lo..hi));
        }

        Self { k, d, entries }
    }

    /// Number of entries
    pub fn k(&self) -> usize {
        self.k
    }

    /// Entry dimension
    pub fn d(&self) -> usize {
        self.d
    }

    /// All entries, row-major
    pub fn entries(&self) -> &[f32] {
        &self.entries
    }

    /// Mutable entries, row-major
    pub fn entries_mut(&mut self) -> &mut [f32] {
        &mut self.entries
    }

    /// Get entry by index
    pub fn entry(&self, index: usize) -> Option<&[f32]> {
        if index >= self.k {
            return None;
        }
        let offset = index * self.d;
        Some(&self.entries[offset..offset + self.d])
    }

    /// Find nearest entry for a vector.
    ///
    /// Ties resolve to the lowest index.
    pub fn nearest(&self, vector: &[f32], distance: DistanceKind) -> Result<(usize, f32)> {
        if vector.len() != self.d {
            return Err(Error::shape(self.d, vector.len()));
        }
        Ok(self.nearest_unchecked(vector, distance))
    }

    #[inline]
    pub(crate) fn nearest_unchecked(&self, vector: &[f32], distance: DistanceKind) -> (usize, f32) {
        let mut best_idx = 0;
        let mut best_dist = f32::INFINITY;

        match distance {
            DistanceKind::Euclidean => {
                for (i, entry) in self.entries.chunks_exact(self.d).enumerate() {
                    let dist = squared_distance(vector, entry);
                    if dist < best_dist {
                        best_dist = dist;
                        best_idx = i;
                    }
                }
            }
            DistanceKind::Cosine => {
                let norm = norm(vector).max(EPS as f32);
                for (i, entry) in self.entries.chunks_exact(self.d).enumerate() {
                    let dot: f32 = vector.iter().zip(entry).map(|(a, b)| a * b).sum();
                    let dist = 1.0 - dot / (norm * norm_of(entry));
                    if dist < best_dist {
                        best_dist = dist;
                        best_idx = i;
                    }
                }
            }
        }

        (best_idx, best_dist)
    }

    /// Encode a batch of vectors to indices
    pub fn encode_batch(&self, vectors: &[f32], distance: DistanceKind) -> Result<Vec<u16>> {
        if vectors.len() % self.d != 0 {
            return Err(Error::shape(
                format!("multiple of {}", self.d),
                vectors.len(),
            ));
        }
        Ok(vectors
            .chunks_exact(self.d)
            .map(|v| self.nearest_unchecked(v, distance).0 as u16)
            .collect())
    }

    /// Decode indices to vectors
    pub fn decode_batch(&self, indices: &[u16]) -> Result<Vec<f32>> {
        let mut vectors = Vec::with_capacity(indices.len() * self.d);
        for &idx in indices {
            let entry = self.entry(idx as usize).ok_or(Error::IndexOutOfRange {
                index: idx as usize,
                k: self.k,
            })?;
            vectors.extend_from_slice(entry);
        }
        Ok(vectors)
    }

    /// Number of distinct entries hit by `indices`
    pub fn count_usage(&self, indices: &[u16]) -> usize {
        let mut seen = vec![false; self.k];
        for &i in indices {
            if let Some(s) = seen.get_mut(i as usize) {
                *s = true;
            }
        }
        seen.into_iter().filter(|&s| s).count()
    }
}

/// Squared L2 distance between two vectors
#[inline]
pub(crate) fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[inline]
fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[inline]
fn norm_of(v: &[f32]) -> f32 {
    norm(v).max(EPS as f32)
}
