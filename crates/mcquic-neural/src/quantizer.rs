//! Multi-codebook product quantization.
//!
//! A latent vector of `channel` values is split into `m` groups of
//! `d = channel / m` values. Group `g` is quantized independently against
//! its own codebook, so one latent costs `m` indices.
//!
//! Latents are laid out `[n][channel]`; indices come back group-major as
//! `[m][n]`, the layout the entropy coder consumes.

use mcquic_core::{DistanceKind, Error, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::codebook::Codebook;

/// Output of a hard quantization pass
#[derive(Debug, Clone, PartialEq)]
pub struct Quantized {
    /// Number of latent vectors
    pub n: usize,
    /// Selected entries, `[m][n]`
    pub indices: Vec<u16>,
    /// Quantized latents, `[n][channel]`
    pub values: Vec<f32>,
}

/// One codebook set per level, `m` codebooks each
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiCodebookQuantizer {
    channel: usize,
    m: usize,
    distance: DistanceKind,
    /// `[level][group]`
    codebooks: Vec<Vec<Codebook>>,
}

impl MultiCodebookQuantizer {
    /// Build from explicit codebooks.
    pub fn new(
        channel: usize,
        distance: DistanceKind,
        codebooks: Vec<Vec<Codebook>>,
    ) -> Result<Self> {
        let m = codebooks.first().map_or(0, Vec::len);
        if m == 0 || channel % m != 0 {
            return Err(Error::config(format!(
                "channel {} not divisible into {} groups",
                channel, m
            )));
        }
        let d = channel / m;
        for (level, books) in codebooks.iter().enumerate() {
            if books.len() != m {
                return Err(Error::shape(
                    format!("{} codebooks at level {}", m, level),
                    books.len(),
                ));
            }
            if books.iter().any(|b| b.d() != d) {
                return Err(Error::shape(format!("codeword dim {}", d), "mixed dims"));
            }
            if books.iter().any(|b| b.k() > u16::MAX as usize + 1) {
                return Err(Error::config("codebooks are limited to 65536 entries"));
            }
        }
        Ok(Self {
            channel,
            m,
            distance,
            codebooks,
        })
    }

    /// Latent width.
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Groups per latent.
    pub fn m(&self) -> usize {
        self.m
    }

    /// Group width.
    pub fn d(&self) -> usize {
        self.channel / self.m
    }

    /// Distance used for nearest search.
    pub fn distance(&self) -> DistanceKind {
        self.distance
    }

    /// Number of levels.
    pub fn levels(&self) -> usize {
        self.codebooks.len()
    }

    /// Codebook size at `level`.
    pub fn k(&self, level: usize) -> usize {
        self.codebooks[level][0].k()
    }

    /// Codebooks at `level`.
    pub fn codebooks(&self, level: usize) -> &[Codebook] {
        &self.codebooks[level]
    }

    /// Mutable codebooks at `level`.
    pub fn codebooks_mut(&mut self, level: usize) -> &mut [Codebook] {
        &mut self.codebooks[level]
    }

    /// Every codebook as `(level, group, codebook)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &Codebook)> {
        self.codebooks.iter().enumerate().flat_map(|(level, books)| {
            books.iter().enumerate().map(move |(g, book)| (level, g, book))
        })
    }

    /// Every codebook, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, usize, &mut Codebook)> {
        self.codebooks.iter_mut().enumerate().flat_map(|(level, books)| {
            books.iter_mut().enumerate().map(move |(g, book)| (level, g, book))
        })
    }

    fn check(&self, level: usize, len: usize) -> Result<usize> {
        if level >= self.codebooks.len() {
            return Err(Error::shape(format!("level < {}", self.codebooks.len()), level));
        }
        if len % self.channel != 0 {
            return Err(Error::shape(format!("multiple of {}", self.channel), len));
        }
        Ok(len / self.channel)
    }

    /// Hard-quantize latents `[n][channel]` at `level`.
    pub fn quantize(&self, level: usize, latents: &[f32]) -> Result<Quantized> {
        let n = self.check(level, latents.len())?;
        let books = &self.codebooks[level];
        let d = self.d();
        let distance = self.distance;

        let per_vector: Vec<Vec<u16>> = latents
            .par_chunks(self.channel)
            .map(|z| {
                books
                    .iter()
                    .zip(z.chunks_exact(d))
                    .map(|(book, part)| book.nearest_unchecked(part, distance).0 as u16)
                    .collect()
            })
            .collect();

        let mut indices = vec![0u16; self.m * n];
        let mut values = Vec::with_capacity(n * self.channel);
        for (i, idx) in per_vector.iter().enumerate() {
            for (g, (&code, book)) in idx.iter().zip(books).enumerate() {
                indices[g * n + i] = code;
                let offset = code as usize * d;
                values.extend_from_slice(&book.entries()[offset..offset + d]);
            }
        }

        Ok(Quantized { n, indices, values })
    }

    /// Look up indices `[m][n]` at `level`, returning latents `[n][channel]`.
    pub fn dequantize(&self, level: usize, indices: &[u16]) -> Result<Vec<f32>> {
        let n = self.check(level, indices.len() * self.d())?;
        let books = &self.codebooks[level];
        let mut values = Vec::with_capacity(n * self.channel);
        for i in 0..n {
            for (g, book) in books.iter().enumerate() {
                let code = indices[g * n + i];
                let entry = book.entry(code as usize).ok_or(Error::IndexOutOfRange {
                    index: code as usize,
                    k: book.k(),
                })?;
                values.extend_from_slice(entry);
            }
        }
        Ok(values)
    }

    /// One-hot counts `[m][k]` of indices `[m][n]` at `level`.
    pub fn count(&self, level: usize, indices: &[u16]) -> Vec<Vec<f64>> {
        let k = self.k(level);
        let n = indices.len() / self.m;
        (0..self.m)
            .map(|g| {
                let mut counts = vec![0.0; k];
                for &code in &indices[g * n..(g + 1) * n] {
                    if let Some(c) = counts.get_mut(code as usize) {
                        *c += 1.0;
                    }
                }
                counts
            })
            .collect()
    }
}

/// Gradients produced by [`StraightThrough::backward`]
#[derive(Debug, Clone)]
pub struct SteGradients {
    /// Gradient w.r.t. the continuous latents `[n][channel]`
    pub latents: Vec<f32>,
    /// Gradient w.r.t. each codebook's entries, `[m][k * d]`
    pub codebooks: Vec<Vec<f32>>,
    /// `sum ||z - q||^2 / normalizer`
    pub commitment_loss: f64,
}

/// Straight-through estimator around the hard quantizer.
///
/// Forward is the hard nearest-entry lookup. Backward passes the gradient
/// of the quantized latents straight to the continuous ones, adds the
/// commitment term `beta * ||z - sg(q)||^2`, and pulls the selected entries
/// towards their latents with `||sg(z) - q||^2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StraightThrough {
    /// Commitment weight `beta`
    pub commitment: f32,
}

impl Default for StraightThrough {
    fn default() -> Self {
        Self { commitment: 0.25 }
    }
}

impl StraightThrough {
    /// Hard quantization.
    pub fn forward(
        &self,
        quantizer: &MultiCodebookQuantizer,
        level: usize,
        latents: &[f32],
    ) -> Result<Quantized> {
        quantizer.quantize(level, latents)
    }

    /// Backward pass given `grad_out = dL/dq` for quantized latents.
    ///
    /// Both auxiliary losses are divided by `normalizer`.
    pub fn backward(
        &self,
        quantizer: &MultiCodebookQuantizer,
        level: usize,
        latents: &[f32],
        quantized: &Quantized,
        grad_out: &[f32],
        normalizer: f32,
    ) -> Result<SteGradients> {
        if grad_out.len() != latents.len() || quantized.values.len() != latents.len() {
            return Err(Error::shape(latents.len(), grad_out.len()));
        }
        let m = quantizer.m();
        let d = quantizer.d();
        let channel = quantizer.channel();
        let n = quantized.n;
        let k = quantizer.k(level);
        let scale = 2.0 / normalizer.max(1.0);

        let mut grad_latents = grad_out.to_vec();
        let mut grad_books = vec![vec![0.0f32; k * d]; m];
        let mut commitment_loss = 0.0f64;

        for i in 0..n {
            for g in 0..m {
                let code = quantized.indices[g * n + i] as usize;
                for j in 0..d {
                    let at = i * channel + g * d + j;
                    let diff = latents[at] - quantized.values[at];
                    commitment_loss += (diff * diff) as f64;
                    grad_latents[at] += self.commitment * scale * diff;
                    grad_books[g][code * d + j] -= scale * diff;
                }
            }
        }

        Ok(SteGradients {
            latents: grad_latents,
            codebooks: grad_books,
            commitment_loss: commitment_loss / normalizer.max(1.0) as f64,
        })
    }
}
