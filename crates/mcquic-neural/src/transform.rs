//! Multi-scale residual transform.
//!
//! ```text
//!   G0 = x ──down2──▶ G1 ──down2──▶ ... ──▶ G(L-1)
//!
//!   level l (coarsest first):
//!     P  = up2(X̂(l+1))        (zero at the coarsest level)
//!     R  = G(l) - P
//!     z  = A · patch(R)        analysis,  channel × 3p²
//!     q  = quantize(z)
//!     X̂  = P + unpatch(S · q)  synthesis, 3p² × channel
//! ```
//!
//! Everything here is plain linear algebra on `[n][dim]` row-major buffers,
//! with the adjoints needed for backpropagation alongside.

use mcquic_core::{Error, ImageTensor, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// 2× box downsample. Odd trailing rows and columns are dropped.
pub fn downsample2(image: &ImageTensor) -> ImageTensor {
    let h = image.height / 2;
    let w = image.width / 2;
    let c = image.channel;
    let mut out = ImageTensor::zeros(h, w, c);
    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                let sum = image.get(2 * y, 2 * x, ch)
                    + image.get(2 * y, 2 * x + 1, ch)
                    + image.get(2 * y + 1, 2 * x, ch)
                    + image.get(2 * y + 1, 2 * x + 1, ch);
                out.set(y, x, ch, sum * 0.25);
            }
        }
    }
    out
}

/// 2× nearest-neighbour upsample.
pub fn upsample2(image: &ImageTensor) -> ImageTensor {
    let c = image.channel;
    let mut out = ImageTensor::zeros(image.height * 2, image.width * 2, c);
    for y in 0..out.height {
        for x in 0..out.width {
            for ch in 0..c {
                out.set(y, x, ch, image.get(y / 2, x / 2, ch));
            }
        }
    }
    out
}

/// Adjoint of [`upsample2`]: sums each 2×2 block.
pub fn upsample2_adjoint(grad: &ImageTensor) -> ImageTensor {
    let scaled = downsample2(grad);
    ImageTensor {
        data: scaled.data.iter().map(|v| v * 4.0).collect(),
        ..scaled
    }
}

/// Gaussian-style pyramid of `levels` box-downsampled images, finest first.
pub fn pyramid(image: &ImageTensor, levels: usize) -> Vec<ImageTensor> {
    let mut out = Vec::with_capacity(levels);
    out.push(image.clone());
    for l in 1..levels {
        let next = downsample2(&out[l - 1]);
        out.push(next);
    }
    out
}

/// Non-overlapping `p × p` patches as vectors of `p * p * channel`.
///
/// Vector element `(dy * p + dx) * channel + c`. Patches are row-major on a
/// `(height / p) × (width / p)` grid.
pub fn patchify(image: &ImageTensor, p: usize) -> Result<(Vec<f32>, usize, usize)> {
    if p == 0 || image.height % p != 0 || image.width % p != 0 {
        return Err(Error::shape(
            format!("sides divisible by {}", p),
            format!("{}x{}", image.height, image.width),
        ));
    }
    let gh = image.height / p;
    let gw = image.width / p;
    let c = image.channel;
    let mut out = Vec::with_capacity(image.data.len());
    for gy in 0..gh {
        for gx in 0..gw {
            for dy in 0..p {
                let start = ((gy * p + dy) * image.width + gx * p) * c;
                out.extend_from_slice(&image.data[start..start + p * c]);
            }
        }
    }
    Ok((out, gh, gw))
}

/// Inverse of [`patchify`].
pub fn unpatchify(
    vectors: &[f32],
    gh: usize,
    gw: usize,
    p: usize,
    channel: usize,
) -> Result<ImageTensor> {
    let dim = p * p * channel;
    if vectors.len() != gh * gw * dim {
        return Err(Error::shape(gh * gw * dim, vectors.len()));
    }
    let width = gw * p;
    let mut image = ImageTensor::zeros(gh * p, width, channel);
    for (i, patch) in vectors.chunks_exact(dim).enumerate() {
        let (gy, gx) = (i / gw, i % gw);
        for dy in 0..p {
            let start = ((gy * p + dy) * width + gx * p) * channel;
            image.data[start..start + p * channel]
                .copy_from_slice(&patch[dy * p * channel..(dy + 1) * p * channel]);
        }
    }
    Ok(image)
}

/// Dense `rows × cols` matrix applied to a batch of column vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearMap {
    rows: usize,
    cols: usize,
    /// Row-major weights
    weight: Vec<f32>,
}

impl LinearMap {
    /// Rectangular identity: ones on the main diagonal.
    pub fn identity(rows: usize, cols: usize) -> Self {
        let mut weight = vec![0.0; rows * cols];
        for i in 0..rows.min(cols) {
            weight[i * cols + i] = 1.0;
        }
        Self { rows, cols, weight }
    }

    /// Output dimension.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Input dimension.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Weights, row-major.
    pub fn weight(&self) -> &[f32] {
        &self.weight
    }

    /// Mutable weights, row-major.
    pub fn weight_mut(&mut self) -> &mut [f32] {
        &mut self.weight
    }

    /// `y_i = W x_i` for every `x_i` in `[n][cols]`.
    pub fn apply(&self, xs: &[f32]) -> Result<Vec<f32>> {
        if xs.len() % self.cols != 0 {
            return Err(Error::shape(format!("multiple of {}", self.cols), xs.len()));
        }
        Ok(xs
            .par_chunks(self.cols)
            .flat_map_iter(|x| {
                self.weight
                    .chunks_exact(self.cols)
                    .map(move |row| row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>())
            })
            .collect())
    }

    /// `x_i = Wᵀ y_i` for every `y_i` in `[n][rows]`.
    pub fn apply_transpose(&self, ys: &[f32]) -> Result<Vec<f32>> {
        if ys.len() % self.rows != 0 {
            return Err(Error::shape(format!("multiple of {}", self.rows), ys.len()));
        }
        Ok(ys
            .par_chunks(self.rows)
            .flat_map_iter(|y| {
                let mut x = vec![0.0f32; self.cols];
                for (row, &g) in self.weight.chunks_exact(self.cols).zip(y) {
                    for (xi, &w) in x.iter_mut().zip(row) {
                        *xi += w * g;
                    }
                }
                x
            })
            .collect())
    }

    /// `sum_i grad_i ⊗ x_i`, the weight gradient for a batch.
    pub fn weight_gradient(&self, grad_out: &[f32], xs: &[f32]) -> Result<Vec<f32>> {
        let n = xs.len() / self.cols.max(1);
        if xs.len() != n * self.cols || grad_out.len() != n * self.rows {
            return Err(Error::shape(n * self.rows, grad_out.len()));
        }
        let mut grad = vec![0.0f32; self.rows * self.cols];
        for (g, x) in grad_out.chunks_exact(self.rows).zip(xs.chunks_exact(self.cols)) {
            for (row, &gr) in grad.chunks_exact_mut(self.cols).zip(g) {
                if gr == 0.0 {
                    continue;
                }
                for (w, &xv) in row.iter_mut().zip(x) {
                    *w += gr * xv;
                }
            }
        }
        Ok(grad)
    }
}

/// Analysis and synthesis maps of one level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelTransform {
    /// Patch vector to latent, `channel × 3p²`
    pub analysis: LinearMap,
    /// Latent to patch vector, `3p² × channel`
    pub synthesis: LinearMap,
}

impl LevelTransform {
    /// Identity-initialised maps between patch dim `dim` and `channel`.
    pub fn identity(dim: usize, channel: usize) -> Self {
        Self {
            analysis: LinearMap::identity(channel, dim),
            synthesis: LinearMap::identity(dim, channel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(h: usize, w: usize) -> ImageTensor {
        let data = (0..h * w * 3).map(|i| i as f32 / (h * w * 3) as f32).collect();
        ImageTensor::from_vec(h, w, 3, data).unwrap()
    }

    #[test]
    fn test_patch_roundtrip() {
        let image = ramp(4, 6);
        let (vectors, gh, gw) = patchify(&image, 2).unwrap();
        assert_eq!((gh, gw), (2, 3));
        // Second element of the first patch is pixel (0, 0) green
        assert_eq!(vectors[1], image.get(0, 0, 1));
        // Element (dy=1, dx=0, c=0) of the first patch
        assert_eq!(vectors[6], image.get(1, 0, 0));
        let back = unpatchify(&vectors, gh, gw, 2, 3).unwrap();
        assert_eq!(back, image);
        assert!(patchify(&ramp(5, 6), 2).is_err());
    }

    #[test]
    fn test_down_up() {
        let mut image = ImageTensor::zeros(2, 2, 1);
        image.data = vec![1.0, 2.0, 3.0, 6.0];
        let down = downsample2(&image);
        assert_eq!(down.data, vec![3.0]);
        let up = upsample2(&down);
        assert_eq!(up.data, vec![3.0; 4]);

        let adj = upsample2_adjoint(&image);
        assert_eq!(adj.data, vec![12.0]);

        let levels = pyramid(&ramp(8, 8), 3);
        assert_eq!(levels.len(), 3);
        assert_eq!((levels[2].height, levels[2].width), (2, 2));
    }

    #[test]
    fn test_linear_map_adjoint() {
        let mut map = LinearMap::identity(2, 3);
        map.weight_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let y = map.apply(&[1.0, 0.0, -1.0]).unwrap();
        assert_eq!(y, vec![-2.0, -2.0]);
        let x = map.apply_transpose(&[1.0, 1.0]).unwrap();
        assert_eq!(x, vec![5.0, 7.0, 9.0]);
        let g = map.weight_gradient(&[1.0, 2.0], &[1.0, 0.0, -1.0]).unwrap();
        assert_eq!(g, vec![1.0, 0.0, -1.0, 2.0, 0.0, -2.0]);
        assert!(map.apply(&[0.0; 4]).is_err());
    }

    #[test]
    fn test_rectangular_identity() {
        let t = LevelTransform::identity(12, 8);
        let z = t.analysis.apply(&(0..12).map(|i| i as f32).collect::<Vec<_>>()).unwrap();
        assert_eq!(z, (0..8).map(|i| i as f32).collect::<Vec<_>>());
        let v = t.synthesis.apply(&z).unwrap();
        assert_eq!(&v[..8], &z[..]);
        assert_eq!(&v[8..], &[0.0; 4]);
    }
}
