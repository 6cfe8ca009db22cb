//! The McQuic compressor: residual transform, quantizer and entropy coder.

use std::collections::BTreeMap;

use mcquic_core::{CodeSize, Error, ImageCodec, ImageTensor, QualityLevel, Result};
use mcquic_entropy::{EntropyCoder, FrequencyModel};
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;
use xxhash_rust::xxh3::Xxh3;

use crate::codebook::Codebook;
use crate::config::ModelConfig;
use crate::format::{index_checksum, LevelHeader, McqFile, McqHeader};
use crate::kmeans::{KMeans, KMeansConfig};
use crate::quantizer::{MultiCodebookQuantizer, Quantized, StraightThrough};
use crate::reassign::reassign_codebook;
use crate::transform::{
    patchify, pyramid, unpatchify, upsample2, upsample2_adjoint, LevelTransform,
};
use crate::MCQ_VERSION;

/// Named parameter gradients. Ordered so iteration is deterministic.
pub type Gradients = BTreeMap<String, Vec<f32>>;

/// Add `other` into `acc`, inserting missing names.
pub fn accumulate(acc: &mut Gradients, other: &Gradients) {
    for (name, grad) in other {
        match acc.get_mut(name) {
            Some(slot) => {
                for (a, g) in slot.iter_mut().zip(grad) {
                    *a += g;
                }
            }
            None => {
                acc.insert(name.clone(), grad.clone());
            }
        }
    }
}

/// Loss terms of one forward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    /// Mean squared error at full resolution
    pub distortion: f64,
    /// Estimated bits per pixel under the current entropy model
    pub rate: f64,
    /// `sum ||z - q||^2` over all latents, normalised
    pub quantization: f64,
}

/// Result of [`CompressorModel::forward_backward`].
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Loss terms, batch means
    pub terms: LossBreakdown,
    /// Gradient per parameter
    pub gradients: Gradients,
    /// One-hot code counts `[level][m][k]` summed over the batch
    pub counts: Vec<Vec<Vec<f64>>>,
    /// Images in the batch
    pub images: usize,
}

/// Per-level state kept for the backward pass.
struct LevelCache {
    vectors: Vec<f32>,
    latents: Vec<f32>,
    quantized: Quantized,
    gh: usize,
    gw: usize,
}

struct ImagePass {
    squared_error: f64,
    bits: f64,
    quantization: f64,
    gradients: Gradients,
    counts: Vec<Vec<Vec<f64>>>,
}

/// Learned image compressor.
///
/// ```text
/// ┌────────────┐   ┌──────────────┐   ┌─────────────┐   ┌──────────┐
/// │ pyramid /  │──▶│ analysis A_l │──▶│ m codebooks │──▶│  rANS    │──▶ .mcq
/// │ residuals  │   └──────────────┘   └─────────────┘   └──────────┘
/// └────────────┘          ▲                  │
///       ▲                 │           ┌──────▼───────┐
///       └─────────── prediction ◀─────│ synthesis S_l│
///                                     └──────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressorModel {
    config: ModelConfig,
    /// One per level, finest first
    transforms: Vec<LevelTransform>,
    quantizer: MultiCodebookQuantizer,
    entropy: EntropyCoder,
}

/// Parameter name of a level's analysis matrix.
pub fn analysis_param(level: usize) -> String {
    format!("level{}.analysis", level)
}

/// Parameter name of a level's synthesis matrix.
pub fn synthesis_param(level: usize) -> String {
    format!("level{}.synthesis", level)
}

/// Parameter name of one codebook.
pub fn codebook_param(level: usize, group: usize) -> String {
    format!("level{}.codebook{}", level, group)
}

fn difference(a: &ImageTensor, b: &ImageTensor) -> ImageTensor {
    ImageTensor {
        height: a.height,
        width: a.width,
        channel: a.channel,
        data: a.data.iter().zip(&b.data).map(|(x, y)| x - y).collect(),
    }
}

impl CompressorModel {
    /// Build an untrained model.
    ///
    /// Transforms start as identity maps and codebooks as regular lattices:
    /// `[0, 1]` at the coarsest level, which codes pixels directly, and
    /// `[-0.5, 0.5]` at residual levels.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let levels = config.levels();
        let d = config.d();
        let dim = config.patch_dim();

        let transforms = (0..levels)
            .map(|_| LevelTransform::identity(dim, config.channel))
            .collect();
        let codebooks = config
            .k
            .iter()
            .enumerate()
            .map(|(level, &k)| {
                let (lo, hi) = if level + 1 == levels { (0.0, 1.0) } else { (-0.5, 0.5) };
                vec![Codebook::lattice(k, d, lo, hi); config.m]
            })
            .collect();
        let quantizer = MultiCodebookQuantizer::new(config.channel, config.distance, codebooks)?;
        let model = FrequencyModel::from_name(&config.frequency_model, config.m, &config.k, config.ema)?;
        let entropy = EntropyCoder::new(config.m, config.k.clone(), model)?
            .with_block_symbols(config.block_symbols);

        Ok(Self {
            config,
            transforms,
            quantizer,
            entropy,
        })
    }

    /// Hyper-parameters.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Number of levels.
    pub fn levels(&self) -> usize {
        self.config.levels()
    }

    /// Quantizer.
    pub fn quantizer(&self) -> &MultiCodebookQuantizer {
        &self.quantizer
    }

    /// Entropy coder.
    pub fn entropy(&self) -> &EntropyCoder {
        &self.entropy
    }

    /// Per-level transforms, finest first.
    pub fn transforms(&self) -> &[LevelTransform] {
        &self.transforms
    }

    /// Proportion of codewords with non-zero frequency.
    pub fn code_usage(&self) -> f64 {
        self.entropy.code_usage()
    }

    /// Every trainable parameter by name.
    pub fn parameters(&self) -> Vec<(String, &[f32])> {
        let mut params: Vec<(String, &[f32])> = Vec::new();
        for (level, t) in self.transforms.iter().enumerate() {
            params.push((analysis_param(level), t.analysis.weight()));
            params.push((synthesis_param(level), t.synthesis.weight()));
        }
        for (level, g, book) in self.quantizer.iter() {
            params.push((codebook_param(level, g), book.entries()));
        }
        params
    }

    /// Every trainable parameter by name, mutably.
    pub fn parameters_mut(&mut self) -> Vec<(String, &mut [f32])> {
        let mut params: Vec<(String, &mut [f32])> = Vec::new();
        for (level, t) in self.transforms.iter_mut().enumerate() {
            params.push((analysis_param(level), t.analysis.weight_mut()));
            params.push((synthesis_param(level), t.synthesis.weight_mut()));
        }
        for (level, g, book) in self.quantizer.iter_mut() {
            params.push((codebook_param(level, g), book.entries_mut()));
        }
        params
    }

    /// Hash of everything the decoder depends on.
    ///
    /// Covers the architecture, synthesis maps, codebooks and the current
    /// entropy model, so a stream only decodes with the exact model state
    /// that wrote it.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Xxh3::new();
        hasher.update(b"mcquic");
        for v in [self.config.channel, self.config.patch, self.config.m] {
            hasher.update(&(v as u64).to_le_bytes());
        }
        for &k in &self.config.k {
            hasher.update(&(k as u64).to_le_bytes());
        }
        hasher.update(&[self.config.distance.tag()]);
        for t in &self.transforms {
            for w in t.synthesis.weight() {
                hasher.update(&w.to_bits().to_le_bytes());
            }
        }
        for (_, _, book) in self.quantizer.iter() {
            for v in book.entries() {
                hasher.update(&v.to_bits().to_le_bytes());
            }
        }
        for level in 0..self.levels() {
            for row in self.entropy.normalized_frequencies(level) {
                for f in row {
                    hasher.update(&f.to_bits().to_le_bytes());
                }
            }
        }
        hasher.digest()
    }

    fn check_image(&self, image: &ImageTensor) -> Result<()> {
        if image.channel != 3 {
            return Err(Error::shape("3 channels", image.channel));
        }
        if image.height == 0 || image.width == 0 {
            return Err(Error::shape("non-empty image", image.size()));
        }
        Ok(())
    }

    /// Code one level given the target and its prediction.
    fn code_level(
        &self,
        level: usize,
        target: &ImageTensor,
        prediction: &ImageTensor,
    ) -> Result<(LevelCache, ImageTensor)> {
        let residual = difference(target, prediction);
        let (vectors, gh, gw) = patchify(&residual, self.config.patch)?;
        let latents = self.transforms[level].analysis.apply(&vectors)?;
        let quantized = self.quantizer.quantize(level, &latents)?;
        let recon = self.synthesize(level, &quantized.values, prediction, gh, gw)?;
        Ok((
            LevelCache {
                vectors,
                latents,
                quantized,
                gh,
                gw,
            },
            recon,
        ))
    }

    fn synthesize(
        &self,
        level: usize,
        values: &[f32],
        prediction: &ImageTensor,
        gh: usize,
        gw: usize,
    ) -> Result<ImageTensor> {
        let patches = self.transforms[level].synthesis.apply(values)?;
        let mut out = unpatchify(&patches, gh, gw, self.config.patch, 3)?;
        for (o, p) in out.data.iter_mut().zip(&prediction.data) {
            *o += p;
        }
        Ok(out)
    }

    fn prediction(recon: Option<&ImageTensor>, target: &ImageTensor) -> ImageTensor {
        match recon {
            Some(r) => upsample2(r),
            None => ImageTensor::zeros(target.height, target.width, target.channel),
        }
    }

    /// Closed-loop coding of levels `first..levels`, coarsest first.
    ///
    /// Returns the caches indexed by `level - first` and the reconstruction
    /// at `first`.
    fn code_levels(&self, padded: &ImageTensor, first: usize) -> Result<(Vec<LevelCache>, ImageTensor)> {
        let levels = self.levels();
        let gauss = pyramid(padded, levels);
        let mut caches = Vec::with_capacity(levels - first);
        let mut recon: Option<ImageTensor> = None;
        for level in (first..levels).rev() {
            let prediction = Self::prediction(recon.as_ref(), &gauss[level]);
            let (cache, out) = self.code_level(level, &gauss[level], &prediction)?;
            caches.push(cache);
            recon = Some(out);
        }
        caches.reverse();
        let recon = recon.ok_or_else(|| Error::config("model has no levels"))?;
        Ok((caches, recon))
    }

    /// Encode an image into an MCQ stream at `quality`.
    pub fn encode(&self, image: &ImageTensor, quality: QualityLevel) -> Result<McqFile> {
        self.check_image(image)?;
        let levels = self.levels();
        let coded = quality.coded_levels();
        if coded == 0 || coded > levels {
            return Err(Error::config(format!(
                "quality level {} outside 1..={}",
                coded, levels
            )));
        }
        let first = levels - coded;
        let padded = image.pad_to_multiple(self.config.alignment());
        let (caches, _) = self.code_levels(&padded, first)?;

        let codes: Vec<Vec<u16>> = caches.iter().map(|c| c.quantized.indices.clone()).collect();
        let code_size = CodeSize::new(
            self.config.m,
            caches.iter().map(|c| c.gh).collect(),
            caches.iter().map(|c| c.gw).collect(),
            self.config.k[first..].to_vec(),
        )?;
        let payloads = self.entropy.compress(first, &codes, &code_size)?;

        let header = McqHeader {
            version: MCQ_VERSION,
            fingerprint: self.fingerprint(),
            height: image.height as u32,
            width: image.width as u32,
            channel: self.config.channel as u8,
            m: self.config.m as u8,
            levels: caches
                .iter()
                .zip(&codes)
                .enumerate()
                .map(|(i, (c, code))| LevelHeader {
                    height: c.gh as u32,
                    width: c.gw as u32,
                    k: self.config.k[first + i] as u32,
                    checksum: index_checksum(code),
                    payload_len: 0,
                })
                .collect(),
        };
        let file = McqFile::new(header, payloads)?;
        debug!(
            height = image.height,
            width = image.width,
            coded,
            bytes = file.size(),
            "encoded image"
        );
        Ok(file)
    }

    /// Decode an MCQ stream written by this exact model state.
    pub fn decode(&self, file: &McqFile) -> Result<ImageTensor> {
        file.verify_fingerprint(self.fingerprint())?;
        let header = &file.header;
        if header.m as usize != self.config.m || header.channel as usize != self.config.channel {
            return Err(Error::shape(
                format!("m = {}, channel = {}", self.config.m, self.config.channel),
                format!("m = {}, channel = {}", header.m, header.channel),
            ));
        }
        let levels = self.levels();
        let coded = header.levels.len();
        if coded == 0 || coded > levels {
            return Err(Error::shape(format!("1..={} coded levels", levels), coded));
        }
        let (height, width) = (header.height as usize, header.width as usize);
        if height == 0 || width == 0 {
            return Err(Error::shape("non-empty image", format!("{}x{}", height, width)));
        }

        let first = levels - coded;
        let align = self.config.alignment();
        let (ph, pw) = (height.div_ceil(align) * align, width.div_ceil(align) * align);
        for (i, lh) in header.levels.iter().enumerate() {
            let level = first + i;
            let expected = (
                (ph >> level) / self.config.patch,
                (pw >> level) / self.config.patch,
            );
            if (lh.height as usize, lh.width as usize) != expected {
                return Err(Error::shape(
                    format!("{}x{} codes at level {}", expected.0, expected.1, level),
                    format!("{}x{}", lh.height, lh.width),
                ));
            }
        }

        let code_size = header.code_size()?;
        let codes = self.entropy.decompress(first, &file.payloads, &code_size)?;
        for (i, (lh, code)) in header.levels.iter().zip(&codes).enumerate() {
            let actual = index_checksum(code);
            if actual != lh.checksum {
                return Err(Error::ChecksumMismatch {
                    level: first + i,
                    expected: lh.checksum,
                    actual,
                });
            }
        }

        let mut recon: Option<ImageTensor> = None;
        for level in (first..levels).rev() {
            let i = level - first;
            let (gh, gw) = (code_size.heights[i], code_size.widths[i]);
            let target = ImageTensor::zeros(gh * self.config.patch, gw * self.config.patch, 3);
            let prediction = Self::prediction(recon.as_ref(), &target);
            let values = self.quantizer.dequantize(level, &codes[i])?;
            recon = Some(self.synthesize(level, &values, &prediction, gh, gw)?);
        }
        let mut image = recon.ok_or_else(|| Error::config("model has no levels"))?;
        for _ in 0..first {
            image = upsample2(&image);
        }

        let mut image = image.crop(height, width)?;
        image.clamp_unit();
        Ok(image)
    }

    /// Full-quality reconstruction without entropy coding.
    pub fn reconstruct(&self, image: &ImageTensor, quality: QualityLevel) -> Result<ImageTensor> {
        self.check_image(image)?;
        let coded = quality.coded_levels().clamp(1, self.levels());
        let first = self.levels() - coded;
        let padded = image.pad_to_multiple(self.config.alignment());
        let (_, mut recon) = self.code_levels(&padded, first)?;
        for _ in 0..first {
            recon = upsample2(&recon);
        }
        let mut out = recon.crop(image.height, image.width)?;
        out.clamp_unit();
        Ok(out)
    }

    /// Loss terms and gradients for a batch of aligned images.
    ///
    /// Quantization is hard in the forward pass and straight-through in the
    /// backward pass. The rate term is an estimate under the current entropy
    /// model and carries no gradient.
    pub fn forward_backward(
        &self,
        batch: &[ImageTensor],
        ste: &StraightThrough,
    ) -> Result<ForwardOutput> {
        if batch.is_empty() {
            return Err(Error::shape("non-empty batch", 0));
        }
        let align = self.config.alignment();
        for image in batch {
            self.check_image(image)?;
            if image.height % align != 0 || image.width % align != 0 {
                return Err(Error::shape(
                    format!("sides divisible by {}", align),
                    image.size(),
                ));
            }
        }

        let samples: usize = batch.iter().map(|i| i.data.len()).sum();
        let pixels: usize = batch.iter().map(|i| i.height * i.width).sum();
        let p2 = self.config.patch * self.config.patch;
        let latent_elems: usize = batch
            .iter()
            .map(|img| {
                (0..self.levels())
                    .map(|l| ((img.height >> l) * (img.width >> l) / p2) * self.config.channel)
                    .sum::<usize>()
            })
            .sum();

        let tables = self.entropy.cdf_tables()?;
        let passes: Vec<ImagePass> = batch
            .par_iter()
            .map(|image| {
                self.image_pass(image, &tables, ste, samples as f32, latent_elems as f32)
            })
            .collect::<Result<_>>()?;

        let mut terms = LossBreakdown::default();
        let mut gradients = Gradients::new();
        let mut counts: Vec<Vec<Vec<f64>>> = self
            .config
            .k
            .iter()
            .map(|&k| vec![vec![0.0; k]; self.config.m])
            .collect();
        let mut bits = 0.0;
        for pass in &passes {
            terms.distortion += pass.squared_error;
            terms.quantization += pass.quantization;
            bits += pass.bits;
            accumulate(&mut gradients, &pass.gradients);
            for (acc, level) in counts.iter_mut().zip(&pass.counts) {
                for (row, add) in acc.iter_mut().zip(level) {
                    for (c, a) in row.iter_mut().zip(add) {
                        *c += a;
                    }
                }
            }
        }
        terms.distortion /= samples as f64;
        terms.rate = bits / pixels as f64;

        Ok(ForwardOutput {
            terms,
            gradients,
            counts,
            images: batch.len(),
        })
    }

    fn image_pass(
        &self,
        image: &ImageTensor,
        tables: &[Vec<mcquic_entropy::QuantizedCdf>],
        ste: &StraightThrough,
        dist_norm: f32,
        commit_norm: f32,
    ) -> Result<ImagePass> {
        let levels = self.levels();
        let p = self.config.patch;
        let (caches, recon) = self.code_levels(image, 0)?;

        let mut squared_error = 0.0f64;
        let mut grad_image = difference(&recon, image);
        for d in &mut grad_image.data {
            squared_error += (*d * *d) as f64;
            *d *= 2.0 / dist_norm;
        }

        let mut gradients = Gradients::new();
        let mut counts = Vec::with_capacity(levels);
        let mut bits = 0.0;
        let mut quantization = 0.0;

        for (level, cache) in caches.iter().enumerate() {
            let n = cache.quantized.n;
            bits += EntropyCoder::estimate_bits(&tables[level], &cache.quantized.indices, n);
            counts.push(self.quantizer.count(level, &cache.quantized.indices));

            let transform = &self.transforms[level];
            let (grad_patches, _, _) = patchify(&grad_image, p)?;
            gradients.insert(
                synthesis_param(level),
                transform
                    .synthesis
                    .weight_gradient(&grad_patches, &cache.quantized.values)?,
            );
            let grad_q = transform.synthesis.apply_transpose(&grad_patches)?;

            let ste_grads = ste.backward(
                &self.quantizer,
                level,
                &cache.latents,
                &cache.quantized,
                &grad_q,
                commit_norm,
            )?;
            quantization += ste_grads.commitment_loss;
            for (g, grad) in ste_grads.codebooks.into_iter().enumerate() {
                gradients.insert(codebook_param(level, g), grad);
            }

            gradients.insert(
                analysis_param(level),
                transform
                    .analysis
                    .weight_gradient(&ste_grads.latents, &cache.vectors)?,
            );

            if level + 1 < levels {
                // X̂ = P + unpatch(S q) and R = G - P, so dP = dX̂ - dR
                let grad_v = transform.analysis.apply_transpose(&ste_grads.latents)?;
                let grad_r = unpatchify(&grad_v, cache.gh, cache.gw, p, 3)?;
                let grad_p = difference(&grad_image, &grad_r);
                grad_image = upsample2_adjoint(&grad_p);
            }
        }

        Ok(ImagePass {
            squared_error,
            bits,
            quantization,
            gradients,
            counts,
        })
    }

    /// Fold batch code counts `[level][m][k]` into the entropy model.
    pub fn observe_codes(&mut self, counts: &[Vec<Vec<f64>>]) -> Result<()> {
        if counts.len() != self.levels() {
            return Err(Error::shape(self.levels(), counts.len()));
        }
        for (level, level_counts) in counts.iter().enumerate() {
            self.entropy.observe(level, level_counts)?;
        }
        Ok(())
    }

    /// Reassign dead codewords everywhere; returns the proportion changed.
    pub fn reassign_codebooks(&mut self, rng: &mut StdRng) -> Result<f64> {
        let mut changed = 0usize;
        let mut total = 0usize;
        for level in 0..self.levels() {
            let freq = self.entropy.normalized_frequencies(level);
            for (book, row) in self.quantizer.codebooks_mut(level).iter_mut().zip(&freq) {
                let r = reassign_codebook(book, row, rng)?;
                changed += r.changed;
                total += r.k;
            }
        }
        Ok(if total == 0 {
            0.0
        } else {
            changed as f64 / total as f64
        })
    }

    /// Fit codebooks to latents of `batch` with k-means, coarsest first.
    ///
    /// Each level is fitted on latents produced with the already fitted
    /// coarser levels, matching what the encoder will see.
    pub fn warm_start(&mut self, batch: &[ImageTensor], config: &KMeansConfig) -> Result<()> {
        let levels = self.levels();
        let m = self.config.m;
        let d = self.config.d();
        let channel = self.config.channel;
        let padded: Vec<ImageTensor> = batch
            .iter()
            .map(|img| img.pad_to_multiple(self.config.alignment()))
            .collect();

        for level in (0..levels).rev() {
            let mut groups: Vec<Vec<f32>> = vec![Vec::new(); m];
            for image in &padded {
                let (caches, _) = self.code_levels(image, level)?;
                for latent in caches[0].latents.chunks_exact(channel) {
                    for (g, part) in latent.chunks_exact(d).enumerate() {
                        groups[g].extend_from_slice(part);
                    }
                }
            }
            let k = self.config.k[level];
            for (g, data) in groups.iter().enumerate() {
                let fitter = KMeans::new(KMeansConfig {
                    seed: config.seed.wrapping_add((level * m + g) as u64),
                    ..config.clone()
                });
                let book = &mut self.quantizer.codebooks_mut(level)[g];
                let fit = fitter.fit(data, k, d, book)?;
                debug!(level, group = g, mse = fit.mse, iterations = fit.iterations, "k-means warm start");
                *book = fit.codebook;
            }
        }
        Ok(())
    }
}

impl ImageCodec for CompressorModel {
    fn levels(&self) -> usize {
        self.config.levels()
    }

    fn compress(&self, image: &ImageTensor, quality: QualityLevel) -> Result<Vec<u8>> {
        Ok(self.encode(image, quality)?.to_bytes())
    }

    fn decompress(&self, input: &[u8]) -> Result<ImageTensor> {
        self.decode(&McqFile::from_bytes_verified(input, self.fingerprint())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::psnr_between;
    use crate::CodebookInit;
    use rand::SeedableRng;

    fn small_config() -> ModelConfig {
        ModelConfig {
            channel: 12,
            patch: 2,
            m: 4,
            k: vec![125, 27],
            ..Default::default()
        }
    }

    fn gradient_image(h: usize, w: usize) -> ImageTensor {
        let mut data = Vec::with_capacity(h * w * 3);
        for y in 0..h {
            for x in 0..w {
                let fx = x as f32 / w as f32;
                let fy = y as f32 / h as f32;
                data.extend_from_slice(&[fx, fy, 0.5 + 0.25 * (fx * 6.0).sin() * fy]);
            }
        }
        ImageTensor::from_vec(h, w, 3, data).unwrap()
    }

    #[test]
    fn test_roundtrip_shapes_and_quality() {
        let model = CompressorModel::new(small_config()).unwrap();
        let image = gradient_image(21, 30);
        let file = model.encode(&image, QualityLevel::full(2)).unwrap();
        assert_eq!(file.header.levels.len(), 2);
        let decoded = model.decode(&file).unwrap();
        assert_eq!(decoded.size(), image.size());
        assert!(decoded.data.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(psnr_between(&image, &decoded).unwrap() > 20.0);

        // Reconstruction without entropy coding matches decoding
        let direct = model.reconstruct(&image, QualityLevel::full(2)).unwrap();
        assert_eq!(direct, decoded);
    }

    #[test]
    fn test_lower_quality_is_smaller() {
        let model = CompressorModel::new(small_config()).unwrap();
        let image = gradient_image(32, 32);
        let full = model.encode(&image, QualityLevel::full(2)).unwrap();
        let coarse = model.encode(&image, QualityLevel::new(1, 2).unwrap()).unwrap();
        assert!(coarse.size() < full.size());
        assert_eq!(coarse.header.levels.len(), 1);

        let decoded = model.decode(&coarse).unwrap();
        assert_eq!(decoded.size(), image.size());
    }

    #[test]
    fn test_fingerprint_tracks_decoder_state() {
        let mut model = CompressorModel::new(small_config()).unwrap();
        let before = model.fingerprint();
        assert_eq!(before, CompressorModel::new(small_config()).unwrap().fingerprint());

        let mut counts: Vec<Vec<Vec<f64>>> =
            vec![vec![vec![0.0; 125]; 4], vec![vec![0.0; 27]; 4]];
        counts[0][0][0] = 1000.0;
        model.observe_codes(&counts).unwrap();
        assert_ne!(model.fingerprint(), before);
    }

    #[test]
    fn test_decode_with_other_model_fails() {
        let model = CompressorModel::new(small_config()).unwrap();
        let other = CompressorModel::new(ModelConfig {
            k: vec![125, 8],
            ..small_config()
        })
        .unwrap();
        let file = model.encode(&gradient_image(16, 16), QualityLevel::full(2)).unwrap();
        let err = other.decode(&file).unwrap_err();
        assert!(matches!(err, Error::FingerprintMismatch { .. }));
    }

    #[test]
    fn test_damaged_stream_from_other_model_reports_fingerprint() {
        let model = CompressorModel::new(small_config()).unwrap();
        let other = CompressorModel::new(ModelConfig {
            k: vec![125, 8],
            ..small_config()
        })
        .unwrap();
        let bytes = model.compress(&gradient_image(32, 32), QualityLevel::full(2)).unwrap();

        let err = other.decompress(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::FingerprintMismatch { .. }), "{}", err);
        let mut padded = bytes.clone();
        padded.push(0);
        let err = other.decompress(&padded).unwrap_err();
        assert!(matches!(err, Error::FingerprintMismatch { .. }), "{}", err);

        let err = model.decompress(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof { .. }), "{}", err);
    }

    #[test]
    fn test_forged_dimensions_fail_cleanly() {
        let model = CompressorModel::new(small_config()).unwrap();
        let mut file = model.encode(&gradient_image(32, 32), QualityLevel::full(2)).unwrap();
        file.header.height = 400_000;
        file.header.width = 400_000;
        file.header.levels[0].height = 200_000;
        file.header.levels[0].width = 200_000;
        file.header.levels[1].height = 100_000;
        file.header.levels[1].width = 100_000;

        let err = model.decode(&file).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }), "{}", err);
        let err = model.decompress(&file.to_bytes()).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }), "{}", err);
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let model = CompressorModel::new(small_config()).unwrap();
        let mut file = model.encode(&gradient_image(16, 16), QualityLevel::full(2)).unwrap();
        file.header.levels[1].checksum ^= 1;
        assert!(matches!(
            model.decode(&file),
            Err(Error::ChecksumMismatch { level: 1, .. })
        ));
    }

    #[test]
    fn test_forward_backward_shapes() {
        let model = CompressorModel::new(small_config()).unwrap();
        let batch = vec![gradient_image(8, 8), gradient_image(8, 8)];
        let out = model
            .forward_backward(&batch, &StraightThrough::default())
            .unwrap();
        assert_eq!(out.images, 2);
        assert!(out.terms.distortion.is_finite() && out.terms.distortion >= 0.0);
        assert!(out.terms.rate > 0.0);

        let params = model.parameters();
        assert_eq!(out.gradients.len(), params.len());
        for (name, value) in &params {
            assert_eq!(out.gradients[name].len(), value.len(), "{}", name);
        }
        // Every latent is counted once per group
        let level0: f64 = out.counts[0][0].iter().sum();
        assert_eq!(level0, 2.0 * 16.0);

        assert!(model.forward_backward(&[gradient_image(6, 8)], &StraightThrough::default()).is_err());
    }

    #[test]
    fn test_synthesis_gradient_matches_finite_difference() {
        // Distortion is quadratic in the finest synthesis map
        let model = CompressorModel::new(small_config()).unwrap();
        let batch = vec![gradient_image(16, 16)];
        let ste = StraightThrough::default();
        let out = model.forward_backward(&batch, &ste).unwrap();
        let name = synthesis_param(0);

        let distortion_at = |delta: f32| -> f64 {
            let mut m = model.clone();
            for (n, param) in m.parameters_mut() {
                if n == name {
                    param[0] += delta;
                }
            }
            m.forward_backward(&batch, &ste).unwrap().terms.distortion
        };
        let eps = 0.1;
        let numeric = (distortion_at(eps) - distortion_at(-eps)) / (2.0 * eps as f64);
        let analytic = out.gradients[&name][0] as f64;
        assert!(
            (numeric - analytic).abs() < 1e-5 + 1e-2 * analytic.abs(),
            "{} vs {}",
            numeric,
            analytic
        );
    }

    #[test]
    fn test_reassignment_keeps_usage() {
        let mut model = CompressorModel::new(small_config()).unwrap();
        let batch = vec![gradient_image(16, 16)];
        let ste = StraightThrough::default();
        let out = model.forward_backward(&batch, &ste).unwrap();
        // Make the entropy model reflect only this batch
        let mut fresh = CompressorModel::new(ModelConfig {
            ema: 0.0,
            ..small_config()
        })
        .unwrap();
        fresh.observe_codes(&out.counts).unwrap();

        let active = |m: &CompressorModel| -> usize {
            let out = m.forward_backward(&batch, &ste).unwrap();
            out.counts
                .iter()
                .flatten()
                .map(|row| row.iter().filter(|&&c| c > 0.0).count())
                .sum()
        };
        let before = active(&fresh);
        let mut rng = StdRng::seed_from_u64(5);
        let proportion = fresh.reassign_codebooks(&mut rng).unwrap();
        assert!(proportion > 0.0 && proportion <= 0.5);
        assert!(active(&fresh) >= before);
    }

    #[test]
    fn test_warm_start() {
        let mut model = CompressorModel::new(ModelConfig {
            init: CodebookInit::KMeans,
            ..small_config()
        })
        .unwrap();
        let batch = vec![gradient_image(16, 16)];
        let before = model.reconstruct(&batch[0], QualityLevel::full(2)).unwrap();
        model.warm_start(&batch, &KMeansConfig::default()).unwrap();
        let after = model.reconstruct(&batch[0], QualityLevel::full(2)).unwrap();
        let p_before = psnr_between(&batch[0], &before).unwrap();
        let p_after = psnr_between(&batch[0], &after).unwrap();
        assert!(p_after >= p_before - 0.5, "{} vs {}", p_after, p_before);
    }

    #[test]
    fn test_rejects_bad_input() {
        let model = CompressorModel::new(small_config()).unwrap();
        assert!(model.encode(&ImageTensor::zeros(8, 8, 1), QualityLevel::full(2)).is_err());
        assert!(model.encode(&ImageTensor::zeros(0, 8, 3), QualityLevel::full(2)).is_err());
        assert!(model.encode(&gradient_image(8, 8), QualityLevel::full(3)).is_err());
    }
}
