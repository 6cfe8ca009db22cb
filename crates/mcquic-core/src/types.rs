//! Core type definitions shared by the coding pipeline.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Spatial size of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    /// Height in pixels.
    pub height: usize,
    /// Width in pixels.
    pub width: usize,
    /// Number of channels (3 for RGB).
    pub channel: usize,
}

impl ImageSize {
    /// Create an RGB size.
    pub fn rgb(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            channel: 3,
        }
    }

    /// Number of pixels.
    pub fn pixels(&self) -> usize {
        self.height * self.width
    }

    /// Number of raw samples.
    pub fn samples(&self) -> usize {
        self.pixels() * self.channel
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channel)
    }
}

/// Shape of the coded index maps, one entry per coded level.
///
/// Levels are listed finest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSize {
    /// Codebook groups per level.
    pub m: usize,
    /// Index map height per level.
    pub heights: Vec<usize>,
    /// Index map width per level.
    pub widths: Vec<usize>,
    /// Codebook size per level.
    pub k: Vec<usize>,
}

impl CodeSize {
    /// Build and check that all per-level vectors agree.
    pub fn new(m: usize, heights: Vec<usize>, widths: Vec<usize>, k: Vec<usize>) -> Result<Self> {
        if heights.len() != widths.len() || heights.len() != k.len() {
            return Err(Error::shape(
                format!("{} levels", k.len()),
                format!("{} heights / {} widths", heights.len(), widths.len()),
            ));
        }
        Ok(Self {
            m,
            heights,
            widths,
            k,
        })
    }

    /// Number of levels.
    pub fn levels(&self) -> usize {
        self.k.len()
    }

    /// Symbols stored at a level (`m * h * w`).
    pub fn symbols(&self, level: usize) -> usize {
        self.m * self.heights[level] * self.widths[level]
    }

    /// Total symbols over all levels.
    pub fn total_symbols(&self) -> usize {
        (0..self.levels()).map(|lv| self.symbols(lv)).sum()
    }
}

/// Quality level: how many residual levels are transmitted, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QualityLevel(u8);

impl QualityLevel {
    /// Validate against the number of levels a model has.
    pub fn new(level: u8, max_levels: usize) -> Result<Self> {
        if level == 0 || level as usize > max_levels {
            return Err(Error::config(format!(
                "quality level {} outside 1..={}",
                level, max_levels
            )));
        }
        Ok(Self(level))
    }

    /// Highest quality for a model with `levels` levels.
    pub fn full(levels: usize) -> Self {
        Self(levels.clamp(1, u8::MAX as usize) as u8)
    }

    /// Raw value.
    pub fn get(self) -> u8 {
        self.0
    }

    /// Number of coded levels.
    pub fn coded_levels(self) -> usize {
        self.0 as usize
    }
}

/// Distance used for nearest-codeword search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceKind {
    /// Squared L2 distance.
    #[default]
    Euclidean,
    /// `1 - cos(x, c)`.
    Cosine,
}

impl DistanceKind {
    /// Stable tag used in fingerprints.
    pub fn tag(self) -> u8 {
        match self {
            DistanceKind::Euclidean => 0,
            DistanceKind::Cosine => 1,
        }
    }
}

/// Interleaved HWC image with samples in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageTensor {
    /// Height in pixels.
    pub height: usize,
    /// Width in pixels.
    pub width: usize,
    /// Channels per pixel.
    pub channel: usize,
    /// Samples, row-major, channel fastest.
    pub data: Vec<f32>,
}

impl ImageTensor {
    /// All-zero image.
    pub fn zeros(height: usize, width: usize, channel: usize) -> Self {
        Self {
            height,
            width,
            channel,
            data: vec![0.0; height * width * channel],
        }
    }

    /// Wrap existing samples.
    pub fn from_vec(height: usize, width: usize, channel: usize, data: Vec<f32>) -> Result<Self> {
        let expected = height * width * channel;
        if data.len() != expected {
            return Err(Error::shape(expected, data.len()));
        }
        Ok(Self {
            height,
            width,
            channel,
            data,
        })
    }

    /// From 8-bit RGB samples.
    pub fn from_rgb8(height: usize, width: usize, bytes: &[u8]) -> Result<Self> {
        let data = bytes.iter().map(|&b| b as f32 / 255.0).collect();
        Self::from_vec(height, width, 3, data)
    }

    /// To 8-bit samples, clamping to `[0, 1]`.
    pub fn to_rgb8(&self) -> Vec<u8> {
        self.data
            .iter()
            .map(|&v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect()
    }

    /// Size descriptor.
    pub fn size(&self) -> ImageSize {
        ImageSize {
            height: self.height,
            width: self.width,
            channel: self.channel,
        }
    }

    #[inline]
    fn offset(&self, y: usize, x: usize, c: usize) -> usize {
        (y * self.width + x) * self.channel + c
    }

    /// Sample at `(y, x, c)`.
    #[inline]
    pub fn get(&self, y: usize, x: usize, c: usize) -> f32 {
        self.data[self.offset(y, x, c)]
    }

    /// Set sample at `(y, x, c)`.
    #[inline]
    pub fn set(&mut self, y: usize, x: usize, c: usize, value: f32) {
        let i = self.offset(y, x, c);
        self.data[i] = value;
    }

    /// Pad with edge replication so both sides are multiples of `multiple`.
    pub fn pad_to_multiple(&self, multiple: usize) -> Self {
        let multiple = multiple.max(1);
        let height = self.height.div_ceil(multiple) * multiple;
        let width = self.width.div_ceil(multiple) * multiple;
        if height == self.height && width == self.width {
            return self.clone();
        }
        let mut out = Self::zeros(height, width, self.channel);
        for y in 0..height {
            let sy = y.min(self.height - 1);
            for x in 0..width {
                let sx = x.min(self.width - 1);
                for c in 0..self.channel {
                    out.set(y, x, c, self.get(sy, sx, c));
                }
            }
        }
        out
    }

    /// Top-left crop.
    pub fn crop(&self, height: usize, width: usize) -> Result<Self> {
        self.crop_at(0, 0, height, width)
    }

    /// Crop a window starting at `(top, left)`.
    pub fn crop_at(&self, top: usize, left: usize, height: usize, width: usize) -> Result<Self> {
        if top + height > self.height || left + width > self.width {
            return Err(Error::shape(
                format!("window {}x{} at ({}, {})", height, width, top, left),
                format!("{}x{}", self.height, self.width),
            ));
        }
        let mut data = Vec::with_capacity(height * width * self.channel);
        for y in top..top + height {
            let start = self.offset(y, left, 0);
            data.extend_from_slice(&self.data[start..start + width * self.channel]);
        }
        Ok(Self {
            height,
            width,
            channel: self.channel,
            data,
        })
    }

    /// Clamp every sample to `[0, 1]`.
    pub fn clamp_unit(&mut self) {
        for v in &mut self.data {
            *v = v.clamp(0.0, 1.0);
        }
    }
}
