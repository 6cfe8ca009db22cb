//! Model hyper-parameters

use mcquic_core::{DistanceKind, Error, Result};
use mcquic_entropy::{FrequencyModel, DEFAULT_BLOCK_SYMBOLS, DEFAULT_EMA};
use serde::{Deserialize, Serialize};

/// How codebooks are initialised before training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodebookInit {
    /// Deterministic grid over the expected latent range
    #[default]
    Lattice,
    /// Lattice, then k-means on the first training batch
    KMeans,
}

/// Architecture of a [`crate::CompressorModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Latent channels per patch
    #[serde(default = "default_channel")]
    pub channel: usize,
    /// Patch side in pixels
    #[serde(default = "default_patch")]
    pub patch: usize,
    /// Codebook groups per latent
    #[serde(default = "default_m")]
    pub m: usize,
    /// Codebook size per level, finest first
    #[serde(default = "default_k")]
    pub k: Vec<usize>,
    /// Nearest-entry distance
    #[serde(default)]
    pub distance: DistanceKind,
    /// Frequency estimator name
    #[serde(default = "default_frequency_model")]
    pub frequency_model: String,
    /// EMA factor for the `ema` estimator
    #[serde(default = "default_ema")]
    pub ema: f64,
    /// Symbols per entropy-coded block
    #[serde(default = "default_block_symbols")]
    pub block_symbols: usize,
    /// Codebook initialisation
    #[serde(default)]
    pub init: CodebookInit,
}

fn default_channel() -> usize {
    12
}

fn default_patch() -> usize {
    2
}

fn default_m() -> usize {
    4
}

fn default_k() -> Vec<usize> {
    vec![2048, 512, 128]
}

fn default_frequency_model() -> String {
    "ema".to_string()
}

fn default_ema() -> f64 {
    DEFAULT_EMA
}

fn default_block_symbols() -> usize {
    DEFAULT_BLOCK_SYMBOLS
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            patch: default_patch(),
            m: default_m(),
            k: default_k(),
            distance: DistanceKind::default(),
            frequency_model: default_frequency_model(),
            ema: default_ema(),
            block_symbols: default_block_symbols(),
            init: CodebookInit::default(),
        }
    }
}

impl ModelConfig {
    /// Maximum number of levels.
    pub const MAX_LEVELS: usize = 8;

    /// Number of levels.
    pub fn levels(&self) -> usize {
        self.k.len()
    }

    /// Group width `channel / m`.
    pub fn d(&self) -> usize {
        self.channel / self.m.max(1)
    }

    /// Patch vector length for RGB input.
    pub fn patch_dim(&self) -> usize {
        3 * self.patch * self.patch
    }

    /// Side multiple images are padded to.
    pub fn alignment(&self) -> usize {
        self.patch << self.levels().saturating_sub(1)
    }

    /// Check every field.
    pub fn validate(&self) -> Result<()> {
        if self.channel == 0 || self.channel > u8::MAX as usize {
            return Err(Error::config(format!("channel {} outside 1..=255", self.channel)));
        }
        if self.m == 0 || self.m > u8::MAX as usize {
            return Err(Error::config(format!("m {} outside 1..=255", self.m)));
        }
        if self.channel % self.m != 0 {
            return Err(Error::config(format!(
                "channel {} is not divisible by m {}",
                self.channel, self.m
            )));
        }
        if self.patch == 0 || self.patch > 16 {
            return Err(Error::config(format!("patch {} outside 1..=16", self.patch)));
        }
        if self.k.is_empty() || self.k.len() > Self::MAX_LEVELS {
            return Err(Error::config(format!(
                "{} levels outside 1..={}",
                self.k.len(),
                Self::MAX_LEVELS
            )));
        }
        if let Some(&k) = self.k.iter().find(|&&k| !(2..=1 << 15).contains(&k)) {
            return Err(Error::config(format!("codebook size {} outside 2..=32768", k)));
        }
        if self.block_symbols == 0 {
            return Err(Error::config("block_symbols must be positive"));
        }
        // Also validates the estimator name and ema range
        FrequencyModel::from_name(&self.frequency_model, self.m, &self.k, self.ema)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ModelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.d(), 3);
        assert_eq!(config.patch_dim(), 12);
        assert_eq!(config.alignment(), 8);
        assert_eq!(config.levels(), 3);
    }

    #[test]
    fn test_validation_errors() {
        let bad = [
            ModelConfig {
                channel: 10,
                ..Default::default()
            },
            ModelConfig {
                k: vec![],
                ..Default::default()
            },
            ModelConfig {
                k: vec![1],
                ..Default::default()
            },
            ModelConfig {
                frequency_model: "zipf".into(),
                ..Default::default()
            },
            ModelConfig {
                ema: 1.5,
                ..Default::default()
            },
            ModelConfig {
                patch: 0,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(Error::ConfigValidation(_))), "{:?}", config);
        }
    }
}
