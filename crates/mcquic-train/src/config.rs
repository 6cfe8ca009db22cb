//! Training configuration, loaded from YAML.
//!
//! ```yaml
//! model:
//!   key: McQuic
//!   channel: 12
//!   m: 4
//!   k: [2048, 512, 128]
//! train:
//!   batch_size: 4
//!   dataset:
//!     train: data/train
//!     val: data/val
//!   optim:
//!     key: Adam
//!     params:
//!       lr: 0.001
//!   schdr:
//!     key: WarmupCosine
//!     params:
//!       warmup_steps: 1000
//! ```
//!
//! Every field has a default; `Config::validate` runs after loading.

use std::fs;
use std::path::{Path, PathBuf};

use mcquic_neural::ModelConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

/// Top-level training configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Model choice and architecture
    #[serde(default)]
    pub model: ModelSection,
    /// Everything about the run itself
    #[serde(default)]
    pub train: TrainSection,
}

/// Registry key plus model architecture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSection {
    /// Model registry key
    #[serde(default = "default_model_key")]
    pub key: String,
    /// Architecture
    #[serde(flatten)]
    pub params: ModelConfig,
}

fn default_model_key() -> String {
    "McQuic".to_string()
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            key: default_model_key(),
            params: ModelConfig::default(),
        }
    }
}

/// A registry key with free-form parameters for its factory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    /// Registry key
    pub key: String,
    /// Factory parameters
    #[serde(default)]
    pub params: serde_yaml::Value,
}

impl Component {
    /// Component with no parameters.
    pub fn named(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            params: serde_yaml::Value::Null,
        }
    }

    /// Deserialize `params` into `T`; a missing block means all defaults.
    pub fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let value = if self.params.is_null() {
            serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
        } else {
            self.params.clone()
        };
        serde_yaml::from_value(value)
            .map_err(|e| TrainError::config(format!("bad params for '{}': {}", self.key, e)))
    }
}

/// Dataset locations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetSection {
    /// Folder of training images
    #[serde(default)]
    pub train: PathBuf,
    /// Folder of validation images, if any
    #[serde(default)]
    pub val: Option<PathBuf>,
}

/// Periodic hooks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HooksSection {
    /// Steps between dead-codeword reassignments
    #[serde(default = "default_reassign_freq")]
    pub codebook_reassign_freq: u64,
}

fn default_reassign_freq() -> u64 {
    100
}

impl Default for HooksSection {
    fn default() -> Self {
        Self {
            codebook_reassign_freq: default_reassign_freq(),
        }
    }
}

/// Rate-distortion loss weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossSection {
    /// Weight of the rate term
    #[serde(default = "default_rate_weight")]
    pub rate_weight: f64,
    /// Commitment weight
    #[serde(default = "default_commitment")]
    pub commitment: f32,
}

fn default_rate_weight() -> f64 {
    0.01
}

fn default_commitment() -> f32 {
    0.25
}

impl Default for LossSection {
    fn default() -> Self {
        Self {
            rate_weight: default_rate_weight(),
            commitment: default_commitment(),
        }
    }
}

/// Run parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSection {
    /// Optimizer steps to run
    #[serde(default = "default_total_steps")]
    pub total_steps: u64,
    /// Images per step, across all workers
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on passes over the training set
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Steps between validations
    #[serde(default = "default_val_freq")]
    pub val_freq: u64,
    /// Steps between checkpoints
    #[serde(default = "default_save_freq")]
    pub save_freq: u64,
    /// Steps between progress logs
    #[serde(default = "default_log_interval")]
    pub log_interval: u64,
    /// Square training crop side
    #[serde(default = "default_crop_size")]
    pub crop_size: usize,
    /// Seed for shuffling, crops and reassignment
    #[serde(default)]
    pub seed: u64,
    /// Data-parallel worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Batches buffered ahead of the trainer
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    /// Retries for transient image load failures
    #[serde(default = "default_io_retries")]
    pub io_retries: u32,
    /// Base backoff between retries, in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Longest a worker may wait at the all-reduce barrier
    #[serde(default = "default_barrier_timeout_ms")]
    pub barrier_timeout_ms: u64,
    /// Global gradient norm limit, `null` to disable
    #[serde(default = "default_gradient_clip")]
    pub gradient_clip: Option<f32>,
    /// Validation images to evaluate, `0` for all
    #[serde(default = "default_val_images")]
    pub val_images: usize,
    /// Checkpoint directory
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Dataset locations
    #[serde(default)]
    pub dataset: DatasetSection,
    /// Optimizer
    #[serde(default = "default_optim")]
    pub optim: Component,
    /// Learning rate scheduler
    #[serde(default = "default_schdr")]
    pub schdr: Component,
    /// Periodic hooks
    #[serde(default)]
    pub hooks: HooksSection,
    /// Loss weights
    #[serde(default)]
    pub loss: LossSection,
}

fn default_total_steps() -> u64 {
    100_000
}

fn default_batch_size() -> usize {
    4
}

fn default_epochs() -> usize {
    1_000
}

fn default_val_freq() -> u64 {
    10
}

fn default_save_freq() -> u64 {
    1_000
}

fn default_log_interval() -> u64 {
    100
}

fn default_crop_size() -> usize {
    256
}

fn default_workers() -> usize {
    1
}

fn default_prefetch() -> usize {
    8
}

fn default_io_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_barrier_timeout_ms() -> u64 {
    60_000
}

fn default_gradient_clip() -> Option<f32> {
    Some(1.0)
}

fn default_val_images() -> usize {
    16
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("saved")
}

fn default_optim() -> Component {
    Component::named("Adam")
}

fn default_schdr() -> Component {
    Component::named("WarmupCosine")
}

impl Default for TrainSection {
    fn default() -> Self {
        Self {
            total_steps: default_total_steps(),
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            val_freq: default_val_freq(),
            save_freq: default_save_freq(),
            log_interval: default_log_interval(),
            crop_size: default_crop_size(),
            seed: 0,
            workers: default_workers(),
            prefetch: default_prefetch(),
            io_retries: default_io_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            barrier_timeout_ms: default_barrier_timeout_ms(),
            gradient_clip: default_gradient_clip(),
            val_images: default_val_images(),
            output_dir: default_output_dir(),
            dataset: DatasetSection::default(),
            optim: default_optim(),
            schdr: default_schdr(),
            hooks: HooksSection::default(),
            loss: LossSection::default(),
        }
    }
}

impl Config {
    /// Parse YAML text and validate it.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)
            .map_err(|e| TrainError::config(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// YAML text of this config.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check every value that would otherwise fail deep inside training.
    pub fn validate(&self) -> Result<()> {
        self.model.params.validate()?;
        if self.model.key.is_empty() {
            return Err(TrainError::config("model.key is empty"));
        }

        let t = &self.train;
        let positive: [(&str, u64); 8] = [
            ("total_steps", t.total_steps),
            ("batch_size", t.batch_size as u64),
            ("epochs", t.epochs as u64),
            ("val_freq", t.val_freq),
            ("save_freq", t.save_freq),
            ("log_interval", t.log_interval),
            ("workers", t.workers as u64),
            ("prefetch", t.prefetch as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TrainError::config(format!("train.{} must be positive", name)));
            }
        }
        if t.hooks.codebook_reassign_freq == 0 {
            return Err(TrainError::config(
                "train.hooks.codebook_reassign_freq must be positive",
            ));
        }
        if t.barrier_timeout_ms == 0 {
            return Err(TrainError::config("train.barrier_timeout_ms must be positive"));
        }
        if t.batch_size % t.workers != 0 {
            return Err(TrainError::config(format!(
                "train.batch_size {} is not divisible by train.workers {}",
                t.batch_size, t.workers
            )));
        }
        let align = self.model.params.alignment();
        if t.crop_size == 0 || t.crop_size % align != 0 {
            return Err(TrainError::config(format!(
                "train.crop_size {} must be a positive multiple of {}",
                t.crop_size, align
            )));
        }
        if let Some(clip) = t.gradient_clip {
            if !(clip.is_finite() && clip > 0.0) {
                return Err(TrainError::config(format!(
                    "train.gradient_clip must be positive, got {}",
                    clip
                )));
            }
        }
        if !(t.loss.rate_weight.is_finite() && t.loss.rate_weight >= 0.0) {
            return Err(TrainError::config("train.loss.rate_weight must be non-negative"));
        }
        if !(t.loss.commitment.is_finite() && t.loss.commitment >= 0.0) {
            return Err(TrainError::config("train.loss.commitment must be non-negative"));
        }
        if t.optim.key.is_empty() || t.schdr.key.is_empty() {
            return Err(TrainError::config("train.optim.key and train.schdr.key are required"));
        }
        Ok(())
    }
}
