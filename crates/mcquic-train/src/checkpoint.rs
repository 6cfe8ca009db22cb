//! Resumable training snapshots.
//!
//! ```text
//! ┌───────┬─────────┬──────────────────────────────────────────────┐
//! │ MCQK  │ u32 ver │ bincode(config, model, optimizer, scheduler, │
//! │       │  (LE)   │         run state)                           │
//! └───────┴─────────┴──────────────────────────────────────────────┘
//! ```
//!
//! The version sits outside the bincode payload so an incompatible file
//! is rejected before deserialization is attempted.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use mcquic_neural::CompressorModel;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Result, TrainError};
use crate::optimizer::Optimizer;
use crate::orchestrator::RunState;
use crate::scheduler::LearningRateScheduler;

/// Leading bytes of every checkpoint file
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"MCQK";

/// Conventional checkpoint extension
pub const CHECKPOINT_EXTENSION: &str = "ckpt";

/// Everything needed to resume or deploy a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Config of the run, as YAML
    pub config_yaml: String,
    /// Trained model
    pub model: CompressorModel,
    /// Optimizer with its moments
    pub optimizer: Optimizer,
    /// Scheduler position
    pub scheduler: LearningRateScheduler,
    /// Step, epoch, seed and best metrics
    pub run: RunState,
}

impl Checkpoint {
    /// Current checkpoint version.
    pub const VERSION: u32 = 1;

    /// Parse the stored config.
    pub fn config(&self) -> Result<Config> {
        Config::from_yaml(&self.config_yaml)
    }

    /// Serialize with header.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(&CHECKPOINT_MAGIC)?;
        writer.write_all(&Self::VERSION.to_le_bytes())?;
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Deserialize, checking magic and version first.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut header = [0u8; 8];
        reader.read_exact(&mut header)?;
        if header[..4] != CHECKPOINT_MAGIC {
            return Err(TrainError::Checkpoint("not a checkpoint file".into()));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != Self::VERSION {
            return Err(TrainError::Checkpoint(format!(
                "checkpoint version mismatch: expected {}, got {}",
                Self::VERSION,
                version
            )));
        }
        bincode::deserialize_from(reader)
            .map_err(|e| TrainError::Checkpoint(format!("failed to parse checkpoint: {}", e)))
    }

    /// Serialize to memory.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Save atomically: write `<path>.tmp`, then rename over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let temp_path = path.with_extension("tmp");
        let file = File::create(&temp_path).map_err(|e| {
            TrainError::Checkpoint(format!(
                "failed to create {}: {}",
                temp_path.display(),
                e
            ))
        })?;
        self.write_to(BufWriter::new(file))?;
        fs::rename(&temp_path, path).map_err(|e| {
            TrainError::Checkpoint(format!("failed to rename checkpoint: {}", e))
        })?;
        Ok(())
    }

    /// Load and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            TrainError::Checkpoint(format!("failed to open {}: {}", path.display(), e))
        })?;
        Self::read_from(BufReader::new(file))
    }
}
