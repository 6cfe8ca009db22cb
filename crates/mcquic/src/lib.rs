//! # McQuic
//!
//! Learned lossy image compression with multi-codebook quantization.
//!
//! An image is coded as a pyramid of residuals. Each level is projected to
//! latents, split into groups, snapped to the nearest entry of a learned
//! codebook per group, and the resulting indices are entropy coded with
//! rANS under adaptive code frequencies. Decoding reverses this exactly, so
//! any decoder holding the same model reconstructs the same image.
//!
//! ## Quick Start
//!
//! ```ignore
//! use mcquic::prelude::*;
//!
//! let model = CompressorModel::new(ModelConfig::default())?;
//! let image = mcquic::load_image(Path::new("photo.png"))?;
//! let file = model.encode(&image, QualityLevel::full(model.levels()))?;
//! file.save(Path::new("photo.mcq"))?;
//! let restored = model.decode(&McqFile::load_verified(Path::new("photo.mcq"), model.fingerprint())?)?;
//! ```
//!
//! ## Crates
//!
//! | Crate | Contents |
//! |-------|----------|
//! | `mcquic-core` | errors, image tensors, shared types |
//! | `mcquic-entropy` | CDF quantization, rANS, frequency models |
//! | `mcquic-neural` | codebooks, transforms, compressor, `.mcq` container |
//! | `mcquic-train` | config, registry, trainer, checkpoints |

pub mod commands;

pub use mcquic_core as types;
pub use mcquic_entropy as entropy;
pub use mcquic_neural as neural;
pub use mcquic_train as train;

pub use commands::{compress_file, decompress_file, load_model, CompressReport};
pub use mcquic_core::{Error, ImageCodec, ImageTensor, QualityLevel, Result};
pub use mcquic_neural::{load_image, save_image, CompressorModel, McqFile, ModelConfig, MCQ_EXTENSION};
pub use mcquic_train::{Checkpoint, Config, Trainer, TrainError};

/// Commonly used items
pub mod prelude {
    pub use super::{CompressorModel, ImageCodec, ImageTensor, McqFile, ModelConfig, QualityLevel};
    pub use std::path::Path;
}
