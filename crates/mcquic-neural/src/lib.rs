//! Multi-codebook quantization for learned image compression.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        McQuic Model                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  image (H×W×3) ──► pad to p·2^(L-1) ──► pyramid G0 … G(L-1)      │
//! │                                                                  │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │  per level, coarsest first                               │   │
//! │  │  ┌─────────┐   ┌─────────┐   ┌───────────┐               │   │
//! │  │  │Residual │ ->│Analysis │ ->│ m × k-way │ -> indices    │   │
//! │  │  │ patches │   │   A_l   │   │ codebooks │   [m][h][w]   │   │
//! │  │  └─────────┘   └─────────┘   └───────────┘               │   │
//! │  │       ▲                            │                     │   │
//! │  │       └──── prediction ◄── S_l ◄───┘                     │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │                                                                  │
//! │  indices ──► rANS (mcquic-entropy) ──► image.mcq                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quality Levels
//!
//! Quality `q` transmits the `q` coarsest levels. Finer levels are replaced
//! by the upsampled prediction, so lower quality means fewer bytes.

mod codebook;
mod compressor;
mod config;
mod format;
mod io;
mod kmeans;
pub mod metrics;
mod quantizer;
mod reassign;
pub mod transform;

pub use codebook::Codebook;
pub use compressor::{
    accumulate, analysis_param, codebook_param, synthesis_param, CompressorModel, ForwardOutput,
    Gradients, LossBreakdown,
};
pub use config::{CodebookInit, ModelConfig};
pub use format::{index_checksum, LevelHeader, McqFile, McqHeader};
pub use io::{load_image, save_image};
pub use kmeans::{KMeans, KMeansConfig, KMeansFit};
pub use quantizer::{MultiCodebookQuantizer, Quantized, SteGradients, StraightThrough};
pub use reassign::{reassign_codebook, Reassignment};

/// File extension for McQuic bitstreams
pub const MCQ_EXTENSION: &str = "mcq";

/// Magic bytes for the MCQ format
pub const MCQ_MAGIC: [u8; 4] = [0x4D, 0x43, 0x51, 0x00]; // "MCQ\0"

/// Current bitstream version
pub const MCQ_VERSION: u16 = 1;

/// Prelude for common imports
pub mod prelude {
    pub use super::{CompressorModel, McqFile, ModelConfig};
    pub use mcquic_core::{ImageCodec, ImageTensor, QualityLevel, Result};
}
