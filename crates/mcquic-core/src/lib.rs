//! # McQuic Core
//!
//! Shared types, errors and codec traits for the McQuic learned image
//! compression stack.
//!
//! McQuic (Multi-codebook Quantizers) encodes an image into discrete
//! codebook indices at several spatial scales, entropy codes the indices
//! and packages them into a `.mcq` container.
//!
//! ## Layering
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  mcquic          facade + CLI                              │
//! ├──────────────────────────────────────────────────────────┤
//! │  mcquic-train    config, registry, orchestrator, workers   │
//! ├──────────────────────────────────────────────────────────┤
//! │  mcquic-neural   codebooks, quantizer, transform, .mcq     │
//! ├──────────────────────────────────────────────────────────┤
//! │  mcquic-entropy  quantized CDFs, rANS, frequency models    │
//! ├──────────────────────────────────────────────────────────┤
//! │  mcquic-core     errors, shapes, traits, stats (this)      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Traits
//!
//! - [`ImageCodec`] - One-shot image compress / decompress at a quality level

pub mod error;
pub mod stats;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use stats::{bits_per_pixel, psnr, CodingStats};
pub use traits::ImageCodec;
pub use types::{CodeSize, DistanceKind, ImageSize, ImageTensor, QualityLevel};

/// Numerical floor used for "never assigned" frequencies and norm guards.
pub const EPS: f64 = 1e-6;
