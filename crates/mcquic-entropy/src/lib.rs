//! Entropy coding for McQuic index maps.
//!
//! Indices produced by the multi-codebook quantizer are coded with a
//! byte-oriented rANS coder. Every codebook group has its own probability
//! model, estimated from how often each codeword is picked during training.
//!
//! ## Overview
//!
//! ```text
//!  counts [m][k] ──► FrequencyModel ──► freq [m][k] ──► pmf_to_quantized_cdf
//!                     (EMA / histogram)                        │
//!                                                              ▼
//!  indices [m][h][w] ─────────────► EntropyCoder ──► blocks of rANS bytes
//! ```
//!
//! ## Block Layout
//!
//! A level is split into blocks of at most `block_symbols` symbols so large
//! images can be streamed. Each block is a little-endian `u32` byte length
//! followed by an independent rANS stream.
//!
//! ## References
//!
//! - [Asymmetric Numeral Systems](https://arxiv.org/abs/0902.0271)
//! - [Interleaved entropy coders](https://arxiv.org/abs/1402.3392)

mod cdf;
mod coder;
mod model;
mod rans;

pub use cdf::{pmf_to_quantized_cdf, QuantizedCdf, PRECISION_BITS};
pub use coder::{BlockDecoder, EntropyCoder, DEFAULT_BLOCK_SYMBOLS};
pub use model::{
    normalize_frequencies, EmaFrequency, FrequencyEstimator, FrequencyModel, HistogramFrequency,
    DEFAULT_EMA,
};
pub use rans::{RansDecoder, RansEncoder, RANS_L};
