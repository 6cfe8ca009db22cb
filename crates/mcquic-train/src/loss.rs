//! Rate-distortion objective

use mcquic_neural::{LossBreakdown, StraightThrough};
use serde::{Deserialize, Serialize};

use crate::config::LossSection;
use crate::error::{Result, TrainError};

/// `distortion + rate_weight · rate + commitment · ||z - sg(q)||²`
///
/// Distortion is MSE and rate is estimated bits per pixel under the current
/// frequency model. Only the distortion and commitment terms have
/// gradients; the rate weight steers the reported objective and best-model
/// selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateDistortionLoss {
    /// Weight of the rate term
    pub rate_weight: f64,
    /// Commitment weight β
    pub commitment: f32,
}

impl Default for RateDistortionLoss {
    fn default() -> Self {
        LossSection::default().into()
    }
}

impl From<LossSection> for RateDistortionLoss {
    fn from(section: LossSection) -> Self {
        Self {
            rate_weight: section.rate_weight,
            commitment: section.commitment,
        }
    }
}

impl RateDistortionLoss {
    /// Scalar objective of one step.
    pub fn total(&self, terms: &LossBreakdown) -> f64 {
        terms.distortion + self.rate_weight * terms.rate + self.commitment as f64 * terms.quantization
    }

    /// Straight-through estimator carrying this commitment weight.
    pub fn straight_through(&self) -> StraightThrough {
        StraightThrough {
            commitment: self.commitment,
        }
    }

    /// Total loss, or `TrainingDivergence` when any term is not finite.
    pub fn checked_total(&self, step: u64, terms: &LossBreakdown) -> Result<f64> {
        let total = self.total(terms);
        if !total.is_finite() {
            return Err(TrainError::TrainingDivergence { step, loss: total });
        }
        Ok(total)
    }
}
