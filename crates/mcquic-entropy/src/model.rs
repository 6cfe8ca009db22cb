//! Probability models for codebook indices.
//!
//! The estimator decides how per-group codeword frequencies are refreshed
//! between training and inference. The default is an exponential moving
//! average of observed counts, initialised uniform.

use mcquic_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::cdf::{pmf_to_quantized_cdf, QuantizedCdf, PRECISION_BITS};

/// Default EMA factor applied to the previous frequency.
pub const DEFAULT_EMA: f64 = 0.99;

/// Strategy for turning observed code counts into frequencies.
pub trait FrequencyEstimator {
    /// Registry name of the strategy.
    fn name(&self) -> &'static str;

    /// Number of levels tracked.
    fn levels(&self) -> usize;

    /// Fold in per-group counts `[m][k]` observed at `level`.
    fn observe(&mut self, level: usize, counts: &[Vec<f64>]) -> Result<()>;

    /// Current raw frequencies `[m][k]` at `level`.
    fn frequencies(&self, level: usize) -> &[Vec<f64>];
}

fn ones(m: usize, k: &[usize]) -> Vec<Vec<Vec<f64>>> {
    k.iter().map(|&ki| vec![vec![1.0; ki]; m]).collect()
}

fn check_counts(level: usize, freq: &[Vec<Vec<f64>>], counts: &[Vec<f64>]) -> Result<()> {
    let table = freq
        .get(level)
        .ok_or_else(|| Error::shape(format!("level < {}", freq.len()), level))?;
    if counts.len() != table.len() || counts.iter().zip(table).any(|(c, t)| c.len() != t.len()) {
        return Err(Error::shape(
            format!("{}x{}", table.len(), table.first().map_or(0, Vec::len)),
            format!("{}x{}", counts.len(), counts.first().map_or(0, Vec::len)),
        ));
    }
    Ok(())
}

/// Exponential moving average of code counts.
///
/// `freq = (1 - ema) * count + ema * freq`, starting from all ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaFrequency {
    decay: f64,
    freq: Vec<Vec<Vec<f64>>>,
}

impl EmaFrequency {
    /// Create for `m` groups with codebook sizes `k` per level.
    pub fn new(m: usize, k: &[usize], ema: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&ema) {
            return Err(Error::config(format!("ema {} outside [0, 1)", ema)));
        }
        Ok(Self {
            decay: 1.0 - ema,
            freq: ones(m, k),
        })
    }
}

impl FrequencyEstimator for EmaFrequency {
    fn name(&self) -> &'static str {
        "ema"
    }

    fn levels(&self) -> usize {
        self.freq.len()
    }

    fn observe(&mut self, level: usize, counts: &[Vec<f64>]) -> Result<()> {
        check_counts(level, &self.freq, counts)?;
        let decay = self.decay;
        for (row, count) in self.freq[level].iter_mut().zip(counts) {
            for (f, c) in row.iter_mut().zip(count) {
                *f = decay * c + (1.0 - decay) * *f;
            }
        }
        Ok(())
    }

    fn frequencies(&self, level: usize) -> &[Vec<f64>] {
        &self.freq[level]
    }
}

/// Cumulative histogram with add-one smoothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramFrequency {
    counts: Vec<Vec<Vec<f64>>>,
}

impl HistogramFrequency {
    /// Create for `m` groups with codebook sizes `k` per level.
    pub fn new(m: usize, k: &[usize]) -> Self {
        Self { counts: ones(m, k) }
    }
}

impl FrequencyEstimator for HistogramFrequency {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn levels(&self) -> usize {
        self.counts.len()
    }

    fn observe(&mut self, level: usize, counts: &[Vec<f64>]) -> Result<()> {
        check_counts(level, &self.counts, counts)?;
        for (row, count) in self.counts[level].iter_mut().zip(counts) {
            for (f, c) in row.iter_mut().zip(count) {
                *f += c;
            }
        }
        Ok(())
    }

    fn frequencies(&self, level: usize) -> &[Vec<f64>] {
        &self.counts[level]
    }
}

/// Serialisable choice of estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrequencyModel {
    /// Exponential moving average (default).
    Ema(EmaFrequency),
    /// Cumulative histogram.
    Histogram(HistogramFrequency),
}

impl FrequencyModel {
    /// Names accepted by [`FrequencyModel::from_name`].
    pub const NAMES: [&'static str; 2] = ["ema", "histogram"];

    /// Build an estimator by name.
    pub fn from_name(name: &str, m: usize, k: &[usize], ema: f64) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ema" => Ok(FrequencyModel::Ema(EmaFrequency::new(m, k, ema)?)),
            "histogram" => Ok(FrequencyModel::Histogram(HistogramFrequency::new(m, k))),
            other => Err(Error::config(format!(
                "unknown frequency model '{}' (available: {})",
                other,
                Self::NAMES.join(", ")
            ))),
        }
    }

    fn inner(&self) -> &dyn FrequencyEstimator {
        match self {
            FrequencyModel::Ema(e) => e,
            FrequencyModel::Histogram(h) => h,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn FrequencyEstimator {
        match self {
            FrequencyModel::Ema(e) => e,
            FrequencyModel::Histogram(h) => h,
        }
    }

    /// Frequencies at `level` scaled so each group sums to `2^16`, rounded.
    pub fn normalized(&self, level: usize) -> Vec<Vec<f64>> {
        normalize_frequencies(self.frequencies(level))
    }

    /// Quantized CDF per group at `level`.
    pub fn cdf_tables(&self, level: usize) -> Result<Vec<QuantizedCdf>> {
        self.normalized(level)
            .iter()
            .map(|row| {
                let total: f64 = row.iter().sum();
                if total < 1.0 {
                    let uniform = vec![1.0 / row.len() as f64; row.len()];
                    pmf_to_quantized_cdf(&uniform, PRECISION_BITS)
                } else {
                    let pmf: Vec<f64> = row.iter().map(|f| f / total).collect();
                    pmf_to_quantized_cdf(&pmf, PRECISION_BITS)
                }
            })
            .collect()
    }

    /// Proportion of codewords with non-zero normalised frequency.
    pub fn code_usage(&self) -> f64 {
        let mut used = 0usize;
        let mut total = 0usize;
        for level in 0..self.levels() {
            for row in self.normalized(level) {
                used += row.iter().filter(|&&f| f > 0.0).count();
                total += row.len();
            }
        }
        if total == 0 {
            0.0
        } else {
            used as f64 / total as f64
        }
    }
}

impl FrequencyEstimator for FrequencyModel {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn levels(&self) -> usize {
        self.inner().levels()
    }

    fn observe(&mut self, level: usize, counts: &[Vec<f64>]) -> Result<()> {
        self.inner_mut().observe(level, counts)
    }

    fn frequencies(&self, level: usize) -> &[Vec<f64>] {
        self.inner().frequencies(level)
    }
}

/// Scale each row to sum to `2^16` and round.
pub fn normalize_frequencies(freq: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let scale = (1u64 << PRECISION_BITS) as f64;
    freq.iter()
        .map(|row| {
            let sum: f64 = row.iter().sum();
            if sum <= 0.0 || !sum.is_finite() {
                return vec![0.0; row.len()];
            }
            row.iter().map(|f| (f / sum * scale).round()).collect()
        })
        .collect()
}
