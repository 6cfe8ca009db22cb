//! Quantized cumulative distribution tables.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use mcquic_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Fixed-point precision of every table.
pub const PRECISION_BITS: u32 = 16;

/// Cumulative frequencies of one codebook group.
///
/// `cdf[0] == 0`, `cdf[k] == 1 << PRECISION_BITS`, strictly increasing, so
/// every symbol stays encodable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizedCdf {
    cdf: Vec<u32>,
}

impl QuantizedCdf {
    /// Number of symbols.
    #[inline]
    pub fn symbols(&self) -> usize {
        self.cdf.len() - 1
    }

    /// Cumulative frequency before `symbol`.
    #[inline]
    pub fn start(&self, symbol: usize) -> u32 {
        self.cdf[symbol]
    }

    /// Frequency of `symbol`.
    #[inline]
    pub fn freq(&self, symbol: usize) -> u32 {
        self.cdf[symbol + 1] - self.cdf[symbol]
    }

    /// Symbol whose interval contains `slot`.
    #[inline]
    pub fn symbol_for(&self, slot: u32) -> usize {
        // First entry strictly greater than slot, minus one
        self.cdf.partition_point(|&c| c <= slot) - 1
    }

    /// Information content of `symbol` in bits.
    #[inline]
    pub fn bits(&self, symbol: usize) -> f64 {
        (PRECISION_BITS as f64) - (self.freq(symbol) as f64).log2()
    }

    /// Raw cumulative table.
    pub fn as_slice(&self) -> &[u32] {
        &self.cdf
    }
}

/// Quantize a probability mass function to a `precision`-bit CDF.
///
/// Every symbol receives at least one slot. Rounding error is paid by the
/// largest frequencies (lowest index first on ties), so the result is
/// deterministic.
/// A pmf with a non-positive or non-finite total falls back to uniform.
pub fn pmf_to_quantized_cdf(pmf: &[f64], precision: u32) -> Result<QuantizedCdf> {
    let k = pmf.len();
    let total = 1u64 << precision;
    if k == 0 {
        return Err(Error::config("empty pmf"));
    }
    if k as u64 > total {
        return Err(Error::config(format!(
            "{} symbols do not fit a {}-bit table",
            k, precision
        )));
    }

    let mass: f64 = pmf.iter().filter(|p| p.is_finite() && **p > 0.0).sum();
    let mut freq: Vec<u64> = if mass > 0.0 && mass.is_finite() {
        pmf.iter()
            .map(|&p| {
                let p = if p.is_finite() && p > 0.0 { p / mass } else { 0.0 };
                ((p * total as f64).round() as u64).max(1)
            })
            .collect()
    } else {
        vec![(total / k as u64).max(1); k]
    };

    let sum: u64 = freq.iter().sum();
    if sum < total {
        let largest = argmax(&freq);
        freq[largest] += total - sum;
    } else if sum > total {
        // Take one slot at a time from the current largest frequency
        let mut heap: BinaryHeap<(u64, Reverse<usize>)> = freq
            .iter()
            .enumerate()
            .map(|(i, &f)| (f, Reverse(i)))
            .collect();
        for _ in 0..sum - total {
            match heap.pop() {
                Some((f, Reverse(i))) if f > 1 => {
                    freq[i] = f - 1;
                    heap.push((f - 1, Reverse(i)));
                }
                _ => return Err(Error::corrupted("cannot fit pmf into quantized table")),
            }
        }
    }

    let mut cdf = Vec::with_capacity(k + 1);
    let mut acc = 0u64;
    cdf.push(0u32);
    for f in freq {
        acc += f;
        cdf.push(acc as u32);
    }
    debug_assert_eq!(acc, total);

    Ok(QuantizedCdf { cdf })
}

fn argmax(values: &[u64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(cdf: &QuantizedCdf, k: usize) {
        let table = cdf.as_slice();
        assert_eq!(table.len(), k + 1);
        assert_eq!(table[0], 0);
        assert_eq!(table[k], 1 << PRECISION_BITS);
        assert!(table.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_uniform() {
        let cdf = pmf_to_quantized_cdf(&[0.25; 4], 16).unwrap();
        check(&cdf, 4);
        assert_eq!(cdf.freq(0), 16384);
        assert_eq!(cdf.freq(3), 16384);
    }

    #[test]
    fn test_zero_probabilities_stay_encodable() {
        let mut pmf = vec![0.0; 100];
        pmf[7] = 1.0;
        let cdf = pmf_to_quantized_cdf(&pmf, 16).unwrap();
        check(&cdf, 100);
        assert_eq!(cdf.freq(0), 1);
        assert_eq!(cdf.freq(7), 65536 - 99);
    }

    #[test]
    fn test_degenerate_pmf_is_uniform() {
        let cdf = pmf_to_quantized_cdf(&[0.0, 0.0, f64::NAN], 16).unwrap();
        check(&cdf, 3);
        assert!(cdf.freq(0) >= 21845 && cdf.freq(0) <= 21846);
    }

    #[test]
    fn test_rounding_excess_is_absorbed() {
        // Many tiny symbols force every one up to 1 slot
        let mut pmf = vec![1e-9; 5000];
        pmf[0] = 0.5;
        pmf[1] = 0.5;
        let cdf = pmf_to_quantized_cdf(&pmf, 16).unwrap();
        check(&cdf, 5000);
        assert_eq!(cdf.freq(0), cdf.freq(1));
        assert_eq!(cdf.freq(2), 1);
    }

    #[test]
    fn test_symbol_lookup() {
        let cdf = pmf_to_quantized_cdf(&[0.5, 0.25, 0.25], 16).unwrap();
        assert_eq!(cdf.symbol_for(0), 0);
        assert_eq!(cdf.symbol_for(32767), 0);
        assert_eq!(cdf.symbol_for(32768), 1);
        assert_eq!(cdf.symbol_for(65535), 2);
        assert!((cdf.bits(0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_too_many_symbols() {
        assert!(pmf_to_quantized_cdf(&vec![1.0; 300], 8).is_err());
        assert!(pmf_to_quantized_cdf(&[], 16).is_err());
    }
}
