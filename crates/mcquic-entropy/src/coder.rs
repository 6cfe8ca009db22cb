//! Blockwise entropy coder for multi-level index maps.

use mcquic_core::{CodeSize, Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cdf::QuantizedCdf;
use crate::model::{FrequencyEstimator, FrequencyModel};
use crate::rans::{RansDecoder, RansEncoder};

/// Symbols per independently coded block.
pub const DEFAULT_BLOCK_SYMBOLS: usize = 1 << 16;

/// Smallest encoded block: `u32` length plus the 32-bit rANS state.
const MIN_BLOCK_BYTES: usize = 8;

/// Entropy coder for `m`-group index maps at every level.
///
/// Index maps are flattened `[m][h][w]`: symbol `i` belongs to group
/// `i / (h * w)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntropyCoder {
    m: usize,
    k: Vec<usize>,
    block_symbols: usize,
    model: FrequencyModel,
}

impl EntropyCoder {
    /// Create a coder around a frequency model.
    pub fn new(m: usize, k: Vec<usize>, model: FrequencyModel) -> Result<Self> {
        if m == 0 {
            return Err(Error::config("entropy coder needs at least one group"));
        }
        if model.levels() != k.len() {
            return Err(Error::config(format!(
                "frequency model tracks {} levels, coder has {}",
                model.levels(),
                k.len()
            )));
        }
        Ok(Self {
            m,
            k,
            block_symbols: DEFAULT_BLOCK_SYMBOLS,
            model,
        })
    }

    /// Override the block size.
    pub fn with_block_symbols(mut self, block_symbols: usize) -> Self {
        self.block_symbols = block_symbols.max(1);
        self
    }

    /// Groups per level.
    pub fn m(&self) -> usize {
        self.m
    }

    /// Codebook sizes per level.
    pub fn k(&self) -> &[usize] {
        &self.k
    }

    /// Underlying frequency model.
    pub fn model(&self) -> &FrequencyModel {
        &self.model
    }

    /// Fold in one-hot code counts `[m][k]` for `level`.
    pub fn observe(&mut self, level: usize, counts: &[Vec<f64>]) -> Result<()> {
        self.model.observe(level, counts)
    }

    /// Frequencies at `level` normalised to `2^16` per group.
    pub fn normalized_frequencies(&self, level: usize) -> Vec<Vec<f64>> {
        self.model.normalized(level)
    }

    /// Proportion of codewords in use.
    pub fn code_usage(&self) -> f64 {
        self.model.code_usage()
    }

    /// CDF tables for every level, `[level][group]`.
    pub fn cdf_tables(&self) -> Result<Vec<Vec<QuantizedCdf>>> {
        (0..self.k.len()).map(|lv| self.model.cdf_tables(lv)).collect()
    }

    /// `m * height * width`, rejecting maps that `data` cannot hold.
    fn level_symbols(&self, height: usize, width: usize, data: &[u8]) -> Result<usize> {
        let symbols = height
            .checked_mul(width)
            .and_then(|plane| plane.checked_mul(self.m))
            .ok_or_else(|| {
                Error::shape("addressable code map", format!("{}x{}x{}", self.m, height, width))
            })?;
        let min_bytes = symbols
            .div_ceil(self.block_symbols)
            .saturating_mul(MIN_BLOCK_BYTES);
        if min_bytes > data.len() {
            return Err(Error::shape(
                format!("at least {} payload bytes for {} symbols", min_bytes, symbols),
                format!("{} bytes", data.len()),
            ));
        }
        Ok(symbols)
    }

    fn check_level(&self, level: usize) -> Result<()> {
        if level >= self.k.len() {
            return Err(Error::shape(format!("level < {}", self.k.len()), level));
        }
        Ok(())
    }

    /// Estimated code length in bits of `indices` under per-group `tables`.
    pub fn estimate_bits(tables: &[QuantizedCdf], indices: &[u16], plane: usize) -> f64 {
        let plane = plane.max(1);
        indices
            .iter()
            .enumerate()
            .map(|(i, &s)| tables[(i / plane).min(tables.len() - 1)].bits(s as usize))
            .sum()
    }

    /// Encode one level; `plane` is `h * w`.
    pub fn encode_level(
        &self,
        level: usize,
        tables: &[QuantizedCdf],
        indices: &[u16],
        plane: usize,
    ) -> Result<Vec<u8>> {
        self.check_level(level)?;
        if indices.len() != self.m * plane {
            return Err(Error::shape(self.m * plane, indices.len()));
        }
        if tables.len() != self.m {
            return Err(Error::shape(format!("{} tables", self.m), tables.len()));
        }

        let mut out = Vec::new();
        for (b, block) in indices.chunks(self.block_symbols).enumerate() {
            let base = b * self.block_symbols;
            let mut enc = RansEncoder::with_capacity(block.len());
            for (j, &symbol) in block.iter().enumerate() {
                let group = (base + j) / plane;
                enc.put(symbol as usize, &tables[group])?;
            }
            let bytes = enc.finish();
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&bytes);
        }

        debug!(
            level,
            symbols = indices.len(),
            bytes = out.len(),
            "encoded level"
        );
        Ok(out)
    }

    /// Stream the blocks of one level.
    pub fn decode_blocks<'a>(
        &'a self,
        tables: &'a [QuantizedCdf],
        data: &'a [u8],
        plane: usize,
    ) -> BlockDecoder<'a> {
        BlockDecoder {
            tables,
            data,
            offset: 0,
            plane: plane.max(1),
            remaining: self.m.saturating_mul(plane),
            decoded: 0,
            block_symbols: self.block_symbols,
        }
    }

    /// Decode one level of shape `[m][h][w]`.
    pub fn decode_level(
        &self,
        level: usize,
        tables: &[QuantizedCdf],
        data: &[u8],
        height: usize,
        width: usize,
    ) -> Result<Vec<u16>> {
        self.check_level(level)?;
        let symbols = self.level_symbols(height, width, data)?;
        let plane = height * width;
        let mut indices = Vec::with_capacity(symbols.min(self.block_symbols));
        for block in self.decode_blocks(tables, data, plane) {
            indices.extend(block?);
        }
        if indices.len() != symbols {
            return Err(Error::shape(symbols, indices.len()));
        }
        Ok(indices)
    }

    /// Encode levels `first_level..first_level + codes.len()`.
    pub fn compress(
        &self,
        first_level: usize,
        codes: &[Vec<u16>],
        code_size: &CodeSize,
    ) -> Result<Vec<Vec<u8>>> {
        let tables = self.cdf_tables()?;
        codes
            .iter()
            .enumerate()
            .map(|(i, code)| {
                let level = first_level + i;
                self.check_level(level)?;
                let plane = code_size.heights[i] * code_size.widths[i];
                self.encode_level(level, &tables[level], code, plane)
            })
            .collect()
    }

    /// Inverse of [`EntropyCoder::compress`].
    pub fn decompress(
        &self,
        first_level: usize,
        binaries: &[Vec<u8>],
        code_size: &CodeSize,
    ) -> Result<Vec<Vec<u16>>> {
        if binaries.len() != code_size.levels() {
            return Err(Error::shape(
                format!("{} level binaries", code_size.levels()),
                binaries.len(),
            ));
        }
        if code_size.m != self.m {
            return Err(Error::shape(format!("m = {}", self.m), format!("m = {}", code_size.m)));
        }
        let tables = self.cdf_tables()?;
        binaries
            .iter()
            .enumerate()
            .map(|(i, binary)| {
                let level = first_level + i;
                self.check_level(level)?;
                if code_size.k[i] != self.k[level] {
                    return Err(Error::shape(
                        format!("k = {}", self.k[level]),
                        format!("k = {}", code_size.k[i]),
                    ));
                }
                self.decode_level(
                    level,
                    &tables[level],
                    binary,
                    code_size.heights[i],
                    code_size.widths[i],
                )
            })
            .collect()
    }
}

/// Iterator over decoded blocks of one level.
#[derive(Debug)]
pub struct BlockDecoder<'a> {
    tables: &'a [QuantizedCdf],
    data: &'a [u8],
    offset: usize,
    plane: usize,
    remaining: usize,
    decoded: usize,
    block_symbols: usize,
}

impl BlockDecoder<'_> {
    fn next_block(&mut self) -> Result<Vec<u16>> {
        let header = self
            .data
            .get(self.offset..self.offset + 4)
            .ok_or_else(|| Error::unexpected_eof(self.data.len()))?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let start = self.offset + 4;
        let body = self
            .data
            .get(start..start + len)
            .ok_or_else(|| Error::unexpected_eof(self.data.len()))?;

        let count = self.remaining.min(self.block_symbols);
        let mut dec = RansDecoder::new(body)?;
        let mut block = Vec::with_capacity(count);
        for j in 0..count {
            let group = (self.decoded + j) / self.plane;
            let table = self
                .tables
                .get(group)
                .ok_or_else(|| Error::shape(format!("group < {}", self.tables.len()), group))?;
            block.push(dec.get(table)? as u16);
        }
        dec.finish()
            .map_err(|e| Error::corrupted_by(format!("block at offset {}", self.offset), e))?;

        self.offset = start + len;
        self.remaining -= count;
        self.decoded += count;
        Ok(block)
    }
}

impl Iterator for BlockDecoder<'_> {
    type Item = Result<Vec<u16>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            if self.offset != self.data.len() {
                let trailing = self.data.len() - self.offset;
                self.offset = self.data.len();
                return Some(Err(Error::shape(
                    "end of level payload",
                    format!("{} extra bytes", trailing),
                )));
            }
            return None;
        }
        let block = self.next_block();
        if block.is_err() {
            // Stop after the first failure
            self.remaining = 0;
            self.offset = self.data.len();
        }
        Some(block)
    }
}
