//! Byte-oriented rANS coder.
//!
//! 32-bit state, byte-wise renormalisation, 16-bit quantized CDFs. Symbols
//! are pushed in reverse so the decoder reads them forward.
//!
//! The encoder starts from state [`RANS_L`]. A well-formed stream decodes
//! back to exactly that state with every byte consumed; anything else means
//! the bytes or the probability model do not belong together.

use mcquic_core::{Error, Result};

use crate::cdf::{QuantizedCdf, PRECISION_BITS};

/// Lower bound of the normalised state interval `[L, L << 8)`.
pub const RANS_L: u32 = 1 << 23;

/// rANS encoder.
///
/// Collects symbols and emits the stream on [`RansEncoder::finish`].
#[derive(Debug, Default)]
pub struct RansEncoder {
    /// Pending (start, freq) pairs in input order.
    pending: Vec<(u32, u32)>,
}

impl RansEncoder {
    /// Create an empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an encoder with room for `symbols` symbols.
    pub fn with_capacity(symbols: usize) -> Self {
        Self {
            pending: Vec::with_capacity(symbols),
        }
    }

    /// Queue `symbol` under `cdf`.
    #[inline]
    pub fn put(&mut self, symbol: usize, cdf: &QuantizedCdf) -> Result<()> {
        if symbol >= cdf.symbols() {
            return Err(Error::IndexOutOfRange {
                index: symbol,
                k: cdf.symbols(),
            });
        }
        self.pending.push((cdf.start(symbol), cdf.freq(symbol)));
        Ok(())
    }

    /// Number of queued symbols.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing has been queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Encode all queued symbols and return the stream.
    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pending.len() / 2 + 4);
        let mut x = RANS_L;

        for &(start, freq) in self.pending.iter().rev() {
            let x_max = ((RANS_L >> PRECISION_BITS) << 8) * freq;
            while x >= x_max {
                out.push((x & 0xff) as u8);
                x >>= 8;
            }
            x = ((x / freq) << PRECISION_BITS) + (x % freq) + start;
        }

        out.extend_from_slice(&x.to_le_bytes());
        out.reverse();
        out
    }
}

/// rANS decoder over a borrowed stream.
#[derive(Debug)]
pub struct RansDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    state: u32,
}

impl<'a> RansDecoder<'a> {
    /// Initialise from the first four bytes of `data`.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::unexpected_eof(data.len()));
        }
        let state = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if state < RANS_L {
            return Err(Error::corrupted_at("rANS state below normalisation bound", 0));
        }
        Ok(Self {
            data,
            pos: 4,
            state,
        })
    }

    /// Decode one symbol under `cdf`.
    #[inline]
    pub fn get(&mut self, cdf: &QuantizedCdf) -> Result<usize> {
        let mask = (1u32 << PRECISION_BITS) - 1;
        let slot = self.state & mask;
        let symbol = cdf.symbol_for(slot);
        let start = cdf.start(symbol);
        let freq = cdf.freq(symbol);

        self.state = freq * (self.state >> PRECISION_BITS) + slot - start;
        while self.state < RANS_L {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or_else(|| Error::unexpected_eof(self.pos))?;
            self.state = (self.state << 8) | byte as u32;
            self.pos += 1;
        }
        Ok(symbol)
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Check the stream ended where the encoder started.
    pub fn finish(self) -> Result<()> {
        if self.state != RANS_L {
            return Err(Error::corrupted(format!(
                "rANS stream ended in state 0x{:08x}, probability model mismatch",
                self.state
            )));
        }
        if self.pos != self.data.len() {
            return Err(Error::corrupted_at(
                format!("{} trailing bytes in rANS stream", self.data.len() - self.pos),
                self.pos,
            ));
        }
        Ok(())
    }
}
