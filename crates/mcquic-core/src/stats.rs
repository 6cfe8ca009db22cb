//! Rate and quality statistics for coding operations.

use crate::types::ImageSize;

/// Bits per pixel of a compressed payload.
pub fn bits_per_pixel(compressed_bytes: usize, size: ImageSize) -> f64 {
    if size.pixels() == 0 {
        return 0.0;
    }
    compressed_bytes as f64 * 8.0 / size.pixels() as f64
}

/// Peak signal-to-noise ratio for samples in `[0, 1]`.
pub fn psnr(mse: f64) -> f64 {
    if mse <= 0.0 {
        f64::INFINITY
    } else {
        10.0 * (1.0 / mse).log10()
    }
}

/// Statistics from a compress/decompress operation.
#[derive(Debug, Clone, Default)]
pub struct CodingStats {
    /// Pixels processed.
    pub pixels: usize,
    /// Raw size in bytes (8-bit samples).
    pub original_size: usize,
    /// Container size in bytes.
    pub compressed_size: usize,
    /// Time taken in microseconds.
    pub time_us: u64,
    /// Symbols entropy coded.
    pub symbols: usize,
    /// Levels transmitted.
    pub coded_levels: usize,
}

impl CodingStats {
    /// Create stats from a completed operation.
    pub fn from_operation(image: ImageSize, compressed_size: usize, time_us: u64) -> Self {
        Self {
            pixels: image.pixels(),
            original_size: image.samples(),
            compressed_size,
            time_us,
            ..Default::default()
        }
    }

    /// Compression ratio against 8-bit raw samples.
    pub fn ratio(&self) -> f64 {
        if self.compressed_size == 0 {
            return 0.0;
        }
        self.original_size as f64 / self.compressed_size as f64
    }

    /// Bits per pixel.
    pub fn bpp(&self) -> f64 {
        if self.pixels == 0 {
            return 0.0;
        }
        self.compressed_size as f64 * 8.0 / self.pixels as f64
    }

    /// Throughput in megapixels per second.
    pub fn megapixels_per_sec(&self) -> f64 {
        if self.time_us == 0 {
            return 0.0;
        }
        self.pixels as f64 / self.time_us as f64
    }

    /// Merge stats from multiple operations.
    pub fn merge(&mut self, other: &CodingStats) {
        self.pixels += other.pixels;
        self.original_size += other.original_size;
        self.compressed_size += other.compressed_size;
        self.time_us += other.time_us;
        self.symbols += other.symbols;
        self.coded_levels = self.coded_levels.max(other.coded_levels);
    }
}
