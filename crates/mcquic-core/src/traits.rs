//! Codec traits.

use crate::error::Result;
use crate::types::{ImageTensor, QualityLevel};

/// One-shot image compression at a quality level.
pub trait ImageCodec {
    /// Number of levels the codec can transmit.
    fn levels(&self) -> usize;

    /// Compress an image into a self-describing byte stream.
    fn compress(&self, image: &ImageTensor, quality: QualityLevel) -> Result<Vec<u8>>;

    /// Decompress a byte stream produced by [`ImageCodec::compress`].
    fn decompress(&self, input: &[u8]) -> Result<ImageTensor>;

    /// Compress then decompress and check the spatial shape survives.
    fn verify_roundtrip(&self, image: &ImageTensor, quality: QualityLevel) -> Result<bool> {
        let compressed = self.compress(image, quality)?;
        let restored = self.decompress(&compressed)?;
        Ok(restored.size() == image.size())
    }
}
