//! Image file I/O

use std::path::Path;

use image::RgbImage;
use mcquic_core::{Error, ImageTensor, Result};

/// Load any supported image file as RGB in `[0, 1]`.
pub fn load_image(path: &Path) -> Result<ImageTensor> {
    let decoded = image::open(path).map_err(|e| match e {
        image::ImageError::IoError(io) => Error::Io(io),
        other => Error::corrupted_by(format!("cannot decode {}", path.display()), other),
    })?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    ImageTensor::from_rgb8(height as usize, width as usize, rgb.as_raw())
}

/// Save an RGB image; the format follows the file extension.
pub fn save_image(path: &Path, image: &ImageTensor) -> Result<()> {
    if image.channel != 3 {
        return Err(Error::shape("3 channels", image.channel));
    }
    let rgb = RgbImage::from_raw(image.width as u32, image.height as u32, image.to_rgb8())
        .ok_or_else(|| Error::shape(image.size(), "raw buffer"))?;
    rgb.save(path).map_err(|e| match e {
        image::ImageError::IoError(io) => Error::Io(io),
        other => Error::corrupted_by(format!("cannot encode {}", path.display()), other),
    })
}
