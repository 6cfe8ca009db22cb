//! File-level operations behind the command-line tool.

use std::path::{Path, PathBuf};
use std::time::Instant;

use mcquic_core::{CodingStats, ImageSize, QualityLevel};
use mcquic_neural::{load_image, save_image, CompressorModel, McqFile, ModelConfig, MCQ_EXTENSION};
use mcquic_train::{Checkpoint, TrainError};
use tracing::{debug, info};

/// Model from a checkpoint, or the untrained default architecture.
pub fn load_model(checkpoint: Option<&Path>) -> Result<CompressorModel, TrainError> {
    match checkpoint {
        Some(path) => {
            let ckpt = Checkpoint::load(path)?;
            debug!(path = %path.display(), step = ckpt.run.step, "model loaded from checkpoint");
            Ok(ckpt.model)
        }
        None => Ok(CompressorModel::new(ModelConfig::default())?),
    }
}

/// Outcome of [`compress_file`]
#[derive(Debug, Clone)]
pub struct CompressReport {
    /// Written file
    pub output: PathBuf,
    /// Levels coded
    pub quality: QualityLevel,
    /// Size and timing
    pub stats: CodingStats,
}

/// `input` with its extension replaced.
pub fn default_output(input: &Path, extension: &str) -> PathBuf {
    input.with_extension(extension)
}

/// Compress an image file to `.mcq`.
///
/// `quality` defaults to every level; `output` defaults to the input path
/// with the `mcq` extension.
pub fn compress_file(
    model: &CompressorModel,
    input: &Path,
    output: Option<&Path>,
    quality: Option<u8>,
) -> Result<CompressReport, TrainError> {
    let quality = match quality {
        Some(q) => QualityLevel::new(q, model.levels())?,
        None => QualityLevel::full(model.levels()),
    };
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output(input, MCQ_EXTENSION));

    let image = load_image(input)?;
    let start = Instant::now();
    let file = model.encode(&image, quality)?;
    let elapsed = start.elapsed().as_micros() as u64;
    file.save(&output)?;

    let stats = CodingStats {
        coded_levels: quality.get() as usize,
        ..CodingStats::from_operation(image.size(), file.size(), elapsed)
    };
    info!(
        input = %input.display(),
        output = %output.display(),
        bytes = file.size(),
        bpp = stats.bpp(),
        quality = quality.get(),
        "compressed"
    );
    Ok(CompressReport {
        output,
        quality,
        stats,
    })
}

/// Decompress a `.mcq` file to an image; the format follows `output`'s
/// extension (PNG when defaulted).
pub fn decompress_file(
    model: &CompressorModel,
    input: &Path,
    output: Option<&Path>,
) -> Result<(PathBuf, ImageSize), TrainError> {
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_output(input, "png"));
    let file = McqFile::load_verified(input, model.fingerprint())?;
    let image = model.decode(&file)?;
    save_image(&output, &image)?;
    info!(
        input = %input.display(),
        output = %output.display(),
        height = image.height,
        width = image.width,
        "decompressed"
    );
    Ok((output, image.size()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output() {
        assert_eq!(
            default_output(Path::new("a/photo.png"), MCQ_EXTENSION),
            PathBuf::from("a/photo.mcq")
        );
        assert_eq!(default_output(Path::new("b.mcq"), "png"), PathBuf::from("b.png"));
    }

    #[test]
    fn test_missing_checkpoint() {
        assert!(matches!(
            load_model(Some(Path::new("/nonexistent/best.ckpt"))),
            Err(TrainError::Checkpoint(_))
        ));
        assert_eq!(load_model(None).unwrap().levels(), 3);
    }
}
