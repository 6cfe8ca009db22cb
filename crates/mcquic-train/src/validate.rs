//! Held-out evaluation by full compress/decompress.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use mcquic_core::{bits_per_pixel, QualityLevel};
use mcquic_neural::metrics::{ms_ssim, mse};
use mcquic_neural::{save_image, CompressorModel};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::Checkpoint;
use crate::dataset::{Dataset, ImageFolder};
use crate::error::{Result, TrainError};

/// Metrics of one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageReport {
    /// Image name
    pub name: String,
    /// Height in pixels
    pub height: usize,
    /// Width in pixels
    pub width: usize,
    /// Container size in bytes
    pub bytes: usize,
    /// Bits per pixel
    pub bpp: f64,
    /// Mean squared error
    pub mse: f64,
    /// PSNR in dB
    pub psnr: f64,
    /// MS-SSIM
    pub ms_ssim: f64,
}

/// Mean metrics over a dataset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Images evaluated
    pub images: usize,
    /// Levels coded
    pub quality: u8,
    /// Mean bits per pixel
    pub bpp: f64,
    /// Mean squared error
    pub mse: f64,
    /// Mean PSNR in dB
    pub psnr: f64,
    /// Mean MS-SSIM
    pub ms_ssim: f64,
    /// Proportion of codewords with non-zero frequency
    pub code_usage: f64,
    /// Per-image metrics
    pub per_image: Vec<ImageReport>,
}

impl ValidationReport {
    /// Write as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

/// Compress and decompress up to `limit` images (`0` for all).
///
/// Reconstructions are written as PNG into `reconstructions` when given.
pub fn evaluate(
    model: &CompressorModel,
    dataset: &dyn Dataset,
    quality: QualityLevel,
    limit: usize,
    reconstructions: Option<&Path>,
) -> Result<ValidationReport> {
    let count = if limit == 0 {
        dataset.len()
    } else {
        limit.min(dataset.len())
    };
    if count == 0 {
        return Err(TrainError::Data("no images to evaluate".into()));
    }
    if let Some(dir) = reconstructions {
        fs::create_dir_all(dir)?;
    }

    let mut per_image = Vec::with_capacity(count);
    for index in 0..count {
        let name = dataset.name(index);
        let image = dataset.load(index)?;
        let file = model.encode(&image, quality)?;
        let bytes = file.size();
        let decoded = model.decode(&file)?;

        let err = mse(&image, &decoded)?;
        let report = ImageReport {
            height: image.height,
            width: image.width,
            bytes,
            bpp: bits_per_pixel(bytes, image.size()),
            mse: err,
            psnr: mcquic_core::psnr(err),
            ms_ssim: ms_ssim(&image, &decoded)?,
            name,
        };
        debug!(image = %report.name, bpp = report.bpp, psnr = report.psnr, "evaluated");

        if let Some(dir) = reconstructions {
            save_image(&dir.join(format!("{}.png", report.name)), &decoded)?;
        }
        per_image.push(report);
    }

    let n = per_image.len() as f64;
    let mean = |f: fn(&ImageReport) -> f64| per_image.iter().map(f).sum::<f64>() / n;
    Ok(ValidationReport {
        images: per_image.len(),
        quality: quality.get(),
        bpp: mean(|r| r.bpp),
        mse: mean(|r| r.mse),
        psnr: mean(|r| r.psnr),
        ms_ssim: mean(|r| r.ms_ssim),
        code_usage: model.code_usage(),
        per_image,
    })
}

/// Evaluate a checkpoint on a folder of images.
///
/// Writes `<output>/<name>.png` reconstructions and `<output>/report.json`.
pub fn validate_checkpoint(
    checkpoint: &Path,
    images: &Path,
    output: &Path,
    quality: Option<u8>,
) -> Result<ValidationReport> {
    let ckpt = Checkpoint::load(checkpoint)?;
    let model = ckpt.model;
    let quality = match quality {
        Some(q) => QualityLevel::new(q, model.levels())?,
        None => QualityLevel::full(model.levels()),
    };
    let dataset = ImageFolder::open(images)?;
    let report = evaluate(&model, &dataset, quality, 0, Some(output))?;
    report.write_json(&output.join("report.json"))?;
    info!(
        images = report.images,
        bpp = report.bpp,
        psnr = report.psnr,
        ms_ssim = report.ms_ssim,
        "validation finished"
    );
    Ok(report)
}
