//! File-level compress and decompress through the facade.
//!
//! Run with: cargo test -p mcquic --test cli

use std::path::Path;

use mcquic::commands::{compress_file, decompress_file, load_model};
use mcquic::neural::metrics::psnr_between;
use mcquic::train::{
    Adam, AdamParams, Checkpoint, Config, LearningRateScheduler, Optimizer, RunState,
    SchedulerConfig,
};
use mcquic::{load_image, save_image, CompressorModel, Error, ImageTensor, ModelConfig, TrainError};

fn gradient(h: usize, w: usize) -> ImageTensor {
    let mut data = Vec::with_capacity(h * w * 3);
    for y in 0..h {
        for x in 0..w {
            let fx = x as f32 / w as f32;
            let fy = y as f32 / h as f32;
            data.extend_from_slice(&[fx, fy, 0.5 * (fx + fy)]);
        }
    }
    ImageTensor::from_vec(h, w, 3, data).unwrap()
}

fn small_model() -> CompressorModel {
    CompressorModel::new(ModelConfig {
        k: vec![27, 8],
        ..Default::default()
    })
    .unwrap()
}

fn write_checkpoint(path: &Path, model: CompressorModel) {
    Checkpoint {
        config_yaml: Config::default().to_yaml().unwrap(),
        model,
        optimizer: Optimizer::Adam(Adam::new(AdamParams::default())),
        scheduler: LearningRateScheduler::new(SchedulerConfig::default()),
        run: RunState::default(),
    }
    .save(path)
    .unwrap();
}

#[test]
fn test_compress_decompress_files() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("photo.png");
    save_image(&input, &gradient(24, 40)).unwrap();

    let model = load_model(None).unwrap();
    let report = compress_file(&model, &input, None, None).unwrap();
    assert_eq!(report.output, dir.path().join("photo.mcq"));
    assert!(report.output.exists());
    assert_eq!(report.quality.get(), 3);
    assert_eq!(report.stats.coded_levels, 3);
    assert!(report.stats.bpp() > 0.0);

    let restored = dir.path().join("restored.png");
    let (written, size) = decompress_file(&model, &report.output, Some(&restored)).unwrap();
    assert_eq!(written, restored);
    assert_eq!((size.height, size.width), (24, 40));

    let original = load_image(&input).unwrap();
    let decoded = load_image(&restored).unwrap();
    assert!(psnr_between(&original, &decoded).unwrap() > 15.0);
}

#[test]
fn test_lower_quality_is_smaller() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("photo.png");
    save_image(&input, &gradient(32, 32)).unwrap();
    let model = load_model(None).unwrap();

    let coarse = compress_file(&model, &input, Some(&dir.path().join("q1.mcq")), Some(1)).unwrap();
    let full = compress_file(&model, &input, Some(&dir.path().join("q3.mcq")), Some(3)).unwrap();
    assert!(coarse.stats.compressed_size < full.stats.compressed_size);

    let (_, size) = decompress_file(&model, &coarse.output, None).unwrap();
    assert_eq!((size.height, size.width), (32, 32));
    assert!(dir.path().join("q1.png").exists());
}

#[test]
fn test_invalid_quality() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("photo.png");
    save_image(&input, &gradient(16, 16)).unwrap();
    let model = load_model(None).unwrap();

    let err = compress_file(&model, &input, None, Some(4)).unwrap_err();
    assert!(err.is_config(), "{}", err);
    let err = compress_file(&model, &input, None, Some(0)).unwrap_err();
    assert!(err.is_config(), "{}", err);
    assert!(!dir.path().join("photo.mcq").exists());
}

#[test]
fn test_model_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = dir.path().join("best.ckpt");
    write_checkpoint(&ckpt, small_model());

    let model = load_model(Some(&ckpt)).unwrap();
    assert_eq!(model.levels(), 2);
    assert_eq!(model.fingerprint(), small_model().fingerprint());

    let input = dir.path().join("photo.png");
    save_image(&input, &gradient(16, 16)).unwrap();
    let report = compress_file(&model, &input, None, None).unwrap();
    assert_eq!(report.quality.get(), 2);
}

#[test]
fn test_decoding_with_other_model_fails() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("photo.png");
    save_image(&input, &gradient(16, 16)).unwrap();

    let report = compress_file(&load_model(None).unwrap(), &input, None, None).unwrap();
    let err = decompress_file(&small_model(), &report.output, None).unwrap_err();
    assert!(
        matches!(err, TrainError::Codec(Error::FingerprintMismatch { .. })),
        "{}",
        err
    );
    // A cut-short file from another model still names the model mismatch
    let bytes = std::fs::read(&report.output).unwrap();
    std::fs::write(&report.output, &bytes[..bytes.len() - 5]).unwrap();
    let err = decompress_file(&small_model(), &report.output, None).unwrap_err();
    assert!(
        matches!(err, TrainError::Codec(Error::FingerprintMismatch { .. })),
        "{}",
        err
    );
}

#[test]
fn test_shipped_config_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/mcquic.yaml");
    let config = Config::load(&path).unwrap();
    assert_eq!(config.model.key, "McQuic");
    assert_eq!(config.model.params.k, vec![2048, 512, 128]);
    assert_eq!(config.train.optim.key, "Adam");
    assert_eq!(config.train.batch_size % config.train.workers, 0);
}
