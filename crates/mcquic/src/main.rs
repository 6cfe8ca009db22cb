//! McQuic command-line tool
//!
//! ```text
//! mcquic compress photo.png -o photo.mcq -m best.ckpt -q 2
//! mcquic decompress photo.mcq -o photo.png -m best.ckpt
//! mcquic train configs/mcquic.yaml [--resume saved/latest.ckpt]
//! mcquic validate best.ckpt images/ -o report/
//! ```

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use mcquic::commands::{compress_file, decompress_file, load_model};
use mcquic_train::{validate_checkpoint, Checkpoint, Config, Registries, Trainer};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "mcquic")]
#[command(version, about = "Learned image compression with multi-codebook quantization")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compress an image to .mcq
    Compress {
        /// Input image (png, jpeg, bmp)
        input: PathBuf,
        /// Output path, defaults to the input with a .mcq extension
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Checkpoint to take the model from
        #[arg(short, long)]
        model: Option<PathBuf>,
        /// Number of levels to transmit
        #[arg(short, long = "qp")]
        quality: Option<u8>,
    },
    /// Decompress a .mcq file to an image
    Decompress {
        /// Input .mcq file
        input: PathBuf,
        /// Output image, defaults to the input with a .png extension
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Checkpoint to take the model from
        #[arg(short, long)]
        model: Option<PathBuf>,
    },
    /// Train a model from a YAML config
    Train {
        /// Config file
        config: PathBuf,
        /// Continue from a checkpoint
        #[arg(short, long)]
        resume: Option<PathBuf>,
    },
    /// Evaluate a checkpoint on a folder of images
    Validate {
        /// Checkpoint to evaluate
        checkpoint: PathBuf,
        /// Image folder
        images: PathBuf,
        /// Directory for reconstructions and report.json
        #[arg(short, long, default_value = "validation")]
        output: PathBuf,
        /// Number of levels to transmit
        #[arg(short, long = "qp")]
        quality: Option<u8>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Compress {
            input,
            output,
            model,
            quality,
        } => {
            let model = load_model(model.as_deref())?;
            let report = compress_file(&model, &input, output.as_deref(), quality)?;
            println!(
                "{} -> {} ({} bytes, {:.4} bpp, {} of {} levels)",
                input.display(),
                report.output.display(),
                report.stats.compressed_size,
                report.stats.bpp(),
                report.quality.get(),
                model.levels()
            );
        }
        Command::Decompress {
            input,
            output,
            model,
        } => {
            let model = load_model(model.as_deref())?;
            let (output, size) = decompress_file(&model, &input, output.as_deref())?;
            println!(
                "{} -> {} ({}x{})",
                input.display(),
                output.display(),
                size.height,
                size.width
            );
        }
        Command::Train { config, resume } => {
            let config = Config::load(&config)?;
            info!(
                total_steps = config.train.total_steps,
                workers = config.train.workers,
                output_dir = %config.train.output_dir.display(),
                "starting training"
            );
            let mut trainer = Trainer::from_config(config, &Registries::builtin())?;
            if let Some(path) = resume {
                trainer.resume(Checkpoint::load(&path)?)?;
            }

            let shutdown = trainer.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping after the current step");
                    shutdown.store(true, Ordering::SeqCst);
                }
            });

            let summary = tokio::task::spawn_blocking(move || trainer.train()).await??;
            println!(
                "trained {} steps (epoch {}), loss {:.6}{}, latest checkpoint {}",
                summary.steps,
                summary.epoch,
                summary.final_loss,
                if summary.interrupted { " [interrupted]" } else { "" },
                summary.latest.display()
            );
        }
        Command::Validate {
            checkpoint,
            images,
            output,
            quality,
        } => {
            let output_dir = output.clone();
            let report = tokio::task::spawn_blocking(move || {
                validate_checkpoint(&checkpoint, &images, &output, quality)
            })
            .await??;
            println!(
                "{} images at {} levels: {:.4} bpp, {:.2} dB PSNR, {:.4} MS-SSIM, {:.1}% codes used ({})",
                report.images,
                report.quality,
                report.bpp,
                report.psnr,
                report.ms_ssim,
                report.code_usage * 100.0,
                output_dir.display()
            );
        }
    }

    Ok(())
}
