//! # McQuic Train
//!
//! Training for the McQuic compressor: YAML configuration, component
//! registries, optimizers and schedulers, background data loading,
//! data-parallel workers, checkpoints and validation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  bounded   ┌─────────────────────────────────────┐
//! │Prefetcher│──channel──▶│ Trainer (state machine, RunState)   │
//! └──────────┘            │   ├─ WorkerPool ── AllReduce        │
//!                         │   ├─ Optimizer + LR scheduler       │
//!                         │   └─ hooks: reassign / validate /   │
//!                         │            checkpoint               │
//!                         └─────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use mcquic_train::{Config, Registries, Trainer};
//!
//! let config = Config::load("configs/mcquic.yaml")?;
//! let mut trainer = Trainer::from_config(config, &Registries::builtin())?;
//! let summary = trainer.train()?;
//! println!("best distortion {:?}", summary.best_distortion);
//! ```

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod distributed;
pub mod error;
pub mod loss;
pub mod optimizer;
pub mod orchestrator;
pub mod prefetch;
pub mod registry;
pub mod scheduler;
pub mod validate;

pub use checkpoint::{Checkpoint, CHECKPOINT_EXTENSION, CHECKPOINT_MAGIC};
pub use config::{Component, Config, DatasetSection, HooksSection, LossSection, ModelSection, TrainSection};
pub use dataset::{Dataset, ImageFolder, InMemory};
pub use distributed::{AllReduce, Contribution, WorkerPool};
pub use error::{Result, TrainError};
pub use loss::RateDistortionLoss;
pub use optimizer::{clip_gradients, Adam, AdamParams, Optimizer, ParameterOptimizer, Sgd, SgdParams};
pub use orchestrator::{RunState, TrainSummary, Trainer, TrainerState, TrainingStats};
pub use prefetch::{Batch, Cursor, PrefetchConfig, Prefetcher};
pub use registry::{ModelFactory, OptimizerFactory, Registries, Registry, SchedulerFactory};
pub use scheduler::{LearningRateScheduler, SchedulerConfig, SchedulerType};
pub use validate::{evaluate, validate_checkpoint, ImageReport, ValidationReport};
