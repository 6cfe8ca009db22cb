//! Training orchestration.
//!
//! ```text
//!  Initializing ──▶ TrainingStep ◀──▶ CodebookReassigning
//!                     ▲    │  ▲
//!                     │    ▼  │
//!                 Validating ─▶ Checkpointing ──▶ Terminated
//! ```
//!
//! One step: workers run forward/backward on their shards, the all-reduce
//! averages gradients, the loss is checked for divergence, then under the
//! model's write lock the gradients are clipped, the optimizer steps and
//! code frequencies are observed. The scheduler steps last.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mcquic_core::QualityLevel;
use mcquic_neural::{CodebookInit, CompressorModel, KMeansConfig, LossBreakdown};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CHECKPOINT_EXTENSION};
use crate::config::Config;
use crate::dataset::{Dataset, ImageFolder};
use crate::distributed::WorkerPool;
use crate::error::{Result, TrainError};
use crate::loss::RateDistortionLoss;
use crate::optimizer::{clip_gradients, Optimizer, ParameterOptimizer};
use crate::prefetch::{Batch, Cursor, PrefetchConfig, Prefetcher};
use crate::registry::Registries;
use crate::scheduler::LearningRateScheduler;
use crate::validate::evaluate;

/// Transitions kept for inspection.
const HISTORY_LIMIT: usize = 1024;

/// Where the trainer is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainerState {
    /// Built, not yet training
    Initializing,
    /// Running optimizer steps
    TrainingStep,
    /// Evaluating the held-out set
    Validating,
    /// Writing a checkpoint
    Checkpointing,
    /// Replacing dead codewords
    CodebookReassigning,
    /// Finished, interrupted or failed
    Terminated,
}

impl TrainerState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: TrainerState) -> bool {
        use TrainerState::*;
        if self == next {
            return self != Terminated;
        }
        match self {
            Initializing => matches!(next, TrainingStep | Checkpointing | Terminated),
            TrainingStep => next != Initializing,
            CodebookReassigning => matches!(next, TrainingStep | Validating | Checkpointing | Terminated),
            Validating => matches!(next, TrainingStep | Checkpointing | Terminated),
            Checkpointing => matches!(next, TrainingStep | Terminated),
            Terminated => false,
        }
    }
}

/// Mutable state of a run; everything a resumed run needs besides the
/// model, optimizer and scheduler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Completed optimizer steps
    pub step: u64,
    /// Epoch of the next batch
    pub epoch: usize,
    /// Index of the next batch within its epoch
    pub batch: usize,
    /// Base seed
    pub seed: u64,
    /// Best validation distortion so far
    pub best_distortion: Option<f64>,
    /// Rate at the best validation distortion
    pub best_rate: Option<f64>,
}

/// Training statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingStats {
    /// Steps run by this trainer
    pub total_steps: u64,
    /// Images processed
    pub total_samples: usize,
    /// Current epoch
    pub epoch: usize,
    /// Exponential moving average of the loss
    pub running_loss: f64,
    /// Best loss seen
    pub best_loss: f64,
    /// Steps since the loss improved
    pub steps_without_improvement: u64,
    /// Training time (seconds)
    pub training_time_secs: f64,
    /// Images per second
    pub samples_per_sec: f64,
    /// Current learning rate
    pub current_lr: f32,
    /// Terms of the last step
    pub last_terms: LossBreakdown,
    /// Gradient norm of the last step, before clipping
    pub grad_norm: f32,
    /// Proportion of codewords replaced by the last reassignment
    pub reassigned: f64,
}

impl Default for TrainingStats {
    fn default() -> Self {
        Self {
            total_steps: 0,
            total_samples: 0,
            epoch: 0,
            running_loss: 0.0,
            best_loss: f64::INFINITY,
            steps_without_improvement: 0,
            training_time_secs: 0.0,
            samples_per_sec: 0.0,
            current_lr: 0.0,
            last_terms: LossBreakdown::default(),
            grad_norm: 0.0,
            reassigned: 0.0,
        }
    }
}

impl TrainingStats {
    /// Update with new loss
    pub fn update(&mut self, loss: f64, lr: f32, samples: usize) {
        self.total_steps += 1;
        self.total_samples += samples;
        self.current_lr = lr;

        if self.total_steps == 1 {
            self.running_loss = loss;
        } else {
            self.running_loss = 0.99 * self.running_loss + 0.01 * loss;
        }

        if loss < self.best_loss {
            self.best_loss = loss;
            self.steps_without_improvement = 0;
        } else {
            self.steps_without_improvement += 1;
        }
    }
}

/// Outcome of [`Trainer::train`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSummary {
    /// Completed steps, including resumed ones
    pub steps: u64,
    /// Epoch reached
    pub epoch: usize,
    /// Running loss at the end
    pub final_loss: f64,
    /// Best validation distortion
    pub best_distortion: Option<f64>,
    /// Rate at the best validation distortion
    pub best_rate: Option<f64>,
    /// Stopped by a shutdown request
    pub interrupted: bool,
    /// Latest checkpoint
    pub latest: PathBuf,
}

/// Drives training of one model
pub struct Trainer {
    config: Config,
    model: Arc<RwLock<CompressorModel>>,
    optimizer: Optimizer,
    scheduler: LearningRateScheduler,
    loss: RateDistortionLoss,
    run: RunState,
    state: TrainerState,
    history: VecDeque<TrainerState>,
    stats: TrainingStats,
    shutdown: Arc<AtomicBool>,
    train_set: Arc<dyn Dataset>,
    val_set: Option<Arc<dyn Dataset>>,
}

impl fmt::Debug for Trainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trainer")
            .field("state", &self.state)
            .field("run", &self.run)
            .field("optimizer", &self.optimizer.name())
            .field("lr", &self.scheduler.get_lr())
            .field("train_images", &self.train_set.len())
            .field("val_images", &self.val_set.as_ref().map(|v| v.len()))
            .finish()
    }
}

impl Trainer {
    /// Build every component named by `config`.
    pub fn new(
        config: Config,
        registries: &Registries,
        train_set: Arc<dyn Dataset>,
        val_set: Option<Arc<dyn Dataset>>,
    ) -> Result<Self> {
        config.validate()?;
        let model = registries.model(&config.model.key, &config.model.params)?;
        let optimizer = registries.optimizer(&config.train.optim)?;
        let scheduler = registries.scheduler(
            &config.train.schdr,
            optimizer.base_lr(),
            config.train.total_steps,
        )?;
        let loss = RateDistortionLoss::from(config.train.loss.clone());
        let run = RunState {
            seed: config.train.seed,
            ..Default::default()
        };

        let mut history = VecDeque::new();
        history.push_back(TrainerState::Initializing);
        Ok(Self {
            config,
            model: Arc::new(RwLock::new(model)),
            optimizer,
            scheduler,
            loss,
            run,
            state: TrainerState::Initializing,
            history,
            stats: TrainingStats::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            train_set,
            val_set,
        })
    }

    /// Build with the image folders named in the config.
    pub fn from_config(config: Config, registries: &Registries) -> Result<Self> {
        let train: Arc<dyn Dataset> = Arc::new(ImageFolder::open(&config.train.dataset.train)?);
        let val = match &config.train.dataset.val {
            Some(dir) => Some(Arc::new(ImageFolder::open(dir)?) as Arc<dyn Dataset>),
            None => None,
        };
        Self::new(config, registries, train, val)
    }

    /// Continue from a checkpoint.
    ///
    /// Model, optimizer and run state come from the checkpoint; the
    /// learning rate schedule comes from the current config, advanced to the
    /// checkpoint's step.
    pub fn resume(&mut self, checkpoint: Checkpoint) -> Result<()> {
        if self.state != TrainerState::Initializing {
            return Err(TrainError::Checkpoint(
                "can only resume before training starts".into(),
            ));
        }
        if checkpoint.model.config() != &self.config.model.params {
            return Err(TrainError::Checkpoint(
                "checkpoint model does not match the configured architecture".into(),
            ));
        }
        if std::mem::discriminant(&checkpoint.optimizer) != std::mem::discriminant(&self.optimizer) {
            return Err(TrainError::Checkpoint(format!(
                "checkpoint optimizer {} does not match configured {}",
                checkpoint.optimizer.name(),
                self.optimizer.name()
            )));
        }
        *self.model.write() = checkpoint.model;
        self.optimizer = checkpoint.optimizer;
        self.scheduler.seek(checkpoint.scheduler.current_step());
        self.run = checkpoint.run;
        info!(step = self.run.step, epoch = self.run.epoch, "resumed from checkpoint");
        Ok(())
    }

    /// Flag that stops training between steps.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Current state.
    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// Recent transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = TrainerState> + '_ {
        self.history.iter().copied()
    }

    /// Run state.
    pub fn run_state(&self) -> &RunState {
        &self.run
    }

    /// Statistics of this trainer's steps.
    pub fn stats(&self) -> &TrainingStats {
        &self.stats
    }

    /// Shared model.
    pub fn model(&self) -> Arc<RwLock<CompressorModel>> {
        Arc::clone(&self.model)
    }

    /// Configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Path of the rolling checkpoint.
    pub fn latest_path(&self) -> PathBuf {
        self.config
            .train
            .output_dir
            .join("latest")
            .with_extension(CHECKPOINT_EXTENSION)
    }

    /// Path of the best-validation checkpoint.
    pub fn best_path(&self) -> PathBuf {
        self.config
            .train
            .output_dir
            .join("best")
            .with_extension(CHECKPOINT_EXTENSION)
    }

    /// Snapshot of everything needed to resume.
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        Ok(Checkpoint {
            config_yaml: self.config.to_yaml()?,
            model: self.model.read().clone(),
            optimizer: self.optimizer.clone(),
            scheduler: self.scheduler.clone(),
            run: self.run.clone(),
        })
    }

    fn transition(&mut self, next: TrainerState) {
        if self.state == next {
            return;
        }
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(from = ?self.state, to = ?next, "trainer state");
        self.state = next;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(next);
    }

    /// Train until `total_steps`, the last epoch, or a shutdown request.
    ///
    /// The latest checkpoint is written on the way out unless a step failed.
    pub fn train(&mut self) -> Result<TrainSummary> {
        if self.state != TrainerState::Initializing {
            return Err(TrainError::config("trainer has already run"));
        }
        match self.train_inner() {
            Ok(interrupted) => {
                self.transition(TrainerState::Checkpointing);
                let latest = self.save_latest()?;
                self.transition(TrainerState::Terminated);
                let summary = TrainSummary {
                    steps: self.run.step,
                    epoch: self.run.epoch,
                    final_loss: self.stats.running_loss,
                    best_distortion: self.run.best_distortion,
                    best_rate: self.run.best_rate,
                    interrupted,
                    latest,
                };
                info!(
                    steps = summary.steps,
                    best_distortion = ?summary.best_distortion,
                    best_rate = ?summary.best_rate,
                    interrupted,
                    "training finished"
                );
                Ok(summary)
            }
            Err(e) => {
                warn!("training stopped: {}", e);
                self.transition(TrainerState::Terminated);
                Err(e)
            }
        }
    }

    /// Returns whether training was interrupted.
    fn train_inner(&mut self) -> Result<bool> {
        let t = self.config.train.clone();
        fs::create_dir_all(&t.output_dir)?;
        info!(
            model = %self.config.model.key,
            optimizer = self.optimizer.name(),
            train_images = self.train_set.len(),
            workers = t.workers,
            batch_size = t.batch_size,
            total_steps = t.total_steps,
            start_step = self.run.step,
            "training started"
        );

        let pool = WorkerPool::spawn(
            t.workers,
            Arc::clone(&self.model),
            Duration::from_millis(t.barrier_timeout_ms),
        )?;
        let start = Cursor {
            epoch: self.run.epoch,
            batch: self.run.batch,
        };
        let mut batches = Prefetcher::spawn(
            Arc::clone(&self.train_set),
            PrefetchConfig::from_train(&t),
            start,
        )?;
        let batches_per_epoch = batches.batches_per_epoch();

        let mut pending: Option<Batch> = None;
        if self.config.model.params.init == CodebookInit::KMeans && self.run.step == 0 {
            if let Some(first) = batches.next() {
                let first = first?;
                let kmeans = KMeansConfig {
                    seed: self.run.seed,
                    ..Default::default()
                };
                self.model.write().warm_start(&first.images, &kmeans)?;
                info!(images = first.images.len(), "codebooks warm-started with k-means");
                pending = Some(first);
            }
        }

        let started = Instant::now();
        while self.run.step < t.total_steps {
            if self.shutdown.load(Ordering::SeqCst) {
                info!(step = self.run.step, "shutdown requested");
                return Ok(true);
            }
            let batch = match pending.take() {
                Some(batch) => batch,
                None => match batches.next() {
                    Some(batch) => batch?,
                    None => break,
                },
            };
            self.transition(TrainerState::TrainingStep);
            self.train_step(&pool, batch, batches_per_epoch)?;

            let elapsed = started.elapsed().as_secs_f64();
            self.stats.training_time_secs = elapsed;
            if elapsed > 0.0 {
                self.stats.samples_per_sec = self.stats.total_samples as f64 / elapsed;
            }
            self.run_hooks()?;
        }
        Ok(false)
    }

    fn train_step(&mut self, pool: &WorkerPool, batch: Batch, batches_per_epoch: usize) -> Result<()> {
        let (epoch, index) = (batch.epoch, batch.index);
        let reduced = pool.step(batch.images, self.loss.straight_through())?;
        let total = self.loss.checked_total(self.run.step, &reduced.terms)?;
        let lr = self.scheduler.get_lr();

        let mut gradients = reduced.gradients.clone();
        let grad_norm = match self.config.train.gradient_clip {
            Some(max_norm) => clip_gradients(&mut gradients, max_norm),
            None => clip_gradients(&mut gradients, f32::INFINITY),
        };
        {
            let mut model = self.model.write();
            self.optimizer.step(model.parameters_mut(), &gradients, lr)?;
            model.observe_codes(&reduced.counts)?;
        }
        self.scheduler.step();

        self.run.step += 1;
        self.run.epoch = epoch;
        self.run.batch = index + 1;
        if self.run.batch >= batches_per_epoch {
            self.run.epoch += 1;
            self.run.batch = 0;
        }

        self.stats.update(total, lr, reduced.images);
        self.stats.epoch = epoch;
        self.stats.last_terms = reduced.terms;
        self.stats.grad_norm = grad_norm;

        if self.run.step % self.config.train.log_interval == 0 {
            info!(
                step = self.run.step,
                epoch,
                loss = total,
                running_loss = self.stats.running_loss,
                distortion = reduced.terms.distortion,
                rate = reduced.terms.rate,
                lr,
                grad_norm,
                "training"
            );
        }
        Ok(())
    }

    /// Hooks due after the step just completed.
    fn run_hooks(&mut self) -> Result<()> {
        let step = self.run.step;
        let t = &self.config.train;
        let reassign_due = step % t.hooks.codebook_reassign_freq == 0;
        let validate_due = step % t.val_freq == 0 && self.val_set.is_some();
        let save_due = step % t.save_freq == 0;

        if reassign_due {
            self.transition(TrainerState::CodebookReassigning);
            let mut rng = StdRng::seed_from_u64(self.run.seed ^ step.wrapping_mul(0x2545_F491_4F6C_DD1D));
            let proportion = self.model.write().reassign_codebooks(&mut rng)?;
            self.stats.reassigned = proportion;
            debug!(step, "reassigned {:.2}% of codewords", proportion * 100.0);
        }

        let mut saved = false;
        if validate_due {
            saved = self.validate_and_save()?;
        }
        if save_due && !saved {
            self.transition(TrainerState::Checkpointing);
            self.save_latest()?;
        }
        Ok(())
    }

    /// Validate, save the latest checkpoint and promote it when it is the
    /// best so far.
    fn validate_and_save(&mut self) -> Result<bool> {
        let Some(val) = self.val_set.clone() else {
            return Ok(false);
        };
        self.transition(TrainerState::Validating);
        let report = {
            let model = self.model.read();
            let quality = QualityLevel::full(model.levels());
            evaluate(&model, val.as_ref(), quality, self.config.train.val_images, None)?
        };
        info!(
            step = self.run.step,
            bpp = report.bpp,
            psnr = report.psnr,
            ms_ssim = report.ms_ssim,
            code_usage = report.code_usage,
            "validation"
        );

        let improved = self.run.best_distortion.map_or(true, |best| report.mse < best);
        if improved {
            self.run.best_distortion = Some(report.mse);
            self.run.best_rate = Some(report.bpp);
        }

        self.transition(TrainerState::Checkpointing);
        let latest = self.save_latest()?;
        if improved {
            let best = self.best_path();
            let temp = best.with_extension("tmp");
            fs::copy(&latest, &temp)?;
            fs::rename(&temp, &best)?;
            info!(step = self.run.step, distortion = report.mse, "new best checkpoint");
        }
        Ok(true)
    }

    fn save_latest(&self) -> Result<PathBuf> {
        let path = self.latest_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        self.checkpoint()?.save(&path)?;
        debug!(step = self.run.step, path = %path.display(), "checkpoint saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::InMemory;
    use mcquic_core::ImageTensor;

    fn images(n: usize, side: usize, channel: usize) -> Vec<ImageTensor> {
        (0..n)
            .map(|i| {
                let data = (0..side * side * channel)
                    .map(|j| ((i * 13 + j * 5) % 64) as f32 / 64.0)
                    .collect();
                ImageTensor::from_vec(side, side, channel, data).unwrap()
            })
            .collect()
    }

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.model.params.k = vec![27, 8];
        let t = &mut config.train;
        t.total_steps = 6;
        t.batch_size = 2;
        t.crop_size = 8;
        t.val_freq = 3;
        t.save_freq = 4;
        t.log_interval = 2;
        t.val_images = 2;
        t.hooks.codebook_reassign_freq = 2;
        t.output_dir = dir.to_path_buf();
        config
    }

    fn trainer(config: Config, channel: usize) -> Trainer {
        let train: Arc<dyn Dataset> = Arc::new(InMemory::new(images(6, 12, channel)));
        let val: Arc<dyn Dataset> = Arc::new(InMemory::new(images(2, 16, 3)));
        Trainer::new(config, &Registries::builtin(), train, Some(val)).unwrap()
    }

    #[test]
    fn test_transition_table() {
        use TrainerState::*;
        assert!(Initializing.can_transition_to(TrainingStep));
        assert!(TrainingStep.can_transition_to(CodebookReassigning));
        assert!(CodebookReassigning.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Checkpointing));
        assert!(Checkpointing.can_transition_to(TrainingStep));
        assert!(!Terminated.can_transition_to(TrainingStep));
        assert!(!Terminated.can_transition_to(Terminated));
        assert!(!Checkpointing.can_transition_to(Validating));
        assert!(!TrainingStep.can_transition_to(Initializing));
    }

    #[test]
    fn test_train_runs_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = trainer(config(dir.path()), 3);
        let summary = trainer.train().unwrap();

        assert_eq!(summary.steps, 6);
        assert!(!summary.interrupted);
        assert!(summary.best_distortion.is_some());
        assert_eq!(trainer.state(), TrainerState::Terminated);
        // 6 images, batch 2: 3 batches per epoch
        assert_eq!(trainer.run_state().epoch, 2);
        assert_eq!(trainer.run_state().batch, 0);

        let history: Vec<_> = trainer.history().collect();
        for state in [
            TrainerState::Initializing,
            TrainerState::TrainingStep,
            TrainerState::CodebookReassigning,
            TrainerState::Validating,
            TrainerState::Checkpointing,
            TrainerState::Terminated,
        ] {
            assert!(history.contains(&state), "{:?} missing", state);
        }
        assert!(trainer.latest_path().exists());
        assert!(trainer.best_path().exists());

        let ckpt = Checkpoint::load(&trainer.latest_path()).unwrap();
        assert_eq!(ckpt.run.step, 6);
        assert_eq!(ckpt.scheduler.current_step(), 6);
        assert!(trainer.train().is_err());
    }

    #[test]
    fn test_shutdown_before_first_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = trainer(config(dir.path()), 3);
        trainer.shutdown_handle().store(true, Ordering::SeqCst);
        let summary = trainer.train().unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.steps, 0);
        assert_eq!(trainer.state(), TrainerState::Terminated);
        assert!(summary.latest.exists());
    }

    #[test]
    fn test_divergence_writes_no_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut poisoned = images(4, 12, 3);
        for image in &mut poisoned {
            image.data[0] = f32::NAN;
        }
        let train: Arc<dyn Dataset> = Arc::new(InMemory::new(poisoned));
        let mut config = config(dir.path());
        config.train.crop_size = 12;
        let mut trainer = Trainer::new(config, &Registries::builtin(), train, None).unwrap();
        match trainer.train() {
            Err(TrainError::TrainingDivergence { step, .. }) => assert_eq!(step, 0),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(trainer.state(), TrainerState::Terminated);
        assert!(!trainer.latest_path().exists());
    }

    #[test]
    fn test_worker_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.train.workers = 2;
        // Grayscale input is rejected by the model inside the workers
        let mut trainer = trainer(config, 1);
        assert!(matches!(
            trainer.train(),
            Err(TrainError::WorkerFailure { .. })
        ));
        assert_eq!(trainer.state(), TrainerState::Terminated);
    }

    #[test]
    fn test_resume_checks_architecture() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = trainer(config(dir.path()), 3);
        let ckpt = first.checkpoint().unwrap();

        let mut other = config(dir.path());
        other.model.params.k = vec![27, 4];
        let mut second = trainer(other, 3);
        assert!(matches!(
            second.resume(ckpt.clone()),
            Err(TrainError::Checkpoint(_))
        ));
        first.resume(ckpt).unwrap();
    }
}
