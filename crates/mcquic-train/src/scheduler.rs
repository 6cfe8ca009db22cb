//! Learning rate scheduling

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Peak learning rate
    pub initial_lr: f32,
    /// Final learning rate
    pub final_lr: f32,
    /// Warmup steps
    pub warmup_steps: u64,
    /// Total training steps
    pub total_steps: u64,
    /// Scheduler type
    pub scheduler_type: SchedulerType,
}

/// Scheduler type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerType {
    /// Constant learning rate
    Constant,
    /// Linear decay
    Linear,
    /// Cosine annealing
    Cosine,
    /// Exponential decay
    Exponential,
    /// Step decay
    Step,
    /// Warmup + cosine
    WarmupCosine,
    /// One cycle
    OneCycle,
}

impl SchedulerType {
    /// Registry names, one per variant.
    pub const NAMES: [&'static str; 7] = [
        "Constant",
        "Linear",
        "Cosine",
        "WarmupCosine",
        "Exponential",
        "Step",
        "OneCycle",
    ];
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            initial_lr: 1e-3,
            final_lr: 1e-5,
            warmup_steps: 0,
            total_steps: 100_000,
            scheduler_type: SchedulerType::WarmupCosine,
        }
    }
}

impl SchedulerConfig {
    /// Reject rates and step counts that make no sense.
    pub fn validate(&self) -> Result<()> {
        if !(self.initial_lr.is_finite() && self.initial_lr > 0.0) {
            return Err(TrainError::config(format!(
                "initial_lr must be positive, got {}",
                self.initial_lr
            )));
        }
        if !(self.final_lr.is_finite() && self.final_lr >= 0.0) {
            return Err(TrainError::config(format!(
                "final_lr must be non-negative, got {}",
                self.final_lr
            )));
        }
        if self.warmup_steps > self.total_steps {
            return Err(TrainError::config(format!(
                "warmup_steps {} exceeds total_steps {}",
                self.warmup_steps, self.total_steps
            )));
        }
        Ok(())
    }
}

/// Learning rate scheduler
///
/// Only the step counter is state; the rate is recomputed from it, so a
/// restored scheduler continues exactly where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRateScheduler {
    config: SchedulerConfig,
    current_step: u64,
    current_lr: f32,
}

impl LearningRateScheduler {
    /// Create new scheduler
    pub fn new(config: SchedulerConfig) -> Self {
        let current_lr = compute_lr(&config, 0);
        Self {
            config,
            current_step: 0,
            current_lr,
        }
    }

    /// Step the scheduler
    pub fn step(&mut self) -> f32 {
        self.current_step += 1;
        self.current_lr = compute_lr(&self.config, self.current_step);
        self.current_lr
    }

    /// Get current learning rate
    pub fn get_lr(&self) -> f32 {
        self.current_lr
    }

    /// Get current step
    pub fn current_step(&self) -> u64 {
        self.current_step
    }

    /// Configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Jump to `step`, as if `step()` had been called that many times.
    pub fn seek(&mut self, step: u64) {
        self.current_step = step;
        self.current_lr = compute_lr(&self.config, step);
    }

    /// Reset scheduler
    pub fn reset(&mut self) {
        self.current_step = 0;
        self.current_lr = compute_lr(&self.config, 0);
    }

    /// Check if training is complete
    pub fn is_complete(&self) -> bool {
        self.current_step >= self.config.total_steps
    }
}

/// Learning rate for a given step
fn compute_lr(config: &SchedulerConfig, step: u64) -> f32 {
    if step < config.warmup_steps {
        let warmup_progress = step as f32 / config.warmup_steps as f32;
        return config.final_lr + (config.initial_lr - config.final_lr) * warmup_progress;
    }

    let post_warmup_step = step - config.warmup_steps;
    let post_warmup_total = config.total_steps.saturating_sub(config.warmup_steps);

    if post_warmup_total == 0 {
        return config.initial_lr;
    }

    let progress = (post_warmup_step as f32 / post_warmup_total as f32).min(1.0);

    match config.scheduler_type {
        SchedulerType::Constant => config.initial_lr,
        SchedulerType::Linear => config.initial_lr + (config.final_lr - config.initial_lr) * progress,
        SchedulerType::Cosine | SchedulerType::WarmupCosine => {
            let cosine_decay = 0.5 * (1.0 + (std::f32::consts::PI * progress).cos());
            config.final_lr + (config.initial_lr - config.final_lr) * cosine_decay
        }
        SchedulerType::Exponential => {
            let floor = config.final_lr.max(config.initial_lr * 1e-6);
            let decay_rate = (floor / config.initial_lr).ln();
            config.initial_lr * (decay_rate * progress).exp()
        }
        SchedulerType::Step => {
            // Decay by 0.1 every 30% of training
            let num_decays = (progress / 0.3) as i32;
            config.initial_lr * 0.1f32.powi(num_decays)
        }
        SchedulerType::OneCycle => {
            let peak = config.initial_lr * 10.0;
            if progress < 0.4 {
                let phase_progress = progress / 0.4;
                config.initial_lr + (peak - config.initial_lr) * phase_progress
            } else {
                let phase_progress = (progress - 0.4) / 0.6;
                peak + (config.final_lr - peak) * phase_progress
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(scheduler_type: SchedulerType) -> SchedulerConfig {
        SchedulerConfig {
            initial_lr: 0.001,
            final_lr: 0.0,
            warmup_steps: 0,
            total_steps: 1000,
            scheduler_type,
        }
    }

    #[test]
    fn test_constant_scheduler() {
        let mut scheduler = LearningRateScheduler::new(config(SchedulerType::Constant));
        for _ in 0..100 {
            assert_eq!(scheduler.step(), 0.001);
        }
    }

    #[test]
    fn test_warmup() {
        let mut scheduler = LearningRateScheduler::new(SchedulerConfig {
            warmup_steps: 10,
            final_lr: 0.0,
            ..Default::default()
        });
        assert_eq!(scheduler.get_lr(), 0.0);
        let mut prev = 0.0;
        for _ in 0..9 {
            let lr = scheduler.step();
            assert!(lr > prev);
            prev = lr;
        }
        assert!((scheduler.step() - 1e-3).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_decay() {
        let mut scheduler = LearningRateScheduler::new(config(SchedulerType::Cosine));
        for _ in 0..500 {
            scheduler.step();
        }
        assert!((scheduler.get_lr() - 0.0005).abs() < 1e-6);
        for _ in 0..500 {
            scheduler.step();
        }
        assert!(scheduler.get_lr().abs() < 1e-9);
        assert!(scheduler.is_complete());
    }

    #[test]
    fn test_step_and_exponential() {
        let mut step = LearningRateScheduler::new(config(SchedulerType::Step));
        for _ in 0..350 {
            step.step();
        }
        assert!((step.get_lr() - 0.0001).abs() < 1e-9);

        let mut exp = LearningRateScheduler::new(config(SchedulerType::Exponential));
        let mut prev = exp.get_lr();
        for _ in 0..1000 {
            let lr = exp.step();
            assert!(lr.is_finite() && lr <= prev);
            prev = lr;
        }
    }

    #[test]
    fn test_one_cycle_peaks() {
        let mut scheduler = LearningRateScheduler::new(config(SchedulerType::OneCycle));
        let lrs: Vec<f32> = (0..1000).map(|_| scheduler.step()).collect();
        let peak = lrs.iter().copied().fold(0.0, f32::max);
        assert!((peak - 0.01).abs() < 1e-4);
    }

    #[test]
    fn test_restore_continues() {
        let mut a = LearningRateScheduler::new(config(SchedulerType::Linear));
        for _ in 0..123 {
            a.step();
        }
        let mut b: LearningRateScheduler = bincode::deserialize(&bincode::serialize(&a).unwrap()).unwrap();
        assert_eq!(a.step(), b.step());

        let mut c = LearningRateScheduler::new(config(SchedulerType::Linear));
        c.seek(124);
        assert_eq!(c, a);
        b.reset();
        assert_eq!(b.current_step(), 0);
    }

    #[test]
    fn test_validate() {
        assert!(SchedulerConfig::default().validate().is_ok());
        let bad = SchedulerConfig {
            initial_lr: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = SchedulerConfig {
            warmup_steps: 10,
            total_steps: 5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
