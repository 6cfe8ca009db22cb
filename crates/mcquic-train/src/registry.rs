//! Name → factory registries for models, optimizers and schedulers.
//!
//! Config files refer to components by key (`McQuic`, `Adam`,
//! `WarmupCosine`, ...). Lookups are case-sensitive; a miss lists what is
//! available.

use std::collections::BTreeMap;

use mcquic_neural::{CompressorModel, ModelConfig};

use crate::config::Component;
use crate::error::{Result, TrainError};
use crate::optimizer::{Adam, AdamParams, Optimizer, Sgd, SgdParams};
use crate::scheduler::{LearningRateScheduler, SchedulerConfig, SchedulerType};

/// Builds a model from its architecture
pub type ModelFactory = fn(&ModelConfig) -> Result<CompressorModel>;

/// Builds an optimizer from its YAML params
pub type OptimizerFactory = fn(&Component) -> Result<Optimizer>;

/// Builds a scheduler from its YAML params, the optimizer's base rate and
/// the run length
pub type SchedulerFactory = fn(&Component, f32, u64) -> Result<LearningRateScheduler>;

/// Named factories of one kind
#[derive(Debug, Clone)]
pub struct Registry<F> {
    kind: &'static str,
    entries: BTreeMap<String, F>,
}

impl<F> Registry<F> {
    /// Empty registry for components of `kind`.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Add or replace a factory.
    pub fn register(&mut self, key: impl Into<String>, factory: F) -> &mut Self {
        self.entries.insert(key.into(), factory);
        self
    }

    /// Look up a factory.
    pub fn get(&self, key: &str) -> Result<&F> {
        self.entries.get(key).ok_or_else(|| TrainError::Registry {
            kind: self.kind,
            key: key.to_string(),
            available: self.keys().collect::<Vec<_>>().join(", "),
        })
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Component kind this registry holds.
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

/// All registries a trainer needs
#[derive(Debug, Clone)]
pub struct Registries {
    /// Models
    pub models: Registry<ModelFactory>,
    /// Optimizers
    pub optimizers: Registry<OptimizerFactory>,
    /// Learning rate schedulers
    pub schedulers: Registry<SchedulerFactory>,
}

impl Default for Registries {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Registries {
    /// Registries holding every builtin component.
    pub fn builtin() -> Self {
        let mut models = Registry::new("model");
        models.register("McQuic", build_mcquic as ModelFactory);

        let mut optimizers = Registry::new("optimizer");
        optimizers
            .register("SGD", build_sgd as OptimizerFactory)
            .register("Adam", build_adam as OptimizerFactory);

        let mut schedulers = Registry::new("scheduler");
        let builders: [(&str, SchedulerFactory); 7] = [
            ("Constant", build_constant),
            ("Linear", build_linear),
            ("Cosine", build_cosine),
            ("WarmupCosine", build_warmup_cosine),
            ("Exponential", build_exponential),
            ("Step", build_step),
            ("OneCycle", build_one_cycle),
        ];
        for (name, factory) in builders {
            schedulers.register(name, factory);
        }

        Self {
            models,
            optimizers,
            schedulers,
        }
    }

    /// Build the model named by `key`.
    pub fn model(&self, key: &str, config: &ModelConfig) -> Result<CompressorModel> {
        (self.models.get(key)?)(config)
    }

    /// Build the optimizer a component names.
    pub fn optimizer(&self, component: &Component) -> Result<Optimizer> {
        (self.optimizers.get(&component.key)?)(component)
    }

    /// Build the scheduler a component names.
    pub fn scheduler(
        &self,
        component: &Component,
        base_lr: f32,
        total_steps: u64,
    ) -> Result<LearningRateScheduler> {
        (self.schedulers.get(&component.key)?)(component, base_lr, total_steps)
    }
}

fn build_mcquic(config: &ModelConfig) -> Result<CompressorModel> {
    Ok(CompressorModel::new(config.clone())?)
}

fn build_sgd(component: &Component) -> Result<Optimizer> {
    Ok(Optimizer::Sgd(Sgd::new(component.params::<SgdParams>()?)))
}

fn build_adam(component: &Component) -> Result<Optimizer> {
    Ok(Optimizer::Adam(Adam::new(component.params::<AdamParams>()?)))
}

/// Scheduler params in YAML; the peak rate comes from the optimizer.
#[derive(Debug, Clone, Default, serde::Deserialize)]
struct SchedulerParams {
    #[serde(default)]
    final_lr: Option<f32>,
    #[serde(default)]
    warmup_steps: u64,
}

fn build_scheduler(
    component: &Component,
    base_lr: f32,
    total_steps: u64,
    scheduler_type: SchedulerType,
) -> Result<LearningRateScheduler> {
    let params: SchedulerParams = component.params()?;
    let config = SchedulerConfig {
        initial_lr: base_lr,
        final_lr: params.final_lr.unwrap_or(base_lr * 0.01),
        warmup_steps: params.warmup_steps,
        total_steps,
        scheduler_type,
    };
    config.validate()?;
    Ok(LearningRateScheduler::new(config))
}

fn build_constant(c: &Component, lr: f32, total: u64) -> Result<LearningRateScheduler> {
    build_scheduler(c, lr, total, SchedulerType::Constant)
}

fn build_linear(c: &Component, lr: f32, total: u64) -> Result<LearningRateScheduler> {
    build_scheduler(c, lr, total, SchedulerType::Linear)
}

fn build_cosine(c: &Component, lr: f32, total: u64) -> Result<LearningRateScheduler> {
    build_scheduler(c, lr, total, SchedulerType::Cosine)
}

fn build_warmup_cosine(c: &Component, lr: f32, total: u64) -> Result<LearningRateScheduler> {
    build_scheduler(c, lr, total, SchedulerType::WarmupCosine)
}

fn build_exponential(c: &Component, lr: f32, total: u64) -> Result<LearningRateScheduler> {
    build_scheduler(c, lr, total, SchedulerType::Exponential)
}

fn build_step(c: &Component, lr: f32, total: u64) -> Result<LearningRateScheduler> {
    build_scheduler(c, lr, total, SchedulerType::Step)
}

fn build_one_cycle(c: &Component, lr: f32, total: u64) -> Result<LearningRateScheduler> {
    build_scheduler(c, lr, total, SchedulerType::OneCycle)
}
