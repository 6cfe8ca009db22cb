//! First-order optimizers over named parameter buffers.
//!
//! Parameters come from [`CompressorModel::parameters_mut`] and gradients
//! are keyed by the same names. Optimizer state is keyed by name too, so it
//! serialises into checkpoints and restores independently of parameter
//! order.
//!
//! [`CompressorModel::parameters_mut`]: mcquic_neural::CompressorModel::parameters_mut

use std::collections::BTreeMap;

use mcquic_neural::Gradients;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};

/// Common optimizer interface
pub trait ParameterOptimizer {
    /// Optimizer name
    fn name(&self) -> &'static str;

    /// Base learning rate from the configuration
    fn base_lr(&self) -> f32;

    /// Apply one update with learning rate `lr`.
    ///
    /// Parameters without a gradient entry are left untouched.
    fn step(&mut self, params: Vec<(String, &mut [f32])>, grads: &Gradients, lr: f32) -> Result<()>;
}

fn check_len(name: &str, param: &[f32], grad: &[f32]) -> Result<()> {
    if param.len() != grad.len() {
        return Err(TrainError::config(format!(
            "gradient for '{}' has {} elements, parameter has {}",
            name,
            grad.len(),
            param.len()
        )));
    }
    Ok(())
}

/// SGD hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdParams {
    /// Base learning rate
    #[serde(default = "default_sgd_lr")]
    pub lr: f32,
    /// Momentum factor
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    /// L2 weight decay
    #[serde(default)]
    pub weight_decay: f32,
}

fn default_sgd_lr() -> f32 {
    1e-2
}

fn default_momentum() -> f32 {
    0.9
}

impl Default for SgdParams {
    fn default() -> Self {
        Self {
            lr: default_sgd_lr(),
            momentum: default_momentum(),
            weight_decay: 0.0,
        }
    }
}

/// Stochastic gradient descent with momentum
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    params: SgdParams,
    velocity: BTreeMap<String, Vec<f32>>,
}

impl Sgd {
    /// Fresh optimizer with no momentum yet.
    pub fn new(params: SgdParams) -> Self {
        Self {
            params,
            velocity: BTreeMap::new(),
        }
    }

    /// Hyperparameters
    pub fn params(&self) -> &SgdParams {
        &self.params
    }
}

impl ParameterOptimizer for Sgd {
    fn name(&self) -> &'static str {
        "SGD"
    }

    fn base_lr(&self) -> f32 {
        self.params.lr
    }

    fn step(&mut self, params: Vec<(String, &mut [f32])>, grads: &Gradients, lr: f32) -> Result<()> {
        let SgdParams {
            momentum,
            weight_decay,
            ..
        } = self.params;
        for (name, param) in params {
            let Some(grad) = grads.get(&name) else {
                continue;
            };
            check_len(&name, param, grad)?;
            let velocity = self
                .velocity
                .entry(name)
                .or_insert_with(|| vec![0.0; grad.len()]);
            for ((p, &g), v) in param.iter_mut().zip(grad).zip(velocity.iter_mut()) {
                let g = g + weight_decay * *p;
                *v = momentum * *v + g;
                *p -= lr * *v;
            }
        }
        Ok(())
    }
}

/// Adam hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamParams {
    /// Base learning rate
    #[serde(default = "default_adam_lr")]
    pub lr: f32,
    /// First moment decay
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    /// Second moment decay
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    /// Denominator epsilon
    #[serde(default = "default_adam_eps")]
    pub eps: f32,
    /// L2 weight decay
    #[serde(default)]
    pub weight_decay: f32,
}

fn default_adam_lr() -> f32 {
    1e-3
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_adam_eps() -> f32 {
    1e-8
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: default_adam_lr(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_adam_eps(),
            weight_decay: 0.0,
        }
    }
}

/// Adam
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    params: AdamParams,
    steps: u64,
    first: BTreeMap<String, Vec<f32>>,
    second: BTreeMap<String, Vec<f32>>,
}

impl Adam {
    /// Fresh optimizer with zeroed moments.
    pub fn new(params: AdamParams) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    /// Hyperparameters
    pub fn params(&self) -> &AdamParams {
        &self.params
    }
}

impl ParameterOptimizer for Adam {
    fn name(&self) -> &'static str {
        "Adam"
    }

    fn base_lr(&self) -> f32 {
        self.params.lr
    }

    fn step(&mut self, params: Vec<(String, &mut [f32])>, grads: &Gradients, lr: f32) -> Result<()> {
        let AdamParams {
            beta1,
            beta2,
            eps,
            weight_decay,
            ..
        } = self.params;
        self.steps += 1;
        let t = self.steps.min(i32::MAX as u64) as i32;
        let correction1 = 1.0 - beta1.powi(t);
        let correction2 = 1.0 - beta2.powi(t);

        for (name, param) in params {
            let Some(grad) = grads.get(&name) else {
                continue;
            };
            check_len(&name, param, grad)?;
            let m = self
                .first
                .entry(name.clone())
                .or_insert_with(|| vec![0.0; grad.len()]);
            let v = self
                .second
                .entry(name)
                .or_insert_with(|| vec![0.0; grad.len()]);
            for (i, (p, &g)) in param.iter_mut().zip(grad).enumerate() {
                let g = g + weight_decay * *p;
                m[i] = beta1 * m[i] + (1.0 - beta1) * g;
                v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
                let m_hat = m[i] / correction1;
                let v_hat = v[i] / correction2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            }
        }
        Ok(())
    }
}

/// Any builtin optimizer, with its state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Optimizer {
    /// SGD with momentum
    Sgd(Sgd),
    /// Adam
    Adam(Adam),
}

impl Optimizer {
    fn inner(&self) -> &dyn ParameterOptimizer {
        match self {
            Optimizer::Sgd(o) => o,
            Optimizer::Adam(o) => o,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ParameterOptimizer {
        match self {
            Optimizer::Sgd(o) => o,
            Optimizer::Adam(o) => o,
        }
    }
}

impl ParameterOptimizer for Optimizer {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn base_lr(&self) -> f32 {
        self.inner().base_lr()
    }

    fn step(&mut self, params: Vec<(String, &mut [f32])>, grads: &Gradients, lr: f32) -> Result<()> {
        self.inner_mut().step(params, grads, lr)
    }
}

/// Scale all gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_gradients(grads: &mut Gradients, max_norm: f32) -> f32 {
    let total_norm_sq: f64 = grads
        .values()
        .flat_map(|g| g.iter())
        .map(|&g| (g as f64) * (g as f64))
        .sum();
    let total_norm = total_norm_sq.sqrt() as f32;

    if total_norm > max_norm && total_norm > 0.0 {
        let scale = max_norm / total_norm;
        for grad in grads.values_mut() {
            for g in grad.iter_mut() {
                *g *= scale;
            }
        }
    }
    total_norm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadratic_grad(x: &[f32]) -> Gradients {
        // d/dx of (x - 3)^2
        let mut grads = Gradients::new();
        grads.insert("x".into(), x.iter().map(|v| 2.0 * (v - 3.0)).collect());
        grads
    }

    fn minimise(mut opt: Optimizer, lr: f32) -> f32 {
        let mut x = vec![0.0f32];
        for _ in 0..500 {
            let grads = quadratic_grad(&x);
            opt.step(vec![("x".into(), &mut x[..])], &grads, lr).unwrap();
        }
        x[0]
    }

    #[test]
    fn test_sgd_converges() {
        let x = minimise(Optimizer::Sgd(Sgd::default()), 0.01);
        assert!((x - 3.0).abs() < 1e-3, "{}", x);
    }

    #[test]
    fn test_adam_converges() {
        let x = minimise(Optimizer::Adam(Adam::default()), 0.05);
        assert!((x - 3.0).abs() < 1e-2, "{}", x);
    }

    #[test]
    fn test_missing_gradient_untouched() {
        let mut opt = Optimizer::Adam(Adam::default());
        let mut y = vec![1.0f32, 2.0];
        opt.step(vec![("y".into(), &mut y[..])], &Gradients::new(), 0.1)
            .unwrap();
        assert_eq!(y, vec![1.0, 2.0]);

        let mut grads = Gradients::new();
        grads.insert("y".into(), vec![1.0]);
        assert!(opt.step(vec![("y".into(), &mut y[..])], &grads, 0.1).is_err());
    }

    #[test]
    fn test_params_from_yaml() {
        let adam: AdamParams = serde_yaml::from_str("lr: 0.0002\nbeta2: 0.99\n").unwrap();
        assert_eq!(adam.lr, 2e-4);
        assert_eq!(adam.beta1, 0.9);
        assert_eq!(adam.beta2, 0.99);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut opt = Optimizer::Sgd(Sgd::default());
        let mut x = vec![0.5f32];
        opt.step(vec![("x".into(), &mut x[..])], &quadratic_grad(&[0.5]), 0.1)
            .unwrap();
        let bytes = bincode::serialize(&opt).unwrap();
        let back: Optimizer = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, opt);
    }

    #[test]
    fn test_clip_gradients() {
        let mut grads = Gradients::new();
        grads.insert("a".into(), vec![3.0]);
        grads.insert("b".into(), vec![4.0]);
        let norm = clip_gradients(&mut grads, 1.0);
        assert!((norm - 5.0).abs() < 1e-6);
        assert!((grads["a"][0] - 0.6).abs() < 1e-6);
        assert!((grads["b"][0] - 0.8).abs() < 1e-6);

        let norm = clip_gradients(&mut grads, 10.0);
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((grads["a"][0] - 0.6).abs() < 1e-6);
    }
}
