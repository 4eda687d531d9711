//! Precision backends: how forward, backward and the optimizer step run.
//!
//! * [`PrecisionBackend::Plain`]: native F32, never skips a step.
//! * [`PrecisionBackend::Mixed`]: forward in F16/BF16 against F32 master
//!   weights, dynamic loss scaling. Gradients are unscaled in the
//!   `GradStore` before anything else reads them; a step whose gradients
//!   are not finite is skipped and the scale is backed off.

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use fitloop_common::{FitError, Result};
use fitloop_core::ForwardCtx;

use crate::optimizer::BoundOptimizer;

/// Result of one optimizer step under a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    Skipped,
}

impl StepOutcome {
    pub fn applied(self) -> bool {
        self == Self::Applied
    }
}

// ── Config ──────────────────────────────────────────────────────────────────

/// Compute precision selected in the estimator config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionKind {
    #[default]
    F32,
    F16,
    Bf16,
}

impl PrecisionKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "f32" | "fp32" | "plain" => Some(Self::F32),
            "f16" | "fp16" => Some(Self::F16),
            "bf16" => Some(Self::Bf16),
            _ => None,
        }
    }
}

fn default_initial_scale() -> f64 {
    65536.0
}
fn default_growth_interval() -> usize {
    2000
}
fn default_growth_factor() -> f64 {
    2.0
}
fn default_backoff_factor() -> f64 {
    0.5
}
fn default_min_scale() -> f64 {
    1.0
}

/// Dynamic loss-scale policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossScaleConfig {
    #[serde(default = "default_initial_scale")]
    pub initial_scale: f64,
    /// Consecutive applied steps before the scale grows.
    #[serde(default = "default_growth_interval")]
    pub growth_interval: usize,
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_min_scale")]
    pub min_scale: f64,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: default_initial_scale(),
            growth_interval: default_growth_interval(),
            growth_factor: default_growth_factor(),
            backoff_factor: default_backoff_factor(),
            min_scale: default_min_scale(),
        }
    }
}

impl LossScaleConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.min_scale >= 1.0 && self.initial_scale >= self.min_scale) {
            return Err(FitError::config(format!(
                "loss scale must satisfy 1 <= min_scale ({}) <= initial_scale ({})",
                self.min_scale, self.initial_scale
            )));
        }
        if self.growth_interval == 0 {
            return Err(FitError::config("growth_interval must be > 0"));
        }
        if !(self.growth_factor > 1.0) || !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0)
        {
            return Err(FitError::config(
                "growth_factor must be > 1 and backoff_factor in (0, 1)",
            ));
        }
        Ok(())
    }
}

// ── LossScaler ──────────────────────────────────────────────────────────────

/// Dynamic loss scale. Only the training thread touches it.
#[derive(Debug, Clone)]
pub struct LossScaler {
    config: LossScaleConfig,
    scale: f64,
    good_steps: usize,
    overflow_count: usize,
}

impl LossScaler {
    pub fn new(config: LossScaleConfig) -> Self {
        Self {
            config,
            scale: config.initial_scale,
            good_steps: 0,
            overflow_count: 0,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count
    }

    /// Back to the initial scale.
    pub fn reset(&mut self) {
        *self = Self::new(self.config);
    }

    /// Record a step. Returns `true` when the step should be applied.
    pub fn update(&mut self, overflow: bool) -> bool {
        if overflow {
            self.overflow_count += 1;
            self.good_steps = 0;
            self.scale = (self.scale * self.config.backoff_factor).max(self.config.min_scale);
            tracing::debug!(scale = self.scale, "loss scale backed off");
            return false;
        }
        self.good_steps += 1;
        if self.good_steps >= self.config.growth_interval {
            self.scale *= self.config.growth_factor;
            self.good_steps = 0;
            tracing::debug!(scale = self.scale, "loss scale grown");
        }
        true
    }
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Sum of squared gradient entries over `vars`, accumulated in F64.
/// Non-finite if any gradient entry is.
pub fn grad_sq_norm(grads: &GradStore, vars: &[Var]) -> candle_core::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g
                .to_dtype(DType::F64)?
                .sqr()?
                .sum_all()?
                .to_scalar::<f64>()?;
        }
    }
    Ok(total)
}

pub fn grads_finite(grads: &GradStore, vars: &[Var]) -> candle_core::Result<bool> {
    Ok(grad_sq_norm(grads, vars)?.is_finite())
}

/// Multiply every gradient of `vars` by `factor` in place.
pub fn scale_grads(grads: &mut GradStore, vars: &[Var], factor: f64) -> candle_core::Result<()> {
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), g.affine(factor, 0.0)?);
        }
    }
    Ok(())
}

/// Rescale gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(
    grads: &mut GradStore,
    vars: &[Var],
    max_norm: f64,
) -> candle_core::Result<f64> {
    let norm = grad_sq_norm(grads, vars)?.sqrt();
    if norm.is_finite() && norm > max_norm {
        scale_grads(grads, vars, max_norm / norm.max(1e-12))?;
    }
    Ok(norm)
}

// ── Backend ─────────────────────────────────────────────────────────────────

pub enum PrecisionBackend {
    Plain,
    Mixed { dtype: DType, scaler: LossScaler },
}

impl PrecisionBackend {
    pub fn from_kind(kind: PrecisionKind, scale: LossScaleConfig) -> Result<Self> {
        match kind {
            PrecisionKind::F32 => Ok(Self::Plain),
            PrecisionKind::F16 => Self::mixed(DType::F16, scale),
            PrecisionKind::Bf16 => Self::mixed(DType::BF16, scale),
        }
    }

    pub fn mixed(dtype: DType, scale: LossScaleConfig) -> Result<Self> {
        if !matches!(dtype, DType::F16 | DType::BF16) {
            return Err(FitError::config(format!(
                "mixed precision needs f16 or bf16, got {dtype:?}"
            )));
        }
        scale.validate()?;
        Ok(Self::Mixed {
            dtype,
            scaler: LossScaler::new(scale),
        })
    }

    /// Check the backend can run on `device` and reset per-fit state.
    pub fn prepare(&mut self, device: &Device) -> Result<()> {
        if let Self::Mixed { dtype, scaler } = self {
            if *dtype == DType::BF16 && device.is_cpu() {
                return Err(FitError::config(
                    "bf16 compute is not supported on the cpu device; use f16",
                ));
            }
            scaler.reset();
        }
        Ok(())
    }

    pub fn compute_dtype(&self) -> DType {
        match self {
            Self::Plain => DType::F32,
            Self::Mixed { dtype, .. } => *dtype,
        }
    }

    pub fn forward_ctx(&self, train: bool) -> ForwardCtx {
        if train {
            ForwardCtx::train(self.compute_dtype())
        } else {
            ForwardCtx::eval(self.compute_dtype())
        }
    }

    pub fn loss_scale(&self) -> Option<f64> {
        match self {
            Self::Plain => None,
            Self::Mixed { scaler, .. } => Some(scaler.scale()),
        }
    }

    /// Gradients of `loss` w.r.t. `vars`, already unscaled.
    pub fn backward(&self, loss: &Tensor, vars: &[Var]) -> candle_core::Result<GradStore> {
        match self {
            Self::Plain => loss.backward(),
            Self::Mixed { scaler, .. } => {
                let scale = scaler.scale();
                let mut grads = loss.affine(scale, 0.0)?.backward()?;
                scale_grads(&mut grads, vars, 1.0 / scale)?;
                Ok(grads)
            }
        }
    }

    /// Apply `grads` unless the mixed backend detects overflow.
    pub fn step(
        &mut self,
        optimizer: &mut BoundOptimizer,
        grads: &GradStore,
        vars: &[Var],
    ) -> candle_core::Result<StepOutcome> {
        match self {
            Self::Plain => {
                optimizer.step(grads)?;
                Ok(StepOutcome::Applied)
            }
            Self::Mixed { scaler, .. } => {
                let overflow = !grads_finite(grads, vars)?;
                if scaler.update(overflow) {
                    optimizer.step(grads)?;
                    Ok(StepOutcome::Applied)
                } else {
                    tracing::warn!(scale = scaler.scale(), "non-finite gradients, step skipped");
                    Ok(StepOutcome::Skipped)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::OptimizerKind;

    fn setup() -> (Var, BoundOptimizer) {
        let w = Var::new(&[1f32, 2.0, 3.0], &Device::Cpu).unwrap();
        let opt = BoundOptimizer::new(OptimizerKind::Sgd, vec![w.clone()], 0.1, 0.0).unwrap();
        (w, opt)
    }

    fn loss_of(w: &Var, dtype: DType) -> Tensor {
        w.as_tensor()
            .to_dtype(dtype)
            .unwrap()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
    }

    #[test]
    fn scaler_backs_off_and_grows() {
        let mut s = LossScaler::new(LossScaleConfig {
            initial_scale: 8.0,
            growth_interval: 2,
            ..Default::default()
        });
        assert!(!s.update(true));
        assert_eq!(s.scale(), 4.0);
        assert!(s.update(false));
        assert_eq!(s.scale(), 4.0);
        assert!(s.update(false));
        assert_eq!(s.scale(), 8.0);
        for _ in 0..10 {
            s.update(true);
        }
        assert_eq!(s.scale(), 1.0);
        assert_eq!(s.overflow_count(), 11);
    }

    fn small_scale() -> LossScaleConfig {
        // Keeps the scaled F16 gradients below 65504.
        LossScaleConfig {
            initial_scale: 1024.0,
            ..Default::default()
        }
    }

    #[test]
    fn mixed_gradients_are_unscaled() {
        let (w, _) = setup();
        let backend = PrecisionBackend::mixed(DType::F16, small_scale()).unwrap();
        let grads = backend.backward(&loss_of(&w, DType::F16), &[w.clone()]).unwrap();
        let g = grads.get(w.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(g, vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn injected_overflow_skips_and_halves() {
        let (w, mut opt) = setup();
        let vars = [w.clone()];
        let mut backend = PrecisionBackend::mixed(DType::F16, small_scale()).unwrap();
        let mut grads = backend.backward(&loss_of(&w, DType::F16), &vars).unwrap();
        let bad = Tensor::new(&[f32::INFINITY, 0.0, 0.0], &Device::Cpu).unwrap();
        grads.insert(w.as_tensor(), bad);

        let outcome = backend.step(&mut opt, &grads, &vars).unwrap();
        assert_eq!(outcome, StepOutcome::Skipped);
        assert_eq!(backend.loss_scale(), Some(512.0));
        assert_eq!(w.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn plain_never_skips() {
        let (w, mut opt) = setup();
        let vars = [w.clone()];
        let mut backend = PrecisionBackend::Plain;
        let mut grads = backend.backward(&loss_of(&w, DType::F32), &vars).unwrap();
        let nan = Tensor::new(&[f32::NAN, 0.0, 0.0], &Device::Cpu).unwrap();
        grads.insert(w.as_tensor(), nan);
        assert_eq!(backend.step(&mut opt, &grads, &vars).unwrap(), StepOutcome::Applied);
        assert_eq!(backend.loss_scale(), None);
        assert!(w.as_tensor().to_vec1::<f32>().unwrap()[0].is_nan());
    }

    #[test]
    fn clip_limits_global_norm() {
        let (w, _) = setup();
        let vars = [w.clone()];
        let mut grads = PrecisionBackend::Plain
            .backward(&loss_of(&w, DType::F32), &vars)
            .unwrap();
        // |(2, 4, 6)| = √56
        let before = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((before - 56f64.sqrt()).abs() < 1e-6);
        let after = grad_sq_norm(&grads, &vars).unwrap().sqrt();
        assert!((after - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(PrecisionBackend::mixed(DType::F32, LossScaleConfig::default()).is_err());
        let mut bf16 = PrecisionBackend::mixed(DType::BF16, LossScaleConfig::default()).unwrap();
        assert!(bf16.prepare(&Device::Cpu).unwrap_err().is_configuration());
        let zero = LossScaleConfig {
            min_scale: 0.0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }
}
