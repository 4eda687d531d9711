//! Optimizers bound to a module's parameters.
//!
//! Candle's `Optimizer` trait is not object safe (it has an associated
//! config and a `Sized` constructor), so the supported optimizers are
//! wrapped in an enum.

use candle_core::backprop::GradStore;
use candle_core::{Result, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    AdamW,
    Sgd,
}

impl OptimizerKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "adamw" | "adam_w" => Some(Self::AdamW),
            "sgd" => Some(Self::Sgd),
            _ => None,
        }
    }
}

/// An optimizer owning its moment buffers and the handles of the parameters
/// it updates. Zeroing gradients is dropping the `GradStore`.
pub enum BoundOptimizer {
    AdamW(AdamW),
    Sgd(SGD),
}

impl BoundOptimizer {
    /// `weight_decay` is ignored by SGD.
    pub fn new(kind: OptimizerKind, vars: Vec<Var>, lr: f64, weight_decay: f64) -> Result<Self> {
        match kind {
            OptimizerKind::AdamW => {
                let params = ParamsAdamW {
                    lr,
                    weight_decay,
                    ..Default::default()
                };
                Ok(Self::AdamW(AdamW::new(vars, params)?))
            }
            OptimizerKind::Sgd => Ok(Self::Sgd(SGD::new(vars, lr)?)),
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::AdamW(opt) => opt.step(grads),
            Self::Sgd(opt) => opt.step(grads),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    #[test]
    fn sgd_step_moves_against_gradient() {
        let w = Var::new(&[1f32, -1.0], &Device::Cpu).unwrap();
        let mut opt = BoundOptimizer::new(OptimizerKind::Sgd, vec![w.clone()], 0.5, 0.0).unwrap();
        // d/dw sum(w²) = 2w
        let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
        opt.step(&loss.backward().unwrap()).unwrap();
        assert_eq!(w.as_tensor().to_vec1::<f32>().unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn learning_rate_is_writable() {
        let w = Var::from_tensor(&Tensor::zeros(3, candle_core::DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let mut opt = BoundOptimizer::new(OptimizerKind::AdamW, vec![w], 1e-3, 0.01).unwrap();
        assert!((opt.learning_rate() - 1e-3).abs() < 1e-15);
        opt.set_learning_rate(5e-4);
        assert!((opt.learning_rate() - 5e-4).abs() < 1e-15);
    }

    #[test]
    fn kind_names() {
        assert_eq!(OptimizerKind::from_name("sgd"), Some(OptimizerKind::Sgd));
        assert_eq!(OptimizerKind::from_name("adamw"), Some(OptimizerKind::AdamW));
        assert_eq!(OptimizerKind::from_name("lion"), None);
    }
}
