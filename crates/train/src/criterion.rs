//! Loss functions.

use candle_core::{DType, Result, Tensor};
use candle_nn::{loss, ops};

/// `(logits, targets) → scalar loss`. Must stay differentiable.
pub trait Criterion: Send {
    /// `logits`: `(batch, classes)`; `targets`: `(batch,)` u32 class ids.
    fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor>;
}

/// Mean cross-entropy with optional label smoothing.
///
/// With smoothing `s` over `C` classes:
/// `(1 − s)·nll + s·mean(−Σ log p / C)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropy {
    label_smoothing: f64,
}

impl CrossEntropy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(label_smoothing: f64) -> Self {
        Self { label_smoothing }
    }
}

impl Criterion for CrossEntropy {
    fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let logits = logits.to_dtype(DType::F32)?;
        let s = self.label_smoothing;
        if s <= 0.0 {
            return loss::cross_entropy(&logits, targets);
        }
        let log_probs = ops::log_softmax(&logits, 1)?;
        let nll = loss::nll(&log_probs, targets)?;
        let uniform = log_probs.mean(1)?.neg()?.mean_all()?;
        nll.affine(1.0 - s, 0.0)? + uniform.affine(s, 0.0)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn uniform_logits_give_log_c() {
        let dev = Device::Cpu;
        let logits = Tensor::zeros((4, 3), DType::F32, &dev).unwrap();
        let targets = Tensor::new(&[0u32, 1, 2, 0], &dev).unwrap();
        for ce in [CrossEntropy::new(), CrossEntropy::with_label_smoothing(0.1)] {
            let l = ce.compute(&logits, &targets).unwrap().to_scalar::<f32>().unwrap();
            assert!((l - 3f32.ln()).abs() < 1e-5, "loss = {l}");
        }
    }

    #[test]
    fn smoothing_is_differentiable() {
        let dev = Device::Cpu;
        let w = Var::new(&[[2f32, 0.0], [0.0, 2.0]], &dev).unwrap();
        let targets = Tensor::new(&[0u32, 1], &dev).unwrap();
        let l = CrossEntropy::with_label_smoothing(0.2)
            .compute(w.as_tensor(), &targets)
            .unwrap();
        let grads = l.backward().unwrap();
        assert!(grads.get(w.as_tensor()).is_some());
    }

    #[test]
    fn confident_correct_prediction_has_low_loss() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[10f32, 0.0], [0.0, 10.0]], &dev).unwrap();
        let targets = Tensor::new(&[0u32, 1], &dev).unwrap();
        let l = CrossEntropy::new()
            .compute(&logits, &targets)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(l < 1e-3);
    }
}
