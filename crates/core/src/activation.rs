//! Feed-forward blocks.
//!
//! Three options, selectable via [`ClassifierConfig`]:
//!
//! | Activation | Formula | Notes |
//! |------------|---------|-------|
//! | SiLU       | x · σ(x) | Default. |
//! | ReLU²      | max(0, x)² | Amplifies strong signals. |
//! | SwiGLU     | SiLU(gate) ⊙ up | 3 projections. |

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use fitloop_common::{ClassifierConfig, FfnActivation};

use crate::linear::CastLinear;

/// ReLU²: `max(0, x)²`.
#[inline]
pub fn relu_squared(x: &Tensor) -> Result<Tensor> {
    x.relu()?.sqr()
}

/// `out = W_down( activation( W_up(x) ) )`
pub struct FeedForward {
    w_up: CastLinear,
    w_down: CastLinear,
    activation: FfnActivation,
}

/// `out = W_down( SiLU(W_gate(x)) ⊙ W_up(x) )`
pub struct SwiGLUFeedForward {
    w_gate: CastLinear,
    w_up: CastLinear,
    w_down: CastLinear,
}

/// Unified FFN: dispatches to either [`FeedForward`] or [`SwiGLUFeedForward`].
pub enum FfnLayer {
    Standard(FeedForward),
    SwiGLU(SwiGLUFeedForward),
}

impl FfnLayer {
    pub fn new(config: &ClassifierConfig, vb: VarBuilder) -> Result<Self> {
        let (h, i) = (config.hidden_size, config.intermediate_size);
        match config.ffn_activation() {
            FfnActivation::SwiGLU => Ok(Self::SwiGLU(SwiGLUFeedForward {
                w_gate: CastLinear::new(h, i, vb.pp("w_gate"))?,
                w_up: CastLinear::new(h, i, vb.pp("w_up"))?,
                w_down: CastLinear::new(i, h, vb.pp("w_down"))?,
            })),
            activation => Ok(Self::Standard(FeedForward {
                w_up: CastLinear::new(h, i, vb.pp("w_up"))?,
                w_down: CastLinear::new(i, h, vb.pp("w_down"))?,
                activation,
            })),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Standard(ff) => {
                let up = ff.w_up.forward(x)?;
                let act = match ff.activation {
                    FfnActivation::ReLU2 => relu_squared(&up)?,
                    _ => candle_nn::ops::silu(&up)?,
                };
                ff.w_down.forward(&act)
            }
            Self::SwiGLU(ff) => {
                let gate = candle_nn::ops::silu(&ff.w_gate.forward(x)?)?;
                let up = ff.w_up.forward(x)?;
                ff.w_down.forward(&(gate * up)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn relu_squared_values() {
        let x = Tensor::new(&[-2f32, 0.0, 3.0], &Device::Cpu).unwrap();
        let y = relu_squared(&x).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(y, vec![0.0, 0.0, 9.0]);
    }

    #[test]
    fn swiglu_has_three_projections() {
        let mut config = ClassifierConfig::new("bag", 2, 10);
        config.hidden_size = 8;
        config.intermediate_size = 16;
        config.use_swiglu = true;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let ffn = FfnLayer::new(&config, vb.pp("ffn")).unwrap();
        // weight + bias per projection
        assert_eq!(varmap.all_vars().len(), 6);
        let x = Tensor::ones((3, 8), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(ffn.forward(&x).unwrap().dims(), &[3, 8]);
    }
}
