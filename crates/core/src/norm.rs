//! Normalisation layers.
//!
//! Built from primitive tensor ops so every path is differentiable. The
//! statistics are always computed in F32, whatever the compute dtype; the
//! result is cast back to the input dtype.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

use fitloop_common::ClassifierConfig;

/// LayerNorm (`gamma`, `beta`) or RMSNorm (`gamma` only) over the last dim.
pub enum NormLayer {
    LayerNorm { gamma: Tensor, beta: Tensor, eps: f64 },
    RmsNorm { gamma: Tensor, eps: f64 },
}

impl NormLayer {
    /// Construct from config. `vb` should be scoped to the layer prefix
    /// (e.g. `vb.pp("ln1")`).
    pub fn new(config: &ClassifierConfig, vb: VarBuilder) -> Result<Self> {
        let size = config.hidden_size;
        let eps = config.layer_norm_eps;
        let gamma = vb.get_with_hints(size, "gamma", Init::Const(1.0))?;
        if config.use_rms_norm {
            Ok(Self::RmsNorm { gamma, eps })
        } else {
            let beta = vb.get_with_hints(size, "beta", Init::Const(0.0))?;
            Ok(Self::LayerNorm { gamma, beta, eps })
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let out = match self {
            Self::LayerNorm { gamma, beta, eps } => {
                let mean = x.mean_keepdim(D::Minus1)?;
                let centered = x.broadcast_sub(&mean)?;
                let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
                let normed = centered.broadcast_div(&var.affine(1.0, *eps)?.sqrt()?)?;
                normed.broadcast_mul(gamma)?.broadcast_add(beta)?
            }
            Self::RmsNorm { gamma, eps } => {
                let ms = x.sqr()?.mean_keepdim(D::Minus1)?;
                let normed = x.broadcast_div(&ms.affine(1.0, *eps)?.sqrt()?)?;
                normed.broadcast_mul(gamma)?
            }
        };
        out.to_dtype(dtype)
    }
}
