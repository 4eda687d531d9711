//! Bidirectional multi-head self-attention with a key padding mask.
//!
//! Fused Q/K/V projection; padded key positions receive an additive bias of
//! `-1e4` (representable in F16) before the softmax.

use candle_core::{IndexOp, Result, Tensor, D};
use candle_nn::VarBuilder;

use fitloop_common::ClassifierConfig;

use crate::linear::CastLinear;

const MASK_BIAS: f64 = -1e4;

/// Multi-head self-attention over all positions.
pub struct SelfAttention {
    c_attn: CastLinear,
    c_proj: CastLinear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl SelfAttention {
    pub fn new(config: &ClassifierConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        Ok(Self {
            c_attn: CastLinear::new(hidden, 3 * hidden, vb.pp("c_attn"))?,
            c_proj: CastLinear::new(hidden, hidden, vb.pp("c_proj"))?,
            num_heads: config.num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// `x`: `(b, t, c)`; `attention_mask`: `(b, t)` u32, 1 = attend.
    pub fn forward(&self, x: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;

        let qkv = self.c_attn.forward(x)?;
        let qkv = qkv.reshape((b, t, 3, self.num_heads, self.head_dim))?;
        let qkv = qkv.permute((0, 3, 1, 4, 2))?; // (b, heads, t, head_dim, 3)

        let q = qkv.i((.., .., .., .., 0))?.contiguous()?;
        let k = qkv.i((.., .., .., .., 1))?.contiguous()?;
        let v = qkv.i((.., .., .., .., 2))?.contiguous()?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?;

        // (b, t) → (b, 1, 1, t): 0 where attended, MASK_BIAS where padded.
        let bias = attention_mask
            .to_dtype(x.dtype())?
            .affine(-MASK_BIAS, MASK_BIAS)?
            .reshape((b, 1, 1, t))?;
        let scores = scores.broadcast_add(&bias)?;

        let att = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let y = att.contiguous()?.matmul(&v)?;
        let y = y.transpose(1, 2)?.reshape((b, t, c))?;

        self.c_proj.forward(&y)
    }
}
