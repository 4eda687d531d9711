//! Precision-following layers: linear projection and embedding table.
//!
//! Parameters are always stored as F32 master weights (they are what the
//! optimiser updates). On every forward call they are cast to the compute
//! dtype: the input's dtype for [`CastLinear`], the requested dtype for
//! [`CastEmbedding`]. `to_dtype` is differentiable, so gradients land on
//! the F32 masters.

use candle_core::{DType, Result, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder};

/// Small init for embedding tables (σ = 0.02).
const EMBED_INIT: Init = Init::Randn {
    mean: 0.,
    stdev: 0.02,
};

// ── CastLinear ──────────────────────────────────────────────────────────────

/// `y = x·Wᵀ + b`, computed in the dtype of `x`.
pub struct CastLinear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl CastLinear {
    /// Parameters `{prefix}.weight` `(out_dim, in_dim)` and `{prefix}.bias`.
    pub fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let inner = candle_nn::linear(in_dim, out_dim, vb)?;
        Ok(Self {
            weight: inner.weight().clone(),
            bias: inner.bias().cloned(),
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let weight = self.weight.to_dtype(dtype)?;
        let bias = self.bias.as_ref().map(|b| b.to_dtype(dtype)).transpose()?;
        Linear::new(weight, bias).forward(x)
    }
}

impl Module for CastLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward(x)
    }
}

// ── CastEmbedding ───────────────────────────────────────────────────────────

/// Lookup table `(num_embeddings, dim)` stored as `{prefix}.embeddings`.
pub struct CastEmbedding {
    table: Tensor,
    dim: usize,
}

impl CastEmbedding {
    pub fn new(num_embeddings: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let table = vb.get_with_hints((num_embeddings, dim), "embeddings", EMBED_INIT)?;
        Ok(Self { table, dim })
    }

    pub fn num_embeddings(&self) -> usize {
        self.table.dims()[0]
    }

    /// `ids` of any shape → `ids.shape + (dim,)` in `dtype`.
    pub fn forward(&self, ids: &Tensor, dtype: DType) -> Result<Tensor> {
        let mut out_dims = ids.dims().to_vec();
        out_dims.push(self.dim);
        let flat = ids.flatten_all()?;
        let table = self.table.to_dtype(dtype)?;
        table.index_select(&flat, 0)?.reshape(out_dims)
    }

    /// The first `len` rows, e.g. positions `0..len` of a position table.
    pub fn prefix(&self, len: usize, dtype: DType) -> Result<Tensor> {
        self.table.narrow(0, 0, len)?.to_dtype(dtype)
    }
}
