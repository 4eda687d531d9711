//! # fitloop-core — modules the estimator can train
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`model`] | `Classifier` / `ModuleFactory` capability, reference classifiers |
//! | [`linear`] | `CastLinear`, `CastEmbedding` (F32 masters, cast per call) |
//! | [`norm`] | `NormLayer` (LayerNorm / RMSNorm) |
//! | [`activation`] | `relu_squared`, `SwiGLUFeedForward`, `FfnLayer` |
//! | [`attention`] | `SelfAttention` with key padding mask |
//! | [`init`] | seeded `reset_parameters` over a `VarMap` |
//!
//! Parameters live in a `candle_nn::VarMap` owned by the caller; modules only
//! hold handles to them. Every layer follows the dtype of its input, so the
//! same module runs under the plain and mixed precision backends.

pub mod activation;
pub mod attention;
pub mod init;
pub mod linear;
pub mod model;
pub mod norm;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use init::{named_vars, reset_parameters, InitScheme};
pub use linear::{CastEmbedding, CastLinear};
pub use model::{
    build_classifier, masked_mean_pool, BagOfEmbeddings, Classifier, ForwardCtx, ModuleFactory,
    TransformerClassifier,
};
pub use norm::NormLayer;
