//! Classifier configuration.
//!
//! Serialised as JSON next to saved parameters so `predict` can rebuild the
//! exact module. Every optional field has a `#[serde(default)]`, so a JSON
//! holding only `arch`, `num_labels` and `vocab_size` is a valid config.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FitError, Result};

/// Hyper-parameters of the reference classifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    // ── Identity ────────────────────────────────────────────────────────────
    /// Registry name of the module (see [`ModelArch`]).
    pub arch: String,
    /// Number of output classes.
    pub num_labels: usize,

    // ── Core dimensions ─────────────────────────────────────────────────────
    /// Vocabulary size (must match the preprocessor).
    pub vocab_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Attention heads (transformer encoder only).
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    /// Encoder layers (transformer encoder only).
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    /// Maximum sequence length; sizes the position table.
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    // ── Architecture switches ───────────────────────────────────────────────
    /// RMSNorm instead of LayerNorm.
    #[serde(default)]
    pub use_rms_norm: bool,
    /// ReLU² activation in the FFN. Ignored when `use_swiglu = true`.
    #[serde(default)]
    pub use_relu2: bool,
    /// SwiGLU FFN (3 projections). Takes precedence over `use_relu2`.
    #[serde(default)]
    pub use_swiglu: bool,
    /// Scale sub-layer output by 1/√2 before adding to the residual.
    #[serde(default = "default_true")]
    pub use_residual_scaling: bool,
    /// Dropout probability applied in training mode (0 disables).
    #[serde(default)]
    pub dropout: f32,
}

fn default_hidden_size() -> usize {
    64
}
fn default_num_heads() -> usize {
    4
}
fn default_num_layers() -> usize {
    2
}
fn default_intermediate_size() -> usize {
    128
}
fn default_max_seq_len() -> usize {
    64
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}
fn default_true() -> bool {
    true
}

impl ClassifierConfig {
    /// Minimal config for a named architecture; other fields take defaults.
    pub fn new(arch: impl Into<String>, num_labels: usize, vocab_size: usize) -> Self {
        Self {
            arch: arch.into(),
            num_labels,
            vocab_size,
            hidden_size: default_hidden_size(),
            num_heads: default_num_heads(),
            num_layers: default_num_layers(),
            intermediate_size: default_intermediate_size(),
            max_seq_len: default_max_seq_len(),
            layer_norm_eps: default_layer_norm_eps(),
            use_rms_norm: false,
            use_relu2: false,
            use_swiglu: false,
            use_residual_scaling: true,
            dropout: 0.0,
        }
    }

    /// Check internal consistency before any parameters are allocated.
    pub fn validate(&self) -> Result<()> {
        let arch = ModelArch::from_name(&self.arch).ok_or_else(|| {
            FitError::config(format!(
                "unknown arch {:?}; expected one of {:?}",
                self.arch,
                ModelArch::NAMES
            ))
        })?;
        if self.num_labels < 2 {
            return Err(FitError::config(format!(
                "num_labels must be >= 2, got {}",
                self.num_labels
            )));
        }
        if self.vocab_size == 0 || self.hidden_size == 0 || self.max_seq_len == 0 {
            return Err(FitError::config(
                "vocab_size, hidden_size and max_seq_len must be non-zero",
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(FitError::config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if arch == ModelArch::TransformerEncoder
            && (self.num_heads == 0 || self.hidden_size % self.num_heads != 0)
        {
            return Err(FitError::config(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        Ok(())
    }

    /// Head dimension (`hidden_size / num_heads`). Call [`validate`](Self::validate) first.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads.max(1)
    }

    /// Resolve which FFN activation to use (priority: swiglu > relu2 > silu).
    pub fn ffn_activation(&self) -> FfnActivation {
        if self.use_swiglu {
            FfnActivation::SwiGLU
        } else if self.use_relu2 {
            FfnActivation::ReLU2
        } else {
            FfnActivation::SiLU
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Architectures known to the module registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArch {
    /// Embedding table → masked mean pool → FFN → linear head.
    BagOfEmbeddings,
    /// Learned positions → bidirectional encoder blocks → pool → head.
    TransformerEncoder,
}

impl ModelArch {
    pub const NAMES: [&'static str; 2] = ["bag-of-embeddings", "transformer-encoder"];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "bag-of-embeddings" | "bag" => Some(Self::BagOfEmbeddings),
            "transformer-encoder" | "transformer" => Some(Self::TransformerEncoder),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::BagOfEmbeddings => Self::NAMES[0],
            Self::TransformerEncoder => Self::NAMES[1],
        }
    }
}

/// Resolved FFN activation choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfnActivation {
    SiLU,
    ReLU2,
    SwiGLU,
}
