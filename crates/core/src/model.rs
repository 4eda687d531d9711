//! The module capability consumed by the estimator, plus two reference
//! classifiers.
//!
//! Any differentiable computation that maps [`ModelInputs`] to raw logits can
//! be trained: implement [`Classifier`] for the computation and
//! [`ModuleFactory`] for whatever builds it from a `VarBuilder`. The
//! estimator owns the resulting `VarMap`, so every parameter the module
//! creates through the builder is seen by the optimiser.

use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fitloop_common::{ClassifierConfig, ModelArch, ModelInputs};

use crate::activation::FfnLayer;
use crate::attention::SelfAttention;
use crate::linear::{CastEmbedding, CastLinear};
use crate::norm::NormLayer;

// ── Capability ──────────────────────────────────────────────────────────────

/// Numeric context of one forward pass.
///
/// Passed explicitly on every call: there is no ambient train/eval or
/// grad-recording state to restore afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardCtx {
    /// Compute dtype (F32 for the plain backend, F16/BF16 for mixed).
    pub dtype: DType,
    /// Training mode: dropout active.
    pub train: bool,
    /// Seed for dropout masks of this pass.
    pub seed: u64,
}

impl ForwardCtx {
    pub fn train(dtype: DType) -> Self {
        Self {
            dtype,
            train: true,
            seed: 0,
        }
    }

    pub fn eval(dtype: DType) -> Self {
        Self {
            dtype,
            train: false,
            seed: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// A parameterised differentiable computation producing class logits.
pub trait Classifier: Send {
    /// Raw logits `(batch, num_labels)`. May be in `ctx.dtype`; the harness
    /// casts to F32 before the loss.
    fn forward(&self, inputs: &ModelInputs, ctx: ForwardCtx) -> Result<Tensor>;

    fn num_labels(&self) -> usize;
}

/// Builds a fresh [`Classifier`]; every call allocates new parameters.
pub trait ModuleFactory: Send {
    /// Identifier of what is built (e.g. the registry name).
    fn name(&self) -> &str;

    fn num_labels(&self) -> usize;

    /// Number of token ids the module can embed, when it has a fixed table.
    fn vocab_size(&self) -> Option<usize> {
        None
    }

    /// Reject an unusable configuration before anything is allocated.
    fn check(&self) -> fitloop_common::Result<()> {
        Ok(())
    }

    fn build(&self, vb: VarBuilder) -> Result<Box<dyn Classifier>>;
}

/// The config doubles as a factory for the built-in registry.
impl ModuleFactory for ClassifierConfig {
    fn name(&self) -> &str {
        &self.arch
    }

    fn num_labels(&self) -> usize {
        self.num_labels
    }

    fn vocab_size(&self) -> Option<usize> {
        Some(self.vocab_size)
    }

    fn check(&self) -> fitloop_common::Result<()> {
        self.validate()
    }

    fn build(&self, vb: VarBuilder) -> Result<Box<dyn Classifier>> {
        build_classifier(self, vb)
    }
}

/// Construct a registry module by `config.arch`.
pub fn build_classifier(config: &ClassifierConfig, vb: VarBuilder) -> Result<Box<dyn Classifier>> {
    config
        .validate()
        .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
    match ModelArch::from_name(&config.arch) {
        Some(ModelArch::BagOfEmbeddings) => Ok(Box::new(BagOfEmbeddings::new(config, vb)?)),
        Some(ModelArch::TransformerEncoder) => {
            Ok(Box::new(TransformerClassifier::new(config, vb)?))
        }
        None => candle_core::bail!("unknown arch {:?}", config.arch),
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Mean of `x` `(b, t, h)` over attended positions of `mask` `(b, t)`.
///
/// Rows with no attended position pool to zero rather than NaN.
pub fn masked_mean_pool(x: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let m = mask.to_dtype(x.dtype())?.unsqueeze(2)?;
    let summed = x.broadcast_mul(&m)?.sum(1)?;
    let count = m.sum(1)?.maximum(1f64)?;
    summed.broadcast_div(&count)
}

/// Inverted dropout. The mask is drawn from `ctx.seed` mixed with `site`,
/// so equal seeds give equal masks and each call site gets its own stream.
pub fn dropout(x: &Tensor, p: f32, ctx: ForwardCtx, site: u64) -> Result<Tensor> {
    if !ctx.train || p <= 0.0 {
        return Ok(x.clone());
    }
    let mut rng = StdRng::seed_from_u64(ctx.seed ^ site.wrapping_mul(0x9E37_79B9_7F4A_7C15));
    let scale = 1.0 / (1.0 - p);
    let mask: Vec<f32> = (0..x.elem_count())
        .map(|_| if rng.gen::<f32>() < p { 0.0 } else { scale })
        .collect();
    let mask = Tensor::from_vec(mask, x.dims(), x.device())?.to_dtype(x.dtype())?;
    x.mul(&mask)
}

// ── BagOfEmbeddings ─────────────────────────────────────────────────────────

/// Embedding → masked mean pool → norm → residual FFN → linear head.
pub struct BagOfEmbeddings {
    embed: CastEmbedding,
    norm: NormLayer,
    ffn: FfnLayer,
    head: CastLinear,
    residual_scale: f64,
    dropout: f32,
    num_labels: usize,
}

impl BagOfEmbeddings {
    pub fn new(config: &ClassifierConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            embed: CastEmbedding::new(config.vocab_size, config.hidden_size, vb.pp("tok"))?,
            norm: NormLayer::new(config, vb.pp("norm"))?,
            ffn: FfnLayer::new(config, vb.pp("ffn"))?,
            head: CastLinear::new(config.hidden_size, config.num_labels, vb.pp("head"))?,
            residual_scale: residual_scale(config),
            dropout: config.dropout,
            num_labels: config.num_labels,
        })
    }
}

impl Classifier for BagOfEmbeddings {
    fn forward(&self, inputs: &ModelInputs, ctx: ForwardCtx) -> Result<Tensor> {
        let x = self.embed.forward(&inputs.input_ids, ctx.dtype)?;
        let pooled = masked_mean_pool(&x, &inputs.attention_mask)?;
        let h = self.norm.forward(&pooled)?;
        let ff = self.ffn.forward(&h)?.affine(self.residual_scale, 0.0)?;
        let h = dropout(&(h + ff)?, self.dropout, ctx, 1)?;
        self.head.forward(&h)
    }

    fn num_labels(&self) -> usize {
        self.num_labels
    }
}

// ── TransformerClassifier ───────────────────────────────────────────────────

/// Pre-norm encoder block: norm → attention → residual → norm → FFN → residual.
struct EncoderBlock {
    attn: SelfAttention,
    ln1: NormLayer,
    ffn: FfnLayer,
    ln2: NormLayer,
    residual_scale: f64,
}

impl EncoderBlock {
    fn new(config: &ClassifierConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attn: SelfAttention::new(config, vb.pp("attn"))?,
            ln1: NormLayer::new(config, vb.pp("ln1"))?,
            ffn: FfnLayer::new(config, vb.pp("mlp"))?,
            ln2: NormLayer::new(config, vb.pp("ln2"))?,
            residual_scale: residual_scale(config),
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let attn_out = self.attn.forward(&self.ln1.forward(x)?, mask)?;
        let x = (x + attn_out.affine(self.residual_scale, 0.0)?)?;
        let ff_out = self.ffn.forward(&self.ln2.forward(&x)?)?;
        &x + ff_out.affine(self.residual_scale, 0.0)?
    }
}

/// Token + learned position embeddings → encoder blocks → final norm →
/// masked mean pool → linear head.
pub struct TransformerClassifier {
    tok: CastEmbedding,
    pos: CastEmbedding,
    blocks: Vec<EncoderBlock>,
    ln_f: NormLayer,
    head: CastLinear,
    dropout: f32,
    num_labels: usize,
}

impl TransformerClassifier {
    pub fn new(config: &ClassifierConfig, vb: VarBuilder) -> Result<Self> {
        let tok = CastEmbedding::new(config.vocab_size, config.hidden_size, vb.pp("tok"))?;
        let pos = CastEmbedding::new(config.max_seq_len, config.hidden_size, vb.pp("pos"))?;
        let blocks = (0..config.num_layers)
            .map(|i| EncoderBlock::new(config, vb.pp(format!("h.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            tok,
            pos,
            blocks,
            ln_f: NormLayer::new(config, vb.pp("ln_f"))?,
            head: CastLinear::new(config.hidden_size, config.num_labels, vb.pp("head"))?,
            dropout: config.dropout,
            num_labels: config.num_labels,
        })
    }
}

impl Classifier for TransformerClassifier {
    fn forward(&self, inputs: &ModelInputs, ctx: ForwardCtx) -> Result<Tensor> {
        let (_, t) = inputs.input_ids.dims2()?;
        let max_seq_len = self.pos.num_embeddings();
        if t > max_seq_len {
            candle_core::bail!("sequence length {t} exceeds max_seq_len {max_seq_len}");
        }
        let tok = self.tok.forward(&inputs.input_ids, ctx.dtype)?;
        let pos = self.pos.prefix(t, ctx.dtype)?;
        let mut x = dropout(&tok.broadcast_add(&pos)?, self.dropout, ctx, 1)?;
        for block in &self.blocks {
            x = block.forward(&x, &inputs.attention_mask)?;
        }
        let x = self.ln_f.forward(&x)?;
        let pooled = masked_mean_pool(&x, &inputs.attention_mask)?;
        self.head.forward(&dropout(&pooled, self.dropout, ctx, 2)?)
    }

    fn num_labels(&self) -> usize {
        self.num_labels
    }
}

fn residual_scale(config: &ClassifierConfig) -> f64 {
    if config.use_residual_scaling {
        1.0 / 2.0_f64.sqrt()
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn inputs(dev: &Device) -> ModelInputs {
        ModelInputs {
            input_ids: Tensor::new(&[[2u32, 5, 7, 0], [2, 9, 0, 0]], dev).unwrap(),
            attention_mask: Tensor::new(&[[1u32, 1, 1, 0], [1, 1, 0, 0]], dev).unwrap(),
        }
    }

    fn small(arch: &str) -> ClassifierConfig {
        let mut c = ClassifierConfig::new(arch, 3, 16);
        c.hidden_size = 8;
        c.num_heads = 2;
        c.num_layers = 1;
        c.intermediate_size = 16;
        c.max_seq_len = 4;
        c
    }

    #[test]
    fn registry_builds_both_archs() {
        let dev = Device::Cpu;
        for arch in ModelArch::NAMES {
            let config = small(arch);
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
            let model = config.build(vb).unwrap();
            assert_eq!(model.num_labels(), 3);
            let logits = model.forward(&inputs(&dev), ForwardCtx::eval(DType::F32)).unwrap();
            assert_eq!(logits.dims(), &[2, 3], "{arch}");
            assert!(!varmap.all_vars().is_empty());
        }
    }

    #[test]
    fn transformer_runs_in_f16() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = small("transformer-encoder").build(vb).unwrap();
        let logits = model.forward(&inputs(&dev), ForwardCtx::train(DType::F16)).unwrap();
        assert_eq!(logits.dtype(), DType::F16);
    }

    #[test]
    fn unknown_arch_is_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(build_classifier(&small("mlp-mixer"), vb).is_err());
    }

    #[test]
    fn too_long_sequence_is_rejected() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut config = small("transformer-encoder");
        config.max_seq_len = 2;
        let model = config.build(vb).unwrap();
        assert!(model.forward(&inputs(&dev), ForwardCtx::eval(DType::F32)).is_err());
    }

    #[test]
    fn mean_pool_ignores_padding() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[[1f32], [3.0], [100.0]]], &dev).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 0]], &dev).unwrap();
        let pooled = masked_mean_pool(&x, &mask).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(pooled, vec![vec![2.0]]);

        let none = Tensor::new(&[[0u32, 0, 0]], &dev).unwrap();
        let pooled = masked_mean_pool(&x, &none).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(pooled, vec![vec![0.0]]);
    }

    #[test]
    fn dropout_masks_follow_the_seed() {
        let x = Tensor::ones((4, 64), DType::F32, &Device::Cpu).unwrap();
        let ctx = ForwardCtx::train(DType::F32).with_seed(7);
        let mask = |ctx, site| dropout(&x, 0.5, ctx, site).unwrap().to_vec2::<f32>().unwrap();

        let a = mask(ctx, 1);
        assert_eq!(a, mask(ctx, 1));
        assert!(a.iter().flatten().all(|&v| v == 0.0 || v == 2.0));
        assert_ne!(a, mask(ctx, 2));
        assert_ne!(a, mask(ctx.with_seed(8), 1));

        let eval = mask(ForwardCtx::eval(DType::F32).with_seed(7), 1);
        assert!(eval.iter().flatten().all(|&v| v == 1.0));
    }

    #[test]
    fn ffn_and_residual_variants_backpropagate() {
        let dev = Device::Cpu;
        let targets = Tensor::new(&[0u32, 2], &dev).unwrap();
        // (relu2, swiglu, residual scaling)
        let variants = [(true, false, true), (false, true, true), (false, false, false)];
        for arch in ModelArch::NAMES {
            for (relu2, swiglu, scaled) in variants {
                let mut config = small(arch);
                config.use_relu2 = relu2;
                config.use_swiglu = swiglu;
                config.use_residual_scaling = scaled;
                config.use_rms_norm = swiglu;
                config.dropout = 0.1;
                let varmap = VarMap::new();
                let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
                let model = config.build(vb).unwrap();

                let ctx = ForwardCtx::train(DType::F32).with_seed(3);
                let logits = model.forward(&inputs(&dev), ctx).unwrap();
                let loss = candle_nn::loss::cross_entropy(&logits, &targets).unwrap();
                assert!(loss.to_scalar::<f32>().unwrap().is_finite());
                let grads = loss.backward().unwrap();
                for var in varmap.all_vars() {
                    assert!(grads.get(var.as_tensor()).is_some(), "{arch} {relu2} {swiglu}");
                }
            }
        }
    }
}
