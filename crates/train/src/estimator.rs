//! The estimator: a trainable module plus everything needed to fit it.
//!
//! ```ignore
//! let config = ClassifierConfig::new("bag-of-embeddings", 3, vocab_size);
//! let mut est = Estimator::new(config, EstimatorConfig::default())?
//!     .with_callback(EpochLogger::new());
//! est.fit(&encodings, &labels, FitParams::seeded(42))?;
//! let predicted = est.predict(&encodings)?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, Var, D};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use fitloop_common::{batch_plan, make_batch, Encodings, FitError, Phase, PhaseExt, Result};
use fitloop_core::{named_vars, reset_parameters, Classifier, ModuleFactory};

use crate::callbacks::{Callback, CallbackList, LrScheduler};
use crate::criterion::{Criterion, CrossEntropy};
use crate::history::History;
use crate::metrics::{accuracy, argmax};
use crate::optimizer::{BoundOptimizer, OptimizerKind};
use crate::precision::{LossScaleConfig, PrecisionBackend, PrecisionKind};
use crate::scheduler::ScheduleKind;
use crate::trainer::{CancelToken, LabeledSet, LoopSettings, TrainingLoop};

/// Default depth of the batch prefetch channel.
pub const PREFETCH_BUFFER: usize = 8;

// ── Config ──────────────────────────────────────────────────────────────────

fn default_batch_size() -> usize {
    32
}
fn default_max_epochs() -> usize {
    10
}
fn default_lr() -> f64 {
    1e-3
}
fn default_weight_decay() -> f64 {
    0.01
}
fn default_true() -> bool {
    true
}
fn default_prefetch() -> usize {
    PREFETCH_BUFFER
}
fn default_partial_fit_epochs() -> usize {
    1
}

/// Training hyper-parameters (serialised as JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Epochs run by `fit`.
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    /// Base learning rate; the schedule scales it.
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default)]
    pub optimizer: OptimizerKind,
    #[serde(default)]
    pub schedule: ScheduleKind,
    /// Re-shuffle training rows every epoch.
    #[serde(default = "default_true")]
    pub shuffle: bool,
    /// Max global gradient norm (unscaled gradients).
    #[serde(default)]
    pub grad_clip: Option<f64>,
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    /// Epochs run by each `partial_fit`.
    #[serde(default = "default_partial_fit_epochs")]
    pub partial_fit_epochs: usize,
    #[serde(default)]
    pub label_smoothing: f64,
    #[serde(default)]
    pub precision: PrecisionKind,
    #[serde(default)]
    pub loss_scale: LossScaleConfig,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_epochs: default_max_epochs(),
            lr: default_lr(),
            weight_decay: default_weight_decay(),
            optimizer: OptimizerKind::default(),
            schedule: ScheduleKind::default(),
            shuffle: true,
            grad_clip: None,
            prefetch: default_prefetch(),
            partial_fit_epochs: default_partial_fit_epochs(),
            label_smoothing: 0.0,
            precision: PrecisionKind::default(),
            loss_scale: LossScaleConfig::default(),
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(FitError::config("batch_size must be > 0"));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(FitError::config(format!("lr must be positive, got {}", self.lr)));
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(FitError::config(format!(
                "label_smoothing must be in [0, 1), got {}",
                self.label_smoothing
            )));
        }
        if let Some(clip) = self.grad_clip {
            if !(clip > 0.0) {
                return Err(FitError::config(format!("grad_clip must be > 0, got {clip}")));
            }
        }
        if let ScheduleKind::WarmupCosine { floor, .. } = self.schedule {
            if !(0.0..=1.0).contains(&floor) {
                return Err(FitError::config(format!("cosine floor must be in [0, 1], got {floor}")));
            }
        }
        Ok(())
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

/// Per-call fit options.
#[derive(Debug, Clone, Default)]
pub struct FitParams {
    /// Seeds weight init and shuffling.
    pub seed: u64,
    /// Held-out rows scored after every epoch.
    pub validation: Option<(Encodings, Vec<u32>)>,
    pub cancel: Option<CancelToken>,
}

impl FitParams {
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed,
            ..Default::default()
        }
    }

    pub fn with_validation(mut self, encodings: Encodings, labels: Vec<u32>) -> Self {
        self.validation = Some((encodings, labels));
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

// ── Estimator ───────────────────────────────────────────────────────────────

/// Module, parameters and the optimizer bound to exactly those parameters.
struct FittedState {
    varmap: VarMap,
    vars: Vec<Var>,
    module: Box<dyn Classifier>,
    optimizer: BoundOptimizer,
}

pub struct Estimator {
    factory: Box<dyn ModuleFactory>,
    config: EstimatorConfig,
    criterion: Box<dyn Criterion>,
    callbacks: CallbackList,
    backend: PrecisionBackend,
    device: Device,
    state: Option<FittedState>,
    history: History,
    global_step: usize,
}

impl fmt::Debug for Estimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Estimator")
            .field("module", &self.factory.name())
            .field("config", &self.config)
            .field("fitted", &self.is_fitted())
            .field("global_step", &self.global_step)
            .finish_non_exhaustive()
    }
}

impl Estimator {
    /// Nothing is allocated until `fit`. The schedule callback from
    /// `config.schedule` is registered first.
    pub fn new(factory: impl ModuleFactory + 'static, config: EstimatorConfig) -> Result<Self> {
        config.validate()?;
        factory.check()?;
        let backend = PrecisionBackend::from_kind(config.precision, config.loss_scale)?;
        let mut callbacks = CallbackList::new();
        callbacks.push(Box::new(LrScheduler::new(config.schedule)));
        Ok(Self {
            factory: Box::new(factory),
            criterion: Box::new(CrossEntropy::with_label_smoothing(config.label_smoothing)),
            config,
            callbacks,
            backend,
            device: Device::Cpu,
            state: None,
            history: History::new(),
            global_step: 0,
        })
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_criterion(mut self, criterion: impl Criterion + 'static) -> Self {
        self.criterion = Box::new(criterion);
        self
    }

    pub fn with_callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn add_callback(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.push(callback);
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn num_labels(&self) -> usize {
        self.factory.num_labels()
    }

    /// Token ids the module accepts, `[0, vocab_size)`, if bounded.
    pub fn vocab_size(&self) -> Option<usize> {
        self.factory.vocab_size()
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Learning rate the next step would use.
    pub fn learning_rate(&self) -> Option<f64> {
        self.state.as_ref().map(|s| s.optimizer.learning_rate())
    }

    /// Current dynamic loss scale (mixed precision only).
    pub fn loss_scale(&self) -> Option<f64> {
        self.backend.loss_scale()
    }

    // ── Training ────────────────────────────────────────────────────────────

    /// Re-initialise the module from `params.seed` and train for
    /// `max_epochs`. Clears the history and `global_step`.
    pub fn fit(&mut self, x: &Encodings, y: &[u32], params: FitParams) -> Result<&mut Self> {
        self.check_data(x, y, &params)?;
        self.backend.prepare(&self.device)?;

        let mut rng = StdRng::seed_from_u64(params.seed);
        let state = self.initialize(&mut rng)?;
        self.state = Some(state);
        self.history.clear();
        self.global_step = 0;
        self.run(x, y, &params, self.config.max_epochs, &mut rng)?;
        Ok(self)
    }

    /// Continue training the current module for `partial_fit_epochs`.
    pub fn partial_fit(&mut self, x: &Encodings, y: &[u32], params: FitParams) -> Result<&mut Self> {
        if self.state.is_none() {
            return Err(FitError::NotFitted);
        }
        self.check_data(x, y, &params)?;
        // Offset by the step count so repeated calls with one seed shuffle differently.
        let seed = params.seed ^ (self.global_step as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut rng = StdRng::seed_from_u64(seed);
        self.run(x, y, &params, self.config.partial_fit_epochs, &mut rng)?;
        Ok(self)
    }

    /// Everything `fit` rejects before touching the estimator: mismatched
    /// lengths, labels outside `[0, num_labels)` and token ids outside the
    /// module vocabulary, for the training and validation sets.
    pub fn check_data(&self, x: &Encodings, y: &[u32], params: &FitParams) -> Result<()> {
        self.check_set(x, y)?;
        if let Some((vx, vy)) = &params.validation {
            self.check_set(vx, vy)?;
        }
        Ok(())
    }

    fn check_set(&self, x: &Encodings, y: &[u32]) -> Result<()> {
        if x.len() != y.len() {
            return Err(FitError::config(format!(
                "{} rows but {} labels",
                x.len(),
                y.len()
            )));
        }
        self.check_targets(y)?;
        self.check_ids(x)
    }

    pub fn check_targets(&self, y: &[u32]) -> Result<()> {
        let num_labels = self.num_labels();
        match y.iter().find(|&&l| l as usize >= num_labels) {
            Some(bad) => Err(FitError::config(format!(
                "label {bad} outside [0, {num_labels})"
            ))),
            None => Ok(()),
        }
    }

    pub fn check_ids(&self, x: &Encodings) -> Result<()> {
        match (self.vocab_size(), x.max_id()) {
            (Some(vocab), Some(max)) if max as usize >= vocab => Err(FitError::config(format!(
                "token id {max} outside the module vocabulary of {vocab}"
            ))),
            _ => Ok(()),
        }
    }

    /// Build and seed a new module and optimizer. The current state is only
    /// replaced by the caller once this succeeds.
    fn initialize(&self, rng: &mut StdRng) -> Result<FittedState> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        let module = self.factory.build(vb).during(Phase::Init)?;
        if module.num_labels() != self.factory.num_labels() {
            return Err(FitError::config(format!(
                "module has {} outputs, factory declares {}",
                module.num_labels(),
                self.factory.num_labels()
            )));
        }
        let params = reset_parameters(&varmap, rng).during(Phase::Init)?;
        let vars: Vec<Var> = named_vars(&varmap)
            .during(Phase::Init)?
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        let optimizer = BoundOptimizer::new(
            self.config.optimizer,
            vars.clone(),
            self.config.lr,
            self.config.weight_decay,
        )
        .during(Phase::Init)?;
        tracing::info!(
            module = self.factory.name(),
            tensors = vars.len(),
            params,
            "module initialised"
        );
        Ok(FittedState {
            varmap,
            vars,
            module,
            optimizer,
        })
    }

    fn run(
        &mut self,
        x: &Encodings,
        y: &[u32],
        params: &FitParams,
        epochs: usize,
        rng: &mut StdRng,
    ) -> Result<()> {
        let settings = LoopSettings {
            batch_size: self.config.batch_size,
            shuffle: self.config.shuffle,
            grad_clip: self.config.grad_clip,
            prefetch: self.config.prefetch,
            base_lr: self.config.lr,
            seed: params.seed,
        };
        let state = self.state.as_mut().ok_or(FitError::NotFitted)?;
        let mut training = TrainingLoop {
            module: state.module.as_ref(),
            vars: &state.vars,
            optimizer: &mut state.optimizer,
            backend: &mut self.backend,
            criterion: self.criterion.as_ref(),
            callbacks: &mut self.callbacks,
            history: &mut self.history,
            global_step: &mut self.global_step,
            device: &self.device,
            settings,
            cancel: params.cancel.as_ref(),
        };
        let validation = params
            .validation
            .as_ref()
            .map(|(vx, vy)| LabeledSet::new(vx, vy));
        training.run(LabeledSet::new(x, y), validation, epochs, rng)
    }

    // ── Inference ───────────────────────────────────────────────────────────

    /// Arg-max class per row.
    pub fn predict(&self, x: &Encodings) -> Result<Vec<u32>> {
        self.predict_with(x, argmax)
    }

    /// Class per row chosen by `decide` from the row's raw outputs.
    pub fn predict_with<F>(&self, x: &Encodings, decide: F) -> Result<Vec<u32>>
    where
        F: Fn(&[f32]) -> u32,
    {
        Ok(self.forward_rows(x, false)?.iter().map(|r| decide(&r[..])).collect())
    }

    /// Softmax of the raw outputs, one row per input.
    pub fn predict_proba(&self, x: &Encodings) -> Result<Vec<Vec<f32>>> {
        self.forward_rows(x, true)
    }

    /// Accuracy of [`predict`](Self::predict) against `y`.
    pub fn score(&self, x: &Encodings, y: &[u32]) -> Result<f32> {
        if x.len() != y.len() {
            return Err(FitError::config(format!(
                "{} rows but {} labels",
                x.len(),
                y.len()
            )));
        }
        let predicted = self.predict(x)?;
        accuracy(&predicted, y).ok_or_else(|| FitError::config("cannot score an empty set"))
    }

    /// Eval-mode forward with outputs detached from the graph.
    fn forward_rows(&self, x: &Encodings, softmax: bool) -> Result<Vec<Vec<f32>>> {
        let state = self.state.as_ref().ok_or(FitError::NotFitted)?;
        self.check_ids(x)?;
        let ctx = self.backend.forward_ctx(false);
        let mut rows = Vec::with_capacity(x.len());
        for indices in batch_plan(x.len(), self.config.batch_size, None) {
            let batch = make_batch(x, None, &indices, &self.device)?;
            let mut out = state
                .module
                .forward(&batch.inputs, ctx)
                .and_then(|l| l.to_dtype(DType::F32))
                .during(Phase::Predict)?
                .detach();
            if softmax {
                out = candle_nn::ops::softmax(&out, D::Minus1).during(Phase::Predict)?;
            }
            rows.extend(out.to_vec2::<f32>().during(Phase::Predict)?);
        }
        Ok(rows)
    }

    // ── Parameters ──────────────────────────────────────────────────────────

    /// Snapshot of every parameter, by name.
    pub fn parameters(&self) -> Result<BTreeMap<String, Vec<f32>>> {
        let state = self.state.as_ref().ok_or(FitError::NotFitted)?;
        named_vars(&state.varmap)
            .during(Phase::Persist)?
            .into_iter()
            .map(|(name, var)| {
                let values = var
                    .as_tensor()
                    .flatten_all()
                    .and_then(|t| t.to_dtype(DType::F32))
                    .and_then(|t| t.to_vec1::<f32>())
                    .during(Phase::Persist)?;
                Ok((name, values))
            })
            .collect()
    }

    /// Write parameters as safetensors.
    pub fn save_params(&self, path: &Path) -> Result<()> {
        let state = self.state.as_ref().ok_or(FitError::NotFitted)?;
        state.varmap.save(path).during(Phase::Persist)?;
        tracing::info!(path = %path.display(), "parameters saved");
        Ok(())
    }

    /// Load parameters written by [`save_params`](Self::save_params). An
    /// unfitted estimator builds its module first and counts as fitted
    /// afterwards.
    pub fn load_params(&mut self, path: &Path) -> Result<()> {
        match self.state.as_mut() {
            Some(state) => state.varmap.load(path).during(Phase::Persist)?,
            None => {
                let mut state = self.initialize(&mut StdRng::seed_from_u64(0))?;
                state.varmap.load(path).during(Phase::Persist)?;
                self.state = Some(state);
            }
        }
        tracing::info!(path = %path.display(), "parameters loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fitloop_common::ClassifierConfig;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn data(rows: usize) -> (Encodings, Vec<u32>) {
        // Class k rows contain token 3 + k, so the task is learnable.
        let seqs: Vec<Vec<u32>> = (0..rows)
            .map(|i| vec![2, 3 + (i % 3) as u32, 6 + (i % 5) as u32])
            .collect();
        let labels = (0..rows).map(|i| (i % 3) as u32).collect();
        (Encodings::from_rows(&seqs, 4, 0).unwrap(), labels)
    }

    fn module() -> ClassifierConfig {
        let mut c = ClassifierConfig::new("bag-of-embeddings", 3, 12);
        c.hidden_size = 16;
        c.intermediate_size = 32;
        c
    }

    fn estimator(config: EstimatorConfig) -> Estimator {
        Estimator::new(module(), config).unwrap()
    }

    fn quick() -> EstimatorConfig {
        EstimatorConfig {
            batch_size: 8,
            max_epochs: 1,
            lr: 1e-2,
            ..Default::default()
        }
    }

    #[test]
    fn predict_before_fit_is_not_fitted() {
        let (x, y) = data(4);
        let mut est = estimator(quick());
        assert!(est.predict(&x).unwrap_err().is_not_fitted());
        assert!(est.predict_proba(&x).unwrap_err().is_not_fitted());
        assert!(est.partial_fit(&x, &y, FitParams::seeded(0)).unwrap_err().is_not_fitted());
        assert!(!est.is_fitted());
    }

    #[test]
    fn invalid_inputs_fail_before_state_changes() {
        let (x, mut y) = data(10);
        let mut est = estimator(quick());
        assert!(est.fit(&x, &y[..9], FitParams::default()).unwrap_err().is_configuration());
        y[3] = 3;
        assert!(est.fit(&x, &y, FitParams::default()).unwrap_err().is_configuration());
        assert!(!est.is_fitted());
        assert!(est.history().is_empty());

        let bad = EstimatorConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(Estimator::new(module(), bad).is_err());
        let mut unknown = module();
        unknown.arch = "mlp-mixer".into();
        assert!(Estimator::new(unknown, quick()).unwrap_err().is_configuration());
    }

    #[test]
    fn fit_counts_steps_and_refit_resets() {
        let (x, y) = data(20);
        let mut est = estimator(EstimatorConfig {
            max_epochs: 2,
            ..quick()
        });
        est.fit(&x, &y, FitParams::seeded(1)).unwrap();
        assert_eq!(est.global_step(), 6);
        assert_eq!(est.history().len(), 2);
        // Linear decay reaches 0 after the last step.
        assert!(est.learning_rate().unwrap().abs() < 1e-12);

        est.partial_fit(&x, &y, FitParams::seeded(1)).unwrap();
        assert_eq!(est.global_step(), 9);
        assert_eq!(est.history().len(), 3);
        assert_eq!(est.history().last().unwrap().epoch, 2);

        est.fit(&x, &y, FitParams::seeded(1)).unwrap();
        assert_eq!(est.global_step(), 6);
        assert_eq!(est.history().len(), 2);
    }

    #[test]
    fn same_seed_same_model() {
        let (x, y) = data(24);
        let mut a = estimator(quick());
        let mut b = estimator(quick());
        a.fit(&x, &y, FitParams::seeded(9)).unwrap();
        b.fit(&x, &y, FitParams::seeded(9)).unwrap();
        assert_eq!(a.parameters().unwrap(), b.parameters().unwrap());
    }

    #[test]
    fn partial_fit_halves_match_one_fit() {
        let config = EstimatorConfig {
            schedule: ScheduleKind::Constant,
            shuffle: false,
            ..quick()
        };
        let (x, y) = data(32);
        let first: Vec<usize> = (0..16).collect();
        let second: Vec<usize> = (16..32).collect();
        let (xa, ya) = (x.select(&first), y[..16].to_vec());
        let (xb, yb) = (x.select(&second), y[16..].to_vec());

        let mut whole = estimator(config.clone());
        whole.fit(&x, &y, FitParams::seeded(5)).unwrap();

        let mut halves = estimator(config);
        halves.fit(&xa, &ya, FitParams::seeded(5)).unwrap();
        halves.partial_fit(&xb, &yb, FitParams::seeded(5)).unwrap();

        assert_eq!(whole.global_step(), halves.global_step());
        let pw = whole.parameters().unwrap();
        let ph = halves.parameters().unwrap();
        for (name, w) in &pw {
            let h = &ph[name];
            let diff = w.iter().zip(h).map(|(a, b)| (a - b).abs()).fold(0f32, f32::max);
            assert!(diff < 1e-5, "{name}: {diff}");
        }
    }

    #[test]
    fn predict_is_idempotent_and_proba_sums_to_one() {
        let (x, y) = data(30);
        let mut est = estimator(EstimatorConfig {
            max_epochs: 3,
            ..quick()
        });
        est.fit(&x, &y, FitParams::seeded(2)).unwrap();
        let before = est.parameters().unwrap();
        let p1 = est.predict(&x).unwrap();
        let p2 = est.predict(&x).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(p1.len(), 30);
        assert_eq!(est.parameters().unwrap(), before);

        for row in est.predict_proba(&x).unwrap() {
            assert_eq!(row.len(), 3);
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
        let always_two = est.predict_with(&x, |_| 2).unwrap();
        assert!(always_two.iter().all(|&c| c == 2));
        let score = est.score(&x, &y).unwrap();
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn learns_a_separable_task() {
        let (x, y) = data(60);
        let mut est = estimator(EstimatorConfig {
            max_epochs: 15,
            lr: 3e-2,
            ..quick()
        });
        est.fit(&x, &y, FitParams::seeded(3).with_validation(x.clone(), y.clone()))
            .unwrap();
        let losses = est.history().train_losses();
        assert!(losses.last().unwrap().unwrap() < losses[0].unwrap());
        assert!(est.score(&x, &y).unwrap() > 0.9);
        assert!(est.history().last().unwrap().valid_acc.is_some());
    }

    #[test]
    fn save_and_load_params() {
        let (x, y) = data(16);
        let mut est = estimator(quick());
        est.fit(&x, &y, FitParams::seeded(4)).unwrap();
        let path = std::env::temp_dir().join(format!("fitloop-est-{}.safetensors", std::process::id()));
        est.save_params(&path).unwrap();

        let mut fresh = estimator(quick());
        fresh.load_params(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert!(fresh.is_fitted());
        assert_eq!(fresh.parameters().unwrap(), est.parameters().unwrap());
        assert_eq!(fresh.predict(&x).unwrap(), est.predict(&x).unwrap());
    }

    #[test]
    fn mixed_precision_trains_in_f16() {
        let (x, y) = data(16);
        let mut est = estimator(EstimatorConfig {
            precision: PrecisionKind::F16,
            loss_scale: LossScaleConfig {
                initial_scale: 256.0,
                ..Default::default()
            },
            ..quick()
        });
        est.fit(&x, &y, FitParams::seeded(0)).unwrap();
        assert_eq!(est.global_step(), 2);
        assert!(est.loss_scale().is_some());
        let rec = est.history().last().unwrap();
        assert_eq!(rec.batches.len(), 2);
        assert!(rec.train_loss.unwrap().is_finite());
    }

    #[test]
    fn same_seed_same_model_with_dropout() {
        let mut config = module();
        config.dropout = 0.5;
        let (x, y) = data(24);
        let fit = |seed| {
            let mut est = Estimator::new(config.clone(), quick()).unwrap();
            est.fit(&x, &y, FitParams::seeded(seed)).unwrap();
            est.parameters().unwrap()
        };
        assert_eq!(fit(9), fit(9));
        assert_ne!(fit(9), fit(10));
    }

    #[test]
    fn out_of_vocabulary_ids_are_configuration_errors() {
        let (x, y) = data(16);
        let mut est = estimator(quick());
        assert_eq!(est.vocab_size(), Some(12));
        est.fit(&x, &y, FitParams::seeded(0)).unwrap();
        let before = est.parameters().unwrap();

        let seqs: Vec<Vec<u32>> = (0..8).map(|i| vec![50 + i]).collect();
        let wide = Encodings::from_rows(&seqs, 4, 0).unwrap();
        let labels = vec![0u32; 8];
        assert!(est.fit(&wide, &labels, FitParams::seeded(0)).unwrap_err().is_configuration());
        let params = FitParams::seeded(0).with_validation(wide.clone(), labels.clone());
        assert!(est.fit(&x, &y, params).unwrap_err().is_configuration());
        assert!(est.predict(&wide).unwrap_err().is_configuration());

        assert_eq!(est.global_step(), 2);
        assert_eq!(est.history().len(), 1);
        assert_eq!(est.parameters().unwrap(), before);
    }

    /// Declares three labels but builds a four-output module once `wrong`
    /// is set.
    struct MislabeledFactory {
        config: ClassifierConfig,
        wrong: Arc<AtomicBool>,
    }

    impl ModuleFactory for MislabeledFactory {
        fn name(&self) -> &str {
            "mislabeled"
        }

        fn num_labels(&self) -> usize {
            3
        }

        fn build(&self, vb: VarBuilder) -> candle_core::Result<Box<dyn Classifier>> {
            let mut config = self.config.clone();
            if self.wrong.load(Ordering::SeqCst) {
                config.num_labels = 4;
            }
            config.build(vb)
        }
    }

    #[test]
    fn failed_refit_keeps_the_fitted_model() {
        let (x, y) = data(16);
        let wrong = Arc::new(AtomicBool::new(false));
        let factory = MislabeledFactory {
            config: module(),
            wrong: wrong.clone(),
        };
        let mut est = Estimator::new(factory, quick()).unwrap();
        est.fit(&x, &y, FitParams::seeded(3)).unwrap();
        let before = est.parameters().unwrap();

        wrong.store(true, Ordering::SeqCst);
        let err = est.fit(&x, &y, FitParams::seeded(4)).unwrap_err();
        assert!(err.is_configuration());
        assert!(est.is_fitted());
        assert_eq!(est.global_step(), 2);
        assert_eq!(est.history().len(), 1);
        assert_eq!(est.parameters().unwrap(), before);
    }

    #[test]
    fn overflowing_steps_are_recorded_as_skipped() {
        let (x, y) = data(16);
        let mut est = estimator(EstimatorConfig {
            precision: PrecisionKind::F16,
            loss_scale: LossScaleConfig {
                initial_scale: 1e30,
                ..Default::default()
            },
            ..quick()
        });
        est.fit(&x, &y, FitParams::seeded(0)).unwrap();

        assert_eq!(est.global_step(), 2);
        let rec = est.history().last().unwrap();
        assert_eq!(rec.skipped_steps, 2);
        assert!(rec.batches.iter().all(|b| !b.applied));
        let scale = est.loss_scale().unwrap();
        assert!((scale / 2.5e29 - 1.0).abs() < 1e-9, "{scale}");
    }
}
