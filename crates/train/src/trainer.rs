//! The epoch/batch state machine.
//!
//! Per epoch: `on_epoch_begin`, then for every training batch
//! `on_batch_begin` → forward → loss → backward → (clip) → backend step →
//! drop gradients → `global_step += 1` → `on_batch_end` → cancel check;
//! then validation, the history record, and `on_epoch_end`.
//!
//! Batches are assembled on a scoped producer thread and handed over a
//! bounded channel, so tensor construction for batch `k + 1` overlaps the
//! backward pass of batch `k`. Only one batch is ever in forward/backward.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::StdRng;

use fitloop_common::{
    batch_plan, make_batch, num_batches, Batch, Encodings, FitError, Phase, PhaseExt, Result,
};
use fitloop_core::Classifier;

use crate::callbacks::{CallbackContext, CallbackList, Hook, LoopState};
use crate::criterion::Criterion;
use crate::history::{BatchRecord, EpochRecord, History};
use crate::metrics::argmax_rows;
use crate::optimizer::BoundOptimizer;
use crate::precision::{clip_grad_norm, PrecisionBackend};

// ── Cancellation ────────────────────────────────────────────────────────────

/// Cooperative stop request, checked after every `on_batch_end`.
///
/// The batch in flight always completes and the interrupted epoch is still
/// recorded (flagged `interrupted`).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Inputs ──────────────────────────────────────────────────────────────────

/// Encoded rows with their labels.
#[derive(Debug, Clone, Copy)]
pub struct LabeledSet<'d> {
    pub encodings: &'d Encodings,
    pub labels: &'d [u32],
}

impl<'d> LabeledSet<'d> {
    pub fn new(encodings: &'d Encodings, labels: &'d [u32]) -> Self {
        Self { encodings, labels }
    }

    pub fn len(&self) -> usize {
        self.encodings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encodings.is_empty()
    }
}

/// Knobs the loop reads from the estimator config.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub batch_size: usize,
    pub shuffle: bool,
    pub grad_clip: Option<f64>,
    pub prefetch: usize,
    pub base_lr: f64,
    /// Mixed with `global_step` into the per-step dropout seed.
    pub seed: u64,
}

// ── TrainingLoop ────────────────────────────────────────────────────────────

/// Borrows everything the estimator owns for the duration of one
/// `fit`/`partial_fit` call.
pub struct TrainingLoop<'a> {
    pub module: &'a dyn Classifier,
    pub vars: &'a [Var],
    pub optimizer: &'a mut BoundOptimizer,
    pub backend: &'a mut PrecisionBackend,
    pub criterion: &'a dyn Criterion,
    pub callbacks: &'a mut CallbackList,
    pub history: &'a mut History,
    pub global_step: &'a mut usize,
    pub device: &'a Device,
    pub settings: LoopSettings,
    pub cancel: Option<&'a CancelToken>,
}

/// Running sums for one pass over batches.
#[derive(Default)]
struct LossTotals {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl LossTotals {
    fn add(&mut self, loss: f32, size: usize) {
        self.loss_sum += loss as f64 * size as f64;
        self.seen += size;
    }

    fn mean_loss(&self) -> Option<f32> {
        (self.seen > 0).then(|| (self.loss_sum / self.seen as f64) as f32)
    }

    fn accuracy(&self) -> Option<f32> {
        (self.seen > 0).then(|| self.correct as f32 / self.seen as f32)
    }
}

/// What happened during the training part of an epoch.
struct EpochPass {
    totals: LossTotals,
    batches: Vec<BatchRecord>,
    interrupted: bool,
}

impl<'a> TrainingLoop<'a> {
    /// Run `epochs` epochs over `train`. Completed epochs stay in the
    /// history even if a later one fails.
    pub fn run(
        &mut self,
        train: LabeledSet<'_>,
        validation: Option<LabeledSet<'_>>,
        epochs: usize,
        rng: &mut StdRng,
    ) -> Result<()> {
        let planned_steps = epochs * num_batches(train.len(), self.settings.batch_size);
        let first_epoch = self.history.len();
        tracing::info!(
            epochs,
            rows = train.len(),
            steps = planned_steps,
            start_step = *self.global_step,
            "training"
        );

        self.notify(Hook::TrainBegin, state(first_epoch, 0, planned_steps, None))?;
        for e in 0..epochs {
            let epoch = first_epoch + e;
            let interrupted = self.run_epoch(epoch, planned_steps, train, validation, rng)?;
            if interrupted {
                tracing::info!(epoch, step = *self.global_step, "training cancelled");
                break;
            }
        }
        let last_epoch = self.history.len().saturating_sub(1);
        self.notify(Hook::TrainEnd, state(last_epoch, 0, planned_steps, None))
    }

    fn run_epoch(
        &mut self,
        epoch: usize,
        planned_steps: usize,
        train: LabeledSet<'_>,
        validation: Option<LabeledSet<'_>>,
        rng: &mut StdRng,
    ) -> Result<bool> {
        self.notify(Hook::EpochBegin, state(epoch, 0, planned_steps, None))?;
        let started = Instant::now();

        let plan = batch_plan(
            train.len(),
            self.settings.batch_size,
            self.settings.shuffle.then_some(&mut *rng),
        );
        let (tx, rx) = mpsc::sync_channel(self.settings.prefetch.max(1));
        let device = self.device;
        let pass = thread::scope(|s| {
            s.spawn(move || produce_batches(tx, &plan, train, device));
            self.consume_batches(rx, epoch, planned_steps)
        })?;

        let (valid_loss, valid_acc) = match validation {
            Some(set) if !pass.interrupted => {
                let totals = self.validate(set)?;
                (totals.mean_loss(), totals.accuracy())
            }
            _ => (None, None),
        };

        let train_loss = pass.totals.mean_loss();
        if train_loss.is_some_and(|l| !l.is_finite()) {
            tracing::warn!(epoch, "non-finite training loss");
        }
        let skipped_steps = pass.batches.iter().filter(|b| !b.applied).count();
        self.history.push(EpochRecord {
            epoch,
            train_loss,
            valid_loss,
            valid_acc,
            duration_secs: started.elapsed().as_secs_f64(),
            skipped_steps,
            interrupted: pass.interrupted,
            batches: pass.batches,
        });
        self.notify(Hook::EpochEnd, state(epoch, 0, planned_steps, None))?;
        Ok(pass.interrupted)
    }

    /// Takes `rx` by value: returning early drops it, which unblocks and
    /// ends the producer before the scope joins it.
    fn consume_batches(
        &mut self,
        rx: Receiver<Result<Batch>>,
        epoch: usize,
        planned_steps: usize,
    ) -> Result<EpochPass> {
        let mut pass = EpochPass {
            totals: LossTotals::default(),
            batches: Vec::new(),
            interrupted: false,
        };
        for (i, batch) in rx.into_iter().enumerate() {
            let batch = batch?;
            self.notify(Hook::BatchBegin, state(epoch, i, planned_steps, None))?;
            let record = self.train_step(&batch)?;
            *self.global_step += 1;
            pass.totals.add(record.loss, record.size);
            let loss = record.loss;
            pass.batches.push(record);
            self.notify(Hook::BatchEnd, state(epoch, i, planned_steps, Some(loss)))?;

            if self.cancel.is_some_and(|c| c.is_cancelled()) {
                pass.interrupted = true;
                break;
            }
        }
        Ok(pass)
    }

    fn train_step(&mut self, batch: &Batch) -> Result<BatchRecord> {
        let targets = targets_of(batch)?;
        let lr = self.optimizer.learning_rate();

        let ctx = self
            .backend
            .forward_ctx(true)
            .with_seed(step_seed(self.settings.seed, *self.global_step));
        let logits = self
            .module
            .forward(&batch.inputs, ctx)
            .and_then(|l| l.to_dtype(DType::F32))
            .during(Phase::Forward)?;
        let loss = self.criterion.compute(&logits, targets).during(Phase::Loss)?;
        let loss_value = loss.to_scalar::<f32>().during(Phase::Loss)?;
        if !loss_value.is_finite() {
            tracing::warn!(step = *self.global_step, loss = loss_value, "non-finite loss");
        }

        let mut grads = self.backend.backward(&loss, self.vars).during(Phase::Backward)?;
        if let Some(max_norm) = self.settings.grad_clip {
            clip_grad_norm(&mut grads, self.vars, max_norm).during(Phase::Backward)?;
        }
        let outcome = self
            .backend
            .step(self.optimizer, &grads, self.vars)
            .during(Phase::OptimizerStep)?;
        drop(grads);

        tracing::debug!(
            step = *self.global_step,
            loss = loss_value,
            lr,
            applied = outcome.applied(),
            "step"
        );
        Ok(BatchRecord {
            loss: loss_value,
            size: batch.size,
            lr,
            applied: outcome.applied(),
        })
    }

    /// Forward-only pass accumulating loss and accuracy.
    fn validate(&self, set: LabeledSet<'_>) -> Result<LossTotals> {
        let mut totals = LossTotals::default();
        let ctx = self.backend.forward_ctx(false);
        for indices in batch_plan(set.len(), self.settings.batch_size, None) {
            let batch = make_batch(set.encodings, Some(set.labels), &indices, self.device)?;
            let logits = self
                .module
                .forward(&batch.inputs, ctx)
                .and_then(|l| l.to_dtype(DType::F32))
                .map(|l| l.detach())
                .during(Phase::Validation)?;
            let loss = self
                .criterion
                .compute(&logits, targets_of(&batch)?)
                .and_then(|l| l.to_scalar::<f32>())
                .during(Phase::Validation)?;
            let rows = logits.to_vec2::<f32>().during(Phase::Validation)?;
            totals.correct += argmax_rows(&rows)
                .iter()
                .zip(&indices)
                .filter(|(p, i)| **p == set.labels[**i])
                .count();
            totals.add(loss, batch.size);
        }
        Ok(totals)
    }

    fn notify(&mut self, hook: Hook, mut state: LoopState) -> Result<()> {
        state.global_step = *self.global_step;
        state.base_lr = self.settings.base_lr;
        let mut ctx = CallbackContext::new(state, &*self.history, self.optimizer.learning_rate());
        self.callbacks.fire(hook, &mut ctx)?;
        if let Some(lr) = ctx.written_lr() {
            self.optimizer.set_learning_rate(lr);
        }
        Ok(())
    }
}

fn state(epoch: usize, batch: usize, planned_steps: usize, batch_loss: Option<f32>) -> LoopState {
    LoopState {
        epoch,
        batch,
        planned_steps,
        batch_loss,
        ..Default::default()
    }
}

fn step_seed(seed: u64, step: usize) -> u64 {
    seed ^ (step as u64 + 1).wrapping_mul(0xD1B5_4A32_D192_ED03)
}

fn targets_of(batch: &Batch) -> Result<&Tensor> {
    batch
        .targets
        .as_ref()
        .ok_or_else(|| FitError::collaborator_msg(Phase::Batching, "batch has no targets"))
}

/// Producer side: build batches in plan order until done or the consumer
/// hangs up.
fn produce_batches(
    tx: SyncSender<Result<Batch>>,
    plan: &[Vec<usize>],
    set: LabeledSet<'_>,
    device: &Device,
) {
    for indices in plan {
        let batch = make_batch(set.encodings, Some(set.labels), indices, device);
        let failed = batch.is_err();
        if tx.send(batch).is_err() || failed {
            break;
        }
    }
}
