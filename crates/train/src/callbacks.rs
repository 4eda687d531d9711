//! Callback hooks around the training loop.
//!
//! Callbacks run in registration order. Each hook gets a [`CallbackContext`]
//! with a read-only view of the loop state and the history, plus the
//! optimizer's learning rate: a write through
//! [`CallbackContext::set_learning_rate`] is applied before the next step.
//! When several callbacks write in the same hook, the last one wins.

use std::time::Duration;

use indicatif::ProgressStyle;

use fitloop_common::Result;

use crate::history::History;
use crate::scheduler::{Schedule, ScheduleKind};

/// Lifecycle point at which callbacks are invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    TrainBegin,
    EpochBegin,
    BatchBegin,
    BatchEnd,
    EpochEnd,
    TrainEnd,
}

/// Loop counters visible to callbacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopState {
    /// Epoch index over the estimator's lifetime.
    pub epoch: usize,
    /// Batch index within the epoch.
    pub batch: usize,
    pub global_step: usize,
    /// Steps this `fit`/`partial_fit` call will take if not interrupted.
    pub planned_steps: usize,
    /// Learning rate from the estimator config.
    pub base_lr: f64,
    /// Loss of the batch that just finished (`BatchEnd` only).
    pub batch_loss: Option<f32>,
}

pub struct CallbackContext<'a> {
    state: LoopState,
    history: &'a History,
    learning_rate: f64,
    lr_written: bool,
}

impl<'a> CallbackContext<'a> {
    pub fn new(state: LoopState, history: &'a History, learning_rate: f64) -> Self {
        Self {
            state,
            history,
            learning_rate,
            lr_written: false,
        }
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn epoch(&self) -> usize {
        self.state.epoch
    }

    pub fn global_step(&self) -> usize {
        self.state.global_step
    }

    pub fn planned_steps(&self) -> usize {
        self.state.planned_steps
    }

    pub fn base_lr(&self) -> f64 {
        self.state.base_lr
    }

    pub fn batch_loss(&self) -> Option<f32> {
        self.state.batch_loss
    }

    pub fn history(&self) -> &History {
        self.history
    }

    /// Current learning rate, including writes made earlier in this hook.
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
        self.lr_written = true;
    }

    /// The learning rate to apply, if any callback wrote one.
    pub fn written_lr(&self) -> Option<f64> {
        self.lr_written.then_some(self.learning_rate)
    }
}

/// Observer of the training loop. Every hook defaults to a no-op; an error
/// aborts the current `fit`/`partial_fit` call.
#[allow(unused_variables)]
pub trait Callback: Send {
    fn name(&self) -> &str;

    fn on_train_begin(&mut self, ctx: &mut CallbackContext) -> Result<()> {
        Ok(())
    }
    fn on_epoch_begin(&mut self, ctx: &mut CallbackContext) -> Result<()> {
        Ok(())
    }
    fn on_batch_begin(&mut self, ctx: &mut CallbackContext) -> Result<()> {
        Ok(())
    }
    fn on_batch_end(&mut self, ctx: &mut CallbackContext) -> Result<()> {
        Ok(())
    }
    fn on_epoch_end(&mut self, ctx: &mut CallbackContext) -> Result<()> {
        Ok(())
    }
    fn on_train_end(&mut self, ctx: &mut CallbackContext) -> Result<()> {
        Ok(())
    }
}

/// Ordered callback registry.
#[derive(Default)]
pub struct CallbackList {
    callbacks: Vec<Box<dyn Callback>>,
}

impl CallbackList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.callbacks.iter().map(|c| c.name()).collect()
    }

    pub fn fire(&mut self, hook: Hook, ctx: &mut CallbackContext) -> Result<()> {
        for cb in &mut self.callbacks {
            match hook {
                Hook::TrainBegin => cb.on_train_begin(ctx)?,
                Hook::EpochBegin => cb.on_epoch_begin(ctx)?,
                Hook::BatchBegin => cb.on_batch_begin(ctx)?,
                Hook::BatchEnd => cb.on_batch_end(ctx)?,
                Hook::EpochEnd => cb.on_epoch_end(ctx)?,
                Hook::TrainEnd => cb.on_train_end(ctx)?,
            }
        }
        Ok(())
    }
}

// ── LrScheduler ─────────────────────────────────────────────────────────────

enum ScheduleSource {
    /// Rebuilt at every train begin, sized to the steps of that call.
    PerRun(ScheduleKind),
    Fixed,
}

/// Sets `lr = base_lr · factor(step)` before every step.
///
/// `step` counts from the `global_step` at train begin, so each
/// `fit`/`partial_fit` call runs its own schedule over its own steps.
pub struct LrScheduler {
    source: ScheduleSource,
    schedule: Option<Box<dyn Schedule>>,
    offset: usize,
}

impl LrScheduler {
    pub fn new(kind: ScheduleKind) -> Self {
        Self {
            source: ScheduleSource::PerRun(kind),
            schedule: None,
            offset: 0,
        }
    }

    /// Use `schedule` as is for every run.
    pub fn fixed(schedule: Box<dyn Schedule>) -> Self {
        Self {
            source: ScheduleSource::Fixed,
            schedule: Some(schedule),
            offset: 0,
        }
    }

    fn apply(&self, ctx: &mut CallbackContext) -> Result<()> {
        if let Some(schedule) = &self.schedule {
            let step = ctx.global_step().saturating_sub(self.offset);
            let lr = ctx.base_lr() * schedule.checked_factor(step)?;
            ctx.set_learning_rate(lr);
        }
        Ok(())
    }
}

impl Callback for LrScheduler {
    fn name(&self) -> &str {
        "lr_scheduler"
    }

    fn on_train_begin(&mut self, ctx: &mut CallbackContext) -> Result<()> {
        if let ScheduleSource::PerRun(kind) = &self.source {
            self.schedule = Some(kind.build(ctx.planned_steps()));
        }
        self.offset = ctx.global_step();
        self.apply(ctx)
    }

    fn on_batch_end(&mut self, ctx: &mut CallbackContext) -> Result<()> {
        self.apply(ctx)
    }
}

// ── EpochLogger ─────────────────────────────────────────────────────────────

/// Logs each finished epoch, and every `log_every` batches at debug level.
pub struct EpochLogger {
    log_every: usize,
}

impl EpochLogger {
    pub fn new() -> Self {
        Self { log_every: 0 }
    }

    pub fn with_batch_logging(log_every: usize) -> Self {
        Self { log_every }
    }
}

impl Default for EpochLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Callback for EpochLogger {
    fn name(&self) -> &str {
        "epoch_logger"
    }

    fn on_batch_end(&mut self, ctx: &mut CallbackContext) -> Result<()> {
        if self.log_every > 0 && ctx.global_step() % self.log_every == 0 {
            tracing::debug!(
                step = ctx.global_step(),
                loss = ctx.batch_loss().unwrap_or(f32::NAN),
                lr = ctx.learning_rate(),
                "batch"
            );
        }
        Ok(())
    }

    fn on_epoch_end(&mut self, ctx: &mut CallbackContext) -> Result<()> {
        if let Some(rec) = ctx.history().last() {
            tracing::info!(
                epoch = rec.epoch,
                train_loss = ?rec.train_loss,
                valid_loss = ?rec.valid_loss,
                valid_acc = ?rec.valid_acc,
                skipped = rec.skipped_steps,
                secs = format!("{:.2}", rec.duration_secs),
                lr = ctx.learning_rate(),
                "epoch done"
            );
        }
        Ok(())
    }
}

// ── ProgressBar ─────────────────────────────────────────────────────────────

/// Terminal progress over the steps of one call.
#[derive(Default)]
pub struct ProgressBar {
    bar: Option<indicatif::ProgressBar>,
}

impl ProgressBar {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Callback for ProgressBar {
    fn name(&self) -> &str {
        "progress_bar"
    }

    fn on_train_begin(&mut self, ctx: &mut CallbackContext) -> Result<()> {
        let bar = indicatif::ProgressBar::new(ctx.planned_steps() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} steps {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar.enable_steady_tick(Duration::from_millis(250));
        self.bar = Some(bar);
        Ok(())
    }

    fn on_batch_end(&mut self, ctx: &mut CallbackContext) -> Result<()> {
        if let Some(bar) = &self.bar {
            bar.inc(1);
            if let Some(loss) = ctx.batch_loss() {
                bar.set_message(format!("loss {loss:.4}"));
            }
        }
        Ok(())
    }

    fn on_train_end(&mut self, _ctx: &mut CallbackContext) -> Result<()> {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message("done");
        }
        Ok(())
    }
}
