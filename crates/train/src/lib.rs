//! # fitloop-train — the trainable-estimator harness
//!
//! Turns a bare [`Classifier`](fitloop_core::Classifier) plus a dataset into
//! a fit/predict cycle:
//!
//! * **[`Estimator`]** — owns module, optimizer, precision backend,
//!   callbacks and history. `fit` / `partial_fit` / `predict` /
//!   `predict_proba`.
//! * **[`TrainingLoop`]** — the epoch/batch state machine with a prefetching
//!   batch producer and cooperative cancellation.
//! * **[`Schedule`]** — pure `step → lr factor` (`LinearDecay`, `Constant`,
//!   `WarmupCosine`), applied by the [`LrScheduler`] callback.
//! * **[`PrecisionBackend`]** — plain F32 or mixed F16/BF16 with dynamic
//!   loss scaling.
//! * **[`Pipeline`]** — preprocessor → estimator over raw text.

pub mod callbacks;
pub mod criterion;
pub mod estimator;
pub mod history;
pub mod metrics;
pub mod optimizer;
pub mod pipeline;
pub mod precision;
pub mod scheduler;
pub mod trainer;

pub use callbacks::{
    Callback, CallbackContext, CallbackList, EpochLogger, Hook, LoopState, LrScheduler,
    ProgressBar,
};
pub use criterion::{Criterion, CrossEntropy};
pub use estimator::{Estimator, EstimatorConfig, FitParams, PREFETCH_BUFFER};
pub use history::{BatchRecord, EpochRecord, History};
pub use metrics::{accuracy, argmax};
pub use optimizer::{BoundOptimizer, OptimizerKind};
pub use pipeline::Pipeline;
pub use precision::{LossScaleConfig, LossScaler, PrecisionBackend, PrecisionKind, StepOutcome};
pub use scheduler::{Constant, LinearDecay, Schedule, ScheduleKind, WarmupCosine};
pub use trainer::{CancelToken, LabeledSet, LoopSettings, TrainingLoop};
