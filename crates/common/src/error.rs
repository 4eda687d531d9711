//! Error taxonomy shared by every crate in the workspace.
//!
//! Numeric overflow under mixed precision is deliberately absent: it is a
//! per-step outcome handled by the precision backend, never an error.

use std::fmt;

use thiserror::Error;

/// Result alias used by the library crates.
pub type Result<T> = std::result::Result<T, FitError>;

/// Lifecycle point at which a collaborator failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Preprocess,
    Batching,
    Forward,
    Loss,
    Backward,
    OptimizerStep,
    Validation,
    Predict,
    Callback,
    Persist,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Preprocess => "preprocess",
            Self::Batching => "batching",
            Self::Forward => "forward",
            Self::Loss => "loss",
            Self::Backward => "backward",
            Self::OptimizerStep => "optimizer step",
            Self::Validation => "validation",
            Self::Predict => "predict",
            Self::Callback => "callback",
            Self::Persist => "persist",
        };
        f.write_str(s)
    }
}

/// Errors raised by the estimator harness.
#[derive(Debug, Error)]
pub enum FitError {
    /// Shape mismatch, label out of range, schedule misconfiguration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// `predict` / `partial_fit` called before the first `fit`.
    #[error("estimator is not fitted yet; call fit() first")]
    NotFitted,

    /// A module, optimizer or preprocessing collaborator failed.
    #[error("{phase} failed: {source}")]
    Collaborator {
        phase: Phase,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FitError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Wrap any collaborator error with the phase it occurred in.
    pub fn collaborator<E>(phase: Phase, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Collaborator {
            phase,
            source: Box::new(err),
        }
    }

    /// Wrap a message-only collaborator failure (e.g. tokenizer errors, which
    /// are boxed trait objects upstream).
    pub fn collaborator_msg(phase: Phase, msg: impl Into<String>) -> Self {
        let msg: String = msg.into();
        Self::Collaborator {
            phase,
            source: msg.into(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    pub fn is_not_fitted(&self) -> bool {
        matches!(self, Self::NotFitted)
    }

    /// Phase of a collaborator failure, if this is one.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Collaborator { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

/// Attach a [`Phase`] to a fallible collaborator call.
///
/// ```ignore
/// let logits = module.forward(&inputs, ctx).during(Phase::Forward)?;
/// ```
pub trait PhaseExt<T> {
    fn during(self, phase: Phase) -> Result<T>;
}

impl<T, E> PhaseExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn during(self, phase: Phase) -> Result<T> {
        self.map_err(|e| FitError::collaborator(phase, e))
    }
}
