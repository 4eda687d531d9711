//! Append-only training history.

use std::path::Path;

use serde::{Deserialize, Serialize};

use fitloop_common::Result;

/// One optimizer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub loss: f32,
    pub size: usize,
    /// Learning rate the step ran with.
    pub lr: f64,
    /// `false` when the mixed backend skipped the step on overflow.
    pub applied: bool,
}

/// One epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Index across the estimator's lifetime (continues over `partial_fit`).
    pub epoch: usize,
    /// Sample-weighted mean training loss; `None` for an empty epoch.
    pub train_loss: Option<f32>,
    pub valid_loss: Option<f32>,
    pub valid_acc: Option<f32>,
    pub duration_secs: f64,
    pub skipped_steps: usize,
    /// Stopped early by a cancel request.
    #[serde(default)]
    pub interrupted: bool,
    pub batches: Vec<BatchRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    epochs: Vec<EpochRecord>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn epochs(&self) -> &[EpochRecord] {
        &self.epochs
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    /// Total batches recorded over all epochs.
    pub fn num_steps(&self) -> usize {
        self.epochs.iter().map(|e| e.batches.len()).sum()
    }

    /// Training loss per epoch, in order.
    pub fn train_losses(&self) -> Vec<Option<f32>> {
        self.epochs.iter().map(|e| e.train_loss).collect()
    }

    pub(crate) fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    pub(crate) fn clear(&mut self) {
        self.epochs.clear();
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
