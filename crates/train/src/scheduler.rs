//! Learning-rate schedules.
//!
//! A schedule is a pure function of the step: it returns a multiplicative
//! factor applied to the base learning rate. It holds no step counter of its
//! own; the training loop's `global_step` drives it through the
//! [`LrScheduler`](crate::callbacks::LrScheduler) callback.

use serde::{Deserialize, Serialize};

use fitloop_common::{num_batches, FitError, Result};

/// `step → lr factor`.
pub trait Schedule: Send {
    fn factor(&self, step: usize) -> f64;

    /// Number of steps the schedule is defined for, if bounded.
    fn total_steps(&self) -> Option<usize> {
        None
    }

    /// [`factor`](Self::factor), rejecting steps past the end of a bounded
    /// schedule.
    fn checked_factor(&self, step: usize) -> Result<f64> {
        match self.total_steps() {
            Some(total) if step > total => Err(FitError::config(format!(
                "schedule step {step} is past total_steps {total}"
            ))),
            _ => Ok(self.factor(step)),
        }
    }
}

/// Steps a run will take: `epochs · ceil(n / batch_size)`.
pub fn total_steps(epochs: usize, n: usize, batch_size: usize) -> usize {
    epochs * num_batches(n, batch_size)
}

// ── LinearDecay ─────────────────────────────────────────────────────────────

/// `factor(s) = (total − s) / max(1, total)`.
///
/// 1 at step 0, strictly positive before `total`, reaching 0 at `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearDecay {
    total_steps: usize,
}

impl LinearDecay {
    pub fn new(total_steps: usize) -> Self {
        Self { total_steps }
    }

    pub fn for_run(epochs: usize, n: usize, batch_size: usize) -> Self {
        Self::new(total_steps(epochs, n, batch_size))
    }
}

impl Schedule for LinearDecay {
    fn factor(&self, step: usize) -> f64 {
        let remaining = self.total_steps.saturating_sub(step);
        remaining as f64 / self.total_steps.max(1) as f64
    }

    fn total_steps(&self) -> Option<usize> {
        Some(self.total_steps)
    }
}

// ── Constant ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct Constant;

impl Schedule for Constant {
    fn factor(&self, _step: usize) -> f64 {
        1.0
    }
}

// ── WarmupCosine ────────────────────────────────────────────────────────────

/// Linear warmup to 1, then cosine decay to `floor` at `total_steps`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarmupCosine {
    warmup_steps: usize,
    total_steps: usize,
    floor: f64,
}

impl WarmupCosine {
    pub fn new(warmup_steps: usize, total_steps: usize, floor: f64) -> Self {
        Self {
            warmup_steps,
            total_steps,
            floor,
        }
    }
}

impl Schedule for WarmupCosine {
    fn factor(&self, step: usize) -> f64 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return (step as f64 + 1.0) / self.warmup_steps as f64;
        }
        let step = step.min(self.total_steps);
        if step <= self.warmup_steps {
            return 1.0;
        }
        let decay_steps = (self.total_steps - self.warmup_steps).max(1);
        let progress = (step - self.warmup_steps) as f64 / decay_steps as f64;
        let cos = (std::f64::consts::PI * progress).cos();
        self.floor + 0.5 * (1.0 - self.floor) * (1.0 + cos)
    }

    fn total_steps(&self) -> Option<usize> {
        Some(self.total_steps)
    }
}

// ── ScheduleKind ────────────────────────────────────────────────────────────

/// Serialisable schedule selection, resolved once the run length is known.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    LinearDecay,
    Constant,
    WarmupCosine {
        warmup_steps: usize,
        #[serde(default)]
        floor: f64,
    },
}

impl Default for ScheduleKind {
    fn default() -> Self {
        Self::LinearDecay
    }
}

impl ScheduleKind {
    pub fn build(&self, total_steps: usize) -> Box<dyn Schedule> {
        match *self {
            Self::LinearDecay => Box::new(LinearDecay::new(total_steps)),
            Self::Constant => Box::new(Constant),
            Self::WarmupCosine {
                warmup_steps,
                floor,
            } => Box::new(WarmupCosine::new(warmup_steps, total_steps, floor)),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "linear" | "linear-decay" => Some(Self::LinearDecay),
            "constant" | "none" => Some(Self::Constant),
            "cosine" | "warmup-cosine" => Some(Self::WarmupCosine {
                warmup_steps: 0,
                floor: 0.0,
            }),
            _ => None,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_decay_starts_at_one_and_stays_positive() {
        let sched = LinearDecay::new(10);
        assert_eq!(sched.factor(0), 1.0);
        let mut prev = f64::INFINITY;
        for s in 0..10 {
            let f = sched.factor(s);
            assert!(f > 0.0, "factor({s}) = {f}");
            assert!(f <= prev);
            prev = f;
        }
        assert_eq!(sched.factor(10), 0.0);
    }

    #[test]
    fn linear_decay_three_epochs_of_thirteen() {
        // 100 rows, batch 8 → 13 batches per epoch.
        let sched = LinearDecay::for_run(3, 100, 8);
        assert_eq!(sched.total_steps(), Some(39));
        assert!((sched.factor(38) - 1.0 / 39.0).abs() < 1e-12);
    }

    #[test]
    fn zero_total_does_not_divide_by_zero() {
        let sched = LinearDecay::new(0);
        assert_eq!(sched.factor(0), 0.0);
        assert!(sched.checked_factor(0).is_ok());
    }

    #[test]
    fn step_past_end_is_configuration_error() {
        let sched = LinearDecay::new(5);
        assert!(sched.checked_factor(5).is_ok());
        let err = sched.checked_factor(6).unwrap_err();
        assert!(err.is_configuration());
        assert!(Constant.checked_factor(1_000_000).is_ok());
    }

    #[test]
    fn warmup_cosine_shape() {
        let sched = WarmupCosine::new(10, 110, 0.0);
        // (0+1)/10
        assert!((sched.factor(0) - 0.1).abs() < 1e-12);
        assert!((sched.factor(10) - 1.0).abs() < 1e-12);
        // midpoint of the decay: cos(π/2) = 0
        assert!((sched.factor(60) - 0.5).abs() < 1e-9);
        assert!(sched.factor(110).abs() < 1e-12);
    }

    #[test]
    fn kind_roundtrips_through_json() {
        let kind = ScheduleKind::WarmupCosine {
            warmup_steps: 4,
            floor: 0.1,
        };
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(serde_json::from_str::<ScheduleKind>(&json).unwrap(), kind);
        let lin: ScheduleKind = serde_json::from_str(r#"{"kind":"linear_decay"}"#).unwrap();
        assert_eq!(lin, ScheduleKind::LinearDecay);
        assert_eq!(lin.build(39).total_steps(), Some(39));
    }
}
