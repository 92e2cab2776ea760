use std::f64::consts::PI;

use crate::TrainingError;

/// Learning-rate policy advanced once per optimizer step.
pub trait LRScheduler: Send {
    /// Advances one step and returns the rate for the next optimizer step.
    fn step(&mut self) -> f64;
    /// Rate for the upcoming optimizer step.
    fn learning_rate(&self) -> f64;
    fn current_step(&self) -> usize;
}

/// Optimizer steps in a run. Accumulation carries across epochs, so a run of
/// `max_epochs * batches_per_epoch` micro-batches makes
/// `floor(micro_batches / accumulation_steps)` steps; `max_steps` replaces
/// that when smaller.
pub fn total_training_steps(
    max_epochs: usize,
    batches_per_epoch: usize,
    accumulation_steps: usize,
    max_steps: Option<usize>,
) -> usize {
    let micro_batches = max_epochs * batches_per_epoch;
    let from_epochs = micro_batches / accumulation_steps.max(1);
    let total = match max_steps {
        Some(cap) => cap.min(from_epochs),
        None => from_epochs,
    };
    total.max(1)
}

/// Linear warmup from zero, then cosine decay to zero.
///
/// The multiplier at step `s` is `s / warmup` during warmup and
/// `max(0, 0.5 * (1 + cos(pi * progress)))` afterwards, with progress clamped
/// to `[0, 1]`. Step 0 therefore runs at a rate of zero when warmup is on.
#[derive(Debug, Clone)]
pub struct WarmupCosine {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
}

impl WarmupCosine {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        Ok(Self {
            base_lr,
            warmup_steps,
            total_steps,
            step: 0,
        })
    }

    pub fn multiplier(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps as f64;
        }
        let effective = (step - self.warmup_steps) as f64;
        let denom = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        let progress = (effective / denom).clamp(0.0, 1.0);
        (0.5 * (1.0 + f64::cos(PI * progress))).max(0.0)
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

impl LRScheduler for WarmupCosine {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.learning_rate()
    }

    fn learning_rate(&self) -> f64 {
        self.base_lr * self.multiplier(self.step)
    }

    fn current_step(&self) -> usize {
        self.step
    }
}

/// Mid-epoch validation points: after batches `V, 2V, ...` of every epoch,
/// with `V = max(1, floor(batches_per_epoch * fraction))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationCadence {
    interval: usize,
}

impl ValidationCadence {
    pub fn new(batches_per_epoch: usize, fraction: f64) -> Self {
        let interval = (batches_per_epoch as f64 * fraction).floor() as usize;
        Self {
            interval: interval.max(1),
        }
    }

    pub fn interval(&self) -> usize {
        self.interval
    }

    /// `completed_batches` counts from 1 within the current epoch.
    pub fn is_due(&self, completed_batches: usize) -> bool {
        completed_batches > 0 && completed_batches % self.interval == 0
    }
}
