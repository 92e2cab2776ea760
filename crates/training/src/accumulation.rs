//! Gradient accumulation as an explicit two-state machine.
//!
//! Every micro-batch runs backward and lands in [`GradientBuffer`]. Once
//! `accumulation_steps` micro-batches have been seen the machine reports
//! [`AccumulationState::Stepping`]; the trainer then unscales, clips, steps
//! the optimizer and scheduler, and calls [`AccumulationSchedule::finish_step`]
//! to return to accumulating.

use candle_core::{backprop::GradStore, Tensor};

use crate::TrainingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulationState {
    /// `pending` micro-batches are buffered, fewer than a full step.
    Accumulating { pending: usize },
    /// A full step is buffered and must be applied before the next micro-batch.
    Stepping,
}

#[derive(Debug, Clone)]
pub struct AccumulationSchedule {
    steps: usize,
    state: AccumulationState,
}

impl AccumulationSchedule {
    pub fn new(accumulation_steps: usize) -> Self {
        Self {
            steps: accumulation_steps.max(1),
            state: AccumulationState::Accumulating { pending: 0 },
        }
    }

    pub fn accumulation_steps(&self) -> usize {
        self.steps
    }

    pub fn state(&self) -> AccumulationState {
        self.state
    }

    /// Factor each micro-batch loss is multiplied by so a full step averages
    /// over its micro-batches.
    pub fn loss_weight(&self) -> f64 {
        1.0 / self.steps as f64
    }

    /// Records one micro-batch whose gradients were buffered.
    pub fn record_micro_batch(&mut self) -> Result<AccumulationState, TrainingError> {
        self.state = match self.state {
            AccumulationState::Accumulating { pending } if pending + 1 >= self.steps => {
                AccumulationState::Stepping
            }
            AccumulationState::Accumulating { pending } => AccumulationState::Accumulating {
                pending: pending + 1,
            },
            AccumulationState::Stepping => {
                return Err(TrainingError::runtime(
                    "micro-batch recorded while an optimizer step is pending",
                ))
            }
        };
        Ok(self.state)
    }

    /// Leaves the stepping state once the optimizer step (or its skip on
    /// overflow) is done.
    pub fn finish_step(&mut self) {
        self.state = AccumulationState::Accumulating { pending: 0 };
    }
}

/// Sums gradients of the tracked parameters across micro-batches.
pub struct GradientBuffer {
    params: Vec<Tensor>,
    grads: Option<GradStore>,
}

impl GradientBuffer {
    pub fn new(params: Vec<Tensor>) -> Self {
        Self {
            params,
            grads: None,
        }
    }

    pub fn params(&self) -> &[Tensor] {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_none()
    }

    pub fn add(&mut self, mut micro: GradStore) -> Result<(), TrainingError> {
        let Some(accum) = self.grads.as_mut() else {
            self.grads = Some(micro);
            return Ok(());
        };
        for tensor in &self.params {
            if let Some(grad) = micro.remove(tensor) {
                let combined = match accum.remove(tensor) {
                    Some(existing) => existing.add(&grad).map_err(to_runtime_error)?,
                    None => grad,
                };
                accum.insert(tensor, combined);
            }
        }
        Ok(())
    }

    pub fn take(&mut self) -> Option<GradStore> {
        self.grads.take()
    }

    pub fn clear(&mut self) {
        self.grads = None;
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn steps_once_every_n_micro_batches() {
        let mut schedule = AccumulationSchedule::new(3);
        let mut stepping_at = Vec::new();

        for micro_batch in 1..=9 {
            if schedule.record_micro_batch().unwrap() == AccumulationState::Stepping {
                stepping_at.push(micro_batch);
                schedule.finish_step();
            }
        }

        assert_eq!(stepping_at, vec![3, 6, 9]);
        assert!((schedule.loss_weight() - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn single_step_accumulation_steps_every_time() {
        let mut schedule = AccumulationSchedule::new(1);
        assert_eq!(
            schedule.record_micro_batch().unwrap(),
            AccumulationState::Stepping
        );
    }

    #[test]
    fn refuses_micro_batches_while_stepping() {
        let mut schedule = AccumulationSchedule::new(1);
        schedule.record_micro_batch().unwrap();
        assert!(schedule.record_micro_batch().is_err());
        schedule.finish_step();
        assert_eq!(
            schedule.state(),
            AccumulationState::Accumulating { pending: 0 }
        );
    }

    #[test]
    fn buffer_sums_micro_batch_gradients() {
        let var = Var::from_slice(&[1.0f32, 2.0], 2, &Device::Cpu).unwrap();
        let mut buffer = GradientBuffer::new(vec![var.as_tensor().clone()]);
        assert!(buffer.is_empty());

        for _ in 0..2 {
            let loss = var.as_tensor().sum_all().unwrap();
            buffer.add(loss.backward().unwrap()).unwrap();
        }

        let grads = buffer.take().unwrap();
        let summed = grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(summed, vec![2.0, 2.0]);
        assert!(buffer.is_empty());
    }
}
