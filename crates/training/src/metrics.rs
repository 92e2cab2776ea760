use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Arithmetic mean accumulated one sample at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    pub fn push(&mut self, sample: f64) {
        self.sum += sample;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// `None` until a sample has been pushed.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    tokens_processed: u64,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
    grad_norm_ema: ExponentialMovingAverage,
    epoch_loss: RunningMean,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            tokens_processed: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
            grad_norm_ema: ExponentialMovingAverage::new(0.1),
            epoch_loss: RunningMean::default(),
        }
    }

    /// Every micro-batch loss counts towards the epoch mean.
    pub fn record_micro_batch(&mut self, loss: f64) {
        self.epoch_loss.push(loss);
    }

    /// Returns the mean micro-batch loss of the finished epoch and starts a
    /// new one.
    pub fn finish_epoch(&mut self) -> Option<f64> {
        std::mem::take(&mut self.epoch_loss).mean()
    }

    pub fn record_step(&mut self, tokens: u64, loss: f64, grad_norm: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.tokens_processed = self.tokens_processed.saturating_add(tokens);
        let step_tokens_per_sec = if step_duration > Duration::ZERO {
            tokens as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };
        let loss_avg = self.loss_ema.update(loss);
        let throughput_avg = self.throughput_ema.update(step_tokens_per_sec);
        let grad_norm_avg = if grad_norm.is_finite() {
            self.grad_norm_ema.update(grad_norm)
        } else {
            self.grad_norm_ema.value().unwrap_or(0.0)
        };

        StepSnapshot {
            loss: loss_avg,
            step_loss: loss,
            tokens,
            step_tokens_per_sec,
            tokens_per_sec: throughput_avg,
            grad_norm: grad_norm_avg,
            raw_grad_norm: grad_norm,
            total_tokens: self.tokens_processed,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    /// Smoothed loss.
    pub loss: f64,
    pub step_loss: f64,
    pub tokens: u64,
    pub step_tokens_per_sec: f64,
    pub tokens_per_sec: f64,
    pub grad_norm: f64,
    pub raw_grad_norm: f64,
    pub total_tokens: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_starts_at_the_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.value(), None);
        assert_eq!(ema.update(4.0), 4.0);
        assert_eq!(ema.update(2.0), 3.0);
    }

    #[test]
    fn epoch_mean_resets_between_epochs() {
        let mut metrics = TrainingMetrics::new();
        metrics.record_micro_batch(1.0);
        metrics.record_micro_batch(3.0);
        assert_eq!(metrics.finish_epoch(), Some(2.0));
        assert_eq!(metrics.finish_epoch(), None);
    }

    #[test]
    fn overflowed_steps_do_not_poison_the_norm_average() {
        let mut metrics = TrainingMetrics::new();
        metrics.record_step(10, 1.0, 2.0);
        let snapshot = metrics.record_step(10, 1.0, f64::INFINITY);
        assert_eq!(snapshot.grad_norm, 2.0);
        assert!(snapshot.raw_grad_norm.is_infinite());
    }
}
