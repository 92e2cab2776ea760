use candle_core::{DType, Error, Result, Tensor, D};
use candle_nn::ops;

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Token-level cross entropy that skips positions labelled [`IGNORE_INDEX`].
#[derive(Debug, Clone)]
pub struct CrossEntropyLoss {
    label_smoothing: f32,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(mut self, smoothing: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(Error::Msg(
                "label smoothing must be in [0, 1) for cross entropy".into(),
            ));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }

    /// `logits` is `(batch, seq, vocab)`, `labels` is `(batch, seq)` of `i64`.
    pub fn compute(&self, logits: &Tensor, labels: &Tensor) -> Result<LossOutput> {
        let dims = logits.dims();
        if dims.len() < 2 {
            return Err(Error::Msg(
                "cross entropy expects logits with at least two dimensions".into(),
            ));
        }
        let vocab_size = dims[dims.len() - 1];
        if vocab_size == 0 {
            return Err(Error::Msg(
                "logits vocabulary dimension must be greater than zero".into(),
            ));
        }
        let token_dims = &dims[..dims.len() - 1];
        if labels.dims() != token_dims {
            return Err(Error::Msg(format!(
                "labels shaped {:?} do not match logits {:?}",
                labels.dims(),
                dims
            )));
        }
        let token_count: usize = token_dims.iter().product();
        if token_count == 0 {
            return Err(Error::Msg("no tokens available for loss computation".into()));
        }

        let device = logits.device();
        let logits_flat = logits
            .reshape((token_count, vocab_size))?
            .to_dtype(DType::F32)?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1)?;

        let labels_flat = labels
            .to_device(device)?
            .to_dtype(DType::I64)?
            .reshape((token_count,))?;
        let valid = labels_flat.ne(IGNORE_INDEX)?;
        let safe_labels = valid
            .where_cond(&labels_flat, &labels_flat.zeros_like()?)?
            .to_dtype(DType::U32)?;
        let valid_mask = valid.to_dtype(DType::F32)?;

        let total_tokens = valid_mask.sum_all()?.to_vec0::<f32>()?.round() as usize;
        if total_tokens == 0 {
            return Err(Error::Msg(
                "every label is ignored, nothing to compute a loss on".into(),
            ));
        }

        let nll = log_probs
            .gather(&safe_labels.unsqueeze(1)?, 1)?
            .squeeze(1)?
            .neg()?;
        let per_token = if self.label_smoothing > 0.0 {
            let smoothing = self.label_smoothing as f64;
            let uniform = log_probs.mean(1)?.neg()?;
            (nll.affine(1.0 - smoothing, 0.0)? + uniform.affine(smoothing, 0.0)?)?
        } else {
            nll
        };

        let loss = (&per_token * &valid_mask)?
            .sum_all()?
            .affine(1f64 / total_tokens as f64, 0.0)?;

        let predictions = logits_flat.argmax(D::Minus1)?;
        let correct = predictions
            .eq(&safe_labels)?
            .to_dtype(DType::F32)?
            .mul(&valid_mask)?
            .sum_all()?
            .to_vec0::<f32>()?
            .round() as usize;

        Ok(LossOutput {
            loss,
            total_tokens,
            correct_tokens: correct,
        })
    }
}

impl Default for CrossEntropyLoss {
    fn default() -> Self {
        Self {
            label_smoothing: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar mean over non-ignored positions.
    pub loss: Tensor,
    pub total_tokens: usize,
    pub correct_tokens: usize,
}

impl LossOutput {
    pub fn accuracy(&self) -> f32 {
        if self.total_tokens == 0 {
            0.0
        } else {
            self.correct_tokens as f32 / self.total_tokens as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn ignored_positions_do_not_contribute() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::from_vec(
            vec![2.0f32, 0.0, 0.0, 0.0, 0.0, 9.0],
            (1, 2, 3),
            &device,
        )?;
        let only_first = Tensor::from_vec(vec![0i64, IGNORE_INDEX], (1, 2), &device)?;
        let output = CrossEntropyLoss::new().compute(&logits, &only_first)?;

        let expected = -(2f32.exp() / (2f32.exp() + 2.0)).ln();
        let loss = output.loss.to_vec0::<f32>()?;
        assert!((loss - expected).abs() < 1e-5);
        assert_eq!(output.total_tokens, 1);
        assert_eq!(output.correct_tokens, 1);
        Ok(())
    }

    #[test]
    fn fully_ignored_labels_are_an_error() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 3), DType::F32, &device)?;
        let labels = Tensor::from_vec(vec![IGNORE_INDEX, IGNORE_INDEX], (1, 2), &device)?;
        assert!(CrossEntropyLoss::new().compute(&logits, &labels).is_err());
        Ok(())
    }
}
