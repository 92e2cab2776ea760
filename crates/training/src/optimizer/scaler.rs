use candle_core::{backprop::GradStore, DType, Tensor};

use crate::{config::Precision, TrainingError};

/// Dynamic loss-scaling parameters.
#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    /// Overflow-free optimizer steps required before the scale grows.
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

/// Outcome of unscaling one accumulated step's gradients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnscaledGradients {
    pub found_overflow: bool,
    /// Global L2 norm of the unscaled gradients.
    pub norm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleChange {
    Unchanged,
    Grew,
    BackedOff,
}

/// Scales the loss before backward and undoes it on the gradients, shrinking
/// the scale whenever the gradients overflow.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    state: ScalerState,
}

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Enabled {
        loss_scale: f32,
        clean_steps: usize,
        config: LossScaleConfig,
    },
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    /// Scaling is active for every precision other than plain fp32.
    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        if precision == Precision::Fp32 {
            return Self {
                state: ScalerState::Disabled,
            };
        }
        let config = sanitize_config(config);
        Self {
            state: ScalerState::Enabled {
                loss_scale: config.initial_scale,
                clean_steps: 0,
                config,
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ScalerState::Enabled { .. })
    }

    pub fn loss_scale(&self) -> f32 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Enabled { loss_scale, .. } => *loss_scale,
        }
    }

    pub fn scale(&self, loss: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.state {
            ScalerState::Disabled => Ok(loss.clone()),
            ScalerState::Enabled { loss_scale, .. } => loss
                .affine(*loss_scale as f64, 0.0)
                .map_err(to_runtime_error),
        }
    }

    /// Divides every gradient of `params` by the current scale in place and
    /// reports overflow together with the global norm. Overflow is checked
    /// even when scaling is disabled.
    pub fn unscale(
        &self,
        grads: &mut GradStore,
        params: &[Tensor],
    ) -> Result<UnscaledGradients, TrainingError> {
        let inverse = 1.0 / self.loss_scale() as f64;
        let mut sum_squares = 0.0f64;
        let mut found_overflow = false;

        for param in params {
            let Some(grad) = grads.remove(param) else {
                continue;
            };
            let unscaled = if self.is_enabled() {
                grad.affine(inverse, 0.0).map_err(to_runtime_error)?
            } else {
                grad
            };
            let squares = squared_norm(&unscaled)?;
            if !squares.is_finite() {
                found_overflow = true;
            }
            sum_squares += squares;
            grads.insert(param, unscaled);
        }

        Ok(UnscaledGradients {
            found_overflow,
            norm: if found_overflow {
                f64::INFINITY
            } else {
                sum_squares.sqrt()
            },
        })
    }

    /// Adjusts the scale after an optimizer step attempt.
    pub fn update(&mut self, found_overflow: bool) -> ScaleChange {
        let ScalerState::Enabled {
            loss_scale,
            clean_steps,
            config,
        } = &mut self.state
        else {
            return ScaleChange::Unchanged;
        };

        if found_overflow {
            *loss_scale = (*loss_scale * config.backoff_factor).max(config.min_scale);
            *clean_steps = 0;
            return ScaleChange::BackedOff;
        }

        *clean_steps += 1;
        if *clean_steps >= config.growth_interval {
            *loss_scale = (*loss_scale * config.growth_factor).min(config.max_scale);
            *clean_steps = 0;
            return ScaleChange::Grew;
        }
        ScaleChange::Unchanged
    }
}

fn squared_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(0.0);
    }
    let sum = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok(sum as f64)
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config
        .initial_scale
        .clamp(config.min_scale, config.max_scale);
    config
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn grows_after_interval() {
        let mut scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: 512.0,
                growth_interval: 2,
                ..LossScaleConfig::default()
            },
            Precision::Mixed,
        );

        assert!(scaler.is_enabled());
        assert_eq!(scaler.update(false), ScaleChange::Unchanged);
        assert_eq!(scaler.loss_scale(), 512.0);
        assert_eq!(scaler.update(false), ScaleChange::Grew);
        assert_eq!(scaler.loss_scale(), 1024.0);
    }

    #[test]
    fn backs_off_on_overflow_and_resets_the_streak() {
        let mut scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: 1024.0,
                backoff_factor: 0.25,
                growth_interval: 2,
                ..LossScaleConfig::default()
            },
            Precision::Fp16,
        );

        scaler.update(false);
        assert_eq!(scaler.update(true), ScaleChange::BackedOff);
        assert_eq!(scaler.loss_scale(), 256.0);
        assert_eq!(scaler.update(false), ScaleChange::Unchanged);
    }

    #[test]
    fn unscale_divides_and_measures_the_norm() {
        let scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: 4.0,
                ..LossScaleConfig::default()
            },
            Precision::Mixed,
        );
        let var = Var::from_slice(&[1.0f32, 1.0], 2, &Device::Cpu).unwrap();
        let params = vec![var.as_tensor().clone()];

        // d/dw of 4 * (3 w0 + 4 w1) is [12, 16]; unscaled that is [3, 4].
        let loss = var
            .as_tensor()
            .mul(&Tensor::new(&[3.0f32, 4.0], &Device::Cpu).unwrap())
            .unwrap()
            .sum_all()
            .unwrap();
        let mut grads = scaler.scale(&loss).unwrap().backward().unwrap();

        let outcome = scaler.unscale(&mut grads, &params).unwrap();
        assert!(!outcome.found_overflow);
        assert!((outcome.norm - 5.0).abs() < 1e-5);
        let grad = grads.get(&params[0]).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(grad, vec![3.0, 4.0]);
    }

    #[test]
    fn detects_non_finite_gradients() {
        let scaler = GradientScaler::new(Precision::Fp32);
        let var = Var::from_slice(&[1.0f32], 1, &Device::Cpu).unwrap();
        let params = vec![var.as_tensor().clone()];
        let loss = var.as_tensor().affine(f64::INFINITY, 0.0).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();

        let outcome = scaler.unscale(&mut grads, &params).unwrap();
        assert!(outcome.found_overflow);
    }

    #[test]
    fn no_op_for_fp32() {
        let mut scaler = GradientScaler::new(Precision::Fp32);
        assert!(!scaler.is_enabled());
        assert_eq!(scaler.loss_scale(), 1.0);
        assert_eq!(scaler.update(true), ScaleChange::Unchanged);

        let tensor = Tensor::new(&[2.0f32, 4.0], &Device::Cpu).unwrap();
        let scaled = scaler.scale(&tensor).unwrap();
        assert_eq!(scaled.to_vec1::<f32>().unwrap(), vec![2.0, 4.0]);
    }
}
