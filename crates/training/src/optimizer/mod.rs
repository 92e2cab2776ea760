pub mod scaler;

pub use scaler::{GradientScaler, LossScaleConfig, ScaleChange, UnscaledGradients};

use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub enum OptimizerConfig {
    /// Weight decay is added to the gradient (L2 penalty).
    Adam(AdamConfig),
    /// Weight decay is applied to the weights directly.
    AdamW(AdamConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl OptimizerConfig {
    fn adam(&self) -> &AdamConfig {
        match self {
            OptimizerConfig::Adam(cfg) | OptimizerConfig::AdamW(cfg) => cfg,
        }
    }

    fn adam_mut(&mut self) -> &mut AdamConfig {
        match self {
            OptimizerConfig::Adam(cfg) | OptimizerConfig::AdamW(cfg) => cfg,
        }
    }
}

impl From<&config::OptimizerConfig> for OptimizerConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        let adam = AdamConfig {
            learning_rate: value.learning_rate as f64,
            beta1: value.beta1 as f64,
            beta2: value.beta2 as f64,
            epsilon: value.epsilon as f64,
            weight_decay: value.weight_decay as f64,
        };
        match value.algorithm {
            config::OptimizerType::Adam => OptimizerConfig::Adam(adam),
            config::OptimizerType::AdamW => OptimizerConfig::AdamW(adam),
        }
    }
}

#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl TrainerOptimizer {
    /// Tracks `named_parameters`. Parameters stored in reduced precision get an
    /// fp32 master copy that receives the updates.
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let dtype = tensor.dtype();

            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            let master = if dtype != DType::F32 {
                let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
                Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
            } else {
                None
            };

            params.push(ParameterSlot {
                param: var,
                dtype,
                master,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.adam().learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.adam_mut().learning_rate = lr;
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Applies one update from the gradients in `grads`, consuming them.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            processed.push((index, grad));
        }

        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let config = self.config;
        let cfg = *config.adam();
        let decoupled = matches!(config, OptimizerConfig::AdamW(_));

        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for (index, grad) in processed {
            let slot = &mut self.params[index];

            let base = match slot.master.as_ref() {
                Some(master) => master.as_tensor().clone(),
                None => slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?,
            };

            let grad = if !decoupled && cfg.weight_decay != 0.0 {
                let penalty = base.affine(cfg.weight_decay, 0.0).map_err(to_runtime_error)?;
                grad.add(&penalty).map_err(to_runtime_error)?
            } else {
                grad
            };

            let new_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?
                .add(&grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            let new_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?
                .add(
                    &grad
                        .sqr()
                        .map_err(to_runtime_error)?
                        .affine(1.0 - cfg.beta2, 0.0)
                        .map_err(to_runtime_error)?,
                )
                .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let decayed = if decoupled && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed.sub(&update).map_err(to_runtime_error)?;

            if let Some(master) = slot.master.as_ref() {
                master.set(&next).map_err(to_runtime_error)?;
            }
            let cast = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&cast).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
