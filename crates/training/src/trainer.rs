use std::sync::Arc;

use candle_core::{
    backprop::GradStore,
    utils::{cuda_is_available, metal_is_available},
    DType, Device, Tensor,
};
use codec::Processor;
use model::{ModelConfig, PatchDecoder, SequenceModel};

use crate::{
    accumulation::{AccumulationSchedule, AccumulationState, GradientBuffer},
    checkpoint::{self, BestMetric, SaveRequest},
    data::{
        read_records, DatasetOptions, DocumentDataset, EvaluationLoader, PixelSource,
        SafetensorsPixelSource, Split, TrainingBatch, TrainingLoader,
    },
    evaluation::{EvaluationReport, Evaluator},
    logging::{Logger, LoggingSettings, StepContext},
    metrics::{RunningMean, TrainingMetrics},
    optimizer::{GradientScaler, OptimizerConfig, TrainerOptimizer},
    scheduler::{total_training_steps, LRScheduler, ValidationCadence, WarmupCosine},
    TrainingConfig, TrainingError,
};

const CLIP_EPSILON: f64 = 1e-6;

/// Owns the model, the frozen processor and every piece of mutable training
/// state. Steps are strictly sequential and validation blocks training.
pub struct Trainer<M: SequenceModel = PatchDecoder> {
    config: TrainingConfig,
    device: Device,
    processor: Arc<Processor>,
    model: M,
    train_loader: Arc<TrainingLoader>,
    val_loader: Arc<EvaluationLoader>,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    gradient_scaler: GradientScaler,
    accumulation: AccumulationSchedule,
    gradients: GradientBuffer,
    cadence: ValidationCadence,
    evaluator: Evaluator,
    metrics: TrainingMetrics,
    logger: Logger,
    step_stats: StepStats,
    best_metric: BestMetric,
    optimizer_steps: usize,
    epoch: usize,
    log_every: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpochOutcome {
    Completed,
    StepLimit,
    Interrupted,
}

impl Trainer<PatchDecoder> {
    /// Builds the reference decoder on the best available device.
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;

        let device = select_device();
        if let Err(err) = device.set_seed(config.runtime.seed) {
            eprintln!("warning: failed to seed device RNG: {}", err);
        }

        let processor = load_processor(&config)?;
        let model = PatchDecoder::new(ModelConfig {
            vocab_size: processor.vocab_size(),
            image_channels: config.model.image_channels,
            hidden_dim: config.model.hidden_dim,
            init_scale: config.model.init_scale,
            seed: config.runtime.seed,
            dtype: config.runtime.precision.parameter_dtype(),
            device: device.clone(),
        })
        .map_err(to_runtime_error)?;
        println!("[training crate] model crate returned initialized model instance");

        Self::assemble(config, device, processor, model)
    }
}

impl<M: SequenceModel> Trainer<M> {
    /// Trains a caller-supplied model. The model is grown to the processor's
    /// vocabulary before the datasets extend it further.
    pub fn with_model(config: TrainingConfig, mut model: M) -> Result<Self, TrainingError> {
        config.validate()?;

        let processor = load_processor(&config)?;
        if model.vocab_size() != processor.vocab_size() {
            model
                .resize_vocabulary(processor.vocab_size())
                .map_err(|err| {
                    TrainingError::initialization(format!(
                        "failed to resize model to {} tokens: {err}",
                        processor.vocab_size()
                    ))
                })?;
        }
        let device = model.device().clone();

        Self::assemble(config, device, processor, model)
    }

    fn assemble(
        config: TrainingConfig,
        device: Device,
        mut processor: Processor,
        mut model: M,
    ) -> Result<Self, TrainingError> {
        let options = DatasetOptions {
            max_length: config.processor.max_length,
            sort_json_keys: config.processor.sort_json_keys,
            task_start_token: config.processor.task_start_token(),
            prompt_end_token: config.processor.prompt_end_token(),
        };

        let train_records = read_records(&config.data.train_path)?;
        let train_set = DocumentDataset::build(
            train_records,
            Split::Train,
            &mut processor,
            &mut model,
            &options,
        )?;
        let val_records = read_records(&config.data.validation_path)?;
        let val_set = DocumentDataset::build(
            val_records,
            Split::Validation,
            &mut processor,
            &mut model,
            &options,
        )?;
        println!(
            "[training crate] datasets ready (train={} validation={} vocab={})",
            train_set.len(),
            val_set.len(),
            processor.vocab_size()
        );

        // The vocabulary is frozen from here on.
        let processor = Arc::new(processor);
        let pixels: Arc<dyn PixelSource> =
            Arc::new(SafetensorsPixelSource::new(config.data.pixel_key.clone()));

        let train_loader = TrainingLoader::new(
            Arc::new(train_set),
            Arc::clone(&processor),
            Arc::clone(&pixels),
            device.clone(),
            config.data.train_batch_size,
            config.data.num_workers,
            config.data.shuffle,
            config.runtime.seed,
        )?;
        let val_loader = EvaluationLoader::new(
            Arc::new(val_set),
            Arc::clone(&processor),
            pixels,
            device.clone(),
            config.data.val_batch_size,
            config.data.num_workers,
        )?;
        println!(
            "[training crate] data loaders ready (train_batches={} val_batches={} grad_accum={})",
            train_loader.batches_per_epoch(),
            val_loader.batches(),
            config.optimizer.accumulation_steps
        );

        let named_parameters = model.parameters();
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "model produced no trainable parameters",
            ));
        }
        println!(
            "[training crate] optimizer will track {} tensor(s)",
            named_parameters.len()
        );
        let parameter_tensors: Vec<Tensor> = named_parameters
            .iter()
            .map(|(_, var)| var.as_tensor().clone())
            .collect();
        let optimizer =
            TrainerOptimizer::new(named_parameters, OptimizerConfig::from(&config.optimizer))?;

        let total_steps = total_training_steps(
            config.scheduler.max_epochs,
            train_loader.batches_per_epoch(),
            config.optimizer.accumulation_steps,
            config.scheduler.max_steps,
        );
        let scheduler: Box<dyn LRScheduler> = Box::new(WarmupCosine::new(
            config.optimizer.learning_rate as f64,
            config.scheduler.warmup_steps,
            total_steps,
        )?);
        let cadence = ValidationCadence::new(
            train_loader.batches_per_epoch(),
            config.evaluation.val_check_fraction,
        );
        println!(
            "[training crate] schedule: {} optimizer step(s), warmup {}, validation every {} batch(es)",
            total_steps,
            config.scheduler.warmup_steps,
            cadence.interval()
        );

        let logger = Logger::new(LoggingSettings::from_config(
            config.logging.enable_stdout,
            config.logging.tensorboard.clone(),
            config.logging.tensorboard_flush_every_n,
        ))?;

        Ok(Self {
            device,
            processor,
            model,
            train_loader: Arc::new(train_loader),
            val_loader: Arc::new(val_loader),
            optimizer,
            scheduler,
            gradient_scaler: GradientScaler::new(config.runtime.precision),
            accumulation: AccumulationSchedule::new(config.optimizer.accumulation_steps),
            gradients: GradientBuffer::new(parameter_tensors),
            cadence,
            evaluator: Evaluator::from_config(&config),
            metrics: TrainingMetrics::new(),
            logger,
            step_stats: StepStats::default(),
            best_metric: BestMetric::default(),
            optimizer_steps: 0,
            epoch: 0,
            log_every: config.logging.log_every_n_steps.max(1),
            config,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer_steps
    }

    pub fn best_metric(&self) -> Option<f64> {
        self.best_metric.value()
    }

    /// Current dynamic loss scale; 1.0 when scaling is off.
    pub fn loss_scale(&self) -> f32 {
        self.gradient_scaler.loss_scale()
    }

    pub fn scheduler_step(&self) -> usize {
        self.scheduler.current_step()
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs until `max_epochs`, `max_steps` or `should_stop` returns true.
    /// The flag is polled before every micro-batch.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        self.model.set_training(true);
        println!(
            "starting training on {:?} (vocab={}, pad_id={})",
            self.device,
            self.processor.vocab_size(),
            self.processor.pad_id()
        );

        for epoch in 0..self.config.scheduler.max_epochs {
            self.epoch = epoch;
            let outcome = self.run_epoch(epoch, &mut should_stop)?;
            if let Some(mean_loss) = self.metrics.finish_epoch() {
                self.logger
                    .log_epoch(self.optimizer_steps, epoch, mean_loss);
            }
            match outcome {
                EpochOutcome::Completed => {}
                EpochOutcome::StepLimit => {
                    println!(
                        "reached max_steps after {} optimizer step(s)",
                        self.optimizer_steps
                    );
                    break;
                }
                EpochOutcome::Interrupted => {
                    println!(
                        "shutdown requested; stopping after {} optimizer step(s)",
                        self.optimizer_steps
                    );
                    break;
                }
            }
        }

        self.logger.flush();
        Ok(())
    }

    /// One validation pass over every configured strategy, without touching
    /// the best checkpoint.
    pub fn evaluate(&mut self) -> Result<EvaluationReport, TrainingError> {
        let was_training = self.model.is_training();
        self.model.set_training(false);
        let report = self
            .evaluator
            .evaluate(&self.model, &self.processor, &self.val_loader);
        self.model.set_training(was_training);
        report
    }

    fn run_epoch<F>(&mut self, epoch: usize, should_stop: &mut F) -> Result<EpochOutcome, TrainingError>
    where
        F: FnMut() -> bool,
    {
        let loader = Arc::clone(&self.train_loader);
        for (position, batch) in loader.epoch(epoch).enumerate() {
            if should_stop() {
                return Ok(EpochOutcome::Interrupted);
            }
            let batch = batch?;

            self.train_micro_batch(&batch)?;
            if self.accumulation.state() == AccumulationState::Stepping {
                self.apply_step()?;
            }

            if self.cadence.is_due(position + 1) {
                self.validate()?;
            }

            if let Some(limit) = self.config.scheduler.max_steps {
                if self.optimizer_steps >= limit {
                    return Ok(EpochOutcome::StepLimit);
                }
            }
        }
        Ok(EpochOutcome::Completed)
    }

    fn train_micro_batch(&mut self, batch: &TrainingBatch) -> Result<(), TrainingError> {
        let loss = self
            .model
            .forward_with_loss(&batch.pixel_values, &batch.input_ids, &batch.labels)
            .map_err(to_runtime_error)?;
        let loss_value = scalar(&loss)?;
        if !loss_value.is_finite() {
            return Err(TrainingError::runtime(format!(
                "non-finite loss {} at epoch {} batch {}",
                loss_value, batch.epoch, batch.batch_index
            )));
        }
        self.metrics.record_micro_batch(loss_value);
        self.step_stats.record(loss_value, batch.answer_tokens as u64);

        let weighted = loss
            .affine(self.accumulation.loss_weight(), 0.0)
            .map_err(to_runtime_error)?;
        let scaled = self.gradient_scaler.scale(&weighted)?;
        let grads = scaled.backward().map_err(to_runtime_error)?;
        self.gradients.add(grads)?;
        self.accumulation.record_micro_batch()?;
        Ok(())
    }

    fn apply_step(&mut self) -> Result<(), TrainingError> {
        let Some(mut grads) = self.gradients.take() else {
            self.accumulation.finish_step();
            return Ok(());
        };

        let unscaled = self
            .gradient_scaler
            .unscale(&mut grads, self.gradients.params())?;
        if unscaled.found_overflow {
            self.gradient_scaler.update(true);
            self.logger
                .log_overflow(self.optimizer_steps, self.gradient_scaler.loss_scale());
            self.optimizer.zero_grad(&mut grads);
            self.step_stats.reset();
            self.accumulation.finish_step();
            return Ok(());
        }

        if let Some(max_norm) = self.config.optimizer.gradient_clip_threshold {
            clip_gradients(
                &mut grads,
                self.gradients.params(),
                unscaled.norm,
                max_norm as f64,
            )?;
        }

        let lr = self.scheduler.learning_rate();
        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(&mut grads)?;
        self.scheduler.step();
        self.gradient_scaler.update(false);
        self.optimizer_steps += 1;
        self.accumulation.finish_step();

        if let Some(step_loss) = self.step_stats.loss.mean() {
            let snapshot = self
                .metrics
                .record_step(self.step_stats.tokens, step_loss, unscaled.norm);
            if self.optimizer_steps % self.log_every == 0 || self.optimizer_steps == 1 {
                let context = StepContext {
                    step: self.optimizer_steps,
                    epoch: self.epoch,
                    learning_rate: lr,
                    loss_scale: self.gradient_scaler.loss_scale(),
                    memory_bytes: self.model.memory_usage_bytes(),
                };
                self.logger.log_training_step(&context, &snapshot);
            }
        }
        self.step_stats.reset();
        Ok(())
    }

    /// Scores the validation split and saves a new best pair on strict
    /// improvement of the first strategy's metric.
    fn validate(&mut self) -> Result<EvaluationReport, TrainingError> {
        self.model.release_cached_memory();
        self.model.set_training(false);
        let result = self
            .evaluator
            .evaluate(&self.model, &self.processor, &self.val_loader);
        self.model.set_training(true);
        self.model.release_cached_memory();
        let report = result?;

        self.logger
            .log_validation(self.optimizer_steps, self.epoch, &report);

        let Some(metric) = report.primary_metric() else {
            return Ok(report);
        };
        if self.best_metric.update(metric) {
            let metric_name = match report.strategies.first() {
                Some(strategy) => format!("{}/{}", strategy.name, report.metric.name()),
                None => report.metric.name().to_string(),
            };
            let descriptor = checkpoint::save_best(SaveRequest {
                result_dir: &self.config.runtime.result_dir,
                config: &self.config,
                model: &self.model,
                processor: &self.processor,
                metric_name: &metric_name,
                metric,
                optimizer_step: self.optimizer_steps,
                epoch: self.epoch,
            })?;
            self.logger
                .log_checkpoint(self.optimizer_steps, &descriptor.directory, metric);
        }
        Ok(report)
    }
}

/// Loss and answer-token count of the micro-batches in the pending step.
#[derive(Debug, Default)]
struct StepStats {
    loss: RunningMean,
    tokens: u64,
}

impl StepStats {
    fn record(&mut self, loss: f64, tokens: u64) {
        self.loss.push(loss);
        self.tokens += tokens;
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

fn select_device() -> Device {
    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    println!(
        "device detection: cuda_available={} metal_available={}",
        cuda_available, metal_available
    );

    let device = if metal_available {
        match Device::new_metal(0) {
            Ok(device) => {
                println!("device: using Metal GPU #0");
                device
            }
            Err(err) => {
                eprintln!(
                    "failed to initialize metal device, falling back to CPU: {}",
                    err
                );
                Device::Cpu
            }
        }
    } else if cuda_available {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                println!("device: using CUDA GPU #0");
                device
            }
            Err(err) => {
                eprintln!("cuda reported available but initialization failed: {err}");
                Device::Cpu
            }
        }
    } else {
        eprintln!("no GPU backend available; using CPU");
        Device::Cpu
    };

    println!(
        "device selected: is_cuda={} is_metal={} is_cpu={}",
        device.is_cuda(),
        device.is_metal(),
        device.is_cpu()
    );
    device
}

fn load_processor(config: &TrainingConfig) -> Result<Processor, TrainingError> {
    let processor_config = &config.processor;
    let processor = if let Some(dir) = processor_config.pretrained_dir.as_ref() {
        println!("[training crate] loading processor from {}", dir.display());
        Processor::load(dir)?
    } else if let Some(path) = processor_config.tokenizer_json.as_ref() {
        println!("[training crate] loading tokenizer from {}", path.display());
        Processor::from_tokenizer_file(path, processor_config.special_tokens.clone())?
    } else {
        return Err(TrainingError::initialization(
            "processor requires either tokenizer_json or pretrained_dir",
        ));
    };
    Ok(processor)
}

/// Rescales the gradients of `params` so their global norm is at most
/// `max_norm`. Returns whether anything was rescaled.
fn clip_gradients(
    grads: &mut GradStore,
    params: &[Tensor],
    total_norm: f64,
    max_norm: f64,
) -> Result<bool, TrainingError> {
    if total_norm <= max_norm {
        return Ok(false);
    }
    let clip_coef = max_norm / (total_norm + CLIP_EPSILON);
    for param in params {
        if let Some(grad) = grads.remove(param) {
            let clipped = (grad * clip_coef).map_err(to_runtime_error)?;
            grads.insert(param, clipped);
        }
    }
    Ok(true)
}

fn scalar(tensor: &Tensor) -> Result<f64, TrainingError> {
    let value = tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok(value as f64)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;

    #[test]
    fn clipping_rescales_to_the_threshold() {
        let weight = Var::new(&[3f32, 4.0], &Device::Cpu).unwrap();
        let loss = weight.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let params = vec![weight.as_tensor().clone()];

        // d/dw sum(w^2) = [6, 8], norm 10
        let clipped = clip_gradients(&mut grads, &params, 10.0, 5.0).unwrap();
        assert!(clipped);
        let grad = grads.get(&params[0]).unwrap().to_vec1::<f32>().unwrap();
        assert!((grad[0] - 3.0).abs() < 1e-4);
        assert!((grad[1] - 4.0).abs() < 1e-4);
    }

    #[test]
    fn clipping_leaves_small_gradients_alone() {
        let weight = Var::new(&[0.1f32, 0.2], &Device::Cpu).unwrap();
        let loss = weight.as_tensor().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        let params = vec![weight.as_tensor().clone()];

        let clipped = clip_gradients(&mut grads, &params, 2f64.sqrt(), 5.0).unwrap();
        assert!(!clipped);
        let grad = grads.get(&params[0]).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(grad, vec![1.0, 1.0]);
    }

    #[test]
    fn scalar_reads_reduced_precision_losses() {
        let loss = Tensor::new(1.5f32, &Device::Cpu)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();
        assert_eq!(scalar(&loss).unwrap(), 1.5);
    }
}
