pub mod accumulation;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod evaluation;
pub mod logging;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use accumulation::{AccumulationSchedule, AccumulationState, GradientBuffer};
pub use checkpoint::{load_best, save_best, BestMetric, CheckpointDescriptor, CheckpointManifest};
pub use config::{TrainingConfig, TrainingError};
pub use data::{DocumentDataset, EvaluationLoader, TrainingBatch, TrainingLoader};
pub use evaluation::{EvaluationReport, Evaluator, StrategyReport};
pub use optimizer::{GradientScaler, OptimizerConfig, TrainerOptimizer};
pub use scheduler::{LRScheduler, ValidationCadence, WarmupCosine};
pub use trainer::Trainer;
