use candle_core::DType;
use codec::{CodecError, SpecialTokens};
use model::DecodingStrategy;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub data: DataConfig,
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path_with(path, Ok)
    }

    /// Like [`TrainingConfig::from_path`], with `adjust` applied to the config
    /// as written, before relative paths are resolved against the config's
    /// directory and before validation.
    pub fn from_path_with<F>(path: impl AsRef<Path>, adjust: F) -> Result<Self, TrainingError>
    where
        F: FnOnce(Self) -> Result<Self, TrainingError>,
    {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        config = adjust(config)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.processor.tokenizer_json.is_none() && self.processor.pretrained_dir.is_none() {
            errors.push(
                "processor must provide either `tokenizer_json` or `pretrained_dir`".to_string(),
            );
        }

        if self.processor.task_tag.trim().is_empty() {
            errors.push("processor.task_tag must not be empty".to_string());
        }

        if self.processor.max_length < 2 {
            errors.push("processor.max_length must be at least 2".to_string());
        }

        if self.data.train_batch_size == 0 {
            errors.push("data.train_batch_size must be greater than 0".to_string());
        }

        if self.data.val_batch_size == 0 {
            errors.push("data.val_batch_size must be greater than 0".to_string());
        }

        if self.optimizer.accumulation_steps == 0 {
            errors.push("optimizer.accumulation_steps must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if let Some(threshold) = self.optimizer.gradient_clip_threshold {
            if threshold <= 0.0 {
                errors.push("optimizer.gradient_clip_threshold must be greater than 0".to_string());
            }
        }

        if self.scheduler.max_epochs == 0 {
            errors.push("scheduler.max_epochs must be greater than 0".to_string());
        }

        if let Some(0) = self.scheduler.max_steps {
            errors.push("scheduler.max_steps must be greater than 0".to_string());
        }

        if !(self.evaluation.val_check_fraction > 0.0 && self.evaluation.val_check_fraction <= 1.0)
        {
            errors.push("evaluation.val_check_fraction must be in (0, 1]".to_string());
        }

        if !(0.0..=1.0).contains(&self.evaluation.anls_threshold) {
            errors.push("evaluation.anls_threshold must be in [0, 1]".to_string());
        }

        if self.evaluation.decoding_strategies.is_empty() {
            errors.push("evaluation.decoding_strategies must not be empty".to_string());
        }

        for named in &self.evaluation.decoding_strategies {
            if named.name.trim().is_empty() {
                errors.push("evaluation.decoding_strategies entries need a name".to_string());
            }
            if let Err(message) = named.strategy.validate() {
                errors.push(format!(
                    "evaluation.decoding_strategies '{}': {}",
                    named.name, message
                ));
            }
        }

        if let Some(0) = self.evaluation.limit_batches {
            errors.push("evaluation.limit_batches must be greater than 0".to_string());
        }

        if self.model.hidden_dim == 0 {
            errors.push("model.hidden_dim must be greater than 0".to_string());
        }

        if self.model.image_channels == 0 {
            errors.push("model.image_channels must be greater than 0".to_string());
        }

        if self.runtime.result_dir.as_os_str().is_empty() {
            errors.push("runtime.result_dir must not be empty".to_string());
        }

        if self.logging.log_every_n_steps == 0 {
            errors.push("logging.log_every_n_steps must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.processor.apply_base_path(base);
        absolutize_in_place(&mut self.runtime.result_dir, base);
        if let Some(dir) = self.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// JSON Lines corpus, one `{"image", "ground_truth"}` record per line.
    pub train_path: PathBuf,
    pub validation_path: PathBuf,
    #[serde(default = "default_train_batch_size")]
    pub train_batch_size: usize,
    #[serde(default = "default_val_batch_size")]
    pub val_batch_size: usize,
    /// Threads used to assemble batch items; 0 builds them on the caller.
    #[serde(default)]
    pub num_workers: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
    /// Tensor name inside each pixel `.safetensors` file.
    #[serde(default = "default_pixel_key")]
    pub pixel_key: String,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.train_path, base);
        absolutize_in_place(&mut self.validation_path, base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default)]
    pub tokenizer_json: Option<PathBuf>,
    /// A processor directory written by a previous run. Takes precedence over
    /// `tokenizer_json`.
    #[serde(default)]
    pub pretrained_dir: Option<PathBuf>,
    #[serde(default)]
    pub special_tokens: SpecialTokens,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_true")]
    pub sort_json_keys: bool,
    /// Selects the prompt tokens: `<s_{task_tag}>` starts every target.
    pub task_tag: String,
    /// Defaults to the task start token.
    #[serde(default)]
    pub prompt_end_token: Option<String>,
}

impl ProcessorConfig {
    pub fn task_start_token(&self) -> String {
        codec::start_tag(&self.task_tag)
    }

    pub fn prompt_end_token(&self) -> String {
        self.prompt_end_token
            .clone()
            .unwrap_or_else(|| self.task_start_token())
    }

    fn apply_base_path(&mut self, base: &Path) {
        for path in [self.tokenizer_json.as_mut(), self.pretrained_dir.as_mut()]
            .into_iter()
            .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

/// Hyperparameters of the reference decoder. The vocabulary size always
/// comes from the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    #[serde(default = "default_image_channels")]
    pub image_channels: usize,
    #[serde(default = "default_init_scale")]
    pub init_scale: f32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            hidden_dim: default_hidden_dim(),
            image_channels: default_image_channels(),
            init_scale: default_init_scale(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default)]
    pub weight_decay: f32,
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f32,
    #[serde(default = "default_accumulation_steps")]
    pub accumulation_steps: usize,
    /// Global gradient-norm cap applied at every optimizer step.
    #[serde(default = "default_gradient_clip_threshold")]
    pub gradient_clip_threshold: Option<f32>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            accumulation_steps: default_accumulation_steps(),
            gradient_clip_threshold: default_gradient_clip_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    #[default]
    Adam,
    AdamW,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    /// Hard cap on optimizer steps; the schedule horizon is the smaller of
    /// this and the epoch-derived count.
    #[serde(default)]
    pub max_steps: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            warmup_steps: default_warmup_steps(),
            max_epochs: default_max_epochs(),
            max_steps: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub precision: Precision,
    /// Root of the best-checkpoint directory.
    #[serde(default = "default_result_dir")]
    pub result_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            precision: Precision::default(),
            result_dir: default_result_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_val_check_fraction")]
    pub val_check_fraction: f64,
    #[serde(default)]
    pub metric: MetricKind,
    /// Match items on `(text, label)` instead of `text` alone.
    #[serde(default)]
    pub strict_matching: bool,
    #[serde(default = "default_anls_threshold")]
    pub anls_threshold: f64,
    /// Evaluated in order; the first one gates best-checkpointing.
    #[serde(default = "default_decoding_strategies")]
    pub decoding_strategies: Vec<NamedStrategy>,
    #[serde(default)]
    pub limit_batches: Option<usize>,
    #[serde(default)]
    pub verbose: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            val_check_fraction: default_val_check_fraction(),
            metric: MetricKind::default(),
            strict_matching: false,
            anls_threshold: default_anls_threshold(),
            decoding_strategies: default_decoding_strategies(),
            limit_batches: None,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamedStrategy {
    pub name: String,
    #[serde(default)]
    pub strategy: DecodingStrategy,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Bag-of-items F1 over `{text, label}` items.
    #[default]
    BagF1,
    /// Average normalized Levenshtein similarity against the best answer.
    Anls,
}

impl MetricKind {
    pub fn name(self) -> &'static str {
        match self {
            MetricKind::BagF1 => "f1",
            MetricKind::Anls => "anls",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
            log_every_n_steps: default_log_every_n_steps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
    /// fp32 parameters with dynamic loss scaling.
    Mixed,
}

impl Precision {
    pub fn parameter_dtype(self) -> DType {
        match self {
            Precision::Fp32 | Precision::Mixed => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_true() -> bool {
    true
}

fn default_train_batch_size() -> usize {
    4
}

fn default_val_batch_size() -> usize {
    1
}

fn default_pixel_key() -> String {
    "pixel_values".to_string()
}

fn default_max_length() -> usize {
    128
}

fn default_hidden_dim() -> usize {
    64
}

fn default_image_channels() -> usize {
    3
}

fn default_init_scale() -> f32 {
    0.02
}

fn default_learning_rate() -> f32 {
    3e-5
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_adam_eps() -> f32 {
    1e-8
}

fn default_accumulation_steps() -> usize {
    1
}

fn default_gradient_clip_threshold() -> Option<f32> {
    Some(0.25)
}

fn default_warmup_steps() -> usize {
    10_000
}

fn default_max_epochs() -> usize {
    30
}

fn default_seed() -> u64 {
    42
}

fn default_result_dir() -> PathBuf {
    PathBuf::from("result")
}

fn default_val_check_fraction() -> f64 {
    0.2
}

fn default_anls_threshold() -> f64 {
    0.5
}

fn default_decoding_strategies() -> Vec<NamedStrategy> {
    vec![NamedStrategy {
        name: "greedy".to_string(),
        strategy: DecodingStrategy::Greedy,
    }]
}

fn default_tensorboard_flush_every_n() -> usize {
    1
}

fn default_log_every_n_steps() -> usize {
    10
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Data(String),
    Codec(CodecError),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Data(msg) => write!(f, "invalid dataset: {}", msg),
            TrainingError::Codec(err) => write!(f, "vocabulary or tokenization failed: {}", err),
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::Codec(err) => Some(err),
            TrainingError::ConfigFormat(_) => None,
            TrainingError::Validation(_) => None,
            TrainingError::Initialization(_)
            | TrainingError::Data(_)
            | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<CodecError> for TrainingError {
    fn from(value: CodecError) -> Self {
        TrainingError::Codec(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [data]
        train_path = "train.jsonl"
        validation_path = "validation.jsonl"

        [processor]
        tokenizer_json = "tokenizer.json"
        task_tag = "funsd"
    "#;

    #[test]
    fn defaults_follow_the_reference_recipe() {
        let config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.processor.max_length, 128);
        assert_eq!(config.data.train_batch_size, 4);
        assert_eq!(config.data.val_batch_size, 1);
        assert_eq!(config.optimizer.gradient_clip_threshold, Some(0.25));
        assert_eq!(config.scheduler.warmup_steps, 10_000);
        assert_eq!(config.evaluation.val_check_fraction, 0.2);
        assert_eq!(config.evaluation.decoding_strategies[0].name, "greedy");
        assert_eq!(config.processor.task_start_token(), "<s_funsd>");
        assert_eq!(config.processor.prompt_end_token(), "<s_funsd>");
        config.validate().unwrap();
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.data.train_batch_size = 0;
        config.evaluation.val_check_fraction = 0.0;
        config.evaluation.decoding_strategies.clear();

        match config.validate() {
            Err(TrainingError::Validation(messages)) => assert_eq!(messages.len(), 3),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn load_resolves_paths_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, MINIMAL).unwrap();

        let config = TrainingConfig::load(&path).unwrap();
        assert_eq!(config.data.train_path, dir.path().join("train.jsonl"));
        assert_eq!(config.runtime.result_dir, dir.path().join("result"));
    }

    #[test]
    fn adjusted_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, MINIMAL).unwrap();

        let config = TrainingConfig::from_path_with(&path, |mut config| {
            config.data.train_path = PathBuf::from("shards/train.jsonl");
            Ok(config)
        })
        .unwrap();
        assert_eq!(
            config.data.train_path,
            dir.path().join("shards").join("train.jsonl")
        );
    }

    #[test]
    fn strategies_parse_from_toml_tables() {
        let source = format!(
            "{MINIMAL}\n[[evaluation.decoding_strategies]]\nname = \"nucleus\"\n\
             [evaluation.decoding_strategies.strategy]\nkind = \"sampling\"\ntop_p = 0.95\ntop_k = 40\n"
        );
        let config: TrainingConfig = toml::from_str(&source).unwrap();
        let named = &config.evaluation.decoding_strategies[0];
        assert_eq!(named.name, "nucleus");
        assert!(matches!(
            named.strategy,
            DecodingStrategy::Sampling { top_k: 40, .. }
        ));
    }

    #[test]
    fn beam_strategies_parse_and_validate() {
        let source = format!(
            "{MINIMAL}\n[[evaluation.decoding_strategies]]\nname = \"beam5\"\n\
             [evaluation.decoding_strategies.strategy]\nkind = \"beam\"\nnum_beams = 5\n\
             no_repeat_ngram_size = 8\n"
        );
        let config: TrainingConfig = toml::from_str(&source).unwrap();
        match &config.evaluation.decoding_strategies[0].strategy {
            DecodingStrategy::Beam(settings) => {
                assert_eq!(settings.num_beams, 5);
                assert_eq!(settings.no_repeat_ngram_size, 8);
                assert!(!settings.early_stopping);
            }
            other => panic!("expected beam, got {other:?}"),
        }

        let broken = source.replace("num_beams = 5", "num_beams = 0");
        let config: TrainingConfig = toml::from_str(&broken).unwrap();
        assert!(config.validate().is_err());
    }
}
