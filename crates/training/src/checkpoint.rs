use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use codec::{
    Processor, VocabularyResize, SPECIAL_TOKENS_FILE, TOKENIZER_FILE, VOCABULARY_FILE,
};
use hex::encode as hex_encode;
use model::SequenceModel;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{TrainingConfig, TrainingError};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const BEST_DIRNAME: &str = "best";
const STAGING_DIRNAME: &str = "best.partial";
const MODEL_DIRNAME: &str = "model";
const PROCESSOR_DIRNAME: &str = "processor";
const MODEL_FILENAME: &str = "model.safetensors";
const MANIFEST_FILENAME: &str = "manifest.json";

/// Best validation metric seen so far. Only a strictly larger value counts
/// as an improvement; NaN never does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestMetric {
    value: f64,
}

impl Default for BestMetric {
    fn default() -> Self {
        Self {
            value: f64::NEG_INFINITY,
        }
    }
}

impl BestMetric {
    pub fn value(&self) -> Option<f64> {
        self.value.is_finite().then_some(self.value)
    }

    pub fn is_improvement(&self, candidate: f64) -> bool {
        candidate > self.value
    }

    /// Records `candidate` when it improves and reports whether it did.
    pub fn update(&mut self, candidate: f64) -> bool {
        if self.is_improvement(candidate) {
            self.value = candidate;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the checkpoint directory.
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub metric_name: String,
    pub metric: f64,
    pub optimizer_step: usize,
    pub epoch: usize,
    pub vocab_size: usize,
    pub model: FileRecord,
    pub processor: Vec<FileRecord>,
}

pub struct SaveRequest<'a, M: SequenceModel + ?Sized> {
    pub result_dir: &'a Path,
    pub config: &'a TrainingConfig,
    pub model: &'a M,
    pub processor: &'a Processor,
    pub metric_name: &'a str,
    pub metric: f64,
    pub optimizer_step: usize,
    pub epoch: usize,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

/// Writes model weights and processor as one pair under
/// `<result_dir>/best`, replacing the previous best only once the new pair
/// is complete.
pub fn save_best<M: SequenceModel + ?Sized>(
    request: SaveRequest<'_, M>,
) -> Result<CheckpointDescriptor, TrainingError> {
    let staging = request.result_dir.join(STAGING_DIRNAME);
    if staging.exists() {
        remove_dir(&staging)?;
    }
    create_dir(&staging.join(MODEL_DIRNAME))?;

    let model_path = staging.join(MODEL_DIRNAME).join(MODEL_FILENAME);
    save_model_weights(request.model, &model_path)?;
    let model_record = file_record(&staging, &model_path)?;

    let processor_dir = staging.join(PROCESSOR_DIRNAME);
    request.processor.save(&processor_dir)?;
    let processor_records = [TOKENIZER_FILE, VOCABULARY_FILE, SPECIAL_TOKENS_FILE]
        .iter()
        .map(|name| file_record(&staging, &processor_dir.join(name)))
        .collect::<Result<Vec<_>, _>>()?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(request.config)?,
        metric_name: request.metric_name.to_string(),
        metric: request.metric,
        optimizer_step: request.optimizer_step,
        epoch: request.epoch,
        vocab_size: request.processor.vocab_size(),
        model: model_record,
        processor: processor_records,
    };
    write_json(&staging.join(MANIFEST_FILENAME), &manifest)?;

    let best_dir = request.result_dir.join(BEST_DIRNAME);
    if best_dir.exists() {
        remove_dir(&best_dir)?;
    }
    fs::rename(&staging, &best_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to move checkpoint into {}: {err}",
            best_dir.display()
        ))
    })?;

    Ok(CheckpointDescriptor {
        directory: best_dir,
        manifest,
    })
}

/// Restores a saved pair: validates every checksum, loads the processor,
/// grows `model` to the saved vocabulary and copies the weights in.
pub fn load_best<M: SequenceModel + ?Sized>(
    directory: &Path,
    model: &mut M,
) -> Result<(Processor, CheckpointManifest), TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    for record in std::iter::once(&manifest.model).chain(manifest.processor.iter()) {
        validate_file(&directory.join(&record.filename), &record.sha256)?;
    }

    let processor = Processor::load(&directory.join(PROCESSOR_DIRNAME))?;
    if processor.vocab_size() != manifest.vocab_size {
        return Err(TrainingError::runtime(format!(
            "processor has {} tokens but the checkpoint recorded {}",
            processor.vocab_size(),
            manifest.vocab_size
        )));
    }
    model
        .resize_vocabulary(processor.vocab_size())
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to resize model to {} tokens: {err}",
                processor.vocab_size()
            ))
        })?;
    apply_model_weights(model, &directory.join(&manifest.model.filename))?;

    Ok((processor, manifest))
}

pub fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

pub fn apply_model_weights<M: SequenceModel + ?Sized>(
    model: &M,
    weights_path: &Path,
) -> Result<(), TrainingError> {
    let device = model.device().clone();
    let tensors = load_safetensors(weights_path, &device).map_err(candle_to_training_error)?;
    let mut params_by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in model.parameters() {
        let tensor = params_by_name.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::runtime(format!(
                "parameter {name} has shape {:?} in the checkpoint but {:?} in the model",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor
                .to_dtype(desired_dtype)
                .map_err(candle_to_training_error)?
        };
        var.set(&tensor).map_err(candle_to_training_error)?;
    }

    if !params_by_name.is_empty() {
        let mut extra = params_by_name.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

fn save_model_weights<M: SequenceModel + ?Sized>(
    model: &M,
    path: &Path,
) -> Result<(), TrainingError> {
    let named_parameters = model.parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let mut tensors = HashMap::with_capacity(named_parameters.len());
    for (name, var) in named_parameters {
        tensors.insert(name, var.as_tensor().clone());
    }
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(root: &Path, path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .strip_prefix(root)
        .ok()
        .and_then(|relative| relative.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .replace('\\', "/");
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn create_dir(path: &Path) -> Result<(), TrainingError> {
    fs::create_dir_all(path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            path.display()
        ))
    })
}

fn remove_dir(path: &Path) -> Result<(), TrainingError> {
    fs::remove_dir_all(path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to remove checkpoint directory {}: {err}",
            path.display()
        ))
    })
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn candle_to_training_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_strict_improvements_count() {
        let mut best = BestMetric::default();
        assert_eq!(best.value(), None);

        assert!(best.update(0.0));
        assert!(!best.update(0.0));
        assert!(best.update(0.4));
        assert!(!best.update(0.3));
        assert!(!best.update(f64::NAN));
        assert_eq!(best.value(), Some(0.4));
    }
}
