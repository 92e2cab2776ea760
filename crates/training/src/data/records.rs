use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use candle_core::{DType, Device, Tensor};
use codec::StructuredValue;
use serde::Deserialize;
use serde_json::Value;

use super::Result;
use crate::TrainingError;

/// One line of a JSON Lines corpus.
#[derive(Debug, Clone)]
pub struct CorpusRecord {
    pub image: PathBuf,
    pub ground_truth: GroundTruth,
}

/// The acceptable parses of one document.
#[derive(Debug, Clone, PartialEq)]
pub enum GroundTruth {
    /// `{"gt_parse": {...}}`
    Single(StructuredValue),
    /// `{"gt_parses": [{...}, ...]}`, several acceptable answers.
    Multiple(Vec<StructuredValue>),
}

impl GroundTruth {
    /// Accepts the ground-truth object itself or a string holding its JSON.
    pub fn parse(raw: &Value) -> Result<Self> {
        let owned;
        let object = match raw {
            Value::String(text) => {
                owned = serde_json::from_str::<Value>(text).map_err(|err| {
                    TrainingError::data(format!("ground_truth is not valid JSON: {}", err))
                })?;
                &owned
            }
            other => other,
        };
        let Value::Object(map) = object else {
            return Err(TrainingError::data("ground_truth must be a JSON object"));
        };

        match (map.get("gt_parse"), map.get("gt_parses")) {
            (Some(_), Some(_)) => Err(TrainingError::data(
                "ground_truth has both `gt_parse` and `gt_parses`",
            )),
            (None, None) => Err(TrainingError::data(
                "ground_truth needs `gt_parse` or `gt_parses`",
            )),
            (Some(single), None) => Ok(GroundTruth::Single(parse_object(single, "gt_parse")?)),
            (None, Some(Value::Array(items))) => {
                if items.is_empty() {
                    return Err(TrainingError::data("`gt_parses` must not be empty"));
                }
                let parses = items
                    .iter()
                    .map(|item| parse_object(item, "gt_parses entry"))
                    .collect::<Result<Vec<_>>>()?;
                Ok(GroundTruth::Multiple(parses))
            }
            (None, Some(_)) => Err(TrainingError::data("`gt_parses` must be a list")),
        }
    }

    pub fn alternatives(&self) -> &[StructuredValue] {
        match self {
            GroundTruth::Single(value) => std::slice::from_ref(value),
            GroundTruth::Multiple(values) => values,
        }
    }
}

fn parse_object(value: &Value, what: &str) -> Result<StructuredValue> {
    if !value.is_object() {
        return Err(TrainingError::data(format!("{} must be a JSON object", what)));
    }
    Ok(StructuredValue::from(value.clone()))
}

#[derive(Deserialize)]
struct RawRecord {
    image: PathBuf,
    ground_truth: Value,
}

/// Reads a JSON Lines corpus. Image paths are resolved against the corpus
/// file's directory; blank lines are skipped.
pub fn read_records(path: &Path) -> Result<Vec<CorpusRecord>> {
    let file = File::open(path).map_err(|err| {
        TrainingError::data(format!("failed to open corpus {}: {}", path.display(), err))
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let line_no = index + 1;
        let raw: RawRecord = serde_json::from_str(&line).map_err(|err| {
            TrainingError::data(format!("{}:{}: {}", path.display(), line_no, err))
        })?;
        let ground_truth = GroundTruth::parse(&raw.ground_truth).map_err(|err| {
            TrainingError::data(format!("{}:{}: {}", path.display(), line_no, err))
        })?;
        let image = if raw.image.is_relative() {
            base.join(raw.image)
        } else {
            raw.image
        };
        records.push(CorpusRecord {
            image,
            ground_truth,
        });
    }
    Ok(records)
}

/// Produces the `(channels, height, width)` pixel tensor of a record.
pub trait PixelSource: Send + Sync {
    fn load(&self, image: &Path, device: &Device) -> Result<Tensor>;
}

/// Reads preprocessed pixels stored under `key` in a `.safetensors` file.
#[derive(Debug, Clone)]
pub struct SafetensorsPixelSource {
    key: String,
}

impl SafetensorsPixelSource {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl PixelSource for SafetensorsPixelSource {
    fn load(&self, image: &Path, device: &Device) -> Result<Tensor> {
        let mut tensors: HashMap<String, Tensor> =
            candle_core::safetensors::load(image, device).map_err(|err| {
                TrainingError::data(format!("failed to read {}: {}", image.display(), err))
            })?;
        let tensor = tensors.remove(&self.key).ok_or_else(|| {
            TrainingError::data(format!(
                "{} has no tensor named '{}'",
                image.display(),
                self.key
            ))
        })?;
        let tensor = match tensor.rank() {
            3 => tensor,
            4 if tensor.dim(0).map_err(to_data_error)? == 1 => {
                tensor.squeeze(0).map_err(to_data_error)?
            }
            _ => {
                return Err(TrainingError::data(format!(
                    "{}: pixels must be (channels, height, width), got {:?}",
                    image.display(),
                    tensor.dims()
                )))
            }
        };
        tensor.to_dtype(DType::F32).map_err(to_data_error)
    }
}

fn to_data_error(err: candle_core::Error) -> TrainingError {
    TrainingError::data(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    #[test]
    fn parses_single_and_multiple_forms() {
        let single = GroundTruth::parse(&json!({"gt_parse": {"menu": "tea"}})).unwrap();
        assert_eq!(single.alternatives().len(), 1);

        let multiple = GroundTruth::parse(&json!({
            "gt_parses": [{"answer": "a"}, {"answer": "b"}]
        }))
        .unwrap();
        assert_eq!(multiple.alternatives().len(), 2);
    }

    #[test]
    fn accepts_ground_truth_stored_as_a_string() {
        let raw = Value::String(r#"{"gt_parse": {"k": "v"}}"#.into());
        let parsed = GroundTruth::parse(&raw).unwrap();
        assert_eq!(
            parsed.alternatives()[0].get("k"),
            Some(&StructuredValue::leaf("v"))
        );
    }

    #[test]
    fn rejects_malformed_ground_truth() {
        for raw in [
            json!({}),
            json!({"gt_parse": {"a": "1"}, "gt_parses": [{"a": "1"}]}),
            json!({"gt_parse": "flat"}),
            json!({"gt_parses": {"a": "1"}}),
            json!({"gt_parses": []}),
            json!({"gt_parses": [{"a": "1"}, 3]}),
            json!([1, 2]),
        ] {
            assert!(
                matches!(GroundTruth::parse(&raw), Err(TrainingError::Data(_))),
                "accepted {raw}"
            );
        }
    }

    #[test]
    fn read_records_reports_the_failing_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        fs::write(
            &path,
            "{\"image\": \"a.safetensors\", \"ground_truth\": {\"gt_parse\": {\"k\": \"v\"}}}\n\n\
             {\"image\": \"b.safetensors\", \"ground_truth\": {}}\n",
        )
        .unwrap();

        let err = read_records(&path).unwrap_err();
        assert!(err.to_string().contains(":3:"), "{err}");
    }

    #[test]
    fn image_paths_resolve_next_to_the_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        fs::write(
            &path,
            "{\"image\": \"img/a.safetensors\", \"ground_truth\": {\"gt_parse\": {\"k\": \"v\"}}}\n",
        )
        .unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records[0].image, dir.path().join("img/a.safetensors"));
    }

    #[test]
    fn safetensors_source_squeezes_a_leading_batch_axis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.safetensors");
        let pixels = Tensor::ones((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        candle_core::safetensors::save(
            &HashMap::from([("pixel_values".to_string(), pixels)]),
            &path,
        )
        .unwrap();

        let source = SafetensorsPixelSource::new("pixel_values");
        let loaded = source.load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.dims(), &[3, 4, 4]);

        let missing = SafetensorsPixelSource::new("image");
        assert!(missing.load(&path, &Device::Cpu).is_err());
    }
}
