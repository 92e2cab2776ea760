use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use model::{ParameterReport, SequenceModel};
use serde_json::{Map, Value};
use training::{EvaluationReport, Trainer, TrainingConfig, TrainingError};

fn main() {
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Document-parse fine-tuning CLI", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to a TOML or JSON config")]
    config: PathBuf,

    /// e.g. `--override optimizer.learning_rate=1e-4` or
    /// `--override evaluation.decoding_strategies[0].name=greedy`.
    #[arg(long = "override", value_name = "KEY=VALUE")]
    overrides: Vec<Override>,

    #[arg(long, help = "Run one validation pass and exit without training")]
    validate_only: bool,
}

#[derive(Debug, Clone)]
struct Override {
    path: Vec<Segment>,
    value: Value,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

impl FromStr for Override {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (path, value) = raw
            .split_once('=')
            .ok_or_else(|| format!("override '{raw}' is not of the form key=value"))?;
        let path = parse_path(path.trim())?;
        Ok(Self {
            path,
            value: parse_value(value.trim()),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let config = load_config(&args.config, &args.overrides)?;

    let mut trainer = Trainer::new(config)?;
    print!(
        "{}",
        ParameterReport::from_parameters(&trainer.model().parameters())
    );

    if args.validate_only {
        let report = trainer.evaluate()?;
        print_report(&report);
        return Ok(());
    }

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;

    match trainer.best_metric() {
        Some(best) => println!(
            "training finished after {} optimizer step(s); best {} = {:.4}",
            trainer.optimizer_steps(),
            trainer.config().evaluation.metric.name(),
            best
        ),
        None => println!(
            "training finished after {} optimizer step(s); no validation ran",
            trainer.optimizer_steps()
        ),
    }
    Ok(())
}

fn print_report(report: &EvaluationReport) {
    for strategy in &report.strategies {
        println!(
            "[{}] samples={} f1={:.4} recall={:.4} precision={:.4} anls={:.4}",
            strategy.name,
            strategy.samples,
            strategy.f1,
            strategy.recall,
            strategy.precision,
            strategy.anls
        );
    }
}

/// Overrides land before relative paths are resolved, so an overridden path
/// is relative to the config file like every other one.
fn load_config(path: &Path, overrides: &[Override]) -> Result<TrainingConfig, TrainingError> {
    TrainingConfig::from_path_with(path, |config| {
        if overrides.is_empty() {
            Ok(config)
        } else {
            apply_overrides(config, overrides)
        }
    })
}

/// Applies overrides on the JSON form of the config and re-validates through
/// deserialization.
fn apply_overrides(
    config: TrainingConfig,
    overrides: &[Override],
) -> Result<TrainingConfig, TrainingError> {
    let mut tree = serde_json::to_value(config)?;
    for item in overrides {
        let slot = slot_at(&mut tree, &item.path)?;
        *slot = item.value.clone();
    }
    serde_json::from_value(tree).map_err(|err| {
        TrainingError::ConfigFormat(format!("config is invalid after overrides: {err}"))
    })
}

/// Walks `path`, creating objects for missing keys and growing arrays with
/// nulls as needed.
fn slot_at<'a>(mut node: &'a mut Value, path: &[Segment]) -> Result<&'a mut Value, TrainingError> {
    for segment in path {
        if node.is_null() {
            *node = match segment {
                Segment::Key(_) => Value::Object(Map::new()),
                Segment::Index(_) => Value::Array(Vec::new()),
            };
        }
        node = match (segment, node) {
            (Segment::Key(key), Value::Object(map)) => {
                map.entry(key.clone()).or_insert(Value::Null)
            }
            (Segment::Index(index), Value::Array(items)) => {
                if items.len() <= *index {
                    items.resize(index + 1, Value::Null);
                }
                &mut items[*index]
            }
            (segment, other) => {
                return Err(TrainingError::runtime(format!(
                    "cannot apply override segment {:?} to {}",
                    segment,
                    kind(other)
                )))
            }
        };
    }
    Ok(node)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// `a.b[2].c` → `[Key(a), Key(b), Index(2), Key(c)]`.
fn parse_path(path: &str) -> Result<Vec<Segment>, String> {
    if path.is_empty() {
        return Err("override key must not be empty".to_string());
    }
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(open) => part.split_at(open),
            None => (part, ""),
        };
        if key.is_empty() {
            return Err(format!("empty key in override path '{path}'"));
        }
        segments.push(Segment::Key(key.to_string()));
        while let Some(inner) = rest.strip_prefix('[') {
            let close = inner
                .find(']')
                .ok_or_else(|| format!("unclosed index in override path '{path}'"))?;
            let index = inner[..close]
                .parse::<usize>()
                .map_err(|err| format!("invalid index in override path '{path}': {err}"))?;
            segments.push(Segment::Index(index));
            rest = &inner[close + 1..];
        }
        if !rest.is_empty() {
            return Err(format!("unexpected '{rest}' in override path '{path}'"));
        }
    }
    Ok(segments)
}

/// JSON literals (numbers, booleans, null, arrays, objects) parse as JSON;
/// anything else is taken as a plain string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn paths_split_keys_and_indices() {
        assert_eq!(
            parse_path("evaluation.decoding_strategies[1].name").unwrap(),
            vec![
                Segment::Key("evaluation".into()),
                Segment::Key("decoding_strategies".into()),
                Segment::Index(1),
                Segment::Key("name".into()),
            ]
        );
        assert!(parse_path("a..b").is_err());
        assert!(parse_path("a[x]").is_err());
    }

    #[test]
    fn values_fall_back_to_strings() {
        assert_eq!(parse_value("3e-4"), json!(3e-4));
        assert_eq!(parse_value("true"), json!(true));
        assert_eq!(parse_value("[1, 2]"), json!([1, 2]));
        assert_eq!(parse_value("receipt"), json!("receipt"));
    }

    #[test]
    fn slots_are_created_on_the_way_down() {
        let mut tree = json!({"logging": {"enable_stdout": true}});
        let path = parse_path("logging.tensorboard").unwrap();
        *slot_at(&mut tree, &path).unwrap() = json!("runs");
        let path = parse_path("evaluation.decoding_strategies[1].name").unwrap();
        *slot_at(&mut tree, &path).unwrap() = json!("sampled");

        assert_eq!(tree["logging"]["tensorboard"], json!("runs"));
        assert_eq!(tree["evaluation"]["decoding_strategies"][0], Value::Null);
        assert_eq!(
            tree["evaluation"]["decoding_strategies"][1]["name"],
            json!("sampled")
        );

        let path = parse_path("logging.enable_stdout.nested").unwrap();
        assert!(slot_at(&mut tree, &path).is_err());
    }

    #[test]
    fn overridden_paths_resolve_next_to_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            "[data]\ntrain_path = \"train.jsonl\"\nvalidation_path = \"val.jsonl\"\n\
             [processor]\ntokenizer_json = \"tokenizer.json\"\ntask_tag = \"cord\"\n",
        )
        .unwrap();
        let overrides = vec![
            "data.train_path=shards/train.jsonl".parse::<Override>().unwrap(),
            "optimizer.learning_rate=1e-4".parse::<Override>().unwrap(),
        ];

        let config = load_config(&config_path, &overrides).unwrap();
        assert_eq!(
            config.data.train_path,
            dir.path().join("shards").join("train.jsonl")
        );
        assert_eq!(config.data.validation_path, dir.path().join("val.jsonl"));
        assert!((config.optimizer.learning_rate - 1e-4).abs() < 1e-9);
    }
}
