use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{evaluation::EvaluationReport, metrics::StepSnapshot, TrainingError};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(
        enable_stdout: bool,
        tensorboard_dir: Option<PathBuf>,
        flush_every: usize,
    ) -> Self {
        Self {
            enable_stdout,
            tensorboard_dir,
            tensorboard_flush_every_n: flush_every.max(1),
        }
    }
}

/// Optimizer-step telemetry beyond the loss snapshot.
#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    pub step: usize,
    pub epoch: usize,
    pub learning_rate: f64,
    pub loss_scale: f32,
    pub memory_bytes: Option<u64>,
}

pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = if let Some(dir) = settings.tensorboard_dir.as_ref() {
            Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?)
        } else {
            None
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn log_training_step(&mut self, context: &StepContext, snapshot: &StepSnapshot) {
        if self.settings.enable_stdout {
            let memory = context
                .memory_bytes
                .map(|bytes| format!(" mem={:.1}MiB", bytes as f64 / (1024.0 * 1024.0)))
                .unwrap_or_default();
            println!(
                "train epoch={} step={} loss={:.4} loss_ema={:.4} tok/s={:.1} grad_norm={:.3} lr={:.5e} scale={}{}",
                context.epoch,
                context.step,
                snapshot.step_loss,
                snapshot.loss,
                snapshot.step_tokens_per_sec,
                snapshot.raw_grad_norm,
                context.learning_rate,
                context.loss_scale,
                memory
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step_i64 = context.step as i64;
            let _ = writer.write_scalar("train/loss", step_i64, snapshot.step_loss);
            let _ = writer.write_scalar("train/loss_ema", step_i64, snapshot.loss);
            let _ = writer.write_scalar("train/grad_norm", step_i64, snapshot.raw_grad_norm);
            let _ = writer.write_scalar("train/learning_rate", step_i64, context.learning_rate);
            let _ = writer.write_scalar("train/loss_scale", step_i64, context.loss_scale as f64);
            let _ = writer.write_scalar("train/epoch", step_i64, context.epoch as f64);
            if let Some(bytes) = context.memory_bytes {
                let _ = writer.write_scalar("train/memory_bytes", step_i64, bytes as f64);
            }
        }
    }

    pub fn log_overflow(&mut self, step: usize, new_scale: f32) {
        if self.settings.enable_stdout {
            println!(
                "train step={} gradient overflow, step skipped, loss scale now {}",
                step, new_scale
            );
        }
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.write_scalar("train/loss_scale", step as i64, new_scale as f64);
        }
    }

    pub fn log_epoch(&mut self, step: usize, epoch: usize, mean_loss: f64) {
        if self.settings.enable_stdout {
            println!("epoch {} finished: mean loss={:.4}", epoch, mean_loss);
        }
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.write_scalar("train/epoch_loss", step as i64, mean_loss);
        }
    }

    pub fn log_validation(&mut self, step: usize, epoch: usize, report: &EvaluationReport) {
        if self.settings.enable_stdout {
            for strategy in &report.strategies {
                println!(
                    "validate epoch={} step={} strategy={} samples={} f1={:.4} recall={:.4} precision={:.4} anls={:.4}",
                    epoch,
                    step,
                    strategy.name,
                    strategy.samples,
                    strategy.f1,
                    strategy.recall,
                    strategy.precision,
                    strategy.anls
                );
            }
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step_i64 = step as i64;
            for strategy in &report.strategies {
                let prefix = format!("validate/{}", strategy.name);
                let _ = writer.write_scalar(&format!("{prefix}/f1"), step_i64, strategy.f1);
                let _ = writer.write_scalar(&format!("{prefix}/recall"), step_i64, strategy.recall);
                let _ = writer.write_scalar(
                    &format!("{prefix}/precision"),
                    step_i64,
                    strategy.precision,
                );
                let _ = writer.write_scalar(&format!("{prefix}/anls"), step_i64, strategy.anls);
            }
        }
    }

    pub fn log_checkpoint(&mut self, step: usize, directory: &Path, metric: f64) {
        if self.settings.enable_stdout {
            println!(
                "💾 step={} new best metric {:.4}, saved to {}",
                step,
                metric,
                directory.display()
            );
        }
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.write_scalar("validate/best_metric", step as i64, metric);
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let path = dir.join(format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        ));
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        self.write_event(&Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        })
    }

    /// TFRecord framing: length, masked CRC of the length, payload, masked
    /// CRC of the payload.
    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut payload = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut payload).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let length = (payload.len() as u64).to_le_bytes();
        let mut record = Vec::with_capacity(payload.len() + 16);
        record.extend_from_slice(&length);
        record.extend_from_slice(&masked_crc32(&length).to_le_bytes());
        record.extend_from_slice(&payload);
        record.extend_from_slice(&masked_crc32(&payload).to_le_bytes());

        self.writer.write_all(&record).map_err(|err| {
            TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
        })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricKind;
    use crate::evaluation::StrategyReport;

    #[test]
    fn records_are_length_prefixed_and_checksummed() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(LoggingSettings::from_config(
            false,
            Some(dir.path().to_path_buf()),
            1,
        ))
        .unwrap();

        logger.log_validation(
            3,
            0,
            &EvaluationReport {
                metric: MetricKind::BagF1,
                strategies: vec![StrategyReport {
                    name: "greedy".into(),
                    samples: 1,
                    f1: 0.5,
                    recall: 0.5,
                    precision: 0.5,
                    anls: 0.0,
                }],
            },
        );
        logger.flush();

        let entry = fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        let bytes = fs::read(entry.path()).unwrap();
        let len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
        let len_crc = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(len_crc, masked_crc32(&bytes[..8]));

        let event = Event::decode(&bytes[12..12 + len]).unwrap();
        assert_eq!(event.step, 3);
        let summary = event.summary.unwrap();
        assert_eq!(summary.value[0].tag, "validate/greedy/f1");
        assert_eq!(summary.value[0].simple_value, Some(0.5));

        let mut offset = 0;
        let mut records = 0;
        while offset < bytes.len() {
            let len = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap()) as usize;
            offset += 8 + 4 + len + 4;
            records += 1;
        }
        assert_eq!(offset, bytes.len());
        assert_eq!(records, 4);
    }
}
