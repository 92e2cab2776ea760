//! Generation-based validation.
//!
//! For every example the prompt (ids up to and including the prompt-end
//! token) is continued by the model, the output is decoded and postprocessed
//! into items, and the items are scored against every acceptable answer.
//! The same validation set is run once per configured decoding strategy.

pub mod anls;
pub mod bag;
pub mod postprocess;

pub use anls::anls;
pub use bag::{bag_of_items, BagScore};
pub use postprocess::{ParsedItem, Postprocessor, TagPostprocessor};

use candle_core::IndexOp;
use codec::Processor;
use model::{GenerationRequest, SequenceModel};

use crate::{
    config::{MetricKind, NamedStrategy, TrainingConfig},
    data::{EvaluationBatch, EvaluationLoader},
    metrics::RunningMean,
    TrainingError,
};

#[derive(Debug, Clone)]
pub struct EvaluationSettings {
    pub metric: MetricKind,
    pub strict_matching: bool,
    pub anls_threshold: f64,
    pub strategies: Vec<NamedStrategy>,
    pub limit_batches: Option<usize>,
    pub max_length: usize,
    pub verbose: bool,
}

impl EvaluationSettings {
    pub fn from_config(config: &TrainingConfig) -> Self {
        let evaluation = &config.evaluation;
        Self {
            metric: evaluation.metric,
            strict_matching: evaluation.strict_matching,
            anls_threshold: evaluation.anls_threshold,
            strategies: evaluation.decoding_strategies.clone(),
            limit_batches: evaluation.limit_batches,
            max_length: config.processor.max_length,
            verbose: evaluation.verbose,
        }
    }
}

/// Scores of one decoding strategy over one validation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyReport {
    pub name: String,
    pub samples: usize,
    pub f1: f64,
    pub recall: f64,
    pub precision: f64,
    pub anls: f64,
}

impl StrategyReport {
    pub fn metric(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::BagF1 => self.f1,
            MetricKind::Anls => self.anls,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub metric: MetricKind,
    pub strategies: Vec<StrategyReport>,
}

impl EvaluationReport {
    /// The configured metric under the first strategy; this is what gates
    /// best-checkpointing.
    pub fn primary_metric(&self) -> Option<f64> {
        self.strategies
            .first()
            .map(|report| report.metric(self.metric))
    }
}

pub struct Evaluator {
    settings: EvaluationSettings,
    postprocessor: Box<dyn Postprocessor>,
}

impl Evaluator {
    pub fn new(settings: EvaluationSettings, postprocessor: Box<dyn Postprocessor>) -> Self {
        Self {
            settings,
            postprocessor,
        }
    }

    /// Evaluator with the tag postprocessor for the configured prompt tokens.
    pub fn from_config(config: &TrainingConfig) -> Self {
        let postprocessor = TagPostprocessor::new(
            &config.processor.special_tokens,
            &config.processor.task_start_token(),
            &config.processor.prompt_end_token(),
        );
        Self::new(EvaluationSettings::from_config(config), Box::new(postprocessor))
    }

    pub fn settings(&self) -> &EvaluationSettings {
        &self.settings
    }

    pub fn evaluate<M: SequenceModel + ?Sized>(
        &self,
        model: &M,
        processor: &Processor,
        loader: &EvaluationLoader,
    ) -> Result<EvaluationReport, TrainingError> {
        let strategies = self
            .settings
            .strategies
            .iter()
            .map(|named| self.evaluate_strategy(model, processor, loader, named))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EvaluationReport {
            metric: self.settings.metric,
            strategies,
        })
    }

    fn evaluate_strategy<M: SequenceModel + ?Sized>(
        &self,
        model: &M,
        processor: &Processor,
        loader: &EvaluationLoader,
        named: &NamedStrategy,
    ) -> Result<StrategyReport, TrainingError> {
        let request = GenerationRequest {
            max_length: self.settings.max_length,
            eos_token_id: processor.eos_id(),
            pad_token_id: processor.pad_id(),
            bad_token_ids: vec![processor.unk_id()],
            strategy: named.strategy.clone(),
        };

        let mut f1 = RunningMean::default();
        let mut recall = RunningMean::default();
        let mut precision = RunningMean::default();
        let mut anls_mean = RunningMean::default();

        let limit = self.settings.limit_batches.unwrap_or(usize::MAX);
        for batch in loader.iter().take(limit) {
            let batch = batch?;
            for sample in self.score_batch(model, processor, &batch, &request)? {
                if self.settings.verbose && f1.count() == 0 {
                    println!("\n----------------------------------------");
                    println!("[{}] Prediction: {}", named.name, sample.prediction);
                    println!("\tAnswer: {}", sample.answer);
                    println!("\tF1-Score: {:.4}", sample.bag.f1);
                }
                f1.push(sample.bag.f1);
                recall.push(sample.bag.recall);
                precision.push(sample.bag.precision);
                anls_mean.push(sample.anls);
            }
        }

        Ok(StrategyReport {
            name: named.name.clone(),
            samples: f1.count(),
            f1: f1.mean().unwrap_or(0.0),
            recall: recall.mean().unwrap_or(0.0),
            precision: precision.mean().unwrap_or(0.0),
            anls: anls_mean.mean().unwrap_or(0.0),
        })
    }

    fn score_batch<M: SequenceModel + ?Sized>(
        &self,
        model: &M,
        processor: &Processor,
        batch: &EvaluationBatch,
        request: &GenerationRequest,
    ) -> Result<Vec<SampleScore>, TrainingError> {
        let mut scores = Vec::with_capacity(batch.answers.len());
        for (row, answers) in batch.answers.iter().enumerate() {
            let pixels = batch
                .pixel_values
                .narrow(0, row, 1)
                .map_err(to_runtime_error)?;
            let ids = batch
                .input_ids
                .i(row)
                .and_then(|ids| ids.to_vec1::<u32>())
                .map_err(to_runtime_error)?;
            let prompt_end = batch.prompt_end_indices[row];
            let prefix = ids.get(..=prompt_end).ok_or_else(|| {
                TrainingError::runtime(format!(
                    "prompt end index {} outside a sequence of {}",
                    prompt_end,
                    ids.len()
                ))
            })?;

            let generated = model
                .generate_from_prefix(&pixels, prefix, request)
                .map_err(to_runtime_error)?;
            let prediction = processor.decode(&generated, false)?;
            scores.push(self.score_sample(processor, prediction, answers));
        }
        Ok(scores)
    }

    /// Bag scores take the best-matching answer; ANLS takes the closest one.
    fn score_sample(
        &self,
        processor: &Processor,
        prediction: String,
        answers: &[String],
    ) -> SampleScore {
        let predicted_items = self.postprocessor.items(&prediction, processor);
        let mut best: Option<(BagScore, &String)> = None;
        for answer in answers {
            let expected = self.postprocessor.items(answer, processor);
            let score = bag_of_items(&expected, &predicted_items, self.settings.strict_matching);
            if best.map_or(true, |(current, _)| score.f1 > current.f1) {
                best = Some((score, answer));
            }
        }
        let (bag, answer) = match best {
            Some((score, answer)) => (score, answer.clone()),
            None => (BagScore::default(), String::new()),
        };

        let answer_texts: Vec<String> = answers
            .iter()
            .map(|answer| self.postprocessor.answer_text(answer, processor))
            .collect();
        let predicted_text = self.postprocessor.answer_text(&prediction, processor);
        let anls = anls(&predicted_text, &answer_texts, self.settings.anls_threshold);

        SampleScore {
            prediction,
            answer,
            bag,
            anls,
        }
    }
}

struct SampleScore {
    prediction: String,
    answer: String,
    bag: BagScore,
    anls: f64,
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_metric_follows_the_first_strategy() {
        let report = |name: &str, f1: f64, anls: f64| StrategyReport {
            name: name.into(),
            samples: 4,
            f1,
            recall: f1,
            precision: f1,
            anls,
        };
        let mut evaluation = EvaluationReport {
            metric: MetricKind::BagF1,
            strategies: vec![report("greedy", 0.25, 0.9), report("nucleus", 0.75, 0.1)],
        };
        assert_eq!(evaluation.primary_metric(), Some(0.25));

        evaluation.metric = MetricKind::Anls;
        assert_eq!(evaluation.primary_metric(), Some(0.9));

        evaluation.strategies.clear();
        assert_eq!(evaluation.primary_metric(), None);
    }
}
