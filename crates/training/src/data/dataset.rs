use std::path::{Path, PathBuf};

use codec::{Processor, TokenCodec, VocabularyResize};
use model::IGNORE_INDEX;
use rand::Rng;

use super::records::CorpusRecord;
use super::Result;
use crate::TrainingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
}

impl Split {
    /// Only the training split may introduce key tags into the vocabulary.
    pub fn registers_key_tags(self) -> bool {
        matches!(self, Split::Train)
    }
}

#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub max_length: usize,
    pub sort_json_keys: bool,
    pub task_start_token: String,
    pub prompt_end_token: String,
}

#[derive(Debug, Clone)]
struct DocumentSample {
    image: PathBuf,
    /// Full target strings: task start, encoded parse, eos.
    targets: Vec<String>,
}

/// Token ids and masked labels for one training example.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingItem {
    pub input_ids: Vec<u32>,
    pub labels: Vec<i64>,
}

/// Generation prompt material and the acceptable answers for one example.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationItem {
    pub input_ids: Vec<u32>,
    pub prompt_end_index: usize,
    pub answers: Vec<String>,
}

/// Encoded corpus for one split.
///
/// Building the dataset is the only place the vocabulary grows; once `build`
/// returns, items only read the processor.
#[derive(Debug, Clone)]
pub struct DocumentDataset {
    split: Split,
    samples: Vec<DocumentSample>,
    max_length: usize,
    prompt_end_id: u32,
}

impl DocumentDataset {
    pub fn build(
        records: Vec<CorpusRecord>,
        split: Split,
        processor: &mut Processor,
        model: &mut dyn VocabularyResize,
        options: &DatasetOptions,
    ) -> Result<Self> {
        if options.max_length < 2 {
            return Err(TrainingError::initialization(
                "max_length must be at least 2",
            ));
        }

        let codec = TokenCodec::new(options.sort_json_keys);
        let eos = processor.special_tokens().eos.clone();
        let mut samples = Vec::with_capacity(records.len());

        for record in records {
            let mut targets = Vec::with_capacity(record.ground_truth.alternatives().len());
            for parse in record.ground_truth.alternatives() {
                let encoding = codec.encode(parse, &*processor);
                if split.registers_key_tags() && !encoding.discovered.is_empty() {
                    processor.add_tokens(&encoding.discovered, model)?;
                }
                let mut target = String::with_capacity(
                    options.task_start_token.len() + encoding.text.len() + eos.len(),
                );
                if !encoding.text.starts_with(&options.task_start_token) {
                    target.push_str(&options.task_start_token);
                }
                target.push_str(&encoding.text);
                target.push_str(&eos);
                targets.push(target);
            }
            samples.push(DocumentSample {
                image: record.image,
                targets,
            });
        }

        processor.add_tokens(
            &[
                options.task_start_token.as_str(),
                options.prompt_end_token.as_str(),
            ],
            model,
        )?;
        processor.set_prompt_end(options.prompt_end_token.clone());
        let prompt_end_id = processor.prompt_end_id().ok_or_else(|| {
            TrainingError::initialization(format!(
                "prompt end token '{}' is not registered",
                options.prompt_end_token
            ))
        })?;

        for (index, sample) in samples.iter().enumerate() {
            for target in &sample.targets {
                let ids = processor.tokenize(target, options.max_length)?;
                if !ids.contains(&prompt_end_id) {
                    return Err(TrainingError::data(format!(
                        "sample {} ({}): prompt end token '{}' missing from tokenized target",
                        index,
                        sample.image.display(),
                        options.prompt_end_token
                    )));
                }
                let labels = mask_labels(&ids, processor.pad_id(), prompt_end_id);
                if labels.iter().all(|&label| label == IGNORE_INDEX) {
                    return Err(TrainingError::data(format!(
                        "sample {} ({}): no answer tokens fit after '{}' within max_length {}",
                        index,
                        sample.image.display(),
                        options.prompt_end_token,
                        options.max_length
                    )));
                }
            }
        }

        Ok(Self {
            split,
            samples,
            max_length: options.max_length,
            prompt_end_id,
        })
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn prompt_end_id(&self) -> u32 {
        self.prompt_end_id
    }

    pub fn image(&self, index: usize) -> Result<&Path> {
        Ok(self.sample(index)?.image.as_path())
    }

    pub fn targets(&self, index: usize) -> Result<&[String]> {
        Ok(&self.sample(index)?.targets)
    }

    /// Picks one alternative uniformly with `rng` and masks everything but the
    /// answer region.
    pub fn training_item<R: Rng + ?Sized>(
        &self,
        index: usize,
        processor: &Processor,
        rng: &mut R,
    ) -> Result<TrainingItem> {
        let targets = &self.sample(index)?.targets;
        let choice = rng.gen_range(0..targets.len());
        let input_ids = processor.tokenize(&targets[choice], self.max_length)?;
        let labels = mask_labels(&input_ids, processor.pad_id(), self.prompt_end_id);
        Ok(TrainingItem { input_ids, labels })
    }

    /// Uses the first alternative as the prompt source and keeps every
    /// alternative as an acceptable answer.
    pub fn evaluation_item(&self, index: usize, processor: &Processor) -> Result<EvaluationItem> {
        let targets = &self.sample(index)?.targets;
        let input_ids = processor.tokenize(&targets[0], self.max_length)?;
        let prompt_end_index = input_ids
            .iter()
            .position(|&id| id == self.prompt_end_id)
            .ok_or_else(|| {
                TrainingError::data(format!("sample {} lost its prompt end token", index))
            })?;
        Ok(EvaluationItem {
            input_ids,
            prompt_end_index,
            answers: targets.clone(),
        })
    }

    fn sample(&self, index: usize) -> Result<&DocumentSample> {
        self.samples.get(index).ok_or_else(|| {
            TrainingError::data(format!(
                "sample index {} out of range for {} samples",
                index,
                self.samples.len()
            ))
        })
    }
}

/// Labels for next-token loss: pad positions and every position up to and
/// including the first prompt-end id become [`IGNORE_INDEX`].
pub fn mask_labels(input_ids: &[u32], pad_id: u32, prompt_end_id: u32) -> Vec<i64> {
    let prompt_end = input_ids.iter().position(|&id| id == prompt_end_id);
    input_ids
        .iter()
        .enumerate()
        .map(|(position, &id)| {
            let in_prompt = prompt_end.is_some_and(|end| position <= end);
            if id == pad_id || in_prompt {
                IGNORE_INDEX
            } else {
                id as i64
            }
        })
        .collect()
}
