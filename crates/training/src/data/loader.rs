use std::sync::Arc;

use candle_core::{Device, Tensor};
use codec::Processor;
use model::IGNORE_INDEX;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;

use super::dataset::DocumentDataset;
use super::records::PixelSource;
use super::Result;
use crate::TrainingError;

#[derive(Debug)]
pub struct TrainingBatch {
    /// `(batch, channels, height, width)`
    pub pixel_values: Tensor,
    /// `(batch, max_length)` u32 ids
    pub input_ids: Tensor,
    /// `(batch, max_length)` i64 labels with ignored positions set to -100
    pub labels: Tensor,
    /// Label positions that contribute to the loss.
    pub answer_tokens: usize,
    pub epoch: usize,
    pub batch_index: usize,
}

#[derive(Debug)]
pub struct EvaluationBatch {
    pub pixel_values: Tensor,
    pub input_ids: Tensor,
    pub prompt_end_indices: Vec<usize>,
    pub answers: Vec<Vec<String>>,
}

/// Shared state for both loaders. Items only read the processor, so it is
/// handed out behind an `Arc` once the vocabulary is frozen.
struct LoaderCore {
    dataset: Arc<DocumentDataset>,
    processor: Arc<Processor>,
    pixels: Arc<dyn PixelSource>,
    device: Device,
    batch_size: usize,
    pool: Option<rayon::ThreadPool>,
}

impl LoaderCore {
    fn new(
        dataset: Arc<DocumentDataset>,
        processor: Arc<Processor>,
        pixels: Arc<dyn PixelSource>,
        device: Device,
        batch_size: usize,
        num_workers: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        let pool = if num_workers > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(num_workers)
                    .build()
                    .map_err(|err| {
                        TrainingError::initialization(format!(
                            "failed to start data workers: {}",
                            err
                        ))
                    })?,
            )
        } else {
            None
        };
        Ok(Self {
            dataset,
            processor,
            pixels,
            device,
            batch_size,
            pool,
        })
    }

    fn batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn chunk<'a>(&self, order: &'a [usize], batch_index: usize) -> Option<&'a [usize]> {
        let start = batch_index * self.batch_size;
        if start >= order.len() {
            return None;
        }
        let end = (start + self.batch_size).min(order.len());
        Some(&order[start..end])
    }

    /// Builds items on the worker pool when one is configured, in order.
    fn build_items<T, F>(&self, positions: &[usize], build: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync + Send,
    {
        match &self.pool {
            Some(pool) => {
                pool.install(|| positions.par_iter().map(|&p| build(p)).collect())
            }
            None => positions.iter().map(|&p| build(p)).collect(),
        }
    }

    fn load_pixels(&self, index: usize) -> Result<Tensor> {
        let image = self.dataset.image(index)?;
        self.pixels.load(image, &self.device)
    }
}

/// Seeded, per-epoch shuffled training batches.
pub struct TrainingLoader {
    core: LoaderCore,
    shuffle: bool,
    seed: u64,
}

impl TrainingLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dataset: Arc<DocumentDataset>,
        processor: Arc<Processor>,
        pixels: Arc<dyn PixelSource>,
        device: Device,
        batch_size: usize,
        num_workers: usize,
        shuffle: bool,
        seed: u64,
    ) -> Result<Self> {
        if dataset.is_empty() {
            return Err(TrainingError::initialization(
                "training corpus is empty; no documents available",
            ));
        }
        Ok(Self {
            core: LoaderCore::new(dataset, processor, pixels, device, batch_size, num_workers)?,
            shuffle,
            seed,
        })
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.core.batches()
    }

    pub fn epoch(&self, epoch: usize) -> TrainingEpoch<'_> {
        let mut order: Vec<usize> = (0..self.core.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        println!(
            "📚 Epoch {} ready: {} documents in {} batches",
            epoch,
            order.len(),
            self.core.batches()
        );
        TrainingEpoch {
            loader: self,
            order,
            epoch,
            next_batch: 0,
        }
    }

    fn batch(&self, epoch: usize, batch_index: usize, chunk: &[usize]) -> Result<TrainingBatch> {
        let core = &self.core;
        let positions: Vec<usize> = (0..chunk.len()).collect();
        let items = core.build_items(&positions, |slot| {
            let index = chunk[slot];
            let position = batch_index * core.batch_size + slot;
            let mut rng = StdRng::seed_from_u64(item_seed(self.seed, epoch, position));
            let item = core
                .dataset
                .training_item(index, &core.processor, &mut rng)?;
            let pixels = core.load_pixels(index)?;
            Ok((pixels, item))
        })?;

        let max_length = core.dataset.max_length();
        let mut pixels = Vec::with_capacity(items.len());
        let mut ids = Vec::with_capacity(items.len() * max_length);
        let mut labels = Vec::with_capacity(items.len() * max_length);
        for (pixel, item) in items {
            pixels.push(pixel);
            ids.extend(item.input_ids);
            labels.extend(item.labels);
        }

        let answer_tokens = labels.iter().filter(|&&label| label != IGNORE_INDEX).count();
        let rows = pixels.len();
        Ok(TrainingBatch {
            pixel_values: Tensor::stack(&pixels, 0).map_err(to_runtime_error)?,
            input_ids: Tensor::from_vec(ids, (rows, max_length), &core.device)
                .map_err(to_runtime_error)?,
            labels: Tensor::from_vec(labels, (rows, max_length), &core.device)
                .map_err(to_runtime_error)?,
            answer_tokens,
            epoch,
            batch_index,
        })
    }
}

pub struct TrainingEpoch<'a> {
    loader: &'a TrainingLoader,
    order: Vec<usize>,
    epoch: usize,
    next_batch: usize,
}

impl Iterator for TrainingEpoch<'_> {
    type Item = Result<TrainingBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch_index = self.next_batch;
        let chunk = self.loader.core.chunk(&self.order, batch_index)?;
        self.next_batch += 1;
        Some(self.loader.batch(self.epoch, batch_index, chunk))
    }
}

/// Validation batches in corpus order.
pub struct EvaluationLoader {
    core: LoaderCore,
}

impl EvaluationLoader {
    pub fn new(
        dataset: Arc<DocumentDataset>,
        processor: Arc<Processor>,
        pixels: Arc<dyn PixelSource>,
        device: Device,
        batch_size: usize,
        num_workers: usize,
    ) -> Result<Self> {
        Ok(Self {
            core: LoaderCore::new(dataset, processor, pixels, device, batch_size, num_workers)?,
        })
    }

    pub fn batches(&self) -> usize {
        self.core.batches()
    }

    pub fn iter(&self) -> EvaluationBatches<'_> {
        EvaluationBatches {
            loader: self,
            order: (0..self.core.dataset.len()).collect(),
            next_batch: 0,
        }
    }

    fn batch(&self, chunk: &[usize]) -> Result<EvaluationBatch> {
        let core = &self.core;
        let items = core.build_items(chunk, |index| {
            let item = core.dataset.evaluation_item(index, &core.processor)?;
            let pixels = core.load_pixels(index)?;
            Ok((pixels, item))
        })?;

        let max_length = core.dataset.max_length();
        let mut pixels = Vec::with_capacity(items.len());
        let mut ids = Vec::with_capacity(items.len() * max_length);
        let mut prompt_end_indices = Vec::with_capacity(items.len());
        let mut answers = Vec::with_capacity(items.len());
        for (pixel, item) in items {
            pixels.push(pixel);
            ids.extend(item.input_ids);
            prompt_end_indices.push(item.prompt_end_index);
            answers.push(item.answers);
        }

        let rows = pixels.len();
        Ok(EvaluationBatch {
            pixel_values: Tensor::stack(&pixels, 0).map_err(to_runtime_error)?,
            input_ids: Tensor::from_vec(ids, (rows, max_length), &core.device)
                .map_err(to_runtime_error)?,
            prompt_end_indices,
            answers,
        })
    }
}

pub struct EvaluationBatches<'a> {
    loader: &'a EvaluationLoader,
    order: Vec<usize>,
    next_batch: usize,
}

impl Iterator for EvaluationBatches<'_> {
    type Item = Result<EvaluationBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.loader.core.chunk(&self.order, self.next_batch)?;
        self.next_batch += 1;
        Some(self.loader.batch(chunk))
    }
}

/// Per-item seed so the alternative picked for a position does not depend on
/// which worker builds it.
fn item_seed(seed: u64, epoch: usize, position: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add((epoch as u64) << 32)
        .wrapping_add(position as u64)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::{DatasetOptions, Split};
    use crate::data::records::{CorpusRecord, GroundTruth};
    use crate::data::test_support::{processor, SizeTracker};
    use candle_core::DType;
    use codec::StructuredValue;
    use std::path::{Path, PathBuf};

    struct ConstantPixels;

    impl PixelSource for ConstantPixels {
        fn load(&self, _image: &Path, device: &Device) -> Result<Tensor> {
            Tensor::ones((3, 2, 2), DType::F32, device).map_err(to_runtime_error)
        }
    }

    fn fixture(count: usize) -> (Arc<DocumentDataset>, Arc<Processor>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut processor = processor(dir.path());
        let mut model = SizeTracker::new(processor.vocab_size());
        let records = (0..count)
            .map(|index| CorpusRecord {
                image: PathBuf::from(format!("{index}.safetensors")),
                ground_truth: GroundTruth::Multiple(vec![
                    StructuredValue::from_json_str(r#"{"menu": "tea"}"#).unwrap(),
                    StructuredValue::from_json_str(r#"{"menu": "iced latte"}"#).unwrap(),
                ]),
            })
            .collect();
        let options = DatasetOptions {
            max_length: 8,
            sort_json_keys: false,
            task_start_token: "<s_receipt>".into(),
            prompt_end_token: "<s_receipt>".into(),
        };
        let dataset =
            DocumentDataset::build(records, Split::Train, &mut processor, &mut model, &options)
                .unwrap();
        (Arc::new(dataset), Arc::new(processor), dir)
    }

    fn loader(count: usize, workers: usize) -> (TrainingLoader, tempfile::TempDir) {
        let (dataset, processor, dir) = fixture(count);
        let loader = TrainingLoader::new(
            dataset,
            processor,
            Arc::new(ConstantPixels),
            Device::Cpu,
            2,
            workers,
            true,
            11,
        )
        .unwrap();
        (loader, dir)
    }

    #[test]
    fn epoch_covers_every_sample_with_a_short_tail() {
        let (loader, _dir) = loader(5, 0);
        assert_eq!(loader.batches_per_epoch(), 3);

        let batches: Vec<TrainingBatch> = loader.epoch(0).map(|batch| batch.unwrap()).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].input_ids.dims(), &[2, 8]);
        assert_eq!(batches[0].pixel_values.dims(), &[2, 3, 2, 2]);
        assert_eq!(batches[2].labels.dims(), &[1, 8]);
        assert_eq!(batches[2].labels.dtype(), DType::I64);
        // <s_receipt> <s_menu> ... </s_menu> </s>: everything after the prompt
        assert!(batches[2].answer_tokens >= 4);
    }

    #[test]
    fn same_seed_and_epoch_replay_identically() {
        let (serial, _a) = loader(6, 0);
        let (parallel, _b) = loader(6, 3);

        for epoch in 0..2 {
            let left: Vec<Vec<Vec<u32>>> = serial
                .epoch(epoch)
                .map(|batch| batch.unwrap().input_ids.to_vec2::<u32>().unwrap())
                .collect();
            let right: Vec<Vec<Vec<u32>>> = parallel
                .epoch(epoch)
                .map(|batch| batch.unwrap().input_ids.to_vec2::<u32>().unwrap())
                .collect();
            assert_eq!(left, right);
        }
    }

    #[test]
    fn evaluation_batches_carry_prompt_indices_and_answers() {
        let (dataset, processor, _dir) = fixture(3);
        let loader = EvaluationLoader::new(
            dataset,
            processor,
            Arc::new(ConstantPixels),
            Device::Cpu,
            2,
            0,
        )
        .unwrap();

        let batches: Vec<EvaluationBatch> = loader.iter().map(|batch| batch.unwrap()).collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].prompt_end_indices, vec![0, 0]);
        assert_eq!(batches[1].answers.len(), 1);
        assert_eq!(batches[1].answers[0].len(), 2);
    }
}
