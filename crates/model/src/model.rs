use candle_core::{DType, Device, Error, IndexOp, Result, Tensor, Var, D};
use codec::{ResizeError, VocabularyResize};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{
    config::ModelConfig,
    generation::{beam_search, suppress_tokens, DecodingStrategy, GenerationRequest},
    loss::CrossEntropyLoss,
    sequence::SequenceModel,
};

/// Small image-conditioned decoder.
///
/// The image is mean-pooled per channel and projected to a context vector.
/// Each position combines its token embedding with a causal running mean of
/// the embeddings before it and the image context; logits come from the tied
/// embedding table plus an output bias.
pub struct PatchDecoder {
    config: ModelConfig,
    encoder_weight: Var,
    encoder_bias: Var,
    embedding: Var,
    mixer: Var,
    output_bias: Var,
    vocab_size: usize,
    training: bool,
    rng: StdRng,
}

impl PatchDecoder {
    /// Builds the decoder with uniformly initialised parameters.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let scale = config.init_scale;
        let hidden = config.hidden_dim;

        let encoder_weight = init_var(
            &mut rng,
            (config.image_channels, hidden),
            scale,
            config.dtype,
            &config.device,
        )?;
        let encoder_bias = Var::zeros(hidden, config.dtype, &config.device)?;
        let embedding = init_var(
            &mut rng,
            (config.vocab_size, hidden),
            scale,
            config.dtype,
            &config.device,
        )?;
        let mixer = init_var(&mut rng, (hidden, hidden), scale, config.dtype, &config.device)?;
        let output_bias = Var::zeros(config.vocab_size, config.dtype, &config.device)?;

        Ok(Self {
            vocab_size: config.vocab_size,
            config,
            encoder_weight,
            encoder_bias,
            embedding,
            mixer,
            output_bias,
            training: true,
            rng,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Produces logits shaped `(batch, seq, vocab_size)`.
    pub fn forward(&self, pixel_values: &Tensor, input_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq) = input_ids.dims2()?;
        if batch == 0 || seq == 0 {
            return Err(Error::Msg(
                "input_ids must have non-zero batch and seq dimensions".into(),
            ));
        }
        let hidden = self.config.hidden_dim;

        let image = self.encode_image(pixel_values)?;
        if image.dim(0)? != batch {
            return Err(Error::Msg(format!(
                "pixel batch {} does not match token batch {}",
                image.dim(0)?,
                batch
            )));
        }

        let ids = input_ids.to_dtype(DType::U32)?.flatten_all()?;
        let embedded = self
            .embedding
            .as_tensor()
            .index_select(&ids, 0)?
            .reshape((batch, seq, hidden))?;

        let averaging = causal_average(seq, self.config.dtype, &self.config.device)?
            .unsqueeze(0)?
            .broadcast_as((batch, seq, seq))?
            .contiguous()?;
        let context = averaging.matmul(&embedded)?;
        let mixed = context
            .reshape((batch * seq, hidden))?
            .matmul(self.mixer.as_tensor())?
            .reshape((batch, seq, hidden))?;

        let states = (embedded + mixed)?
            .broadcast_add(&image.unsqueeze(1)?)?
            .tanh()?;
        let logits = states
            .reshape((batch * seq, hidden))?
            .matmul(&self.embedding.as_tensor().t()?)?
            .broadcast_add(self.output_bias.as_tensor())?;
        logits.reshape((batch, seq, self.vocab_size))
    }

    fn encode_image(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let dims = pixel_values.dims();
        if dims.len() != 4 {
            return Err(Error::Msg(format!(
                "pixel_values expected [batch, channels, height, width] got {:?}",
                dims
            )));
        }
        if dims[1] != self.config.image_channels {
            return Err(Error::Msg(format!(
                "expected {} image channels, got {}",
                self.config.image_channels, dims[1]
            )));
        }
        let pooled = pixel_values
            .to_dtype(self.config.dtype)?
            .flatten_from(2)?
            .mean(D::Minus1)?;
        pooled
            .matmul(self.encoder_weight.as_tensor())?
            .broadcast_add(self.encoder_bias.as_tensor())?
            .tanh()
    }

    fn next_token_logits(&self, pixel_values: &Tensor, context: &[u32]) -> Result<Vec<f32>> {
        let input = Tensor::from_slice(context, (1, context.len()), &self.config.device)?;
        let logits = self.forward(pixel_values, &input)?;
        logits
            .i((0, context.len() - 1))?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()
    }

    fn random_rows(&mut self, rows: usize) -> Result<Tensor> {
        let hidden = self.config.hidden_dim;
        let scale = self.config.init_scale;
        let data: Vec<f32> = (0..rows * hidden)
            .map(|_| self.rng.gen_range(-scale..scale))
            .collect();
        Tensor::from_vec(data, (rows, hidden), &self.config.device)?.to_dtype(self.config.dtype)
    }

    fn grow(&mut self, new_size: usize) -> Result<()> {
        let extra = new_size - self.vocab_size;
        let rows = self.random_rows(extra)?;
        let embedding = Tensor::cat(&[self.embedding.as_tensor(), &rows], 0)?;
        let bias_tail = Tensor::zeros(extra, self.config.dtype, &self.config.device)?;
        let output_bias = Tensor::cat(&[self.output_bias.as_tensor(), &bias_tail], 0)?;

        self.embedding = Var::from_tensor(&embedding)?;
        self.output_bias = Var::from_tensor(&output_bias)?;
        self.vocab_size = new_size;
        Ok(())
    }
}

impl VocabularyResize for PatchDecoder {
    fn resize_vocabulary(&mut self, new_size: usize) -> std::result::Result<(), ResizeError> {
        if new_size < self.vocab_size {
            return Err(format!(
                "cannot shrink vocabulary from {} to {}",
                self.vocab_size, new_size
            )
            .into());
        }
        if new_size == self.vocab_size {
            return Ok(());
        }
        self.grow(new_size)?;
        Ok(())
    }
}

impl SequenceModel for PatchDecoder {
    fn forward_with_loss(
        &self,
        pixel_values: &Tensor,
        input_ids: &Tensor,
        labels: &Tensor,
    ) -> Result<Tensor> {
        let seq = input_ids.dim(1)?;
        if seq < 2 {
            return Err(Error::Msg(
                "next-token loss needs sequences of at least two tokens".into(),
            ));
        }
        let inputs = input_ids.narrow(1, 0, seq - 1)?;
        let targets = labels.narrow(1, 1, seq - 1)?;
        let logits = self.forward(pixel_values, &inputs)?;
        Ok(CrossEntropyLoss::new().compute(&logits, &targets)?.loss)
    }

    fn generate_from_prefix(
        &self,
        pixel_values: &Tensor,
        prefix: &[u32],
        request: &GenerationRequest,
    ) -> Result<Vec<u32>> {
        if prefix.is_empty() {
            return Err(Error::Msg("generation prefix must not be empty".into()));
        }
        if let DecodingStrategy::Beam(settings) = &request.strategy {
            return beam_search(prefix, request, settings, |tokens| {
                self.next_token_logits(pixel_values, tokens)
            });
        }

        let mut rng = StdRng::seed_from_u64(request.strategy.seed());
        let mut sequence = prefix.to_vec();

        while sequence.len() < request.max_length {
            let mut logits = self.next_token_logits(pixel_values, &sequence)?;
            suppress_tokens(&mut logits, &request.bad_token_ids);
            let Some(next) = request.strategy.select(&logits, &sequence, &mut rng) else {
                break;
            };
            sequence.push(next);
            if next == request.eos_token_id || next == request.pad_token_id {
                break;
            }
        }
        Ok(sequence)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("encoder.patch.weight".into(), self.encoder_weight.clone()),
            ("encoder.patch.bias".into(), self.encoder_bias.clone()),
            ("decoder.embedding.weight".into(), self.embedding.clone()),
            ("decoder.mixer.weight".into(), self.mixer.clone()),
            ("decoder.output.bias".into(), self.output_bias.clone()),
        ]
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn device(&self) -> &Device {
        &self.config.device
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn memory_usage_bytes(&self) -> Option<u64> {
        let bytes = self
            .parameters()
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count() * var.as_tensor().dtype().size_in_bytes())
            .sum::<usize>();
        Some(bytes as u64)
    }
}

fn init_var(
    rng: &mut StdRng,
    shape: (usize, usize),
    scale: f32,
    dtype: DType,
    device: &Device,
) -> Result<Var> {
    let data: Vec<f32> = (0..shape.0 * shape.1)
        .map(|_| rng.gen_range(-scale..scale))
        .collect();
    let tensor = Tensor::from_vec(data, shape, device)?.to_dtype(dtype)?;
    Var::from_tensor(&tensor)
}

/// Lower-triangular `(seq, seq)` matrix whose row `i` averages positions `0..=i`.
fn causal_average(seq: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; seq * seq];
    for row in 0..seq {
        let weight = 1.0 / (row + 1) as f32;
        for col in 0..=row {
            data[row * seq + col] = weight;
        }
    }
    Tensor::from_vec(data, (seq, seq), device)?.to_dtype(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig {
            vocab_size: 6,
            image_channels: 3,
            hidden_dim: 4,
            init_scale: 0.1,
            seed: 5,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    #[test]
    fn causal_average_rows_sum_to_one() -> Result<()> {
        let rows = causal_average(3, DType::F32, &Device::Cpu)?.to_vec2::<f32>()?;
        assert_eq!(rows[0], vec![1.0, 0.0, 0.0]);
        assert!((rows[2].iter().sum::<f32>() - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn shrinking_is_rejected() -> Result<()> {
        let mut model = PatchDecoder::new(config())?;
        assert!(model.resize_vocabulary(4).is_err());
        assert_eq!(model.vocab_size(), 6);
        Ok(())
    }
}
