use candle_core::{DType, Device, Error, Result};

/// Configuration of the reference [`crate::PatchDecoder`].
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Initial vocabulary size. Grows through `resize_vocabulary`.
    pub vocab_size: usize,
    /// Channels of the incoming pixel tensors `(batch, channels, height, width)`.
    pub image_channels: usize,
    pub hidden_dim: usize,
    pub init_scale: f32,
    pub seed: u64,
    pub dtype: DType,
    pub device: Device,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.image_channels == 0 {
            return Err(Error::Msg("image_channels must be greater than zero".into()));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if !(self.init_scale > 0.0) {
            return Err(Error::Msg("init_scale must be positive".into()));
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "parameter dtype must be floating point, got {:?}",
                self.dtype
            )));
        }
        Ok(())
    }
}
