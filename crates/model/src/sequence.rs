use candle_core::{Device, Result, Tensor, Var};
use codec::VocabularyResize;

use crate::generation::GenerationRequest;

/// The image-to-sequence model as seen by the trainer and the evaluator.
///
/// Implementations own their parameters as [`Var`]s so the optimizer can
/// update them in place. Growing the vocabulary replaces the embedding
/// parameters, so callers collect `parameters()` only after the vocabulary
/// has been frozen.
pub trait SequenceModel: VocabularyResize + Send {
    /// Next-token loss: predicts `labels[:, 1:]` from `input_ids[:, :-1]`.
    /// Label positions equal to [`crate::IGNORE_INDEX`] are skipped.
    fn forward_with_loss(
        &self,
        pixel_values: &Tensor,
        input_ids: &Tensor,
        labels: &Tensor,
    ) -> Result<Tensor>;

    /// Continues `prefix` for a single image (`pixel_values` has batch 1) and
    /// returns the full sequence, prefix included, capped at
    /// `request.max_length`.
    fn generate_from_prefix(
        &self,
        pixel_values: &Tensor,
        prefix: &[u32],
        request: &GenerationRequest,
    ) -> Result<Vec<u32>>;

    /// Named trainable parameters, names stable across save and load.
    fn parameters(&self) -> Vec<(String, Var)>;

    fn vocab_size(&self) -> usize;

    fn device(&self) -> &Device;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Drops allocator caches held by the backend, if any.
    fn release_cached_memory(&self) {}

    fn memory_usage_bytes(&self) -> Option<u64> {
        None
    }
}
