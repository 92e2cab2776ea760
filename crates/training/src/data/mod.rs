//! Corpus records, the encoded per-split dataset and the batch loaders.

pub mod dataset;
pub mod loader;
pub mod records;

pub use dataset::{
    mask_labels, DatasetOptions, DocumentDataset, EvaluationItem, Split, TrainingItem,
};
pub use loader::{
    EvaluationBatch, EvaluationBatches, EvaluationLoader, TrainingBatch, TrainingEpoch,
    TrainingLoader,
};
pub use records::{read_records, CorpusRecord, GroundTruth, PixelSource, SafetensorsPixelSource};

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    use codec::{Processor, ResizeError, SpecialTokens, VocabularyResize};

    pub struct SizeTracker {
        pub size: usize,
    }

    impl SizeTracker {
        pub fn new(size: usize) -> Self {
            Self { size }
        }
    }

    impl VocabularyResize for SizeTracker {
        fn resize_vocabulary(&mut self, new_size: usize) -> Result<(), ResizeError> {
            self.size = new_size;
            Ok(())
        }
    }

    /// Word-level base vocabulary with the default special tokens.
    pub fn processor(dir: &Path) -> Processor {
        let special = |id: u32, content: &str| {
            serde_json::json!({
                "id": id, "content": content, "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            })
        };
        let tokenizer = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [special(0, "<pad>"), special(1, "<unk>"), special(2, "</s>")],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": {
                    "<pad>": 0, "<unk>": 1, "</s>": 2,
                    "iced": 3, "latte": 4, "tea": 5, "2": 6, "total": 7
                },
                "unk_token": "<unk>"
            }
        });
        let path = dir.join("tokenizer.json");
        std::fs::write(&path, tokenizer.to_string()).unwrap();
        Processor::from_tokenizer_file(&path, SpecialTokens::default()).unwrap()
    }
}
