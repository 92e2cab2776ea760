use thiserror::Error;

pub type Result<T> = std::result::Result<T, CodecError>;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde_json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    #[error("special token '{0}' is not part of the vocabulary")]
    UnknownSpecialToken(String),

    #[error("vocabulary grew to {size} tokens but the model could not be resized: {reason}")]
    ResizeFailed { size: usize, reason: String },

    #[error("invalid structure: {0}")]
    InvalidStructure(String),

    #[error("processor artifact error: {0}")]
    Artifact(String),
}

pub(crate) fn artifact<S: Into<String>>(msg: S) -> CodecError {
    CodecError::Artifact(msg.into())
}
