//! Structured ground truth ⇄ flat token sequences.
//!
//! Document parses are nested key/value structures. This crate flattens them
//! into tag-delimited text (`<s_key>value</s_key>`, sequence elements joined by
//! `<sep/>`) and back, and maintains the vocabulary that grows as new key tags
//! are discovered.
//!
//! # Encoding
//!
//! [`TokenCodec::encode`] is pure: it never mutates the vocabulary. The tags a
//! value introduces are returned in [`Encoding::discovered`] and the caller
//! decides whether to register them (only the training split does).
//!
//! # Vocabulary
//!
//! [`VocabularyRegistry`] assigns stable ids on top of a base tokenizer
//! vocabulary. Growth is propagated to the model through the
//! [`VocabularyResize`] capability; a failed resize is an error, never a
//! silent mismatch between vocabulary and embedding table.
//!
//! # Processor
//!
//! [`Processor`] couples the registry with a HuggingFace
//! [`tokenizers::Tokenizer`] and the pad/eos/unk special tokens. It is the unit
//! that is saved next to model weights.

pub mod errors;

mod decode;
mod encode;
mod processor;
mod value;
mod vocabulary;

pub use decode::decode;
pub use encode::{
    categorical_tag, end_tag, start_tag, Encoding, TokenCodec, TokenLookup, SEPARATOR_TOKEN,
    TEXT_SEQUENCE_KEY,
};
pub use errors::{CodecError, Result};
pub use processor::{
    Processor, SpecialTokens, SPECIAL_TOKENS_FILE, TOKENIZER_FILE, VOCABULARY_FILE,
};
pub use value::StructuredValue;
pub use vocabulary::{
    AddedToken, ResizeError, VocabularyRegistry, VocabularyResize, VocabularySnapshot,
};
