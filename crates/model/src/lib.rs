pub mod config;
pub mod generation;
pub mod loss;
pub mod model;
pub mod parameters;
pub mod sequence;

pub use config::ModelConfig;
pub use generation::{BeamSettings, DecodingStrategy, GenerationRequest};
pub use loss::{CrossEntropyLoss, LossOutput, IGNORE_INDEX};
pub use model::PatchDecoder;
pub use parameters::ParameterReport;
pub use sequence::SequenceModel;
