pub mod adapter;
pub mod collab;
pub mod config;
pub mod dan;
pub mod lm;
pub mod loss;

pub use adapter::{DecoderAdapter, DecoderMode};
pub use collab::{DecodeStepOutput, Encoder, SequenceDecoder};
pub use config::{DanConfig, DanLmConfig, dan_from_config, dan_lm_from_config};
pub use dan::{Dan, TranscriptionOutcome};
pub use lm::DanLm;
pub use loss::masked_cross_entropy;
