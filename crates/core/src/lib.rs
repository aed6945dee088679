pub mod cache;
pub mod error;
pub mod metrics;
pub mod positional;
pub mod tensor;
pub mod vocab;

pub use cache::{DecodeCache, KvChunk, KvEntry};
pub use error::ModelError;
pub use metrics::{
    EpochRates, PerplexityAccumulator, PerplexityMetric, PolyphonyMetrics, TranscriptAccumulator,
};
pub use positional::PositionalEncoding2D;
pub use vocab::Vocabulary;
