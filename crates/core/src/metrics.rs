use anyhow::Result;
use candle_core::Tensor;

/// Character/symbol/line error rates for one evaluation epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochRates {
    pub cer: f64,
    pub ser: f64,
    pub ler: f64,
}

/// Edit-distance metrics over decoded transcription pairs. The computation is
/// an external collaborator; models only hand it the accumulated pairs.
pub trait PolyphonyMetrics {
    fn compute(&self, predictions: &[String], ground_truths: &[String]) -> Result<EpochRates>;
}

/// Perplexity of true continuations under predicted distributions.
///
/// `logits` is `[batch, seq, vocab]`, `target_ids` is `[batch, seq]`; the
/// implementation is expected to honor the padding id it was built with.
pub trait PerplexityMetric {
    fn compute(&self, logits: &Tensor, target_ids: &Tensor) -> Result<f64>;
}

/// Epoch-scoped buffer of decoded prediction/ground-truth pairs.
///
/// Owned by the evaluation loop; `reset` marks the epoch boundary.
#[derive(Debug, Default)]
pub struct TranscriptAccumulator {
    predictions: Vec<String>,
    ground_truths: Vec<String>,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, prediction: String, ground_truth: String) {
        self.predictions.push(prediction);
        self.ground_truths.push(ground_truth);
    }

    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    pub fn predictions(&self) -> &[String] {
        &self.predictions
    }

    pub fn ground_truths(&self) -> &[String] {
        &self.ground_truths
    }

    /// One accumulated pair, for epoch-end sample logging.
    pub fn sample_pair(&self) -> Option<(&str, &str)> {
        self.predictions
            .last()
            .zip(self.ground_truths.last())
            .map(|(p, g)| (p.as_str(), g.as_str()))
    }

    pub fn reset(&mut self) {
        self.predictions.clear();
        self.ground_truths.clear();
    }
}

/// Epoch-scoped running perplexity values, averaged at epoch end.
#[derive(Debug, Default)]
pub struct PerplexityAccumulator {
    values: Vec<f64>,
}

impl PerplexityAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }
}
