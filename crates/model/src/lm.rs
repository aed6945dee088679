use std::path::{Path, PathBuf};

use anyhow::{Result, ensure};
use candle_core::{DType, Device, IndexOp, Tensor};
use dan_omr_core::{
    DecodeCache, PerplexityAccumulator, PerplexityMetric, Vocabulary,
    tensor::token_tensor,
};
use tracing::{debug, info};

use crate::{
    adapter::DecoderAdapter,
    collab::{DecodeStepOutput, SequenceDecoder},
    loss::masked_cross_entropy,
};

/// Decoder-only language model over the symbol vocabulary.
///
/// Shares the adapter machinery with [`crate::Dan`] but runs unconditioned:
/// the decoder is switched into LM mode once at construction and never sees
/// feature sequences.
pub struct DanLm<D: SequenceDecoder> {
    adapter: DecoderAdapter<D>,
    vocab: Vocabulary,
    padding_id: u32,
    device: Device,
    out_dir: PathBuf,
}

impl<D: SequenceDecoder> DanLm<D> {
    pub fn new(
        mut decoder: D,
        vocab: Vocabulary,
        maxlen: usize,
        out_dir: impl Into<PathBuf>,
        device: Device,
    ) -> Result<Self> {
        decoder.set_lm_mode();
        let adapter = DecoderAdapter::unconditioned(decoder, maxlen)?;
        let padding_id = vocab.pad_id();
        Ok(Self {
            adapter,
            vocab,
            padding_id,
            device,
            out_dir: out_dir.into(),
        })
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn maxlen(&self) -> usize {
        self.adapter.maxlen()
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Full teacher-forced forward over a `[batch, len]` prefix, cacheless.
    pub fn forward(&self, tokens: &Tensor) -> Result<DecodeStepOutput> {
        self.adapter.decode_step(None, None, tokens, None)
    }

    /// One training step: cross-entropy loss plus a running perplexity pushed
    /// into the epoch accumulator.
    pub fn training_step(
        &self,
        decoder_input: &Tensor,
        targets: &Tensor,
        perplexity: &dyn PerplexityMetric,
        accumulator: &mut PerplexityAccumulator,
    ) -> Result<Tensor> {
        let output = self.forward(decoder_input)?;
        let loss = masked_cross_entropy(&output.logits, targets, self.padding_id)?;
        accumulator.push(perplexity.compute(&output.logits, targets)?);
        debug!(loss = loss.to_scalar::<f32>()?, "language-model training loss");
        Ok(loss)
    }

    /// Log and return the epoch's mean training perplexity, then reset.
    pub fn on_train_epoch_end(&self, accumulator: &mut PerplexityAccumulator) -> Option<f64> {
        let mean = accumulator.mean();
        if let Some(perplexity) = mean {
            info!(stage = "train", perplexity, "epoch perplexity");
        }
        accumulator.reset();
        mean
    }

    /// Teacher-forced incremental evaluation of one `[1, len]` target row.
    ///
    /// Starting from `<bos>` with an empty cache, each step collects the
    /// model's last-position distribution and then feeds the *true* next
    /// token (never the arg-max). The stacked distributions are scored
    /// against the true ids by the perplexity collaborator.
    pub fn evaluation_step(
        &self,
        targets: &Tensor,
        perplexity: &dyn PerplexityMetric,
        accumulator: &mut PerplexityAccumulator,
    ) -> Result<()> {
        let (batch, len) = targets.shape().dims2()?;
        ensure!(batch == 1, "teacher-forced evaluation expects a single row, got batch {batch}");
        ensure!(len >= 1, "evaluation targets must not be empty");
        let true_ids = targets.to_dtype(DType::U32)?.i(0)?.to_vec1::<u32>()?;

        let mut prefix = vec![self.vocab.bos_id()];
        let mut cache = DecodeCache::new();
        let mut steps = Vec::with_capacity(true_ids.len());
        for &next in &true_ids {
            let tokens = token_tensor(&prefix, &self.device)?;
            let output = self.adapter.decode_step(None, None, &tokens, Some(&mut cache))?;
            let seq = output.logits.dim(1)?;
            steps.push(output.logits.i((.., seq - 1, ..))?);
            prefix.push(next);
        }

        let stacked = Tensor::stack(&steps, 1)?;
        accumulator.push(perplexity.compute(&stacked, targets)?);
        Ok(())
    }

    /// Log and return the epoch's mean evaluation perplexity, then reset.
    pub fn on_evaluation_epoch_end(
        &self,
        accumulator: &mut PerplexityAccumulator,
        stage: &str,
    ) -> Option<f64> {
        let mean = accumulator.mean();
        if let Some(perplexity) = mean {
            info!(stage, perplexity, "epoch perplexity");
        }
        accumulator.reset();
        mean
    }
}
