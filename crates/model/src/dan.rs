use std::path::{Path, PathBuf};

use anyhow::{Result, ensure};
use candle_core::{Device, Tensor};
use dan_omr_core::{
    DecodeCache, EpochRates, PolyphonyMetrics, PositionalEncoding2D, TranscriptAccumulator,
    Vocabulary,
    tensor::{argmax_last_position, token_tensor},
};
use tracing::{debug, info};

use crate::{
    adapter::DecoderAdapter,
    collab::{DecodeStepOutput, Encoder, SequenceDecoder},
    loss::masked_cross_entropy,
};

/// Result of one greedy transcription.
#[derive(Debug)]
pub struct TranscriptionOutcome {
    /// Post-processed text (structural markers substituted).
    pub text: String,
    /// Generated ids after the leading `<bos>`, `<eos>` included when emitted.
    pub tokens: Vec<u32>,
}

/// DAN image-to-sequence transcription model.
///
/// Owns the encoder collaborator, the 2D positional table and the decoder
/// adapter in conditioned mode. The device is resolved once at construction
/// and used for every tensor the model allocates.
pub struct Dan<E: Encoder, D: SequenceDecoder> {
    encoder: E,
    positional: PositionalEncoding2D,
    adapter: DecoderAdapter<D>,
    vocab: Vocabulary,
    padding_id: u32,
    device: Device,
    out_dir: PathBuf,
}

impl<E: Encoder, D: SequenceDecoder> Dan<E, D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        encoder: E,
        decoder: D,
        d_model: usize,
        max_height: usize,
        max_width: usize,
        maxlen: usize,
        vocab: Vocabulary,
        out_dir: impl Into<PathBuf>,
        device: Device,
    ) -> Result<Self> {
        let positional = PositionalEncoding2D::new(d_model, max_height, max_width, &device)?;
        let adapter = DecoderAdapter::conditioned(decoder, maxlen)?;
        let padding_id = vocab.pad_id();
        Ok(Self {
            encoder,
            positional,
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

    pub fn positional(&self) -> &PositionalEncoding2D {
        &self.positional
    }

    pub fn maxlen(&self) -> usize {
        self.adapter.maxlen()
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Teacher-forced forward over a full `[batch, len]` prefix (`<bos>`
    /// leading); the last column is dropped, matching the shifted targets of
    /// [`Self::training_step`].
    pub fn forward(&self, images: &Tensor, decoder_input: &Tensor) -> Result<DecodeStepOutput> {
        let encoder_output = self.encoder.encode(images)?;
        let (_batch, len) = decoder_input.shape().dims2()?;
        ensure!(len >= 2, "decoder input must hold <bos> plus at least one token");
        let input = decoder_input.narrow(1, 0, len - 1)?;
        self.adapter
            .decode_image_step(&encoder_output, &self.positional, &input, None)
    }

    /// One training step: teacher-forced forward, cross-entropy against the
    /// shifted targets with padding positions ignored.
    pub fn training_step(
        &self,
        images: &Tensor,
        decoder_input: &Tensor,
        targets: &Tensor,
    ) -> Result<Tensor> {
        let (_batch, len) = decoder_input.shape().dims2()?;
        let (_tb, target_len) = targets.shape().dims2()?;
        ensure!(
            len == target_len,
            "decoder input covers {len} positions but targets cover {target_len}"
        );
        let output = self.forward(images, decoder_input)?;
        let shifted = targets.narrow(1, 0, target_len - 1)?;
        let loss = masked_cross_entropy(&output.logits, &shifted, self.padding_id)?;
        debug!(loss = loss.to_scalar::<f32>()?, "teacher-forced training loss");
        Ok(loss)
    }

    /// Greedy autoregressive transcription of a single image.
    ///
    /// Starts from `<bos>` with an empty cache, picks the arg-max token each
    /// step and stops on `<eos>` or after `maxlen` steps, whichever first.
    pub fn transcribe(&self, image: &Tensor) -> Result<TranscriptionOutcome> {
        let encoder_output = self.encoder.encode(image)?;
        let mut prefix = vec![self.vocab.bos_id()];
        let mut cache = DecodeCache::new();
        for _ in 0..self.adapter.maxlen() {
            let tokens = token_tensor(&prefix, &self.device)?;
            let output = self.adapter.decode_image_step(
                &encoder_output,
                &self.positional,
                &tokens,
                Some(&mut cache),
            )?;
            let next = argmax_last_position(&output.logits)?;
            prefix.push(next);
            if next == self.vocab.eos_id() {
                break;
            }
        }
        let text = self.vocab.decode_text(&prefix)?;
        let tokens = prefix.split_off(1);
        debug!(generated = tokens.len(), "greedy transcription finished");
        Ok(TranscriptionOutcome { text, tokens })
    }

    /// Transcribe one evaluation sample and stash the decoded pair in the
    /// epoch accumulator.
    pub fn validation_step(
        &self,
        image: &Tensor,
        ground_truth: &[u32],
        accumulator: &mut TranscriptAccumulator,
    ) -> Result<()> {
        let outcome = self.transcribe(image)?;
        let gt_text = self.vocab.decode_text(ground_truth)?;
        accumulator.push(outcome.text, gt_text);
        Ok(())
    }

    /// Score and log the epoch's accumulated pairs, then reset the buffer.
    pub fn on_validation_epoch_end(
        &self,
        accumulator: &mut TranscriptAccumulator,
        metrics: &dyn PolyphonyMetrics,
        stage: &str,
    ) -> Result<EpochRates> {
        ensure!(
            !accumulator.is_empty(),
            "no transcription pairs accumulated for stage {stage}"
        );
        let rates = metrics.compute(accumulator.predictions(), accumulator.ground_truths())?;
        if let Some((prediction, ground_truth)) = accumulator.sample_pair() {
            info!(stage, prediction, ground_truth, "epoch sample");
        }
        info!(
            stage,
            cer = rates.cer,
            ser = rates.ser,
            ler = rates.ler,
            "transcription error rates"
        );
        accumulator.reset();
        Ok(rates)
    }
}
