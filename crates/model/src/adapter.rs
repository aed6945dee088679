use anyhow::Result;
use candle_core::Tensor;
use dan_omr_core::{
    DecodeCache, ModelError, PositionalEncoding2D,
    tensor::flatten_spatial,
};

use crate::collab::{DecodeStepOutput, SequenceDecoder};

/// Conditioning capability, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderMode {
    /// Image-conditioned transcription: every step requires the flattened
    /// encoder features and their position-enhanced counterpart.
    Conditioned,
    /// Pure language modelling: no feature sequences are accepted.
    Unconditioned,
}

/// Wraps an external [`SequenceDecoder`], owning mode enforcement, the
/// `maxlen` bound and the feature flattening in front of it.
pub struct DecoderAdapter<D: SequenceDecoder> {
    decoder: D,
    mode: DecoderMode,
    maxlen: usize,
}

impl<D: SequenceDecoder> DecoderAdapter<D> {
    pub fn conditioned(decoder: D, maxlen: usize) -> Result<Self> {
        Self::with_mode(decoder, DecoderMode::Conditioned, maxlen)
    }

    pub fn unconditioned(decoder: D, maxlen: usize) -> Result<Self> {
        Self::with_mode(decoder, DecoderMode::Unconditioned, maxlen)
    }

    fn with_mode(decoder: D, mode: DecoderMode, maxlen: usize) -> Result<Self> {
        if maxlen == 0 {
            return Err(ModelError::configuration("maxlen must be > 0").into());
        }
        Ok(Self {
            decoder,
            mode,
            maxlen,
        })
    }

    pub fn mode(&self) -> DecoderMode {
        self.mode
    }

    pub fn maxlen(&self) -> usize {
        self.maxlen
    }

    /// Run one decode call over the current token prefix.
    ///
    /// The prefix may be passed in full each step (the decoder consumes only
    /// the uncached tail) or as just the new tokens on top of the cached
    /// history; either way the total decoded length is bounded by `maxlen`.
    pub fn decode_step(
        &self,
        features: Option<&Tensor>,
        enhanced: Option<&Tensor>,
        tokens: &Tensor,
        cache: Option<&mut DecodeCache>,
    ) -> Result<DecodeStepOutput> {
        match self.mode {
            DecoderMode::Conditioned => {
                if features.is_none() || enhanced.is_none() {
                    return Err(ModelError::configuration(
                        "conditioned decoding requires both the feature sequence and its position-enhanced counterpart",
                    )
                    .into());
                }
            }
            DecoderMode::Unconditioned => {
                if features.is_some() || enhanced.is_some() {
                    return Err(ModelError::configuration(
                        "language-model decoding does not accept feature sequences",
                    )
                    .into());
                }
            }
        }

        let (_batch, len) = tokens.shape().dims2()?;
        let past = cache.as_ref().map(|c| c.seq_len()).unwrap_or(0);
        let total = if len > past { len } else { past + len };
        if total > self.maxlen {
            return Err(ModelError::SequenceLengthExceeded {
                requested: total,
                maxlen: self.maxlen,
            }
            .into());
        }

        self.decoder.decode(features, enhanced, tokens, cache)
    }

    /// Image-conditioned step: flattens the encoder output into the decoder's
    /// sequence-major layout and pairs it with its position-enhanced
    /// flattening before decoding.
    pub fn decode_image_step(
        &self,
        encoder_output: &Tensor,
        positional: &PositionalEncoding2D,
        tokens: &Tensor,
        cache: Option<&mut DecodeCache>,
    ) -> Result<DecodeStepOutput> {
        let features = flatten_spatial(encoder_output)?;
        let enhanced = flatten_spatial(&positional.apply(encoder_output)?)?;
        self.decode_step(Some(&features), Some(&enhanced), tokens, cache)
    }
}
