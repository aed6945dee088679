use anyhow::Result;
use candle_core::Tensor;
use dan_omr_core::DecodeCache;

/// Output of one decoder call.
#[derive(Debug)]
pub struct DecodeStepOutput {
    /// Decoder hidden states for the positions it consumed, `[batch, seq, d_model]`.
    pub hidden_states: Tensor,
    /// Per-position vocabulary logits, `[batch, seq, vocab]`. When a cache is
    /// threaded, `seq` covers only the freshly consumed tail of the prefix.
    pub logits: Tensor,
    /// Attention weights over the feature sequence, when the decoder exposes them.
    pub attention: Option<Tensor>,
}

/// Image encoder collaborator: `[batch, in_channels, H, W]` image batch to a
/// `[batch, d_model, h, w]` feature map. Layer internals are the
/// implementation's business.
pub trait Encoder {
    fn encode(&self, images: &Tensor) -> Result<Tensor>;
}

/// Autoregressive decoder collaborator.
///
/// `tokens` is the current prefix (leading `<bos>` included), `[batch, len]`
/// U32 ids. With a threaded [`DecodeCache`] the decoder must only consume the
/// uncached tail of the prefix and append the keys/values it produced; results
/// must be numerically equivalent to a cacheless recompute over the full
/// prefix.
///
/// In conditioned mode `features` carries the flattened encoder sequence
/// (keys/values) and `enhanced` its position-aware counterpart, both
/// `[h * w, batch, d_model]`; how the two are fused is owned by the decoder.
pub trait SequenceDecoder {
    /// Switch the decoder into pure language-model operation. Invoked once at
    /// LM-model construction, before any decode call.
    fn set_lm_mode(&mut self) {}

    fn decode(
        &self,
        features: Option<&Tensor>,
        enhanced: Option<&Tensor>,
        tokens: &Tensor,
        cache: Option<&mut DecodeCache>,
    ) -> Result<DecodeStepOutput>;
}
