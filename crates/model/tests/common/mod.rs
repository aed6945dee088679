#![allow(dead_code)]

use anyhow::{Result, ensure};
use candle_core::{Device, Tensor, shape::D};
use candle_nn::ops::softmax;
use dan_omr_core::{
    DecodeCache, EpochRates, KvChunk, PerplexityMetric, PolyphonyMetrics, Vocabulary,
};
use dan_omr_model::{DecodeStepOutput, Encoder, SequenceDecoder, masked_cross_entropy};

pub const TOY_DIM: usize = 8;
pub const TOY_VOCAB: usize = 8;

/// Vocabulary used throughout the model tests:
/// `{<bos>:0, <eos>:1, <pad>:2, A:3, <s>:4, B:5, <t>:6, <b>:7}`.
pub fn tiny_vocab() -> Result<Vocabulary> {
    Vocabulary::from_pairs([
        ("<bos>", 0u32),
        ("<eos>", 1),
        ("<pad>", 2),
        ("A", 3),
        ("<s>", 4),
        ("B", 5),
        ("<t>", 6),
        ("<b>", 7),
    ])
}

/// Deterministic xorshift-filled weights in roughly [-0.5, 0.5).
pub fn toy_weights(rows: usize, cols: usize, seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..rows * cols)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            ((state >> 11) as f64 / (1u64 << 53) as f64) as f32 - 0.5
        })
        .collect()
}

/// Single-layer causal-attention decoder with real key/value caching.
///
/// Not a serious network; it exists so the cache-equivalence and greedy-loop
/// contracts can be exercised with genuine attention arithmetic. In
/// conditioned operation it adds a cross-attention read over the feature
/// sequence, using the position-enhanced flattening as keys and the plain
/// flattening as values.
pub struct ToyDecoder {
    embed: Tensor,
    wq: Tensor,
    wk: Tensor,
    wv: Tensor,
    out: Tensor,
    dim: usize,
    lm_mode: bool,
}

impl ToyDecoder {
    pub fn new(vocab: usize, dim: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            embed: Tensor::from_vec(toy_weights(vocab, dim, 1), (vocab, dim), device)?,
            wq: Tensor::from_vec(toy_weights(dim, dim, 2), (dim, dim), device)?,
            wk: Tensor::from_vec(toy_weights(dim, dim, 3), (dim, dim), device)?,
            wv: Tensor::from_vec(toy_weights(dim, dim, 4), (dim, dim), device)?,
            out: Tensor::from_vec(toy_weights(dim, vocab, 5), (dim, vocab), device)?,
            dim,
            lm_mode: false,
        })
    }

    fn project(&self, x: &Tensor, w: &Tensor) -> Result<Tensor> {
        let (batch, len, dim) = x.shape().dims3()?;
        let (_, out) = w.shape().dims2()?;
        Ok(x.reshape((batch * len, dim))?
            .matmul(w)?
            .reshape((batch, len, out))?)
    }
}

fn causal_mask(fresh: usize, total: usize, device: &Device) -> Result<Tensor> {
    let offset = total - fresh;
    let mut data = vec![0f32; fresh * total];
    for i in 0..fresh {
        for j in 0..total {
            if j > offset + i {
                data[i * total + j] = f32::NEG_INFINITY;
            }
        }
    }
    Ok(Tensor::from_vec(data, (1, fresh, total), device)?)
}

impl SequenceDecoder for ToyDecoder {
    fn set_lm_mode(&mut self) {
        self.lm_mode = true;
    }

    fn decode(
        &self,
        features: Option<&Tensor>,
        enhanced: Option<&Tensor>,
        tokens: &Tensor,
        mut cache: Option<&mut DecodeCache>,
    ) -> Result<DecodeStepOutput> {
        let (batch, len) = tokens.shape().dims2()?;
        let past = cache.as_ref().map(|c| c.seq_len()).unwrap_or(0);
        // With a threaded cache only the uncached tail is consumed.
        let fresh = if past > 0 && len > past { len - past } else { len };
        let tail = tokens.narrow(1, len - fresh, fresh)?;
        let flat = tail.reshape((batch * fresh,))?.contiguous()?;
        let emb = self
            .embed
            .index_select(&flat, 0)?
            .reshape((batch, fresh, self.dim))?;

        let q = self.project(&emb, &self.wq)?;
        let k = self.project(&emb, &self.wk)?;
        let v = self.project(&emb, &self.wv)?;

        let (k_all, v_all) = match cache.as_mut() {
            Some(cache) => {
                cache.append(0, KvChunk::new(k.unsqueeze(1)?, v.unsqueeze(1)?)?)?;
                let entry = cache.get(0).expect("chunk appended above");
                (entry.key().squeeze(1)?, entry.value().squeeze(1)?)
            }
            None => (k.clone(), v.clone()),
        };

        let total = k_all.dim(1)?;
        let scale = 1.0 / (self.dim as f64).sqrt();
        let scores = q
            .matmul(&k_all.transpose(1, 2)?.contiguous()?)?
            .affine(scale, 0.0)?;
        let scores = scores.broadcast_add(&causal_mask(fresh, total, tokens.device())?)?;
        let attn = softmax(&scores, D::Minus1)?;
        let mut hidden = attn.matmul(&v_all.contiguous()?)?;

        let mut attention = None;
        if !self.lm_mode {
            if let (Some(features), Some(enhanced)) = (features, enhanced) {
                let keys = enhanced.permute((1, 0, 2))?.contiguous()?;
                let values = features.permute((1, 0, 2))?.contiguous()?;
                let scores = q
                    .matmul(&keys.transpose(1, 2)?.contiguous()?)?
                    .affine(scale, 0.0)?;
                let weights = softmax(&scores, D::Minus1)?;
                hidden = hidden.add(&weights.matmul(&values)?)?;
                attention = Some(weights);
            }
        }

        let logits = self.project(&hidden, &self.out)?;
        Ok(DecodeStepOutput {
            hidden_states: hidden,
            logits,
            attention,
        })
    }
}

/// Decoder whose arg-max at step `n` is `script[n]` (last entry repeating),
/// for driving the greedy loop down a known path.
pub struct ScriptedDecoder {
    vocab: usize,
    script: Vec<u32>,
}

impl ScriptedDecoder {
    pub fn new(vocab: usize, script: Vec<u32>) -> Self {
        assert!(!script.is_empty(), "script must pick at least one token");
        Self { vocab, script }
    }
}

impl SequenceDecoder for ScriptedDecoder {
    fn decode(
        &self,
        _features: Option<&Tensor>,
        _enhanced: Option<&Tensor>,
        tokens: &Tensor,
        _cache: Option<&mut DecodeCache>,
    ) -> Result<DecodeStepOutput> {
        let (batch, len) = tokens.shape().dims2()?;
        // The prefix always carries the leading <bos>.
        let step = (len - 1).min(self.script.len() - 1);
        let pick = self.script[step] as usize;
        ensure!(pick < self.vocab, "scripted id {pick} outside vocab {}", self.vocab);
        let mut data = vec![0f32; batch * len * self.vocab];
        for row in 0..batch {
            data[(row * len + (len - 1)) * self.vocab + pick] = 1.0;
        }
        let logits = Tensor::from_vec(data, (batch, len, self.vocab), tokens.device())?;
        Ok(DecodeStepOutput {
            hidden_states: logits.clone(),
            logits,
            attention: None,
        })
    }
}

/// 2x average pooling plus a per-channel scale fanning a single-channel image
/// out to `d_model` feature channels.
pub struct GridEncoder {
    channel_scale: Tensor,
}

impl GridEncoder {
    pub fn new(d_model: usize, device: &Device) -> Result<Self> {
        let scale: Vec<f32> = (0..d_model)
            .map(|c| 0.5 + c as f32 / d_model as f32)
            .collect();
        Ok(Self {
            channel_scale: Tensor::from_vec(scale, (1, d_model, 1, 1), device)?,
        })
    }
}

impl Encoder for GridEncoder {
    fn encode(&self, images: &Tensor) -> Result<Tensor> {
        let (_batch, channels, _h, _w) = images.shape().dims4()?;
        ensure!(channels == 1, "grid encoder expects single-channel images");
        let pooled = images.avg_pool2d(2)?;
        Ok(pooled.broadcast_mul(&self.channel_scale)?)
    }
}

/// Whole-string mismatch rate reported as all three rates.
pub struct ExactMatchMetrics;

impl PolyphonyMetrics for ExactMatchMetrics {
    fn compute(&self, predictions: &[String], ground_truths: &[String]) -> Result<EpochRates> {
        ensure!(
            predictions.len() == ground_truths.len(),
            "pair count mismatch: {} vs {}",
            predictions.len(),
            ground_truths.len()
        );
        let mismatched = predictions
            .iter()
            .zip(ground_truths)
            .filter(|(p, g)| p != g)
            .count();
        let rate = mismatched as f64 / predictions.len() as f64;
        Ok(EpochRates {
            cer: rate,
            ser: rate,
            ler: rate,
        })
    }
}

/// Perplexity as exp of the padding-masked mean negative log-likelihood.
pub struct NllPerplexity {
    pub padding_id: u32,
}

impl PerplexityMetric for NllPerplexity {
    fn compute(&self, logits: &Tensor, target_ids: &Tensor) -> Result<f64> {
        let nll = masked_cross_entropy(logits, target_ids, self.padding_id)?.to_scalar::<f32>()?;
        Ok((nll as f64).exp())
    }
}
