use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use dan_omr_core::Vocabulary;
use serde::{Deserialize, Serialize};

use crate::{
    collab::{Encoder, SequenceDecoder},
    dan::Dan,
    lm::DanLm,
};

/// Transcription model configuration.
///
/// `in_channels` and `d_model` double as hyperparameters for the injected
/// encoder/decoder collaborators; `max_height`/`max_width` bound the raw
/// images the model accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DanConfig {
    pub in_channels: usize,
    pub d_model: usize,
    pub max_height: usize,
    pub max_width: usize,
    pub max_len: usize,
    pub out_dir: PathBuf,
}

impl Default for DanConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            d_model: 256,
            max_height: 1024,
            max_width: 1024,
            max_len: 1024,
            out_dir: PathBuf::from("out"),
        }
    }
}

/// Language-model configuration. `d_model`, `dim_ff` and `num_dec_layers`
/// parameterize the decoder collaborator the caller builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DanLmConfig {
    pub d_model: usize,
    pub dim_ff: usize,
    pub num_dec_layers: usize,
    pub max_len: usize,
    pub out_dir: PathBuf,
}

impl Default for DanLmConfig {
    fn default() -> Self {
        Self {
            d_model: 256,
            dim_ff: 1024,
            num_dec_layers: 8,
            max_len: 1024,
            out_dir: PathBuf::from("out"),
        }
    }
}

/// Build a [`Dan`] from a config, deriving the positional grid from the
/// encoder's downsampling (height / 16, width / 8) and reserving one decode
/// slot for the leading `<bos>`.
pub fn dan_from_config<E: Encoder, D: SequenceDecoder>(
    cfg: &DanConfig,
    encoder: E,
    decoder: D,
    vocab: Vocabulary,
    device: Device,
) -> Result<Dan<E, D>> {
    let max_height = cfg.max_height / 16 + 1;
    let max_width = cfg.max_width / 8 + 1;
    let maxlen = cfg.max_len + 1;
    Dan::new(
        encoder,
        decoder,
        cfg.d_model,
        max_height,
        max_width,
        maxlen,
        vocab,
        cfg.out_dir.clone(),
        device,
    )
}

/// Build a [`DanLm`] from a config; the decoder is switched into LM mode once
/// inside [`DanLm::new`] and the padding id is taken from the vocabulary.
pub fn dan_lm_from_config<D: SequenceDecoder>(
    cfg: &DanLmConfig,
    decoder: D,
    vocab: Vocabulary,
    device: Device,
) -> Result<DanLm<D>> {
    DanLm::new(decoder, vocab, cfg.max_len + 1, cfg.out_dir.clone(), device)
}
