use anyhow::{Result, bail, ensure};
use candle_core::{Tensor, shape::D};

/// Newly computed key/value tensors produced by one decode step.
///
/// Both tensors are `[batch, heads, seq, dim]`; the sequence axis is the only
/// one allowed to differ between appends.
#[derive(Debug, Clone)]
pub struct KvChunk {
    pub key: Tensor,
    pub value: Tensor,
}

impl KvChunk {
    pub fn new(key: Tensor, value: Tensor) -> Result<Self> {
        ensure!(
            key.rank() == 4,
            "expected key tensor with rank 4 [batch, heads, seq, dim], got rank {}",
            key.rank()
        );
        ensure!(
            value.rank() == 4,
            "expected value tensor with rank 4 [batch, heads, seq, dim], got rank {}",
            value.rank()
        );
        let (kb, kh, ks, _) = key.shape().dims4()?;
        let (vb, vh, vs, _) = value.shape().dims4()?;
        ensure!(kb == vb, "chunk batch mismatch between key ({kb}) and value ({vb})");
        ensure!(kh == vh, "chunk heads mismatch between key ({kh}) and value ({vh})");
        ensure!(ks == vs, "chunk sequence mismatch between key ({ks}) and value ({vs})");
        Ok(Self { key, value })
    }

    pub fn seq_len(&self) -> usize {
        self.key
            .dim(D::Minus2)
            .expect("chunk tensors are validated to rank 4")
    }
}

/// Accumulated key/value history for a single decoder layer.
///
/// Appends concatenate along the sequence axis, so `key()`/`value()` always
/// expose the full history as one tensor.
#[derive(Debug, Clone)]
pub struct KvEntry {
    key: Tensor,
    value: Tensor,
    len: usize,
}

impl KvEntry {
    pub fn from_chunk(chunk: KvChunk) -> Self {
        let len = chunk.seq_len();
        Self {
            key: chunk.key,
            value: chunk.value,
            len,
        }
    }

    fn validate_chunk(&self, chunk: &KvChunk) -> Result<()> {
        let (batch, heads, _, key_dim) = self.key.shape().dims4()?;
        let (cb, ch, _, ck) = chunk.key.shape().dims4()?;
        ensure!(cb == batch, "chunk batch {cb} does not match cached batch {batch}");
        ensure!(ch == heads, "chunk heads {ch} does not match cached heads {heads}");
        ensure!(ck == key_dim, "chunk key dim {ck} does not match cached key dim {key_dim}");
        let (_, _, _, value_dim) = self.value.shape().dims4()?;
        let (_, _, _, cv) = chunk.value.shape().dims4()?;
        ensure!(
            cv == value_dim,
            "chunk value dim {cv} does not match cached value dim {value_dim}"
        );
        ensure!(
            chunk.key.dtype() == self.key.dtype(),
            "chunk dtype {:?} does not match cached dtype {:?}",
            chunk.key.dtype(),
            self.key.dtype()
        );
        ensure!(
            chunk.key.device().location() == self.key.device().location(),
            "chunk device {:?} does not match cached device {:?}",
            chunk.key.device(),
            self.key.device()
        );
        Ok(())
    }

    pub fn append(&mut self, chunk: &KvChunk) -> Result<()> {
        self.validate_chunk(chunk)?;
        let chunk_len = chunk.seq_len();
        if chunk_len == 0 {
            return Ok(());
        }
        self.key = Tensor::cat(&[&self.key, &chunk.key], D::Minus2)?;
        self.value = Tensor::cat(&[&self.value, &chunk.value], D::Minus2)?;
        self.len += chunk_len;
        Ok(())
    }

    /// Full cached key history, `[batch, heads, cached_seq, dim]`.
    pub fn key(&self) -> &Tensor {
        &self.key
    }

    /// Full cached value history, `[batch, heads, cached_seq, dim]`.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn seq_len(&self) -> usize {
        self.len
    }
}

/// Append-only incremental decode state threaded through successive steps.
///
/// The empty state is `DecodeCache::new()`; every step appends the key/value
/// tensors it produced and the next step reuses them instead of recomputing
/// attention over the whole prefix. Ownership moves step to step; the cache is
/// never shared between concurrent decodes.
#[derive(Debug, Clone, Default)]
pub struct DecodeCache {
    entries: Vec<Option<KvEntry>>,
}

impl DecodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_layers(num_layers: usize) -> Self {
        Self {
            entries: vec![None; num_layers],
        }
    }

    /// Number of layer slots tracked, including empty ones.
    pub fn num_layers(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| entry.is_none())
    }

    pub fn get(&self, layer_idx: usize) -> Option<&KvEntry> {
        self.entries.get(layer_idx).and_then(|entry| entry.as_ref())
    }

    /// Append the chunk to `layer_idx`, creating the entry on first use.
    pub fn append(&mut self, layer_idx: usize, chunk: KvChunk) -> Result<()> {
        if chunk.seq_len() == 0 {
            bail!("refusing to append an empty chunk to layer {layer_idx}");
        }
        if layer_idx >= self.entries.len() {
            self.entries.resize_with(layer_idx + 1, || None);
        }
        match self.entries[layer_idx].as_mut() {
            Some(existing) => existing.append(&chunk),
            None => {
                self.entries[layer_idx] = Some(KvEntry::from_chunk(chunk));
                Ok(())
            }
        }
    }

    /// Longest cached sequence across layers; 0 for the empty state.
    pub fn seq_len(&self) -> usize {
        self.entries
            .iter()
            .filter_map(|entry| entry.as_ref().map(KvEntry::seq_len))
            .max()
            .unwrap_or(0)
    }

    /// Drop all cached state, keeping the layer slots allocated.
    pub fn clear(&mut self) {
        for entry in &mut self.entries {
            *entry = None;
        }
    }
}
