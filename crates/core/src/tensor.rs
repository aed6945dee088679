use anyhow::{Result, ensure};
use candle_core::{DType, Device, IndexOp, Tensor, shape::D};

/// Reorder a `[batch, channels, h, w]` feature map into the decoder's
/// sequence-major `[h * w, batch, channels]` layout.
pub fn flatten_spatial(features: &Tensor) -> Result<Tensor> {
    ensure!(
        features.rank() == 4,
        "expected feature map with rank 4 [batch, channels, h, w], got rank {}",
        features.rank()
    );
    Ok(features
        .flatten_from(2)?
        .permute((2, 0, 1))?
        .contiguous()?)
}

/// Arg-max token id of the last sequence position of `[batch, seq, vocab]`
/// logits, read from the first batch row.
pub fn argmax_last_position(logits: &Tensor) -> Result<u32> {
    let (batch, seq_len, _vocab) = logits.shape().dims3()?;
    ensure!(batch >= 1 && seq_len >= 1, "logits must be non-empty, got {batch}x{seq_len}");
    let last = logits.i((0, seq_len - 1, ..))?;
    Ok(last.argmax(D::Minus1)?.to_scalar::<u32>()?)
}

/// Build a `[1, len]` U32 token tensor on the model's device.
pub fn token_tensor(ids: &[u32], device: &Device) -> Result<Tensor> {
    ensure!(!ids.is_empty(), "token prefix must not be empty");
    Ok(Tensor::from_vec(ids.to_vec(), (1, ids.len()), device)?)
}

/// Returns `tensor` cast to `dtype` only when needed.
pub fn to_dtype_if_needed(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        Ok(tensor.to_dtype(dtype)?)
    }
}
