use anyhow::{Result, ensure};
use candle_core::{DType, Tensor, shape::D};
use candle_nn::ops::log_softmax;
use dan_omr_core::tensor::to_dtype_if_needed;

/// Cross-entropy over `[batch, seq, vocab]` logits and `[batch, seq]` target
/// ids, ignoring every position whose target equals `padding_id`.
///
/// Returns the scalar mean over non-padding positions; a batch of pure
/// padding yields zero. Logit values at padding positions cannot influence
/// the result.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, padding_id: u32) -> Result<Tensor> {
    let (batch, seq_len, _vocab) = logits.shape().dims3()?;
    let (target_batch, target_len) = targets.shape().dims2()?;
    ensure!(
        batch == target_batch && seq_len == target_len,
        "logits cover {batch}x{seq_len} positions but targets cover {target_batch}x{target_len}"
    );

    let targets = to_dtype_if_needed(targets, DType::U32)?;
    let log_probs = log_softmax(logits, D::Minus1)?.contiguous()?;
    let picked = log_probs
        .gather(&targets.unsqueeze(D::Minus1)?.contiguous()?, D::Minus1)?
        .squeeze(D::Minus1)?;

    let mask = targets.ne(padding_id)?.to_dtype(DType::F32)?;
    let total = picked.neg()?.mul(&mask)?.sum_all()?;
    let count = mask.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Ok(Tensor::zeros((), DType::F32, logits.device())?);
    }
    Ok(total.affine(1.0 / count as f64, 0.0)?)
}
