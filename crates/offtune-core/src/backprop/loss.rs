//! Token-level cross-entropy with an ignore sentinel.

use crate::error::{OfftuneError, Result};
use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;

/// Target id that contributes nothing to the loss.
pub const IGNORE_INDEX: i64 = -1;

/// Mean cross-entropy of `logits` [.., vocab] against integer `targets` [..].
///
/// Positions whose target is [`IGNORE_INDEX`] are excluded from both the sum
/// and the mean and receive a zero gradient. The log-softmax is taken in f32.
///
/// Fails with `NumericInstability` if every target is ignored.
pub fn cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let vocab = logits.dim(D::Minus1)?;
    let logits = logits.to_dtype(DType::F32)?.reshape(((), vocab))?;
    let targets = targets.to_dtype(DType::I64)?.flatten_all()?;
    if logits.dim(0)? != targets.dim(0)? {
        return Err(OfftuneError::ShapeMismatch(format!(
            "{} logit rows for {} targets",
            logits.dim(0)?,
            targets.dim(0)?
        )));
    }

    let keep = targets.ne(IGNORE_INDEX)?;
    let ids: Vec<i64> = targets.to_vec1()?;
    if let Some(bad) = ids
        .iter()
        .find(|&&t| t != IGNORE_INDEX && (t < 0 || t as usize >= vocab))
    {
        return Err(OfftuneError::ShapeMismatch(format!(
            "target id {bad} outside vocabulary of {vocab}"
        )));
    }
    let count = ids.iter().filter(|&&t| t != IGNORE_INDEX).count();
    if count == 0 {
        return Err(OfftuneError::NumericInstability(
            "every target position is ignored".to_string(),
        ));
    }

    let safe_ids = keep.where_cond(&targets, &targets.zeros_like()?)?;
    let log_probs = log_softmax(&logits, D::Minus1)?;
    let picked = log_probs.gather(&safe_ids.unsqueeze(1)?, 1)?.squeeze(1)?;
    let picked = picked.mul(&keep.to_dtype(DType::F32)?)?;
    Ok((picked.sum_all()?.neg()? / count as f64)?)
}
