//! Single-module replay: reload, recompute, differentiate, release.

use crate::error::{OfftuneError, Result};
use crate::lora::AdapterGrads;
use crate::offload::{Blackbox, Offloadable};
use crate::rng::{DropoutRng, RngSnapshot};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};

/// Result of replaying one module.
#[derive(Debug)]
pub struct Replay {
    /// Gradient with respect to the module's cached input, `None` if the
    /// input is not a floating-point tensor.
    pub input_grad: Option<Tensor>,
    /// Gradients of the trainable tensors used by the recomputation.
    pub grads: AdapterGrads,
    /// Number of frozen parameters verified to have no gradient.
    pub frozen_checked: usize,
}

/// Reverse-mode step through one offloaded module.
///
/// The steps run in a fixed order:
/// 1. load the module's parameters and freeze them,
/// 2. load its cached input and make it a gradient root if it is floating point,
/// 3. restore `snapshot` into `rng`,
/// 4. recompute the output with `forward`,
/// 5. backpropagate `grad_output` through it,
/// 6. collect the input gradient,
/// 7. release the module and the recomputed graph.
///
/// Fails with `InvalidState` if any frozen parameter received a gradient and
/// with `NumericInstability` if a produced gradient is not finite.
pub fn replay_module<'v, M, F>(
    blackbox: &Blackbox<M>,
    device: &Device,
    grad_output: &Tensor,
    rng: &mut DropoutRng,
    snapshot: Option<&RngSnapshot>,
    trainable: impl IntoIterator<Item = &'v Var>,
    forward: F,
) -> Result<Replay>
where
    M: Offloadable,
    F: FnOnce(&M, &Tensor, &mut DropoutRng) -> Result<Tensor>,
{
    let id = blackbox.id();

    let mut module = blackbox.load(device)?;
    module.freeze();
    let frozen = module.named_tensors();

    let input = blackbox.load_input(device)?;
    let root = if input.dtype().is_float() {
        Some(Var::from_tensor(&input.detach())?)
    } else {
        None
    };
    let input = match &root {
        Some(var) => var.as_tensor().clone(),
        None => input,
    };

    if let Some(snapshot) = snapshot {
        rng.restore_state(snapshot, device)?;
    }

    let output = forward(&*module, &input, rng)?;
    if output.dims() != grad_output.dims() {
        return Err(OfftuneError::ShapeMismatch(format!(
            "{id}: recomputed output {:?} does not match incoming gradient {:?}",
            output.dims(),
            grad_output.dims()
        )));
    }
    let store = backward_with(&output, grad_output)?;

    let input_grad = match &root {
        Some(var) => match store.get(var.as_tensor()) {
            Some(grad) => {
                let grad = grad.detach();
                ensure_finite(&grad, &format!("{id} input gradient"))?;
                Some(grad)
            }
            None => None,
        },
        None => None,
    };

    for (name, param) in &frozen {
        if store.get(param).is_some() {
            return Err(OfftuneError::InvalidState(format!(
                "frozen parameter {id}.{name} received a gradient"
            )));
        }
    }

    let mut grads = AdapterGrads::new();
    grads.accumulate(trainable, &store)?;
    for (_, grad) in grads.iter() {
        ensure_finite(grad, &format!("{id} adapter gradient"))?;
    }

    drop(store);
    drop(output);
    drop(module);

    Ok(Replay {
        input_grad,
        grads,
        frozen_checked: frozen.len(),
    })
}

/// Backpropagate `output` with upstream gradient `grad`.
pub fn backward_with(output: &Tensor, grad: &Tensor) -> Result<GradStore> {
    let grad = grad.detach().to_dtype(output.dtype())?;
    Ok(output.mul(&grad)?.sum_all()?.backward()?)
}

/// Fail with `NumericInstability` unless every element of `t` is finite.
pub fn ensure_finite(t: &Tensor, what: &str) -> Result<()> {
    let values: Vec<f32> = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        return Err(OfftuneError::NumericInstability(format!(
            "{what} contains {bad}"
        )));
    }
    Ok(())
}
