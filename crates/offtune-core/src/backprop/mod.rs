//! Manual layer-by-layer backpropagation over offloaded modules.
//!
//! The ordinary forward path keeps one autodiff graph for the whole network,
//! which means every layer's activations and (loaded) parameters stay alive
//! until `backward()`. [`ManualBackprop`] avoids that:
//!
//! - **Forward** runs every layer with its parameters loaded only for the
//!   duration of the call. Each layer's input is cached in the offload store
//!   and the dropout generator state is snapshotted right before the layer
//!   runs. Layer outputs are detached, so no graph survives between layers.
//! - **Backward** first differentiates the small resident tail (loss, output
//!   projection replayed from its cache, final norm), then walks the layers
//!   in reverse. Each step reloads the layer, marks its cached input as a
//!   gradient root, restores the dropout state, recomputes the output and
//!   pushes the incoming gradient through it.
//!
//! Adapters are the only trainable tensors. Gradients collected during a
//! step are merged into the model's ledger only once the whole backward pass
//! succeeded.
//!
//! ```text
//!   Idle ─forward─▶ ForwardRunning ─▶ ForwardDone ─backward─▶ BackwardRunning ─▶ BackwardDone
//! ```

mod loss;
mod replay;

pub use loss::{cross_entropy, IGNORE_INDEX};
pub use replay::{backward_with, ensure_finite, replay_module, Replay};

use crate::error::{OfftuneError, Result};
use crate::lora::AdapterGrads;
use crate::model::{LayerContext, Transformer};
use crate::rng::{dropout, DropoutRng, RngSnapshot};
use candle_core::{DType, Tensor, Var};

/// Where a [`ManualBackprop`] session is in its single forward+backward cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing has run yet.
    Idle,
    /// Forward pass in progress, or aborted by an error.
    ForwardRunning,
    /// Forward pass finished; checkpoints are in place.
    ForwardDone,
    /// Backward pass in progress, or aborted by an error.
    BackwardRunning,
    /// Backward pass finished.
    BackwardDone,
}

/// Counters describing one manual backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackwardReport {
    /// Layers replayed in reverse.
    pub layers_replayed: usize,
    /// Dropout snapshots taken during the forward pass.
    pub rng_snapshots: usize,
    /// Frozen parameters verified to have received no gradient.
    pub frozen_params_checked: usize,
    /// Highest number of modules resident at once over the whole step.
    pub peak_resident: usize,
}

/// Result of a full manual forward+backward step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// `[batch, seq_len, vocab]` logits from the forward pass.
    pub logits: Tensor,
    /// Mean cross-entropy.
    pub loss: f32,
    /// Adapter gradients of this step alone.
    pub grads: AdapterGrads,
    /// Step counters.
    pub report: BackwardReport,
}

/// Checkpoints recorded by the forward pass.
#[derive(Debug)]
struct ForwardState {
    ctx: LayerContext,
    /// Dropout state right before each layer, in layer order.
    snapshots: Vec<RngSnapshot>,
    /// Dropout state after the last stochastic op.
    end_of_forward: RngSnapshot,
    /// Detached output of the last layer.
    hidden: Tensor,
    logits: Tensor,
}

/// One forward+backward invocation over a [`Transformer`].
///
/// A session is single use. Any error leaves it in a running phase and it
/// must be dropped along with whatever gradients it collected.
#[derive(Debug)]
pub struct ManualBackprop<'m> {
    model: &'m mut Transformer,
    phase: Phase,
    state: Option<ForwardState>,
}

impl<'m> ManualBackprop<'m> {
    /// Start a session.
    pub fn new(model: &'m mut Transformer) -> Self {
        Self {
            model,
            phase: Phase::Idle,
            state: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn expect_phase(&self, expected: Phase, op: &str) -> Result<()> {
        if self.phase != expected {
            return Err(OfftuneError::InvalidState(format!(
                "{op} called in phase {:?}, expected {expected:?}",
                self.phase
            )));
        }
        Ok(())
    }

    /// Run the checkpointing forward pass and return the logits.
    pub fn forward(&mut self, tokens: &Tensor, rng: &mut DropoutRng) -> Result<Tensor> {
        self.expect_phase(Phase::Idle, "forward")?;
        self.phase = Phase::ForwardRunning;

        let model = &*self.model;
        let device = model.device().clone();
        let (_, seq_len) = tokens.dims2()?;
        let ctx = model.layer_context(seq_len)?;

        model.store().clear_inputs()?;
        model.residency().reset_peak();
        tracing::debug!(seq_len, layers = model.num_layers(), "manual forward");

        let h = model.tok_embeddings().forward(tokens)?;
        let mut h = dropout(&h, model.config().dropout, rng)?.detach();

        let mut snapshots = Vec::with_capacity(model.num_layers());
        for (idx, layer) in model.layers().iter().enumerate() {
            snapshots.push(rng.save_state(&device));
            h = layer
                .forward(&h, &ctx, model.layer_adapters(idx)?, rng)?
                .detach();
            tracing::trace!(layer = idx, "forward done");
        }
        let end_of_forward = rng.save_state(&device);

        let normed = model.norm().forward(&h)?;
        let logits = model.output().forward(&normed)?.detach();

        self.state = Some(ForwardState {
            ctx,
            snapshots,
            end_of_forward,
            hidden: h,
            logits: logits.clone(),
        });
        self.phase = Phase::ForwardDone;
        tracing::debug!("manual forward done");
        Ok(logits)
    }

    /// Compute the loss against `targets` and replay every layer in reverse.
    ///
    /// On success the step's adapter gradients are added to the model's
    /// ledger. Whether or not the replay succeeds, `rng` is left where the
    /// forward pass left it.
    pub fn backward(&mut self, targets: &Tensor, rng: &mut DropoutRng) -> Result<StepOutput> {
        self.expect_phase(Phase::ForwardDone, "backward")?;
        let state = self
            .state
            .take()
            .ok_or_else(|| OfftuneError::InvalidState("forward state missing".to_string()))?;
        self.phase = Phase::BackwardRunning;

        let model = &*self.model;
        let device = model.device().clone();
        let replayed = replay_stages(model, &state, targets, rng);
        let restored = rng.restore_state(&state.end_of_forward, &device);
        let Replayed {
            loss,
            grads: step_grads,
            frozen_checked,
        } = replayed?;
        restored?;
        model.tok_embeddings().evict_input()?;

        let report = BackwardReport {
            layers_replayed: model.num_layers(),
            rng_snapshots: state.snapshots.len(),
            frozen_params_checked: frozen_checked,
            peak_resident: model.residency().peak(),
        };

        self.model.accumulate_grads(&step_grads)?;
        self.phase = Phase::BackwardDone;
        tracing::info!(
            loss,
            layers = report.layers_replayed,
            peak_resident = report.peak_resident,
            "manual step done"
        );

        Ok(StepOutput {
            logits: state.logits,
            loss,
            grads: step_grads,
            report,
        })
    }
}

/// Outcome of both backward stages, before anything reaches the model.
struct Replayed {
    loss: f32,
    grads: AdapterGrads,
    frozen_checked: usize,
}

/// Stage 1 (loss, output projection, final norm) then stage 2 (layers in reverse).
fn replay_stages(
    model: &Transformer,
    state: &ForwardState,
    targets: &Tensor,
    rng: &mut DropoutRng,
) -> Result<Replayed> {
    let device = model.device().clone();
    let num_layers = model.num_layers();
    if state.snapshots.len() != num_layers {
        return Err(OfftuneError::InvalidState(format!(
            "{} rng snapshots for {num_layers} layers",
            state.snapshots.len()
        )));
    }

    let logits_root = Var::from_tensor(&state.logits)?;
    let loss = cross_entropy(logits_root.as_tensor(), targets)?;
    let loss_value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    if !loss_value.is_finite() {
        return Err(OfftuneError::NumericInstability(format!(
            "loss is {loss_value}"
        )));
    }
    let d_logits = loss
        .backward()?
        .get(logits_root.as_tensor())
        .map(Tensor::detach)
        .ok_or_else(|| OfftuneError::InvalidState("loss has no logits gradient".to_string()))?;
    tracing::debug!(loss = loss_value, "manual backward");

    let tail = replay_module(
        model.output(),
        &device,
        &d_logits,
        rng,
        None,
        std::iter::empty::<&Var>(),
        |output, x, _| output.forward(x),
    )?;
    model.output().evict_input()?;
    let mut frozen_checked = tail.frozen_checked;
    let d_normed = tail.input_grad.ok_or_else(|| {
        OfftuneError::InvalidState("output projection input has no gradient".to_string())
    })?;

    // The final norm stays resident and its weight is detached at assembly.
    let hidden_root = Var::from_tensor(&state.hidden)?;
    let normed = model.norm().forward(hidden_root.as_tensor())?;
    let mut grad = backward_with(&normed, &d_normed)?
        .get(hidden_root.as_tensor())
        .map(Tensor::detach)
        .ok_or_else(|| OfftuneError::InvalidState("final norm input has no gradient".to_string()))?;
    ensure_finite(&grad, "final norm input gradient")?;

    let mut step_grads = AdapterGrads::new();
    for idx in (0..num_layers).rev() {
        let adapters = model.layer_adapters(idx)?;
        let layer = &model.layers()[idx];
        let ctx = &state.ctx;
        let replay = replay_module(
            layer,
            &device,
            &grad,
            rng,
            Some(&state.snapshots[idx]),
            adapters.vars(),
            |module, x, rng| module.forward(x, ctx, adapters, rng),
        )?;
        layer.evict_input()?;
        step_grads.merge(&replay.grads)?;
        frozen_checked += replay.frozen_checked;
        tracing::debug!(
            layer = idx,
            adapter_grads = replay.grads.len(),
            "layer replayed"
        );

        match replay.input_grad {
            Some(input_grad) => grad = input_grad,
            None if idx == 0 => {}
            None => {
                return Err(OfftuneError::InvalidState(format!(
                    "layer {idx} input has no gradient"
                )))
            }
        }
    }

    Ok(Replayed {
        loss: loss_value,
        grads: step_grads,
        frozen_checked,
    })
}
