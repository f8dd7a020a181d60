//! Transformer model container.
//!
//! Owns the offloaded modules (embedding, layers, output projection), the
//! resident final norm and rotary tables, and the adapters. Two forward
//! paths exist:
//!
//! - [`Transformer::forward`]: the ordinary path. Every module is loaded in
//!   turn but the autodiff graph spans the whole network, so a single
//!   `backward()` on the loss reaches every adapter.
//! - [`Transformer::manual_step`]: the offload path driven by
//!   [`ManualBackprop`], which keeps one layer open at a time and replays
//!   layers in reverse for the gradient.

use super::{
    LayerContext, ModelConfig, OutputProjection, RmsNorm, RotaryEmbedding,
    TokenEmbedding, TransformerLayer, WeightLoader,
};
use crate::backprop::{cross_entropy, ManualBackprop, StepOutput};
use crate::error::{OfftuneError, Result};
use crate::lora::{AdapterGrads, AdapterSet, AttentionAdapters};
use crate::offload::{Blackbox, ModuleId, OffloadStore, Offloadable, ResidencyTracker};
use crate::rng::{dropout, DropoutRng};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Output of the ordinary forward path.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// `[batch, seq_len, vocab]` with targets, `[batch, 1, vocab]` without.
    pub logits: Tensor,
    /// Mean cross-entropy over non-ignored targets, still attached to the graph.
    pub loss: Option<Tensor>,
}

/// A LoRA-adapted transformer whose frozen weights live in an offload store.
pub struct Transformer {
    config: Arc<ModelConfig>,
    device: Device,
    store: Arc<dyn OffloadStore>,
    residency: Arc<ResidencyTracker>,
    tok_embeddings: Blackbox<TokenEmbedding>,
    layers: Vec<Blackbox<TransformerLayer>>,
    norm: RmsNorm,
    output: Blackbox<OutputProjection>,
    rope: RotaryEmbedding,
    adapters: AdapterSet,
    grads: AdapterGrads,
}

impl Transformer {
    /// Build a seeded random model and register it with `store`.
    pub fn new(
        config: ModelConfig,
        store: Arc<dyn OffloadStore>,
        device: &Device,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);

        let tok_embeddings = TokenEmbedding::random(&config, device, &mut rng)?;
        let layers = (0..config.n_layers)
            .map(|i| TransformerLayer::random(&config, i, device, &mut rng))
            .collect::<Result<Vec<_>>>()?;
        let norm = RmsNorm::ones(config.dim, config.norm_eps, config.dtype(), device)?;
        let output = OutputProjection::random(&config, device, &mut rng)?;
        let adapters = AdapterSet::new(&config, device, &mut rng)?;

        Self::assemble(config, store, device, tok_embeddings, layers, norm, output, adapters)
    }

    /// Register pretrained weights (llama names) with `store`.
    ///
    /// Adapters are freshly initialized from `seed`.
    pub fn from_weights(
        config: ModelConfig,
        store: Arc<dyn OffloadStore>,
        device: &Device,
        loader: &WeightLoader,
        seed: u64,
    ) -> Result<Self> {
        config.validate()?;
        let missing = |name: &str| OfftuneError::StorageMissing(format!("checkpoint has no {name}"));

        let tok_embeddings = TokenEmbedding::from_tensors(
            &config,
            ModuleId::Embedding,
            loader.take_prefix("tok_embeddings."),
        )?;
        let layers = (0..config.n_layers)
            .map(|i| {
                let prefix = format!("layers.{i}.");
                let tensors = loader.take_prefix(&prefix);
                if tensors.is_empty() {
                    return Err(missing(&prefix));
                }
                TransformerLayer::from_tensors(&config, ModuleId::Layer(i), tensors)
            })
            .collect::<Result<Vec<_>>>()?;
        let norm_weight = loader
            .get("norm.weight")
            .ok_or_else(|| missing("norm.weight"))?
            .to_device(device)?
            .to_dtype(config.dtype())?;
        let norm = RmsNorm::new(norm_weight, config.norm_eps)?;
        let output =
            OutputProjection::from_tensors(&config, ModuleId::Output, loader.take_prefix("output."))?;

        let mut rng = StdRng::seed_from_u64(seed);
        let adapters = AdapterSet::new(&config, device, &mut rng)?;

        Self::assemble(config, store, device, tok_embeddings, layers, norm, output, adapters)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: ModelConfig,
        store: Arc<dyn OffloadStore>,
        device: &Device,
        tok_embeddings: TokenEmbedding,
        layers: Vec<TransformerLayer>,
        mut norm: RmsNorm,
        output: OutputProjection,
        adapters: AdapterSet,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let residency = Arc::new(ResidencyTracker::new());
        let tok_embeddings = Blackbox::register(
            tok_embeddings,
            ModuleId::Embedding,
            store.clone(),
            config.clone(),
            residency.clone(),
        )?;
        let layers = layers
            .into_iter()
            .enumerate()
            .map(|(i, layer)| {
                Blackbox::register(
                    layer,
                    ModuleId::Layer(i),
                    store.clone(),
                    config.clone(),
                    residency.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let output = Blackbox::register(
            output,
            ModuleId::Output,
            store.clone(),
            config.clone(),
            residency.clone(),
        )?;
        norm.freeze();

        let rope = RotaryEmbedding::new(config.head_dim(), config.max_seq_len, config.rope_theta, device)?;

        tracing::info!(
            "registered {} layers (dim={}, heads={}/{}, vocab={}), {} trainable adapter parameters",
            layers.len(),
            config.dim,
            config.n_heads,
            config.kv_heads(),
            config.vocab_size,
            adapters.num_parameters()
        );

        Ok(Self {
            config,
            device: device.clone(),
            store,
            residency,
            tok_embeddings,
            layers,
            norm,
            output,
            rope,
            adapters,
            grads: AdapterGrads::new(),
        })
    }

    /// Ordinary forward pass.
    ///
    /// With `targets` the logits cover every position and the loss is
    /// returned attached to the autodiff graph. Without targets only the
    /// last position's logits are returned.
    pub fn forward(
        &self,
        tokens: &Tensor,
        targets: Option<&Tensor>,
        rng: &mut DropoutRng,
    ) -> Result<ForwardOutput> {
        let (_, seq_len) = tokens.dims2()?;
        let ctx = self.layer_context(seq_len)?;

        let h = self.tok_embeddings.forward(tokens)?;
        let mut h = dropout(&h, self.config.dropout, rng)?;
        for (idx, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h, &ctx, self.layer_adapters(idx)?, rng)?;
        }
        let h = self.norm.forward(&h)?;

        match targets {
            Some(targets) => {
                let logits = self.output.forward(&h)?;
                let loss = cross_entropy(&logits, targets)?;
                Ok(ForwardOutput {
                    logits,
                    loss: Some(loss),
                })
            }
            None => {
                let last = h.narrow(1, seq_len - 1, 1)?;
                Ok(ForwardOutput {
                    logits: self.output.forward(&last)?,
                    loss: None,
                })
            }
        }
    }

    /// Backpropagate an ordinary-path loss and add the adapter gradients to the ledger.
    ///
    /// Returns the gradients of this call alone.
    pub fn backward(&mut self, loss: &Tensor) -> Result<AdapterGrads> {
        let store = loss.backward()?;
        let mut step = AdapterGrads::new();
        step.accumulate(self.adapters.vars(), &store)?;
        self.grads.merge(&step)?;
        Ok(step)
    }

    /// One forward+backward through the offload path.
    pub fn manual_step(
        &mut self,
        tokens: &Tensor,
        targets: &Tensor,
        rng: &mut DropoutRng,
    ) -> Result<StepOutput> {
        let mut session = ManualBackprop::new(self);
        session.forward(tokens, rng)?;
        session.backward(targets, rng)
    }

    /// Rotary tables and causal mask for `seq_len` tokens.
    pub fn layer_context(&self, seq_len: usize) -> Result<LayerContext> {
        if seq_len == 0 {
            return Err(OfftuneError::ShapeMismatch("empty token sequence".to_string()));
        }
        LayerContext::new(&self.rope, seq_len, &self.device)
    }

    /// Every frozen weight with the adapter corrections folded into `wq` and `wv`.
    ///
    /// Names follow the llama checkpoint layout.
    pub fn merged_weights(&self) -> Result<HashMap<String, Tensor>> {
        let mut merged = HashMap::new();
        let mut insert_module = |id: ModuleId, tensors: Vec<(String, Tensor)>| {
            for (name, t) in tensors {
                merged.insert(format!("{id}.{name}"), t);
            }
        };

        let embedding = self.tok_embeddings.load(&self.device)?;
        insert_module(ModuleId::Embedding, embedding.named_tensors());
        drop(embedding);

        for (idx, blackbox) in self.layers.iter().enumerate() {
            let adapters = self.layer_adapters(idx)?;
            let layer = blackbox.load(&self.device)?;
            let mut tensors = layer.named_tensors();
            drop(layer);
            for (name, t) in tensors.iter_mut() {
                let correction = match name.as_str() {
                    "attention.wq.weight" => adapters.q.expanded()?,
                    "attention.wv.weight" => adapters.v.expanded()?,
                    _ => continue,
                };
                *t = (&*t + correction.to_dtype(t.dtype())?)?.detach();
            }
            insert_module(ModuleId::Layer(idx), tensors);
        }

        let output = self.output.load(&self.device)?;
        insert_module(ModuleId::Output, output.named_tensors());
        drop(output);

        merged.insert("norm.weight".to_string(), self.norm.weight().clone());
        Ok(merged)
    }

    /// Write [`Transformer::merged_weights`] to a safetensors file.
    pub fn save_merged(&self, path: &Path) -> Result<()> {
        let merged = self
            .merged_weights()?
            .into_iter()
            .map(|(name, t)| Ok((name, t.to_device(&Device::Cpu)?.contiguous()?)))
            .collect::<Result<HashMap<_, _>>>()?;
        candle_core::safetensors::save(&merged, path)?;
        tracing::info!("saved {} merged tensors to {}", merged.len(), path.display());
        Ok(())
    }

    /// Forget accumulated adapter gradients.
    pub fn zero_grad(&mut self) {
        self.grads.clear();
    }

    /// Adapter gradients accumulated since the last [`Transformer::zero_grad`].
    pub fn adapter_grads(&self) -> &AdapterGrads {
        &self.grads
    }

    pub(crate) fn accumulate_grads(&mut self, step: &AdapterGrads) -> Result<()> {
        self.grads.merge(step)
    }

    pub(crate) fn layer_adapters(&self, idx: usize) -> Result<&AttentionAdapters> {
        self.adapters
            .layer(idx)
            .ok_or_else(|| OfftuneError::InvalidState(format!("no adapters for layer {idx}")))
    }

    /// Model configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Compute device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Offload store holding the frozen modules.
    pub fn store(&self) -> &Arc<dyn OffloadStore> {
        &self.store
    }

    /// Resident-module counter.
    pub fn residency(&self) -> &Arc<ResidencyTracker> {
        &self.residency
    }

    /// Token embedding handle.
    pub fn tok_embeddings(&self) -> &Blackbox<TokenEmbedding> {
        &self.tok_embeddings
    }

    /// Layer handles in order.
    pub fn layers(&self) -> &[Blackbox<TransformerLayer>] {
        &self.layers
    }

    /// Resident final norm.
    pub fn norm(&self) -> &RmsNorm {
        &self.norm
    }

    /// Output projection handle.
    pub fn output(&self) -> &Blackbox<OutputProjection> {
        &self.output
    }

    /// Trainable adapters.
    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    /// Number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transformer")
            .field("config", &self.config)
            .field("device", &self.device)
            .field("store", &self.store)
            .field("layers", &self.layers.len())
            .finish()
    }
}
