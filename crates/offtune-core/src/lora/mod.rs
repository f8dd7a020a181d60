//! Low-rank adapters.
//!
//! A [`LoraAdapter`] adds `scale * up(down(dropout(x)))` to the output of a
//! frozen linear map. `down` is randomly initialized and `up` starts at zero,
//! so a fresh adapter contributes nothing. Adapter weights are the only
//! `Var`s in the model and therefore the only tensors the autodiff engine
//! produces gradients for.
//!
//! Adapters stay resident for the whole step. They are never written to the
//! offload store together with the layer they adapt.

mod grads;

pub use grads::AdapterGrads;

use crate::error::{OfftuneError, Result};
use crate::model::{kaiming_uniform, linear, ModelConfig};
use crate::rng::{dropout, DropoutRng};
use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::path::Path;

/// Trainable low-rank correction for one frozen [out, in] linear map.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    /// Down projection [rank, in].
    down: Var,
    /// Up projection [out, rank].
    up: Var,
    /// `alpha / rank`.
    scale: f64,
    /// Input dropout rate.
    dropout: f32,
}

impl LoraAdapter {
    /// Create an adapter with a Kaiming-uniform `down` and a zero `up`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_features: usize,
        out_features: usize,
        rank: usize,
        alpha: f64,
        dropout: f32,
        dtype: DType,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if rank == 0 {
            return Err(OfftuneError::ShapeMismatch(
                "lora rank must be positive".to_string(),
            ));
        }
        let down = kaiming_uniform(rng, rank, in_features, dtype, device)?;
        let up = Tensor::zeros((out_features, rank), dtype, device)?;
        Ok(Self {
            down: Var::from_tensor(&down)?,
            up: Var::from_tensor(&up)?,
            scale: alpha / rank as f64,
            dropout,
        })
    }

    /// Build from existing weights.
    pub fn from_weights(down: &Tensor, up: &Tensor, alpha: f64, dropout: f32) -> Result<Self> {
        let (rank, _) = down.dims2()?;
        let (_, up_rank) = up.dims2()?;
        if rank != up_rank || rank == 0 {
            return Err(OfftuneError::ShapeMismatch(format!(
                "lora down {:?} and up {:?} disagree on rank",
                down.dims(),
                up.dims()
            )));
        }
        Ok(Self {
            down: Var::from_tensor(&down.detach())?,
            up: Var::from_tensor(&up.detach())?,
            scale: alpha / rank as f64,
            dropout,
        })
    }

    /// `scale * up(down(dropout(x)))`.
    pub fn forward(&self, x: &Tensor, rng: &mut DropoutRng) -> Result<Tensor> {
        let x = dropout(x, self.dropout, rng)?;
        let hidden = linear(&x, self.down.as_tensor())?;
        let out = linear(&hidden, self.up.as_tensor())?;
        Ok((out * self.scale)?)
    }

    /// The full [out, in] correction `scale * up @ down`.
    pub fn expanded(&self) -> Result<Tensor> {
        let product = self.up.as_tensor().matmul(self.down.as_tensor())?;
        Ok((product * self.scale)?)
    }

    /// Fail unless this adapter fits the frozen `weight` [out, in].
    pub fn check_wraps(&self, weight: &Tensor) -> Result<()> {
        let (out_features, in_features) = weight.dims2()?;
        if self.in_features() != in_features || self.out_features() != out_features {
            return Err(OfftuneError::ShapeMismatch(format!(
                "lora [{} -> {} -> {}] cannot wrap weight {:?}",
                self.in_features(),
                self.rank(),
                self.out_features(),
                weight.dims()
            )));
        }
        Ok(())
    }

    /// Down projection.
    pub fn down(&self) -> &Var {
        &self.down
    }

    /// Up projection.
    pub fn up(&self) -> &Var {
        &self.up
    }

    /// Both trainable tensors, down first.
    pub fn vars(&self) -> [&Var; 2] {
        [&self.down, &self.up]
    }

    /// Adapter rank.
    pub fn rank(&self) -> usize {
        self.down.dims()[0]
    }

    /// Input width.
    pub fn in_features(&self) -> usize {
        self.down.dims()[1]
    }

    /// Output width.
    pub fn out_features(&self) -> usize {
        self.up.dims()[0]
    }

    /// Output scale.
    pub fn scale(&self) -> f64 {
        self.scale
    }
}

/// Adapters on the query and value projections of one layer.
#[derive(Debug, Clone)]
pub struct AttentionAdapters {
    /// Query adapter.
    pub q: LoraAdapter,
    /// Value adapter.
    pub v: LoraAdapter,
}

impl AttentionAdapters {
    /// Fresh adapters for one layer of `config`.
    pub fn new(config: &ModelConfig, device: &Device, rng: &mut StdRng) -> Result<Self> {
        let dim = config.dim;
        let head_dim = config.head_dim();
        let q_out = config.n_heads * head_dim;
        let v_out = config.kv_heads() * head_dim;
        let q = LoraAdapter::new(
            dim,
            q_out,
            config.lora_rank,
            config.lora_alpha,
            config.lora_dropout,
            config.dtype(),
            device,
            rng,
        )?;
        let v = LoraAdapter::new(
            dim,
            v_out,
            config.lora_rank,
            config.lora_alpha,
            config.lora_dropout,
            config.dtype(),
            device,
            rng,
        )?;
        Ok(Self { q, v })
    }

    /// All four trainable tensors.
    pub fn vars(&self) -> [&Var; 4] {
        let [qd, qu] = self.q.vars();
        let [vd, vu] = self.v.vars();
        [qd, qu, vd, vu]
    }
}

/// Adapters for every layer, in layer order.
#[derive(Debug, Clone)]
pub struct AdapterSet {
    layers: Vec<AttentionAdapters>,
}

impl AdapterSet {
    /// Fresh adapters for every layer of `config`.
    pub fn new(config: &ModelConfig, device: &Device, rng: &mut StdRng) -> Result<Self> {
        let layers = (0..config.n_layers)
            .map(|_| AttentionAdapters::new(config, device, rng))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    /// Adapters of layer `idx`.
    pub fn layer(&self, idx: usize) -> Option<&AttentionAdapters> {
        self.layers.get(idx)
    }

    /// Iterate over layers.
    pub fn iter(&self) -> std::slice::Iter<'_, AttentionAdapters> {
        self.layers.iter()
    }

    /// Number of adapted layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// True if there are no adapted layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Every trainable tensor in the model.
    pub fn vars(&self) -> Vec<&Var> {
        self.layers.iter().flat_map(|l| l.vars()).collect()
    }

    /// Total number of trainable scalars.
    pub fn num_parameters(&self) -> usize {
        self.vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Adapter weights keyed as `layers.{i}.{q,v}_lora.{down,up}`.
    pub fn named_tensors(&self) -> HashMap<String, Tensor> {
        let mut named = HashMap::new();
        for (i, layer) in self.layers.iter().enumerate() {
            for (slot, adapter) in [("q_lora", &layer.q), ("v_lora", &layer.v)] {
                named.insert(
                    format!("layers.{i}.{slot}.down"),
                    adapter.down.as_detached_tensor(),
                );
                named.insert(
                    format!("layers.{i}.{slot}.up"),
                    adapter.up.as_detached_tensor(),
                );
            }
        }
        named
    }

    /// Write adapter weights to a safetensors file.
    pub fn save(&self, path: &Path) -> Result<()> {
        candle_core::safetensors::save(&self.named_tensors(), path)?;
        tracing::info!("saved {} adapter tensors to {}", self.layers.len() * 4, path.display());
        Ok(())
    }

    /// Overwrite adapter weights from a safetensors file written by [`AdapterSet::save`].
    pub fn load(&self, path: &Path) -> Result<()> {
        let device = self
            .layers
            .first()
            .map(|l| l.q.down.device().clone())
            .unwrap_or(Device::Cpu);
        let tensors = candle_core::safetensors::load(path, &device)?;
        for (i, layer) in self.layers.iter().enumerate() {
            for (slot, adapter) in [("q_lora", &layer.q), ("v_lora", &layer.v)] {
                for (part, var) in [("down", &adapter.down), ("up", &adapter.up)] {
                    let name = format!("layers.{i}.{slot}.{part}");
                    let tensor = tensors
                        .get(&name)
                        .ok_or_else(|| OfftuneError::StorageMissing(name.clone()))?;
                    if tensor.dims() != var.dims() {
                        return Err(OfftuneError::ShapeMismatch(format!(
                            "{name}: expected {:?}, got {:?}",
                            var.dims(),
                            tensor.dims()
                        )));
                    }
                    var.set(&tensor.to_dtype(var.dtype())?)?;
                }
            }
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a AdapterSet {
    type Item = &'a AttentionAdapters;
    type IntoIter = std::slice::Iter<'a, AttentionAdapters>;

    fn into_iter(self) -> Self::IntoIter {
        self.layers.iter()
    }
}
