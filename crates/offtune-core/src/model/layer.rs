//! Transformer layer implementation.
//!
//! A single transformer decoder layer combining:
//! - Pre-attention RMSNorm
//! - Grouped Query Attention with LoRA on the query and value projections
//! - Pre-feed-forward RMSNorm
//! - SwiGLU feed-forward
//!
//! The layer is the unit of offload: all of its frozen weights are saved
//! and restored together. Its adapters are not part of it.

use super::{kaiming_uniform, linear, FeedForward, ModelConfig, RmsNorm, RopeTables, RotaryEmbedding};
use crate::error::{OfftuneError, Result};
use crate::lora::AttentionAdapters;
use crate::offload::{take_param, Blackbox, ModuleId, Offloadable};
use crate::rng::{dropout, DropoutRng};
use candle_core::{DType, Device, Tensor, D};
use rand::rngs::StdRng;
use std::collections::HashMap;

/// Per-call inputs shared by every layer: rotary tables and the causal mask.
#[derive(Debug, Clone)]
pub struct LayerContext {
    /// Rotary tables for the current sequence length.
    pub rope: RopeTables,
    /// Additive causal mask [1, 1, seq_len, seq_len] in f32.
    pub mask: Tensor,
}

impl LayerContext {
    /// Build the context for a sequence of `seq_len` tokens.
    pub fn new(rope: &RotaryEmbedding, seq_len: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            rope: rope.slice(seq_len)?,
            mask: create_causal_mask(seq_len, device)?,
        })
    }

    /// Sequence length this context was built for.
    pub fn seq_len(&self) -> usize {
        self.rope.seq_len()
    }
}

/// Self-attention module for transformer layers.
#[derive(Debug, Clone)]
pub struct Attention {
    /// Query projection: [n_heads * head_dim, dim]
    wq: Tensor,
    /// Key projection: [n_kv_heads * head_dim, dim]
    wk: Tensor,
    /// Value projection: [n_kv_heads * head_dim, dim]
    wv: Tensor,
    /// Output projection: [dim, n_heads * head_dim]
    wo: Tensor,
    /// Number of attention heads.
    num_heads: usize,
    /// Number of key-value heads (for GQA).
    num_kv_heads: usize,
    /// Head dimension.
    head_dim: usize,
    /// Dropout rate on attention probabilities and the output.
    dropout: f32,
}

impl Attention {
    /// Create attention with seeded random weights.
    pub fn random(config: &ModelConfig, device: &Device, rng: &mut StdRng) -> Result<Self> {
        let dim = config.dim;
        let head_dim = config.head_dim();
        let q_out = config.n_heads * head_dim;
        let kv_out = config.kv_heads() * head_dim;
        let dtype = config.dtype();
        Ok(Self {
            wq: kaiming_uniform(rng, q_out, dim, dtype, device)?,
            wk: kaiming_uniform(rng, kv_out, dim, dtype, device)?,
            wv: kaiming_uniform(rng, kv_out, dim, dtype, device)?,
            wo: kaiming_uniform(rng, dim, q_out, dtype, device)?,
            num_heads: config.n_heads,
            num_kv_heads: config.kv_heads(),
            head_dim,
            dropout: config.dropout,
        })
    }

    /// Create attention with provided weights.
    pub fn new(
        wq: Tensor,
        wk: Tensor,
        wv: Tensor,
        wo: Tensor,
        config: &ModelConfig,
    ) -> Result<Self> {
        Ok(Self {
            wq,
            wk,
            wv,
            wo,
            num_heads: config.n_heads,
            num_kv_heads: config.kv_heads(),
            head_dim: config.head_dim(),
            dropout: config.dropout,
        })
    }

    /// Attention forward pass.
    ///
    /// Adapter randomness is consumed in a fixed order: query adapter,
    /// value adapter, attention probabilities, output.
    ///
    /// # Arguments
    ///
    /// * `x` - Normalized input [batch, seq_len, dim]
    /// * `ctx` - Rotary tables and causal mask
    /// * `adapters` - Query and value adapters
    /// * `rng` - Dropout state
    pub fn forward(
        &self,
        x: &Tensor,
        ctx: &LayerContext,
        adapters: &AttentionAdapters,
        rng: &mut DropoutRng,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        adapters.q.check_wraps(&self.wq)?;
        adapters.v.check_wraps(&self.wv)?;

        let xq = (linear(x, &self.wq)? + adapters.q.forward(x, rng)?)?;
        let xk = linear(x, &self.wk)?;
        let xv = (linear(x, &self.wv)? + adapters.v.forward(x, rng)?)?;

        // [batch, seq, heads, head_dim] -> [batch, heads, seq, head_dim]
        let q = self.split_heads(&xq, batch, seq_len, self.num_heads)?;
        let k = self.split_heads(&xk, batch, seq_len, self.num_kv_heads)?;
        let v = self.split_heads(&xv, batch, seq_len, self.num_kv_heads)?;

        let (q, k) = ctx.rope.apply(&q, &k)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(&k, n_rep)?;
        let v = repeat_kv(&v, n_rep)?;

        let attn = self.scaled_dot_product(&q, &k, &v, &ctx.mask, rng)?;

        // [batch, heads, seq, head_dim] -> [batch, seq, heads * head_dim]
        let attn = attn
            .transpose(1, 2)?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        let out = linear(&attn, &self.wo)?;
        dropout(&out, self.dropout, rng)
    }

    fn split_heads(&self, x: &Tensor, batch: usize, seq_len: usize, heads: usize) -> Result<Tensor> {
        Ok(x.reshape((batch, seq_len, heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Causal attention with the softmax taken in f32.
    fn scaled_dot_product(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &Tensor,
        rng: &mut DropoutRng,
    ) -> Result<Tensor> {
        let dtype = q.dtype();
        let scale = 1.0 / (self.head_dim as f64).sqrt();

        // Attention scores: Q @ K^T / sqrt(d)
        let scores = (q.matmul(&k.t()?)? * scale)?;
        let scores = scores.to_dtype(DType::F32)?.broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(dtype)?;
        let probs = dropout(&probs, self.dropout, rng)?;

        Ok(probs.matmul(v)?)
    }

    /// Get the number of heads.
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Get the number of KV heads.
    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    /// Get the head dimension.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// `(wq, wk, wv, wo)`.
    pub fn weights(&self) -> (&Tensor, &Tensor, &Tensor, &Tensor) {
        (&self.wq, &self.wk, &self.wv, &self.wo)
    }

    fn freeze(&mut self) {
        self.wq = self.wq.detach();
        self.wk = self.wk.detach();
        self.wv = self.wv.detach();
        self.wo = self.wo.detach();
    }
}

/// Repeat KV heads for GQA.
///
/// `[batch, kv_heads, seq, head_dim] -> [batch, kv_heads * n_rep, seq, head_dim]`,
/// each KV head repeated contiguously so query head `h` reads KV head `h / n_rep`.
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }

    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;

    // [batch, kv_heads, seq, head_dim] -> [batch, kv_heads, 1, seq, head_dim]
    let x = x.unsqueeze(2)?;
    // Expand to [batch, kv_heads, n_rep, seq, head_dim]
    let x = x.expand((batch, num_kv_heads, n_rep, seq_len, head_dim))?;
    // Reshape to [batch, heads, seq, head_dim]
    Ok(x.reshape((batch, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// Create a causal attention mask.
pub fn create_causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    // mask[i][j] = 0 if j <= i, -inf otherwise
    let mask_data: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();

    let mask = Tensor::from_vec(mask_data, (seq_len, seq_len), device)?;

    // Add batch and head dimensions: [1, 1, seq_len, seq_len]
    Ok(mask.unsqueeze(0)?.unsqueeze(0)?)
}

/// A single transformer decoder layer.
#[derive(Debug, Clone)]
pub struct TransformerLayer {
    /// Pre-attention layer norm.
    attention_norm: RmsNorm,
    /// Self-attention.
    attention: Attention,
    /// Pre-feed-forward layer norm.
    ffn_norm: RmsNorm,
    /// Feed-forward block.
    feed_forward: FeedForward,
    /// Layer index.
    layer_idx: usize,
}

impl TransformerLayer {
    /// Create a new transformer layer.
    pub fn new(
        attention_norm: RmsNorm,
        attention: Attention,
        ffn_norm: RmsNorm,
        feed_forward: FeedForward,
        layer_idx: usize,
    ) -> Self {
        Self {
            attention_norm,
            attention,
            ffn_norm,
            feed_forward,
            layer_idx,
        }
    }

    /// Create a transformer layer with seeded random weights.
    pub fn random(
        config: &ModelConfig,
        layer_idx: usize,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let dtype = config.dtype();
        Ok(Self {
            attention_norm: RmsNorm::ones(config.dim, config.norm_eps, dtype, device)?,
            attention: Attention::random(config, device, rng)?,
            ffn_norm: RmsNorm::ones(config.dim, config.norm_eps, dtype, device)?,
            feed_forward: FeedForward::random(config, device, rng)?,
            layer_idx,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - Input tensor [batch, seq_len, dim]
    /// * `ctx` - Rotary tables and causal mask
    /// * `adapters` - This layer's adapters
    /// * `rng` - Dropout state
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        ctx: &LayerContext,
        adapters: &AttentionAdapters,
        rng: &mut DropoutRng,
    ) -> Result<Tensor> {
        let normed = self.attention_norm.forward(hidden_states)?;
        let attn_output = self.attention.forward(&normed, ctx, adapters, rng)?;
        let hidden_states = (hidden_states + attn_output)?;

        let normed = self.ffn_norm.forward(&hidden_states)?;
        let ff_output = self.feed_forward.forward(&normed, rng)?;
        Ok((hidden_states + ff_output)?)
    }

    /// Get the layer index.
    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Get the attention module.
    pub fn attention(&self) -> &Attention {
        &self.attention
    }

    /// Get the feed-forward module.
    pub fn feed_forward(&self) -> &FeedForward {
        &self.feed_forward
    }
}

impl Offloadable for TransformerLayer {
    fn named_tensors(&self) -> Vec<(String, Tensor)> {
        let (wq, wk, wv, wo) = self.attention.weights();
        let (w1, w2, w3) = self.feed_forward.weights();
        [
            ("attention.wq.weight", wq),
            ("attention.wk.weight", wk),
            ("attention.wv.weight", wv),
            ("attention.wo.weight", wo),
            ("feed_forward.w1.weight", w1),
            ("feed_forward.w2.weight", w2),
            ("feed_forward.w3.weight", w3),
            ("attention_norm.weight", self.attention_norm.weight()),
            ("ffn_norm.weight", self.ffn_norm.weight()),
        ]
        .into_iter()
        .map(|(name, t)| (name.to_string(), t.clone()))
        .collect()
    }

    fn from_tensors(
        config: &ModelConfig,
        id: ModuleId,
        mut tensors: HashMap<String, Tensor>,
    ) -> Result<Self> {
        let ModuleId::Layer(layer_idx) = id else {
            return Err(OfftuneError::StorageCorrupt(format!(
                "{id} is not a transformer layer"
            )));
        };
        let dtype = config.dtype();
        let dim = config.dim;
        let q_out = config.n_heads * config.head_dim();
        let kv_out = config.kv_heads() * config.head_dim();
        let hidden = config.ffn_hidden_dim();
        let mut take = |name: &str, shape: &[usize]| take_param(&mut tensors, id, name, shape, dtype);

        let attention = Attention::new(
            take("attention.wq.weight", &[q_out, dim])?,
            take("attention.wk.weight", &[kv_out, dim])?,
            take("attention.wv.weight", &[kv_out, dim])?,
            take("attention.wo.weight", &[dim, q_out])?,
            config,
        )?;
        let feed_forward = FeedForward::new(
            take("feed_forward.w1.weight", &[hidden, dim])?,
            take("feed_forward.w2.weight", &[dim, hidden])?,
            take("feed_forward.w3.weight", &[hidden, dim])?,
            config.dropout,
        )?;
        let attention_norm = RmsNorm::new(take("attention_norm.weight", &[dim])?, config.norm_eps)?;
        let ffn_norm = RmsNorm::new(take("ffn_norm.weight", &[dim])?, config.norm_eps)?;

        Ok(Self::new(attention_norm, attention, ffn_norm, feed_forward, layer_idx))
    }

    fn freeze(&mut self) {
        self.attention_norm.freeze();
        self.attention.freeze();
        self.ffn_norm.freeze();
        self.feed_forward.freeze();
    }
}

impl Blackbox<TransformerLayer> {
    /// Cache `hidden_states`, load the layer, run it, release it.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        ctx: &LayerContext,
        adapters: &AttentionAdapters,
        rng: &mut DropoutRng,
    ) -> Result<Tensor> {
        self.cache_input(hidden_states)?;
        let layer = self.load(hidden_states.device())?;
        layer.forward(hidden_states, ctx, adapters, rng)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Invariant: repeated head h equals original head h / n_rep.
        #[test]
        fn repeat_kv_head_mapping(kv_heads in 1usize..4, n_rep in 1usize..4, seq in 1usize..5) {
            let x = Tensor::randn(0.0f32, 1.0, &[1, kv_heads, seq, 2], &Device::Cpu).unwrap();
            let repeated = repeat_kv(&x, n_rep).unwrap();
            prop_assert_eq!(repeated.dims(), &[1, kv_heads * n_rep, seq, 2]);
            for h in 0..kv_heads * n_rep {
                let got: Vec<Vec<f32>> = repeated.get(0).unwrap().get(h).unwrap().to_vec2().unwrap();
                let want: Vec<Vec<f32>> = x.get(0).unwrap().get(h / n_rep).unwrap().to_vec2().unwrap();
                prop_assert_eq!(got, want);
            }
        }
    }
}
