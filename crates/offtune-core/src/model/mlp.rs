//! SwiGLU feed-forward block (Swish-Gated Linear Unit).
//!
//! SwiGLU is a gated activation function used in modern transformers
//! like Llama and PaLM. It combines SiLU (Swish) with a gating mechanism.
//!
//! # Formula
//!
//! `FeedForward(x) = dropout(w2(silu(w1(x)) * w3(x)))`
//!
//! Where `silu(x) = x * sigmoid(x)`
//!
//! # Reference
//!
//! [GLU Variants Improve Transformer](https://arxiv.org/abs/2002.05202)

use super::{kaiming_uniform, linear, ModelConfig};
use crate::error::{OfftuneError, Result};
use crate::rng::{dropout, DropoutRng};
use candle_core::{Device, Tensor};
use candle_nn::ops::silu;
use rand::rngs::StdRng;

/// SwiGLU feed-forward block.
#[derive(Debug, Clone)]
pub struct FeedForward {
    /// Gate projection: dim -> hidden
    w1: Tensor,
    /// Down projection: hidden -> dim
    w2: Tensor,
    /// Up projection: dim -> hidden
    w3: Tensor,
    /// Output dropout rate.
    dropout: f32,
}

impl FeedForward {
    /// Create a feed-forward block with given weights.
    pub fn new(w1: Tensor, w2: Tensor, w3: Tensor, dropout: f32) -> Result<Self> {
        let (hidden, dim) = w1.dims2()?;
        if w3.dims() != [hidden, dim] || w2.dims() != [dim, hidden] {
            return Err(OfftuneError::ShapeMismatch(format!(
                "feed-forward weights disagree: w1 {:?}, w2 {:?}, w3 {:?}",
                w1.dims(),
                w2.dims(),
                w3.dims()
            )));
        }
        Ok(Self {
            w1,
            w2,
            w3,
            dropout,
        })
    }

    /// Create a feed-forward block with seeded random weights.
    pub fn random(config: &ModelConfig, device: &Device, rng: &mut StdRng) -> Result<Self> {
        let dim = config.dim;
        let hidden = config.ffn_hidden_dim();
        let dtype = config.dtype();
        Ok(Self {
            w1: kaiming_uniform(rng, hidden, dim, dtype, device)?,
            w2: kaiming_uniform(rng, dim, hidden, dtype, device)?,
            w3: kaiming_uniform(rng, hidden, dim, dtype, device)?,
            dropout: config.dropout,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., dim]
    /// * `rng` - Dropout state
    pub fn forward(&self, x: &Tensor, rng: &mut DropoutRng) -> Result<Tensor> {
        let gate = silu(&linear(x, &self.w1)?)?;
        let up = linear(x, &self.w3)?;
        let out = linear(&(gate * up)?, &self.w2)?;
        dropout(&out, self.dropout, rng)
    }

    /// Hidden width.
    pub fn hidden_dim(&self) -> usize {
        self.w1.dims()[0]
    }

    /// Model width.
    pub fn dim(&self) -> usize {
        self.w1.dims()[1]
    }

    /// `(w1, w2, w3)`.
    pub fn weights(&self) -> (&Tensor, &Tensor, &Tensor) {
        (&self.w1, &self.w2, &self.w3)
    }

    /// Drop any gradient history from the weights.
    pub fn freeze(&mut self) {
        self.w1 = self.w1.detach();
        self.w2 = self.w2.detach();
        self.w3 = self.w3.detach();
    }
}
