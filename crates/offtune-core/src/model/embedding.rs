//! Token embedding and output projection.
//!
//! Both are offloadable like a transformer layer but sit outside the
//! per-layer replay loop: the embedding has no trainable input and the
//! output projection is replayed once from its cached input.

use super::{kaiming_uniform, linear, standard_normal, ModelConfig};
use crate::error::{OfftuneError, Result};
use crate::offload::{take_param, Blackbox, ModuleId, Offloadable};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use std::collections::HashMap;

/// Token id -> vector lookup table [vocab_size, dim].
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    weight: Tensor,
}

impl TokenEmbedding {
    /// Wrap an existing [vocab_size, dim] table.
    pub fn new(weight: Tensor) -> Result<Self> {
        weight.dims2()?;
        Ok(Self { weight })
    }

    /// Standard-normal table.
    pub fn random(config: &ModelConfig, device: &Device, rng: &mut StdRng) -> Result<Self> {
        let weight = standard_normal(rng, (config.vocab_size, config.dim), config.dtype(), device)?;
        Ok(Self { weight })
    }

    /// Look up `tokens` [batch, seq_len] -> [batch, seq_len, dim].
    pub fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = tokens.dims2()?;
        let (vocab_size, dim) = self.weight.dims2()?;
        if tokens.dtype().is_float() {
            return Err(OfftuneError::ShapeMismatch(format!(
                "token ids must be integers, got {:?}",
                tokens.dtype()
            )));
        }
        let ids = tokens.flatten_all()?;
        let wide = ids.to_dtype(candle_core::DType::I64)?;
        let min_id = wide.min(0)?.to_scalar::<i64>()?;
        let max_id = wide.max(0)?.to_scalar::<i64>()?;
        for id in [min_id, max_id] {
            if id < 0 || id as usize >= vocab_size {
                return Err(OfftuneError::ShapeMismatch(format!(
                    "token id {id} outside vocabulary of {vocab_size}"
                )));
            }
        }
        let rows = self.weight.index_select(&ids, 0)?;
        Ok(rows.reshape((batch, seq_len, dim))?)
    }

    /// The table.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl Offloadable for TokenEmbedding {
    fn named_tensors(&self) -> Vec<(String, Tensor)> {
        vec![("weight".to_string(), self.weight.clone())]
    }

    fn from_tensors(
        config: &ModelConfig,
        id: ModuleId,
        mut tensors: HashMap<String, Tensor>,
    ) -> Result<Self> {
        let shape = [config.vocab_size, config.dim];
        let weight = take_param(&mut tensors, id, "weight", &shape, config.dtype())?;
        Ok(Self { weight })
    }

    fn freeze(&mut self) {
        self.weight = self.weight.detach();
    }
}

impl Blackbox<TokenEmbedding> {
    /// Cache `tokens`, load the table, look them up.
    pub fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        self.cache_input(tokens)?;
        let embedding = self.load(tokens.device())?;
        embedding.forward(tokens)
    }
}

/// Final projection to vocabulary logits, weight [vocab_size, dim].
#[derive(Debug, Clone)]
pub struct OutputProjection {
    weight: Tensor,
}

impl OutputProjection {
    /// Wrap an existing [vocab_size, dim] weight.
    pub fn new(weight: Tensor) -> Result<Self> {
        weight.dims2()?;
        Ok(Self { weight })
    }

    /// Kaiming-uniform weight.
    pub fn random(config: &ModelConfig, device: &Device, rng: &mut StdRng) -> Result<Self> {
        let weight = kaiming_uniform(rng, config.vocab_size, config.dim, config.dtype(), device)?;
        Ok(Self { weight })
    }

    /// `[.., dim] -> [.., vocab_size]`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        linear(x, &self.weight)
    }

    /// The weight.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl Offloadable for OutputProjection {
    fn named_tensors(&self) -> Vec<(String, Tensor)> {
        vec![("weight".to_string(), self.weight.clone())]
    }

    fn from_tensors(
        config: &ModelConfig,
        id: ModuleId,
        mut tensors: HashMap<String, Tensor>,
    ) -> Result<Self> {
        let shape = [config.vocab_size, config.dim];
        let weight = take_param(&mut tensors, id, "weight", &shape, config.dtype())?;
        Ok(Self { weight })
    }

    fn freeze(&mut self) {
        self.weight = self.weight.detach();
    }
}

impl Blackbox<OutputProjection> {
    /// Cache `x`, load the projection, apply it.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.cache_input(x)?;
        let output = self.load(x.device())?;
        output.forward(x)
    }
}
