//! Rotary Position Embeddings (RoPE).
//!
//! RoPE encodes position information by rotating query and key vectors
//! in the complex plane. Coordinates are rotated in adjacent pairs
//! `(x[2i], x[2i+1])`, each pair treated as one complex number.
//!
//! # Reference
//!
//! [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use crate::error::{OfftuneError, Result};
use candle_core::{DType, Device, Tensor};

/// Precomputed rotation tables for every position up to `max_seq_len`.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Cosine cache [max_seq_len, head_dim / 2].
    cos_cache: Tensor,
    /// Sine cache [max_seq_len, head_dim / 2].
    sin_cache: Tensor,
    /// Head dimension.
    head_dim: usize,
    /// Maximum sequence length cached.
    max_seq_len: usize,
}

impl RotaryEmbedding {
    /// Tables for angles `position / theta^(2i / head_dim)`.
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        if head_dim % 2 != 0 {
            return Err(OfftuneError::ShapeMismatch(format!(
                "rope head_dim must be even, got {head_dim}"
            )));
        }
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_slice(&inv_freq, (1, half_dim), device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::from_slice(&positions, (max_seq_len, 1), device)?;

        // freqs = positions * inv_freq -> [max_seq_len, half_dim]
        let freqs = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos_cache: freqs.cos()?,
            sin_cache: freqs.sin()?,
            head_dim,
            max_seq_len,
        })
    }

    /// Tables for the first `seq_len` positions.
    pub fn slice(&self, seq_len: usize) -> Result<RopeTables> {
        if seq_len > self.max_seq_len {
            return Err(OfftuneError::ShapeMismatch(format!(
                "sequence length {seq_len} exceeds max_seq_len {}",
                self.max_seq_len
            )));
        }
        Ok(RopeTables {
            cos: self.cos_cache.narrow(0, 0, seq_len)?,
            sin: self.sin_cache.narrow(0, 0, seq_len)?,
        })
    }

    /// Full cosine table.
    pub fn cos(&self) -> &Tensor {
        &self.cos_cache
    }

    /// Full sine table.
    pub fn sin(&self) -> &Tensor {
        &self.sin_cache
    }

    /// Longest sequence the tables cover.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Per-head width.
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}

/// Cos/sin rows for one forward call, each [seq_len, head_dim / 2].
#[derive(Debug, Clone)]
pub struct RopeTables {
    cos: Tensor,
    sin: Tensor,
}

impl RopeTables {
    /// Number of positions covered.
    pub fn seq_len(&self) -> usize {
        self.cos.dims()[0]
    }

    /// Rotate `query` [b, heads, s, d] and `key` [b, kv_heads, s, d]; values are left alone.
    pub fn apply(&self, query: &Tensor, key: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((self.rotate_pairs(query)?, self.rotate_pairs(key)?))
    }

    /// Rotate adjacent coordinate pairs, computed in f32.
    fn rotate_pairs(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq_len, head_dim) = x.dims4()?;
        let half_dim = head_dim / 2;
        if seq_len != self.seq_len() || half_dim != self.cos.dims()[1] {
            return Err(OfftuneError::ShapeMismatch(format!(
                "rope tables [{}, {}] do not fit input {:?}",
                self.seq_len(),
                self.cos.dims()[1],
                x.dims()
            )));
        }
        let dtype = x.dtype();

        // [batch, heads, seq, half_dim, 2]
        let pairs = x
            .to_dtype(DType::F32)?
            .reshape((batch, heads, seq_len, half_dim, 2))?;
        let re = pairs.narrow(4, 0, 1)?.squeeze(4)?;
        let im = pairs.narrow(4, 1, 1)?.squeeze(4)?;

        let cos = self.cos.reshape((1, 1, seq_len, half_dim))?;
        let sin = self.sin.reshape((1, 1, seq_len, half_dim))?;

        // (re + i*im) * (cos + i*sin)
        let out_re = (re.broadcast_mul(&cos)? - im.broadcast_mul(&sin)?)?;
        let out_im = (re.broadcast_mul(&sin)? + im.broadcast_mul(&cos)?)?;

        let out = Tensor::stack(&[out_re, out_im], 4)?.flatten_from(3)?;
        Ok(out.to_dtype(dtype)?)
    }
}
