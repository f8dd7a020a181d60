//! Model configuration.

use crate::error::{OfftuneError, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Numeric precision used for parameters and activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ComputePrecision {
    /// 32-bit float.
    #[default]
    F32,
    /// IEEE half precision.
    F16,
    /// bfloat16.
    Bf16,
}

impl ComputePrecision {
    /// Candle dtype for this precision.
    pub fn dtype(self) -> DType {
        match self {
            ComputePrecision::F32 => DType::F32,
            ComputePrecision::F16 => DType::F16,
            ComputePrecision::Bf16 => DType::BF16,
        }
    }
}

/// Where offloaded modules and cached activations live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OffloadLocation {
    /// One safetensors file per module on disk.
    #[default]
    Disk,
    /// Host memory.
    Ram,
}

/// Configuration for a LoRA-adapted transformer model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Embedding dimension.
    pub dim: usize,
    /// Number of transformer layers.
    pub n_layers: usize,
    /// Number of query heads.
    pub n_heads: usize,
    /// Number of key/value heads (for GQA). `None` means `n_heads`.
    pub n_kv_heads: Option<usize>,
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Feed-forward hidden width is rounded up to a multiple of this.
    pub multiple_of: usize,
    /// Width multiplier applied before the 2/3 SwiGLU reduction.
    pub ffn_hidden_mult: usize,
    /// Optional extra multiplier on the feed-forward width.
    pub ffn_dim_multiplier: Option<f64>,
    /// RMS norm epsilon.
    pub norm_eps: f64,
    /// Maximum sequence length.
    pub max_seq_len: usize,
    /// Dropout rate for embedding, attention and feed-forward outputs.
    pub dropout: f32,
    /// Numeric precision for parameters and activations.
    pub compute_precision: ComputePrecision,
    /// Offload medium.
    pub offload_location: OffloadLocation,
    /// Directory for the disk offload medium.
    pub offload_dir: PathBuf,
    /// Rope theta.
    pub rope_theta: f64,
    /// LoRA rank.
    pub lora_rank: usize,
    /// LoRA alpha; the adapter scale is `alpha / rank`.
    pub lora_alpha: f64,
    /// Dropout rate applied to adapter inputs.
    pub lora_dropout: f32,
}

impl ModelConfig {
    /// Head dimension.
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Number of key/value heads.
    pub fn kv_heads(&self) -> usize {
        self.n_kv_heads.unwrap_or(self.n_heads)
    }

    /// How many query heads share each key/value head.
    pub fn n_rep(&self) -> usize {
        self.n_heads / self.kv_heads()
    }

    /// Feed-forward hidden width.
    pub fn ffn_hidden_dim(&self) -> usize {
        ffn_hidden_dim(
            self.dim,
            self.ffn_hidden_mult,
            self.multiple_of,
            self.ffn_dim_multiplier,
        )
    }

    /// Adapter output scale.
    pub fn lora_scale(&self) -> f64 {
        self.lora_alpha / self.lora_rank as f64
    }

    /// Candle dtype for parameters and activations.
    pub fn dtype(&self) -> DType {
        self.compute_precision.dtype()
    }

    /// Check that the dimensions fit together.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(OfftuneError::InvalidConfig(msg));
        if self.n_heads == 0 || self.dim % self.n_heads != 0 {
            return fail(format!(
                "dim {} is not divisible by n_heads {}",
                self.dim, self.n_heads
            ));
        }
        let kv = self.kv_heads();
        if kv == 0 || self.n_heads % kv != 0 {
            return fail(format!(
                "n_heads {} is not a multiple of n_kv_heads {}",
                self.n_heads, kv
            ));
        }
        if self.head_dim() % 2 != 0 {
            return fail(format!("head_dim {} must be even for rope", self.head_dim()));
        }
        if self.multiple_of == 0 {
            return fail("multiple_of must be positive".to_string());
        }
        if self.lora_rank == 0 {
            return fail("lora_rank must be positive".to_string());
        }
        if self.vocab_size == 0 || self.n_layers == 0 || self.max_seq_len == 0 {
            return fail("vocab_size, n_layers and max_seq_len must be positive".to_string());
        }
        for (name, p) in [("dropout", self.dropout), ("lora_dropout", self.lora_dropout)] {
            if !(0.0..1.0).contains(&p) {
                return fail(format!("{name} must be in [0, 1), got {p}"));
            }
        }
        Ok(())
    }

    /// Load from JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        // Llama-2-7B-like defaults
        Self {
            dim: 4096,
            n_layers: 32,
            n_heads: 32,
            n_kv_heads: None,
            vocab_size: 32000,
            multiple_of: 256,
            ffn_hidden_mult: 4,
            ffn_dim_multiplier: None,
            norm_eps: 1e-5,
            max_seq_len: 2048,
            dropout: 0.0,
            compute_precision: ComputePrecision::F32,
            offload_location: OffloadLocation::Disk,
            offload_dir: PathBuf::from("offload"),
            rope_theta: 10000.0,
            lora_rank: 8,
            lora_alpha: 64.0,
            lora_dropout: 0.05,
        }
    }
}

/// SwiGLU hidden width for a model dimension.
///
/// `mult * dim` is reduced to two thirds (truncating), optionally scaled by
/// `multiplier` (truncating), then rounded up to a multiple of `multiple_of`.
pub fn ffn_hidden_dim(
    dim: usize,
    mult: usize,
    multiple_of: usize,
    multiplier: Option<f64>,
) -> usize {
    let mut hidden = 2 * (mult * dim) / 3;
    if let Some(m) = multiplier {
        hidden = (m * hidden as f64) as usize;
    }
    multiple_of * hidden.div_ceil(multiple_of)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llama2_7b_hidden_width() {
        assert_eq!(ffn_hidden_dim(4096, 4, 256, None), 11008);
        assert_eq!(ModelConfig::default().ffn_hidden_dim(), 11008);
    }

    #[test]
    fn llama2_70b_hidden_width() {
        // dim=8192, ffn_dim_multiplier=1.3, multiple_of=4096
        assert_eq!(ffn_hidden_dim(8192, 4, 4096, Some(1.3)), 28672);
    }

    #[test]
    fn hidden_width_already_aligned() {
        assert_eq!(ffn_hidden_dim(96, 4, 256, None), 256);
        assert_eq!(ffn_hidden_dim(8, 4, 1, None), 21);
        assert_eq!(ffn_hidden_dim(8, 4, 4, None), 24);
    }

    #[test]
    fn derived_dimensions() {
        let config = ModelConfig {
            dim: 64,
            n_heads: 8,
            n_kv_heads: Some(2),
            ..Default::default()
        };
        assert_eq!(config.head_dim(), 8);
        assert_eq!(config.kv_heads(), 2);
        assert_eq!(config.n_rep(), 4);
        assert!((config.lora_scale() - 8.0).abs() < 1e-12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_heads() {
        let config = ModelConfig {
            dim: 64,
            n_heads: 8,
            n_kv_heads: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(OfftuneError::InvalidConfig(_))
        ));
    }

    #[test]
    fn validate_rejects_zero_rank() {
        let config = ModelConfig {
            lora_rank: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip_with_partial_fields() {
        let json = r#"{ "dim": 8, "n_layers": 2, "n_heads": 2, "vocab_size": 16,
                        "offload_location": "ram", "compute_precision": "bf16" }"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.dim, 8);
        assert_eq!(config.offload_location, OffloadLocation::Ram);
        assert_eq!(config.dtype(), DType::BF16);
        // Unspecified fields keep their defaults.
        assert_eq!(config.multiple_of, 256);
        assert_eq!(config.lora_rank, 8);
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = ModelConfig {
            dim: 16,
            n_layers: 1,
            n_heads: 4,
            vocab_size: 32,
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
        let loaded = ModelConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Hidden width is aligned and never smaller than the unrounded width.
        #[test]
        fn hidden_width_is_aligned(
            dim in 1usize..8192,
            multiple_of in prop::sample::select(vec![1usize, 4, 32, 64, 256]),
        ) {
            let hidden = ffn_hidden_dim(dim, 4, multiple_of, None);
            prop_assert_eq!(hidden % multiple_of, 0);
            prop_assert!(hidden >= 8 * dim / 3);
            prop_assert!(hidden < 8 * dim / 3 + multiple_of);
        }
    }
}
