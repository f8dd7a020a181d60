//! Model components and the offloaded transformer container.
//!
//! Provides:
//! - Model configuration
//! - Weight loading
//! - Layer building blocks (norm, rotary tables, attention, feed-forward)
//! - The [`Transformer`] container and its ordinary forward path

mod config;
mod embedding;
mod layer;
mod linear;
mod loader;
mod mlp;
mod rmsnorm;
mod rope;
mod transformer;

pub use config::{ffn_hidden_dim, ComputePrecision, ModelConfig, OffloadLocation};
pub use embedding::{OutputProjection, TokenEmbedding};
pub use layer::{create_causal_mask, repeat_kv, Attention, LayerContext, TransformerLayer};
pub use linear::{kaiming_uniform, linear, standard_normal, uniform};
pub use loader::{map_hf_name, read_safetensors, unpermute_rotary, WeightLoader};
pub use mlp::FeedForward;
pub use rmsnorm::RmsNorm;
pub use rope::{RopeTables, RotaryEmbedding};
pub use transformer::{ForwardOutput, Transformer};
