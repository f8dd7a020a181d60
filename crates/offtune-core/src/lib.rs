//! # Offtune Core
//!
//! LoRA fine-tuning of llama-style transformers whose frozen weights live
//! outside working memory.
//!
//! This crate provides:
//! - **Low-rank adapters** on the query and value projections, the only
//!   trainable tensors in the model
//! - **Blackbox offload** of every layer, the embedding and the output
//!   projection to RAM or disk, with cached inputs for recomputation
//! - **Manual backpropagation** that replays one layer at a time in reverse,
//!   restoring the dropout generator so recomputed masks match the forward pass
//! - An ordinary single-graph forward path for reference and inference

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backprop;
pub mod error;
pub mod lora;
pub mod model;
pub mod offload;
pub mod rng;

pub use error::{OfftuneError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backprop::{BackwardReport, ManualBackprop, Phase, StepOutput, IGNORE_INDEX};
    pub use crate::error::{OfftuneError, Result};
    pub use crate::lora::{AdapterGrads, AdapterSet, LoraAdapter};
    pub use crate::model::{ModelConfig, OffloadLocation, Transformer, WeightLoader};
    pub use crate::offload::{open_store, DiskStore, OffloadStore, RamStore};
    pub use crate::rng::DropoutRng;
}
