//! # Offtune
//!
//! LoRA fine-tuning for transformers that do not fit in device memory.
//!
//! Frozen layer weights live in an offload store (host RAM or disk) and are
//! brought onto the device one layer at a time. The backward pass replays
//! each layer from its cached input with the dropout RNG rewound to the
//! state it had during the forward pass, so gradients match an ordinary
//! in-memory step.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use offtune::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let tuner = FineTuner::builder()
//!         .config_file("config.json")
//!         .weights_path("model.safetensors")
//!         .offload_location(OffloadLocation::Disk)
//!         .build()?;
//!
//!     let (inputs, targets) = tuner.next_token_batch(&[1, 15043, 29892, 3186])?;
//!     let out = tuner.step(&inputs, &targets)?;
//!     println!("loss {:.4}", out.loss);
//!
//!     tuner.save_adapters("adapters.safetensors".as_ref())?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use offtune_core::*;

mod tuner;

pub use tuner::{FineTuner, FineTunerBuilder, FineTunerConfig};

/// Commonly used types.
pub mod prelude {
    pub use crate::tuner::{FineTuner, FineTunerBuilder, FineTunerConfig};
    pub use offtune_core::prelude::*;

    // Re-export useful external types
    pub use anyhow;
    pub use candle_core::{Device, Tensor};
    pub use tracing;
}
