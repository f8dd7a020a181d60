//! Error types for Offtune Core.

use thiserror::Error;

/// Result type alias for Offtune operations.
pub type Result<T> = std::result::Result<T, OfftuneError>;

/// Errors that can occur while running or replaying a training step.
///
/// Every variant aborts the current forward+backward invocation. Partially
/// accumulated adapter gradients must be discarded by the caller.
#[derive(Error, Debug)]
pub enum OfftuneError {
    /// A module was never saved to the offload store.
    #[error("storage missing: {0}")]
    StorageMissing(String),

    /// Serialized module state does not match the expected parameters.
    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    /// No cached activation exists for a module.
    #[error("activation cache miss: {0}")]
    CacheMiss(String),

    /// A randomness snapshot was restored on an incompatible device.
    #[error("rng state format mismatch: {0}")]
    StateFormatMismatch(String),

    /// Shape mismatch error.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Non-finite loss or gradient.
    #[error("numeric instability: {0}")]
    NumericInstability(String),

    /// Invalid model configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Operation issued in the wrong orchestrator phase.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}
