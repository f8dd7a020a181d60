//! Explicit randomness state for dropout.
//!
//! Dropout masks are drawn from a [`DropoutRng`] that is threaded through every
//! forward call instead of from a device-global generator. The manual backward
//! pass snapshots this state before each layer and restores it before the
//! layer is recomputed, which makes every recomputed mask bit-identical to the
//! one drawn during the forward pass.

use crate::error::{OfftuneError, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Kind of compute device a snapshot was taken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    /// Host CPU.
    Cpu,
    /// CUDA device.
    Cuda,
    /// Metal device.
    Metal,
}

impl DeviceClass {
    /// Classify a candle device.
    pub fn of(device: &Device) -> Self {
        if device.is_cuda() {
            DeviceClass::Cuda
        } else if device.is_metal() {
            DeviceClass::Metal
        } else {
            DeviceClass::Cpu
        }
    }
}

/// Opaque saved generator state.
#[derive(Debug, Clone)]
pub struct RngSnapshot {
    device: DeviceClass,
    state: StdRng,
    training: bool,
}

impl RngSnapshot {
    /// Device class this snapshot belongs to.
    pub fn device_class(&self) -> DeviceClass {
        self.device
    }
}

/// Seeded generator driving every dropout mask.
#[derive(Debug, Clone)]
pub struct DropoutRng {
    state: StdRng,
    training: bool,
}

impl DropoutRng {
    /// Training-mode generator from a seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            state: StdRng::seed_from_u64(seed),
            training: true,
        }
    }

    /// Evaluation-mode generator: every dropout site is the identity.
    pub fn eval() -> Self {
        Self {
            state: StdRng::seed_from_u64(0),
            training: false,
        }
    }

    /// Whether dropout is active.
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Switch between training and evaluation mode.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Capture the current state for `device`.
    pub fn save_state(&self, device: &Device) -> RngSnapshot {
        RngSnapshot {
            device: DeviceClass::of(device),
            state: self.state.clone(),
            training: self.training,
        }
    }

    /// Rewind to a previously captured state.
    pub fn restore_state(&mut self, snapshot: &RngSnapshot, device: &Device) -> Result<()> {
        let class = DeviceClass::of(device);
        if snapshot.device != class {
            return Err(OfftuneError::StateFormatMismatch(format!(
                "snapshot taken for {:?}, restoring on {:?}",
                snapshot.device, class
            )));
        }
        self.state = snapshot.state.clone();
        self.training = snapshot.training;
        Ok(())
    }

    /// Draw a keep-mask scaled by `1 / (1 - p)`.
    fn mask(&mut self, len: usize, p: f32) -> Vec<f32> {
        let scale = 1.0 / (1.0 - p);
        (0..len)
            .map(|_| if self.state.gen::<f32>() < p { 0.0 } else { scale })
            .collect()
    }
}

/// Inverted dropout with rate `p`.
///
/// Identity, with no randomness consumed, when `p == 0` or the generator is
/// in evaluation mode.
pub fn dropout(x: &Tensor, p: f32, rng: &mut DropoutRng) -> Result<Tensor> {
    if p <= 0.0 || !rng.training {
        return Ok(x.clone());
    }
    if p >= 1.0 {
        return Ok(x.zeros_like()?);
    }
    let mask = rng.mask(x.elem_count(), p);
    let mask = Tensor::from_vec(mask, x.shape(), x.device())?.to_dtype(x.dtype())?;
    Ok(x.mul(&mask)?)
}
