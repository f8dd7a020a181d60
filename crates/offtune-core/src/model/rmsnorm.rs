//! RMS normalization.
//!
//! `RmsNorm(x) = weight * x / sqrt(mean(x^2) + eps)`, with no mean
//! subtraction. The reduction runs in f32 whatever the activation dtype;
//! the result is cast back before the scale is applied.

use crate::error::Result;
use candle_core::{DType, Device, Tensor, D};

/// RMS normalization with a frozen per-feature scale.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    /// Wrap a `[dim]` scale vector.
    pub fn new(weight: Tensor, eps: f64) -> Result<Self> {
        weight.dims1()?;
        Ok(Self { weight, eps })
    }

    /// Unit scale, as in a freshly initialized model.
    pub fn ones(dim: usize, eps: f64, dtype: DType, device: &Device) -> Result<Self> {
        Self::new(Tensor::ones(dim, dtype, device)?, eps)
    }

    /// Normalize over the last axis of `x` [..., dim].
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let wide = x.to_dtype(DType::F32)?;
        let inv_rms = (wide.sqr()?.mean_keepdim(D::Minus1)? + self.eps)?
            .sqrt()?
            .recip()?;
        let normed = wide.broadcast_mul(&inv_rms)?.to_dtype(dtype)?;
        Ok(normed.broadcast_mul(&self.weight)?)
    }

    /// The scale vector.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub(crate) fn freeze(&mut self) {
        self.weight = self.weight.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;

    #[test]
    fn constant_rows_normalize_to_the_scale() {
        let weight = Tensor::new(&[0.5f32, 2.0, 1.0], &Device::Cpu).unwrap();
        let norm = RmsNorm::new(weight, 0.0).unwrap();
        let x = Tensor::full(-3.0f32, (2, 3), &Device::Cpu).unwrap();
        let out: Vec<Vec<f32>> = norm.forward(&x).unwrap().to_vec2().unwrap();
        for row in out {
            assert_eq!(row, vec![-0.5, -2.0, -1.0]);
        }
    }

    #[test]
    fn mean_is_not_subtracted() {
        let norm = RmsNorm::ones(2, 1e-5, DType::F32, &Device::Cpu).unwrap();
        let x = Tensor::new(&[[3.0f32, 4.0]], &Device::Cpu).unwrap();
        let out: Vec<Vec<f32>> = norm.forward(&x).unwrap().to_vec2().unwrap();
        let rms = (12.5f32 + 1e-5).sqrt();
        assert!((out[0][0] - 3.0 / rms).abs() < 1e-5);
        assert!((out[0][1] - 4.0 / rms).abs() < 1e-5);
    }

    #[test]
    fn half_precision_input_keeps_its_dtype() {
        let norm = RmsNorm::ones(16, 1e-5, DType::BF16, &Device::Cpu).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (1, 3, 16), &Device::Cpu)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();
        assert_eq!(norm.forward(&x).unwrap().dtype(), DType::BF16);
    }

    #[test]
    fn frozen_scale_gets_no_gradient() {
        let scale = Var::ones(4, DType::F32, &Device::Cpu).unwrap();
        let mut norm = RmsNorm::new(scale.as_tensor().clone(), 1e-5).unwrap();
        norm.freeze();
        let x = Var::from_tensor(&Tensor::randn(0.0f32, 1.0, (2, 4), &Device::Cpu).unwrap())
            .unwrap();
        let grads = norm.forward(x.as_tensor()).unwrap().sum_all().unwrap().backward().unwrap();
        assert!(grads.get(scale.as_tensor()).is_none());
        assert!(grads.get(x.as_tensor()).is_some());
    }

    #[test]
    fn non_vector_weight_is_rejected() {
        let weight = Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(RmsNorm::new(weight, 1e-5).is_err());
    }
}
