//! Bias-free linear maps and seeded parameter initialization.

use crate::error::{OfftuneError, Result};
use candle_core::{DType, Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};

/// `x @ weight^T` for `x` of shape [..., in] and `weight` of shape [out, in].
pub fn linear(x: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let (out_features, in_features) = weight.dims2()?;
    let dims = x.dims().to_vec();
    let last = dims.last().copied().unwrap_or(0);
    if last != in_features {
        return Err(OfftuneError::ShapeMismatch(format!(
            "linear: input {:?} does not match weight [{}, {}]",
            dims, out_features, in_features
        )));
    }

    // Reshape to 2D for matmul
    let rows = x.elem_count() / in_features;
    let out = x.reshape((rows, in_features))?.matmul(&weight.t()?)?;

    let mut out_dims = dims;
    if let Some(last) = out_dims.last_mut() {
        *last = out_features;
    }
    Ok(out.reshape(out_dims)?)
}

/// Uniform(-bound, bound) tensor drawn from `rng`.
pub fn uniform<S: Into<Shape>>(
    rng: &mut StdRng,
    shape: S,
    bound: f64,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    if !(bound.is_finite() && bound >= 0.0) {
        return Err(OfftuneError::InvalidConfig(format!(
            "uniform bound must be finite and non-negative, got {bound}"
        )));
    }
    let shape = shape.into();
    let bound = bound as f32;
    let dist = Uniform::new_inclusive(-bound, bound);
    let data: Vec<f32> = dist.sample_iter(&mut *rng).take(shape.elem_count()).collect();
    Ok(Tensor::from_vec(data, shape, device)?.to_dtype(dtype)?)
}

/// Kaiming-uniform init for a [out, in] weight: bound `1 / sqrt(in)`.
pub fn kaiming_uniform(
    rng: &mut StdRng,
    out_features: usize,
    in_features: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let bound = 1.0 / (in_features as f64).sqrt();
    uniform(rng, (out_features, in_features), bound, dtype, device)
}

/// Standard normal tensor drawn from `rng`.
pub fn standard_normal<S: Into<Shape>>(
    rng: &mut StdRng,
    shape: S,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let shape = shape.into();
    let dist = Normal::new(0.0f32, 1.0)
        .map_err(|e| OfftuneError::InvalidConfig(format!("normal init: {e}")))?;
    let data: Vec<f32> = dist.sample_iter(&mut *rng).take(shape.elem_count()).collect();
    Ok(Tensor::from_vec(data, shape, device)?.to_dtype(dtype)?)
}
