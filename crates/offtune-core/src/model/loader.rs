//! SafeTensors weight loading utilities.
//!
//! Weights are keyed by Llama-2 reference names:
//!
//! - `tok_embeddings.weight`
//! - `layers.{i}.attention.{wq,wk,wv,wo}.weight`
//! - `layers.{i}.feed_forward.{w1,w2,w3}.weight`
//! - `layers.{i}.{attention_norm,ffn_norm}.weight`
//! - `norm.weight`, `output.weight`
//!
//! HuggingFace checkpoints can be converted with [`WeightLoader::into_reference_names`].
//!
//! # Example
//!
//! ```ignore
//! use offtune_core::model::WeightLoader;
//!
//! let loader = WeightLoader::from_file(Path::new("/path/to/model.safetensors"), &Device::Cpu)?;
//! let tensor = loader.get_tensor("tok_embeddings.weight")?;
//! ```

use crate::error::{OfftuneError, Result};
use candle_core::{Device, Tensor};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Weight loader for SafeTensors format.
#[derive(Debug)]
pub struct WeightLoader {
    /// Loaded tensors indexed by name.
    tensors: HashMap<String, Tensor>,
    /// Device for loaded tensors.
    device: Device,
}

impl WeightLoader {
    /// Create a new weight loader from a model directory.
    ///
    /// Loads all .safetensors files in the directory.
    pub fn from_dir(dir: &Path, device: &Device) -> Result<Self> {
        let mut tensors = HashMap::new();

        let mut safetensor_files: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "safetensors") {
                safetensor_files.push(path);
            }
        }

        // Sort for deterministic loading order
        safetensor_files.sort();

        if safetensor_files.is_empty() {
            return Err(OfftuneError::StorageMissing(format!(
                "No .safetensors files found in {}",
                dir.display()
            )));
        }

        for path in &safetensor_files {
            tensors.extend(Self::load_safetensors_file(path, device)?);
        }

        Ok(Self {
            tensors,
            device: device.clone(),
        })
    }

    /// Create a weight loader from a single file.
    pub fn from_file(path: &Path, device: &Device) -> Result<Self> {
        let tensors = Self::load_safetensors_file(path, device)?;
        Ok(Self {
            tensors,
            device: device.clone(),
        })
    }

    /// Wrap tensors that are already in memory.
    pub fn from_tensors(tensors: HashMap<String, Tensor>, device: &Device) -> Self {
        Self {
            tensors,
            device: device.clone(),
        }
    }

    fn load_safetensors_file(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
        let data = fs::read(path)?;
        read_safetensors(&data, device).map_err(|e| match e {
            OfftuneError::StorageCorrupt(msg) => {
                OfftuneError::StorageCorrupt(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Rename HuggingFace Llama tensors to reference names.
    ///
    /// HuggingFace stores `q_proj`/`k_proj` rows permuted for half-split
    /// rotary embeddings; those rows are put back in adjacent-pair order.
    pub fn into_reference_names(self, n_heads: usize, n_kv_heads: usize) -> Result<Self> {
        let mut renamed = HashMap::with_capacity(self.tensors.len());
        for (name, tensor) in self.tensors {
            let mapped = map_hf_name(&name);
            let tensor = if name.ends_with("self_attn.q_proj.weight") {
                unpermute_rotary(&tensor, n_heads)?
            } else if name.ends_with("self_attn.k_proj.weight") {
                unpermute_rotary(&tensor, n_kv_heads)?
            } else {
                tensor
            };
            renamed.insert(mapped, tensor);
        }
        Ok(Self {
            tensors: renamed,
            device: self.device,
        })
    }

    /// Get a tensor by name.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Get a tensor by name, returning an error if not found.
    pub fn get_tensor(&self, name: &str) -> Result<Tensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| OfftuneError::StorageMissing(format!("Tensor not found: {}", name)))
    }

    /// Check if a tensor exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Get all tensor names.
    pub fn tensor_names(&self) -> Vec<&str> {
        self.tensors.keys().map(|s| s.as_str()).collect()
    }

    /// Get the number of loaded tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if no tensors are loaded.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Get the device tensors are loaded to.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Tensors under `prefix`, with the prefix stripped from their names.
    pub fn take_prefix(&self, prefix: &str) -> HashMap<String, Tensor> {
        self.tensors
            .iter()
            .filter_map(|(name, tensor)| {
                name.strip_prefix(prefix)
                    .map(|rest| (rest.to_string(), tensor.clone()))
            })
            .collect()
    }
}

/// Decode a safetensors buffer into candle tensors on `device`.
///
/// Decoding errors are reported as `StorageCorrupt`.
pub fn read_safetensors(data: &[u8], device: &Device) -> Result<HashMap<String, Tensor>> {
    let safetensors = SafeTensors::deserialize(data)
        .map_err(|e| OfftuneError::StorageCorrupt(format!("failed to deserialize: {e}")))?;

    safetensors
        .tensors()
        .into_iter()
        .map(|(name, view)| Ok((name, view_to_tensor(&view, device)?)))
        .collect()
}

/// Convert a SafeTensors view to a Candle tensor.
///
/// Views inside a safetensors buffer need not be aligned for their element
/// type, so bytes are copied into an aligned vector rather than cast in place.
fn view_to_tensor(view: &safetensors::tensor::TensorView, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let data = view.data();

    let tensor = match view.dtype() {
        safetensors::Dtype::F32 => {
            Tensor::from_vec(bytemuck::pod_collect_to_vec::<u8, f32>(data), shape, device)?
        }
        safetensors::Dtype::F16 => {
            Tensor::from_vec(bytemuck::pod_collect_to_vec::<u8, half::f16>(data), shape, device)?
        }
        safetensors::Dtype::BF16 => {
            Tensor::from_vec(bytemuck::pod_collect_to_vec::<u8, half::bf16>(data), shape, device)?
        }
        safetensors::Dtype::F64 => {
            Tensor::from_vec(bytemuck::pod_collect_to_vec::<u8, f64>(data), shape, device)?
        }
        safetensors::Dtype::I64 => {
            Tensor::from_vec(bytemuck::pod_collect_to_vec::<u8, i64>(data), shape, device)?
        }
        safetensors::Dtype::I32 => {
            // Candle doesn't have I32, upcast
            let values: Vec<i64> = bytemuck::pod_collect_to_vec::<u8, i32>(data)
                .into_iter()
                .map(i64::from)
                .collect();
            Tensor::from_vec(values, shape, device)?
        }
        safetensors::Dtype::U32 => {
            Tensor::from_vec(bytemuck::pod_collect_to_vec::<u8, u32>(data), shape, device)?
        }
        safetensors::Dtype::U8 => Tensor::from_vec(data.to_vec(), shape, device)?,
        other => {
            return Err(OfftuneError::StorageCorrupt(format!(
                "Unsupported dtype: {:?}",
                other
            )));
        }
    };

    Ok(tensor)
}

/// Map HuggingFace Llama tensor names to reference names.
///
/// - `model.embed_tokens.weight` -> `tok_embeddings.weight`
/// - `model.layers.0.self_attn.q_proj.weight` -> `layers.0.attention.wq.weight`
/// - `model.layers.0.mlp.gate_proj.weight` -> `layers.0.feed_forward.w1.weight`
/// - `model.layers.0.input_layernorm.weight` -> `layers.0.attention_norm.weight`
/// - `model.norm.weight` -> `norm.weight`
/// - `lm_head.weight` -> `output.weight`
pub fn map_hf_name(hf_name: &str) -> String {
    const RENAMES: [(&str, &str); 12] = [
        ("embed_tokens.", "tok_embeddings."),
        ("lm_head.", "output."),
        ("self_attn.q_proj.", "attention.wq."),
        ("self_attn.k_proj.", "attention.wk."),
        ("self_attn.v_proj.", "attention.wv."),
        ("self_attn.o_proj.", "attention.wo."),
        ("mlp.gate_proj.", "feed_forward.w1."),
        ("mlp.down_proj.", "feed_forward.w2."),
        ("mlp.up_proj.", "feed_forward.w3."),
        ("post_attention_layernorm.", "ffn_norm."),
        ("input_layernorm.", "attention_norm."),
        ("model.", ""),
    ];
    let mut name = hf_name.to_string();
    for (from, to) in RENAMES {
        if let Some(pos) = name.find(from) {
            // Only strip `model.` as a leading prefix.
            if from == "model." && pos != 0 {
                continue;
            }
            name.replace_range(pos..pos + from.len(), to);
        }
    }
    name
}

/// Undo the HuggingFace row permutation of a [heads * head_dim, in] projection.
pub fn unpermute_rotary(weight: &Tensor, heads: usize) -> Result<Tensor> {
    let (out_features, in_features) = weight.dims2()?;
    if heads == 0 || out_features % (2 * heads) != 0 {
        return Err(OfftuneError::ShapeMismatch(format!(
            "cannot split {out_features} rows into {heads} rotary heads"
        )));
    }
    let half = out_features / heads / 2;
    Ok(weight
        .reshape((heads, 2, half, in_features))?
        .transpose(1, 2)?
        .reshape((out_features, in_features))?)
}
