//! High-level fine-tuning session.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use offtune_core::{
    backprop::StepOutput,
    lora::AdapterGrads,
    model::{ModelConfig, OffloadLocation, Transformer, WeightLoader},
    offload::open_store,
    rng::DropoutRng,
};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};

/// Configuration for a fine-tuning session.
#[derive(Debug, Clone, Default)]
pub struct FineTunerConfig {
    /// Safetensors file or directory of shards. `None` initializes randomly.
    pub weights_path: Option<PathBuf>,
    /// Seed for parameter initialization and dropout masks.
    pub seed: u64,
    /// Overrides the model config's offload medium.
    pub offload_location: Option<OffloadLocation>,
    /// Overrides the model config's offload directory.
    pub offload_dir: Option<PathBuf>,
    /// Weights use HuggingFace Llama names and rotary row order.
    pub hf_layout: bool,
}

/// Builder for creating a [`FineTuner`].
pub struct FineTunerBuilder {
    config: FineTunerConfig,
    model_config: Option<ModelConfig>,
    config_file: Option<PathBuf>,
    device: Device,
}

impl FineTunerBuilder {
    /// Create a new builder targeting the CPU.
    pub fn new() -> Self {
        Self {
            config: FineTunerConfig::default(),
            model_config: None,
            config_file: None,
            device: Device::Cpu,
        }
    }

    /// Set the model configuration.
    pub fn model_config(mut self, config: ModelConfig) -> Self {
        self.model_config = Some(config);
        self
    }

    /// Read the model configuration from a JSON file at build time.
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Load frozen weights from a safetensors file or shard directory.
    pub fn weights_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.weights_path = Some(path.into());
        self
    }

    /// Treat the weights as a HuggingFace Llama checkpoint.
    pub fn hf_layout(mut self, hf_layout: bool) -> Self {
        self.config.hf_layout = hf_layout;
        self
    }

    /// Set the seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Set the offload medium.
    pub fn offload_location(mut self, location: OffloadLocation) -> Self {
        self.config.offload_location = Some(location);
        self
    }

    /// Set the directory used by the disk medium.
    pub fn offload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.offload_dir = Some(dir.into());
        self
    }

    /// Set the compute device.
    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Build the session.
    pub fn build(self) -> Result<FineTuner> {
        let mut model_config = match (self.model_config, &self.config_file) {
            (Some(config), _) => config,
            (None, Some(path)) => ModelConfig::from_file(path)
                .with_context(|| format!("reading model config {}", path.display()))?,
            (None, None) => ModelConfig::default(),
        };
        if let Some(location) = self.config.offload_location {
            model_config.offload_location = location;
        }
        if let Some(dir) = &self.config.offload_dir {
            model_config.offload_dir = dir.clone();
        }

        let store = open_store(&model_config).context("opening offload store")?;
        let seed = self.config.seed;
        let model = match &self.config.weights_path {
            Some(path) => {
                let loader = if path.is_dir() {
                    WeightLoader::from_dir(path, &self.device)
                } else {
                    WeightLoader::from_file(path, &self.device)
                }
                .with_context(|| format!("loading weights from {}", path.display()))?;
                let loader = if self.config.hf_layout {
                    loader.into_reference_names(model_config.n_heads, model_config.kv_heads())?
                } else {
                    loader
                };
                Transformer::from_weights(model_config, store, &self.device, &loader, seed)?
            }
            None => Transformer::new(model_config, store, &self.device, seed)?,
        };

        tracing::info!(
            "fine-tuner ready: {} layers, {} adapter parameters on {:?}",
            model.num_layers(),
            model.adapters().num_parameters(),
            self.device
        );

        Ok(FineTuner {
            config: self.config,
            model: RwLock::new(model),
            rng: Mutex::new(DropoutRng::seeded(seed)),
        })
    }
}

impl Default for FineTunerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// LoRA fine-tuning session over an offloaded transformer.
pub struct FineTuner {
    config: FineTunerConfig,
    model: RwLock<Transformer>,
    rng: Mutex<DropoutRng>,
}

impl FineTuner {
    /// Create a builder.
    pub fn builder() -> FineTunerBuilder {
        FineTunerBuilder::new()
    }

    /// Split a token stream into next-token inputs and targets, both `[1, n - 1]`.
    pub fn next_token_batch(&self, ids: &[u32]) -> Result<(Tensor, Tensor)> {
        anyhow::ensure!(ids.len() >= 2, "need at least two tokens, got {}", ids.len());
        let model = self.model.read();
        let n = ids.len() - 1;
        let inputs = Tensor::from_slice(&ids[..n], (1, n), model.device())?;
        let targets: Vec<i64> = ids[1..].iter().map(|&t| t as i64).collect();
        let targets = Tensor::from_vec(targets, (1, n), model.device())?;
        Ok((inputs, targets))
    }

    /// One training step through the offload path. Gradients are added to the ledger.
    pub fn step(&self, tokens: &Tensor, targets: &Tensor) -> Result<StepOutput> {
        let mut model = self.model.write();
        let mut rng = self.rng.lock();
        rng.set_training(true);
        let out = model.manual_step(tokens, targets, &mut rng)?;
        tracing::debug!(
            "step loss {:.5}, {} layers replayed",
            out.loss,
            out.report.layers_replayed
        );
        Ok(out)
    }

    /// Last-position logits with dropout disabled.
    pub fn logits(&self, tokens: &Tensor) -> Result<Tensor> {
        let model = self.model.read();
        let out = model.forward(tokens, None, &mut DropoutRng::eval())?;
        Ok(out.logits)
    }

    /// Evaluation loss with dropout disabled.
    pub fn eval_loss(&self, tokens: &Tensor, targets: &Tensor) -> Result<f32> {
        let model = self.model.read();
        let out = model.forward(tokens, Some(targets), &mut DropoutRng::eval())?;
        let loss = out
            .loss
            .context("forward with targets returned no loss")?;
        Ok(loss.to_scalar::<f32>()?)
    }

    /// Snapshot of the accumulated gradient ledger.
    pub fn grads(&self) -> AdapterGrads {
        self.model.read().adapter_grads().clone()
    }

    /// Clear the gradient ledger.
    pub fn zero_grad(&self) {
        self.model.write().zero_grad();
    }

    /// Write adapter weights to a safetensors file.
    pub fn save_adapters(&self, path: &Path) -> Result<()> {
        Ok(self.model.read().adapters().save(path)?)
    }

    /// Overwrite adapter weights from a file written by [`FineTuner::save_adapters`].
    pub fn load_adapters(&self, path: &Path) -> Result<()> {
        self.model
            .read()
            .adapters()
            .load(path)
            .with_context(|| format!("loading adapters from {}", path.display()))
    }

    /// Write frozen weights with adapters folded in.
    pub fn save_merged(&self, path: &Path) -> Result<()> {
        Ok(self.model.read().save_merged(path)?)
    }

    /// Session configuration.
    pub fn config(&self) -> &FineTunerConfig {
        &self.config
    }

    /// Shared access to the model.
    pub fn model(&self) -> parking_lot::RwLockReadGuard<'_, Transformer> {
        self.model.read()
    }
}

impl std::fmt::Debug for FineTuner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FineTuner")
            .field("config", &self.config)
            .field("model", &*self.model.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            dim: 8,
            n_layers: 2,
            n_heads: 2,
            vocab_size: 16,
            multiple_of: 4,
            max_seq_len: 16,
            lora_rank: 2,
            lora_alpha: 4.0,
            offload_location: OffloadLocation::Ram,
            ..ModelConfig::default()
        }
    }

    fn tuner() -> FineTuner {
        FineTuner::builder()
            .model_config(tiny_config())
            .seed(7)
            .build()
            .unwrap()
    }

    #[test]
    fn builder_applies_offload_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let tuner = FineTuner::builder()
            .model_config(tiny_config())
            .offload_location(OffloadLocation::Disk)
            .offload_dir(dir.path())
            .build()
            .unwrap();
        let model = tuner.model();
        assert_eq!(model.config().offload_location, OffloadLocation::Disk);
        assert_eq!(model.config().offload_dir, dir.path());
    }

    #[test]
    fn next_token_batch_shifts_by_one() {
        let tuner = tuner();
        let (inputs, targets) = tuner.next_token_batch(&[1, 2, 3, 4]).unwrap();
        assert_eq!(inputs.to_vec2::<u32>().unwrap(), vec![vec![1, 2, 3]]);
        assert_eq!(targets.to_vec2::<i64>().unwrap(), vec![vec![2, 3, 4]]);
        assert!(tuner.next_token_batch(&[1]).is_err());
    }

    #[test]
    fn step_fills_and_zero_grad_clears_ledger() {
        let tuner = tuner();
        let (inputs, targets) = tuner.next_token_batch(&[3, 1, 4, 1, 5]).unwrap();
        let out = tuner.step(&inputs, &targets).unwrap();
        assert!(out.loss.is_finite());
        assert_eq!(out.report.layers_replayed, 2);
        assert!(!tuner.grads().is_empty());
        tuner.zero_grad();
        assert!(tuner.grads().is_empty());
    }

    #[test]
    fn logits_cover_last_position() {
        let tuner = tuner();
        let (inputs, _) = tuner.next_token_batch(&[3, 1, 4, 1]).unwrap();
        assert_eq!(tuner.logits(&inputs).unwrap().dims(), &[1, 1, 16]);
    }

    #[test]
    fn missing_weights_have_context() {
        let err = FineTuner::builder()
            .model_config(tiny_config())
            .weights_path("/nonexistent/model.safetensors")
            .build()
            .unwrap_err();
        assert!(format!("{err:#}").contains("loading weights"));
    }
}
