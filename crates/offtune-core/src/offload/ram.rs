//! Host-memory offload medium.

use super::{host_copy, ModuleId, OffloadStore};
use crate::error::{OfftuneError, Result};
use candle_core::{Device, Tensor};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Keeps module parameters and cached inputs in host memory.
#[derive(Debug, Default)]
pub struct RamStore {
    modules: RwLock<HashMap<ModuleId, Vec<(String, Tensor)>>>,
    inputs: RwLock<HashMap<ModuleId, Tensor>>,
}

impl RamStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored modules.
    pub fn num_modules(&self) -> usize {
        self.modules.read().len()
    }

    /// Number of cached inputs.
    pub fn num_inputs(&self) -> usize {
        self.inputs.read().len()
    }
}

impl OffloadStore for RamStore {
    fn save(&self, id: ModuleId, tensors: Vec<(String, Tensor)>) -> Result<()> {
        let copies = tensors
            .into_iter()
            .map(|(name, t)| Ok((name, host_copy(&t)?)))
            .collect::<Result<Vec<_>>>()?;
        self.modules.write().insert(id, copies);
        Ok(())
    }

    fn load(&self, id: ModuleId, device: &Device) -> Result<HashMap<String, Tensor>> {
        let modules = self.modules.read();
        let stored = modules
            .get(&id)
            .ok_or_else(|| OfftuneError::StorageMissing(format!("{id} was never saved")))?;
        stored
            .iter()
            .map(|(name, t)| Ok((name.clone(), t.to_device(device)?)))
            .collect()
    }

    fn remove(&self, id: ModuleId) -> Result<()> {
        self.modules.write().remove(&id);
        Ok(())
    }

    fn contains(&self, id: ModuleId) -> bool {
        self.modules.read().contains_key(&id)
    }

    fn save_input(&self, id: ModuleId, input: &Tensor) -> Result<()> {
        let copy = host_copy(input)?;
        self.inputs.write().insert(id, copy);
        Ok(())
    }

    fn load_input(&self, id: ModuleId, device: &Device) -> Result<Tensor> {
        let inputs = self.inputs.read();
        let input = inputs
            .get(&id)
            .ok_or_else(|| OfftuneError::CacheMiss(format!("no cached input for {id}")))?;
        Ok(input.to_device(device)?)
    }

    fn evict_input(&self, id: ModuleId) -> Result<()> {
        self.inputs.write().remove(&id);
        Ok(())
    }

    fn clear_inputs(&self) -> Result<()> {
        self.inputs.write().clear();
        Ok(())
    }
}
