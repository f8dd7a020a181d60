//! Disk offload medium: one safetensors file per module.

use super::{ModuleId, OffloadStore};
use crate::error::{OfftuneError, Result};
use crate::model::read_safetensors;
use candle_core::{Device, Tensor};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const INPUT_KEY: &str = "input";

/// Stores `{id}.safetensors` and `{id}.input.safetensors` under a directory.
#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    /// Use `dir` for storage, creating it if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        tracing::debug!("disk offload store at {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Storage directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn module_path(&self, id: ModuleId) -> PathBuf {
        self.dir.join(format!("{id}.safetensors"))
    }

    fn input_path(&self, id: ModuleId) -> PathBuf {
        self.dir.join(format!("{id}.input.safetensors"))
    }

    fn write(path: &Path, tensors: HashMap<String, Tensor>) -> Result<()> {
        // Contiguous host copies serialize without surprises.
        let tensors = tensors
            .into_iter()
            .map(|(name, t)| Ok((name, t.detach().to_device(&Device::Cpu)?.contiguous()?)))
            .collect::<Result<HashMap<_, _>>>()?;
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    fn remove_file(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl OffloadStore for DiskStore {
    fn save(&self, id: ModuleId, tensors: Vec<(String, Tensor)>) -> Result<()> {
        let path = self.module_path(id);
        Self::write(&path, tensors.into_iter().collect())?;
        tracing::trace!(module = %id, path = %path.display(), "wrote module");
        Ok(())
    }

    fn load(&self, id: ModuleId, device: &Device) -> Result<HashMap<String, Tensor>> {
        let path = self.module_path(id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(OfftuneError::StorageMissing(format!(
                    "{id}: {} does not exist",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        read_safetensors(&data, device)
            .map_err(|e| OfftuneError::StorageCorrupt(format!("{id}: {e}")))
    }

    fn remove(&self, id: ModuleId) -> Result<()> {
        Self::remove_file(&self.module_path(id))
    }

    fn contains(&self, id: ModuleId) -> bool {
        self.module_path(id).exists()
    }

    fn save_input(&self, id: ModuleId, input: &Tensor) -> Result<()> {
        let tensors = HashMap::from([(INPUT_KEY.to_string(), input.clone())]);
        Self::write(&self.input_path(id), tensors)
    }

    fn load_input(&self, id: ModuleId, device: &Device) -> Result<Tensor> {
        let path = self.input_path(id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(OfftuneError::CacheMiss(format!("no cached input for {id}")))
            }
            Err(e) => return Err(e.into()),
        };
        let mut tensors = read_safetensors(&data, device)
            .map_err(|e| OfftuneError::StorageCorrupt(format!("{id} input: {e}")))?;
        tensors
            .remove(INPUT_KEY)
            .ok_or_else(|| OfftuneError::StorageCorrupt(format!("{id}: input file has no tensor")))
    }

    fn evict_input(&self, id: ModuleId) -> Result<()> {
        Self::remove_file(&self.input_path(id))
    }

    fn clear_inputs(&self) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_input = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".input.safetensors"));
            if is_input {
                Self::remove_file(&path)?;
            }
        }
        Ok(())
    }
}
