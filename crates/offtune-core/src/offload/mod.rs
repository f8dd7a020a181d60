//! Offload storage for frozen modules and cached activations.
//!
//! Every offloadable unit (token embedding, transformer layer, output
//! projection) is written to an [`OffloadStore`] once at registration and
//! re-materialized on demand through a [`Blackbox`] handle. Each blackbox
//! forward also caches its input so the manual backward pass can recompute
//! the module later without keeping the forward graph alive.
//!
//! Two mediums are provided: [`RamStore`] (host memory) and [`DiskStore`]
//! (one safetensors file per module).

mod disk;
mod ram;

pub use disk::DiskStore;
pub use ram::RamStore;

use crate::error::{OfftuneError, Result};
use crate::model::{ModelConfig, OffloadLocation};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Identity of an offloadable module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleId {
    /// Token embedding table.
    Embedding,
    /// Transformer layer by index.
    Layer(usize),
    /// Output projection.
    Output,
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleId::Embedding => write!(f, "tok_embeddings"),
            ModuleId::Layer(i) => write!(f, "layers.{i}"),
            ModuleId::Output => write!(f, "output"),
        }
    }
}

/// Storage backend for module parameters and cached activations.
pub trait OffloadStore: Send + Sync + fmt::Debug {
    /// Persist a module's named parameters, replacing any previous copy.
    fn save(&self, id: ModuleId, tensors: Vec<(String, Tensor)>) -> Result<()>;

    /// Materialize a module's parameters on `device`.
    ///
    /// Fails with `StorageMissing` if `id` was never saved.
    fn load(&self, id: ModuleId, device: &Device) -> Result<HashMap<String, Tensor>>;

    /// Drop a module's parameters.
    fn remove(&self, id: ModuleId) -> Result<()>;

    /// Whether parameters for `id` are stored.
    fn contains(&self, id: ModuleId) -> bool;

    /// Remember the input a module saw during the latest forward pass.
    fn save_input(&self, id: ModuleId, input: &Tensor) -> Result<()>;

    /// Return the cached input on `device`.
    ///
    /// Fails with `CacheMiss` if nothing was cached or it was evicted.
    fn load_input(&self, id: ModuleId, device: &Device) -> Result<Tensor>;

    /// Drop the cached input of one module.
    fn evict_input(&self, id: ModuleId) -> Result<()>;

    /// Drop every cached input.
    fn clear_inputs(&self) -> Result<()>;
}

/// Open the store selected by `config.offload_location`.
pub fn open_store(config: &ModelConfig) -> Result<Arc<dyn OffloadStore>> {
    Ok(match config.offload_location {
        OffloadLocation::Ram => Arc::new(RamStore::new()),
        OffloadLocation::Disk => Arc::new(DiskStore::open(&config.offload_dir)?),
    })
}

/// A module that can be paged out to an [`OffloadStore`] and rebuilt.
pub trait Offloadable: Sized {
    /// Parameters keyed by their checkpoint-relative name.
    fn named_tensors(&self) -> Vec<(String, Tensor)>;

    /// Rebuild from named parameters, validating every shape.
    ///
    /// Fails with `StorageCorrupt` if a parameter is missing or misshapen.
    fn from_tensors(
        config: &ModelConfig,
        id: ModuleId,
        tensors: HashMap<String, Tensor>,
    ) -> Result<Self>;

    /// Drop gradient tracking from every parameter.
    fn freeze(&mut self);
}

/// Take `name` out of `tensors`, checking its shape and casting to `dtype`.
pub fn take_param(
    tensors: &mut HashMap<String, Tensor>,
    id: ModuleId,
    name: &str,
    shape: &[usize],
    dtype: DType,
) -> Result<Tensor> {
    let tensor = tensors.remove(name).ok_or_else(|| {
        OfftuneError::StorageCorrupt(format!("{id}: missing parameter {name}"))
    })?;
    if tensor.dims() != shape {
        return Err(OfftuneError::StorageCorrupt(format!(
            "{id}: {name} has shape {:?}, expected {:?}",
            tensor.dims(),
            shape
        )));
    }
    Ok(tensor.to_dtype(dtype)?.detach())
}

/// Counts modules materialized for computation at the same time.
#[derive(Debug, Default)]
pub struct ResidencyTracker {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ResidencyTracker {
    /// New tracker with nothing resident.
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn release(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    /// Modules resident right now.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Highest simultaneous residency since the last reset.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Restart peak tracking from the current count.
    pub fn reset_peak(&self) {
        self.peak.store(self.current(), Ordering::SeqCst);
    }
}

/// A module materialized from storage. Released on drop.
pub struct Resident<M> {
    module: M,
    tracker: Arc<ResidencyTracker>,
}

impl<M> Deref for Resident<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.module
    }
}

impl<M> DerefMut for Resident<M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut self.module
    }
}

impl<M> Drop for Resident<M> {
    fn drop(&mut self) {
        self.tracker.release();
    }
}

/// Handle to a module living in an [`OffloadStore`].
pub struct Blackbox<M> {
    id: ModuleId,
    store: Arc<dyn OffloadStore>,
    config: Arc<ModelConfig>,
    residency: Arc<ResidencyTracker>,
    _module: PhantomData<fn() -> M>,
}

impl<M: Offloadable> Blackbox<M> {
    /// Save `module` to `store` and return a handle to it. The module itself is dropped.
    pub fn register(
        module: M,
        id: ModuleId,
        store: Arc<dyn OffloadStore>,
        config: Arc<ModelConfig>,
        residency: Arc<ResidencyTracker>,
    ) -> Result<Self> {
        store.save(id, module.named_tensors())?;
        tracing::trace!(module = %id, "registered offloaded module");
        Ok(Self {
            id,
            store,
            config,
            residency,
            _module: PhantomData,
        })
    }

    /// Materialize the module's parameters on `device`.
    pub fn load(&self, device: &Device) -> Result<Resident<M>> {
        let tensors = self.store.load(self.id, device)?;
        let module = M::from_tensors(&self.config, self.id, tensors)?;
        self.residency.acquire();
        tracing::trace!(module = %self.id, "loaded");
        Ok(Resident {
            module,
            tracker: self.residency.clone(),
        })
    }

    /// Cache the input of the current forward call.
    pub fn cache_input(&self, input: &Tensor) -> Result<()> {
        self.store.save_input(self.id, &input.detach())
    }

    /// Input cached by the latest forward call.
    pub fn load_input(&self, device: &Device) -> Result<Tensor> {
        self.store.load_input(self.id, device)
    }

    /// Drop the cached input.
    pub fn evict_input(&self) -> Result<()> {
        self.store.evict_input(self.id)
    }

    /// Module identity.
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn OffloadStore> {
        &self.store
    }
}

impl<M> fmt::Debug for Blackbox<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blackbox")
            .field("id", &self.id)
            .field("store", &self.store)
            .finish()
    }
}

/// Host-memory copy that shares no storage with `tensor`.
pub(crate) fn host_copy(tensor: &Tensor) -> Result<Tensor> {
    let tensor = tensor.detach();
    Ok(if tensor.device().is_cpu() {
        tensor.copy()?
    } else {
        tensor.to_device(&Device::Cpu)?
    })
}
