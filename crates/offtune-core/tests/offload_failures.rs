//! Failure semantics of the manual path and the disk medium end to end.

mod common;

use candle_core::{DType, Device, Tensor};
use common::{assert_close, fixture_batch, fixture_config, fixture_model, fixture_model_on};
use offtune_core::backprop::{ManualBackprop, Phase};
use offtune_core::model::{ModelConfig, OffloadLocation, Transformer, WeightLoader};
use offtune_core::offload::{open_store, DiskStore, ModuleId};
use offtune_core::rng::{dropout, DropoutRng};
use offtune_core::OfftuneError;
use std::fs;
use std::sync::Arc;

fn disk_model(dir: &tempfile::TempDir) -> (Transformer, Arc<DiskStore>) {
    disk_model_with(dir, fixture_config())
}

fn disk_model_with(dir: &tempfile::TempDir, config: ModelConfig) -> (Transformer, Arc<DiskStore>) {
    let store = Arc::new(DiskStore::open(&dir.path().join("offload")).unwrap());
    let model = fixture_model_on(config, store.clone());
    (model, store)
}

#[test]
fn disk_step_matches_ram_step() {
    let dir = tempfile::tempdir().unwrap();
    let (tokens, targets) = fixture_batch();
    let (mut on_disk, store) = disk_model(&dir);
    let mut in_ram = fixture_model(fixture_config());

    assert!(store.dir().join("layers.1.safetensors").exists());
    assert!(store.dir().join("tok_embeddings.safetensors").exists());
    assert!(store.dir().join("output.safetensors").exists());

    let a = on_disk
        .manual_step(&tokens, &targets, &mut DropoutRng::seeded(0))
        .unwrap();
    let b = in_ram
        .manual_step(&tokens, &targets, &mut DropoutRng::seeded(0))
        .unwrap();
    assert_eq!(a.loss, b.loss);
    for (va, vb) in on_disk.adapters().vars().iter().zip(in_ram.adapters().vars()) {
        assert_close(a.grads.get(va).unwrap(), b.grads.get(vb).unwrap(), 0.0, "grad");
    }
    assert!(!store.dir().join("layers.0.input.safetensors").exists());
}

#[test]
fn open_store_follows_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = ModelConfig {
        offload_location: OffloadLocation::Disk,
        offload_dir: dir.path().join("blackbox"),
        ..fixture_config()
    };
    let store = open_store(&config).unwrap();
    let mut model = fixture_model_on(config, store);
    let (tokens, targets) = fixture_batch();
    model
        .manual_step(&tokens, &targets, &mut DropoutRng::seeded(0))
        .unwrap();
    assert!(dir.path().join("blackbox/layers.0.safetensors").exists());
}

#[test]
fn missing_layer_aborts_backward() {
    let dir = tempfile::tempdir().unwrap();
    let (tokens, targets) = fixture_batch();
    // Layers 2 and 1 replay with their own snapshots before layer 0 fails.
    let config = ModelConfig {
        n_layers: 3,
        dropout: 0.2,
        ..fixture_config()
    };
    let (mut model, store) = disk_model_with(&dir, config);

    let mut rng = DropoutRng::seeded(0);
    let mut session = ManualBackprop::new(&mut model);
    session.forward(&tokens, &mut rng).unwrap();
    let mut after_forward = rng.clone();
    fs::remove_file(store.dir().join("layers.0.safetensors")).unwrap();

    let err = session.backward(&targets, &mut rng).unwrap_err();
    assert!(matches!(err, OfftuneError::StorageMissing(_)), "{err}");
    assert_eq!(session.phase(), Phase::BackwardRunning);
    drop(session);
    assert!(model.adapter_grads().is_empty());

    let ones = Tensor::ones(64, DType::F32, &Device::Cpu).unwrap();
    let next: Vec<f32> = dropout(&ones, 0.5, &mut rng).unwrap().to_vec1().unwrap();
    let expected: Vec<f32> = dropout(&ones, 0.5, &mut after_forward)
        .unwrap()
        .to_vec1()
        .unwrap();
    assert_eq!(next, expected);
}

#[test]
fn corrupt_layer_aborts_backward() {
    let dir = tempfile::tempdir().unwrap();
    let (tokens, targets) = fixture_batch();
    let (mut model, store) = disk_model(&dir);

    let mut session = ManualBackprop::new(&mut model);
    session.forward(&tokens, &mut DropoutRng::seeded(0)).unwrap();
    fs::write(store.dir().join("layers.1.safetensors"), b"\x08\0\0\0\0\0\0\0garbage!").unwrap();

    let err = session
        .backward(&targets, &mut DropoutRng::seeded(0))
        .unwrap_err();
    assert!(matches!(err, OfftuneError::StorageCorrupt(_)), "{err}");
}

#[test]
fn misshapen_layer_is_storage_corrupt() {
    let (tokens, targets) = fixture_batch();
    let mut model = fixture_model(fixture_config());

    // Overwrite layer 1 with a layer of a wider model.
    let wide = ModelConfig {
        dim: 16,
        ..fixture_config()
    };
    let loader = WeightLoader::from_tensors(common::fixture_weights(&wide), &Device::Cpu);
    let layer: Vec<_> = loader.take_prefix("layers.0.").into_iter().collect();
    model.store().save(ModuleId::Layer(1), layer).unwrap();

    let err = model
        .manual_step(&tokens, &targets, &mut DropoutRng::seeded(0))
        .unwrap_err();
    assert!(matches!(err, OfftuneError::StorageCorrupt(_)), "{err}");
    assert!(model.adapter_grads().is_empty());
}

#[test]
fn cleared_cache_is_a_cache_miss() {
    let (tokens, targets) = fixture_batch();
    let mut model = fixture_model(fixture_config());
    let store = model.store().clone();

    let mut session = ManualBackprop::new(&mut model);
    session.forward(&tokens, &mut DropoutRng::seeded(0)).unwrap();
    store.clear_inputs().unwrap();

    let err = session
        .backward(&targets, &mut DropoutRng::seeded(0))
        .unwrap_err();
    assert!(matches!(err, OfftuneError::CacheMiss(_)), "{err}");
}

#[test]
fn evicted_layer_input_is_a_cache_miss() {
    let (tokens, targets) = fixture_batch();
    let mut model = fixture_model(fixture_config());
    let store = model.store().clone();

    let mut session = ManualBackprop::new(&mut model);
    session.forward(&tokens, &mut DropoutRng::seeded(0)).unwrap();
    store.evict_input(ModuleId::Layer(0)).unwrap();

    let err = session
        .backward(&targets, &mut DropoutRng::seeded(0))
        .unwrap_err();
    assert!(matches!(err, OfftuneError::CacheMiss(_)), "{err}");
}

#[test]
fn all_ignored_targets_abort_backward() {
    let (tokens, _) = fixture_batch();
    let targets = candle_core::Tensor::new(&[[-1i64, -1, -1, -1]], &Device::Cpu).unwrap();
    let mut model = fixture_model(fixture_config());
    let err = model
        .manual_step(&tokens, &targets, &mut DropoutRng::seeded(0))
        .unwrap_err();
    assert!(matches!(err, OfftuneError::NumericInstability(_)), "{err}");
}

#[test]
fn merged_export_reproduces_adapted_model() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("merged.safetensors");
    let (tokens, _) = fixture_batch();

    let adapted = fixture_model(fixture_config());
    adapted.save_merged(&path).unwrap();

    let loader = WeightLoader::from_file(&path, &Device::Cpu).unwrap();
    let merged = Transformer::from_weights(
        fixture_config(),
        Arc::new(offtune_core::offload::RamStore::new()),
        &Device::Cpu,
        &loader,
        0,
    )
    .unwrap();

    let a = adapted
        .forward(&tokens, None, &mut DropoutRng::eval())
        .unwrap();
    let b = merged
        .forward(&tokens, None, &mut DropoutRng::eval())
        .unwrap();
    assert_close(&b.logits, &a.logits, 1e-4, "merged logits");
}

#[test]
fn adapter_checkpoint_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("adapters.safetensors");

    let trained = fixture_model(fixture_config());
    trained.adapters().save(&path).unwrap();

    let fresh = Transformer::new(
        fixture_config(),
        Arc::new(offtune_core::offload::RamStore::new()),
        &Device::Cpu,
        1,
    )
    .unwrap();
    fresh.adapters().load(&path).unwrap();
    for (a, b) in trained.adapters().vars().iter().zip(fresh.adapters().vars()) {
        assert_close(a.as_tensor(), b.as_tensor(), 0.0, "adapter");
    }
}
