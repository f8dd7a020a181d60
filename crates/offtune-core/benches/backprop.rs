//! Ordinary single-graph step vs manual offloaded step.
//!
//! The manual path pays for reloading every layer twice and for caching
//! inputs, in exchange for keeping one layer resident at a time. These
//! benchmarks show how that overhead scales with depth and sequence length.

use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use offtune_core::model::{ModelConfig, OffloadLocation, Transformer};
use offtune_core::offload::{DiskStore, OffloadStore, RamStore};
use offtune_core::rng::DropoutRng;
use std::sync::Arc;

fn bench_config(n_layers: usize) -> ModelConfig {
    ModelConfig {
        dim: 64,
        n_layers,
        n_heads: 4,
        n_kv_heads: Some(2),
        vocab_size: 256,
        multiple_of: 32,
        max_seq_len: 128,
        dropout: 0.1,
        offload_location: OffloadLocation::Ram,
        lora_rank: 4,
        lora_alpha: 8.0,
        lora_dropout: 0.05,
        ..Default::default()
    }
}

/// Random token ids and next-token targets.
fn batch(seq_len: usize, vocab: usize) -> (Tensor, Tensor) {
    let ids: Vec<u32> = (0..=seq_len).map(|i| ((i * 37 + 11) % vocab) as u32).collect();
    let tokens = Tensor::from_vec(ids[..seq_len].to_vec(), (1, seq_len), &Device::Cpu).unwrap();
    let targets: Vec<i64> = ids[1..].iter().map(|&t| t as i64).collect();
    let targets = Tensor::from_vec(targets, (1, seq_len), &Device::Cpu).unwrap();
    (tokens, targets)
}

fn model(n_layers: usize, store: Arc<dyn OffloadStore>) -> Transformer {
    Transformer::new(bench_config(n_layers), store, &Device::Cpu, 0).unwrap()
}

/// Benchmark: one training step vs number of layers.
fn bench_step_vs_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_vs_depth");
    let (tokens, targets) = batch(32, 256);

    for n_layers in [1, 2, 4, 8].iter() {
        let mut m = model(*n_layers, Arc::new(RamStore::new()));
        group.throughput(Throughput::Elements(*n_layers as u64));

        group.bench_with_input(BenchmarkId::new("resident", n_layers), n_layers, |b, _| {
            b.iter(|| {
                let mut rng = DropoutRng::seeded(0);
                let out = m.forward(&tokens, Some(&targets), &mut rng).unwrap();
                let loss = out.loss.unwrap();
                black_box(m.backward(&loss).unwrap())
            })
        });

        group.bench_with_input(BenchmarkId::new("manual", n_layers), n_layers, |b, _| {
            b.iter(|| {
                let mut rng = DropoutRng::seeded(0);
                black_box(m.manual_step(&tokens, &targets, &mut rng).unwrap())
            })
        });
    }

    group.finish();
}

/// Benchmark: one manual step vs sequence length.
fn bench_manual_vs_seq_len(c: &mut Criterion) {
    let mut group = c.benchmark_group("manual_vs_seq_len");
    let mut m = model(4, Arc::new(RamStore::new()));

    for seq_len in [8, 32, 128].iter() {
        let (tokens, targets) = batch(*seq_len, 256);
        group.throughput(Throughput::Elements(*seq_len as u64));
        group.bench_with_input(BenchmarkId::new("tokens", seq_len), seq_len, |b, _| {
            b.iter(|| {
                let mut rng = DropoutRng::seeded(0);
                black_box(m.manual_step(&tokens, &targets, &mut rng).unwrap())
            })
        });
    }

    group.finish();
}

/// Benchmark: RAM vs disk offload medium for the manual step.
fn bench_offload_medium(c: &mut Criterion) {
    let mut group = c.benchmark_group("offload_medium");
    let (tokens, targets) = batch(32, 256);
    let dir = tempfile::tempdir().unwrap();

    let stores: [(&str, Arc<dyn OffloadStore>); 2] = [
        ("ram", Arc::new(RamStore::new())),
        ("disk", Arc::new(DiskStore::open(dir.path()).unwrap())),
    ];
    for (name, store) in stores {
        let mut m = model(4, store);
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut rng = DropoutRng::seeded(0);
                black_box(m.manual_step(&tokens, &targets, &mut rng).unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_step_vs_depth,
    bench_manual_vs_seq_len,
    bench_offload_medium,
);
criterion_main!(benches);
