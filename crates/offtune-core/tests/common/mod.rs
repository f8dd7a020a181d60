//! Deterministic fixtures shared by the integration tests.

#![allow(dead_code)]

use candle_core::{Device, Tensor};
use offtune_core::model::{ModelConfig, OffloadLocation, Transformer, WeightLoader};
use offtune_core::offload::{OffloadStore, RamStore};
use std::collections::HashMap;
use std::sync::Arc;

/// 2 layers, dim 8, 2 heads, vocab 16.
pub fn fixture_config() -> ModelConfig {
    ModelConfig {
        dim: 8,
        n_layers: 2,
        n_heads: 2,
        vocab_size: 16,
        multiple_of: 4,
        max_seq_len: 16,
        offload_location: OffloadLocation::Ram,
        lora_rank: 2,
        lora_alpha: 4.0,
        lora_dropout: 0.0,
        ..Default::default()
    }
}

/// Smooth, non-symmetric values in `[-scale, scale]`.
fn wave(shape: &[usize], phase: f32, scale: f32) -> Tensor {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n)
        .map(|i| (i as f32 * 0.731 + phase).sin() * scale)
        .collect();
    Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
}

/// Llama-named weights derived from the config alone.
pub fn fixture_weights(config: &ModelConfig) -> HashMap<String, Tensor> {
    let dim = config.dim;
    let q_out = config.n_heads * config.head_dim();
    let kv_out = config.kv_heads() * config.head_dim();
    let hidden = config.ffn_hidden_dim();
    let lin = |fan_in: usize| 1.0 / (fan_in as f32).sqrt();

    let mut weights = HashMap::new();
    weights.insert(
        "tok_embeddings.weight".to_string(),
        wave(&[config.vocab_size, dim], 0.1, 1.0),
    );
    for i in 0..config.n_layers {
        let p = i as f32;
        let mut put = |name: &str, t: Tensor| {
            weights.insert(format!("layers.{i}.{name}"), t);
        };
        put("attention.wq.weight", wave(&[q_out, dim], 1.0 + p, lin(dim)));
        put("attention.wk.weight", wave(&[kv_out, dim], 2.0 + p, lin(dim)));
        put("attention.wv.weight", wave(&[kv_out, dim], 3.0 + p, lin(dim)));
        put("attention.wo.weight", wave(&[dim, q_out], 4.0 + p, lin(q_out)));
        put("feed_forward.w1.weight", wave(&[hidden, dim], 5.0 + p, lin(dim)));
        put("feed_forward.w2.weight", wave(&[dim, hidden], 6.0 + p, lin(hidden)));
        put("feed_forward.w3.weight", wave(&[hidden, dim], 7.0 + p, lin(dim)));
        put(
            "attention_norm.weight",
            (wave(&[dim], 8.0 + p, 0.1) + 1.0).unwrap(),
        );
        put("ffn_norm.weight", (wave(&[dim], 9.0 + p, 0.1) + 1.0).unwrap());
    }
    weights.insert("norm.weight".to_string(), (wave(&[dim], 10.0, 0.1) + 1.0).unwrap());
    weights.insert(
        "output.weight".to_string(),
        wave(&[config.vocab_size, dim], 11.0, lin(dim)),
    );
    weights
}

/// Route `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fixture model on `store` with every adapter set to non-zero values.
pub fn fixture_model_on(config: ModelConfig, store: Arc<dyn OffloadStore>) -> Transformer {
    init_tracing();
    let loader = WeightLoader::from_tensors(fixture_weights(&config), &Device::Cpu);
    let model = Transformer::from_weights(config, store, &Device::Cpu, &loader, 0).unwrap();
    for (i, var) in model.adapters().vars().into_iter().enumerate() {
        let values = wave(var.dims(), 20.0 + i as f32, 0.2);
        var.set(&values).unwrap();
    }
    model
}

/// Fixture model in RAM.
pub fn fixture_model(config: ModelConfig) -> Transformer {
    fixture_model_on(config, Arc::new(RamStore::new()))
}

/// One sequence of length 4 and its next-token targets.
pub fn fixture_batch() -> (Tensor, Tensor) {
    let tokens = Tensor::new(&[[3u32, 14, 1, 5]], &Device::Cpu).unwrap();
    let targets = Tensor::new(&[[14i64, 1, 5, 9]], &Device::Cpu).unwrap();
    (tokens, targets)
}

/// Flattened f32 values.
pub fn values(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1().unwrap()
}

/// `|a - b| <= tol * max(1, |b|)` elementwise.
pub fn assert_close(a: &Tensor, b: &Tensor, tol: f32, what: &str) {
    assert_eq!(a.dims(), b.dims(), "{what}: shapes differ");
    for (i, (x, y)) in values(a).iter().zip(values(b)).enumerate() {
        let bound = tol * y.abs().max(1.0);
        assert!((x - y).abs() <= bound, "{what}[{i}]: {x} vs {y}");
    }
}
