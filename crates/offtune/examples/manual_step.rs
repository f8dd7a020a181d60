//! Manual backprop example.
//!
//! Runs a few offloaded training steps on a small random model and writes
//! the merged weights.

use anyhow::Result;
use offtune::prelude::*;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let offload_dir = tempfile::tempdir()?;
    let config = ModelConfig {
        dim: 64,
        n_layers: 4,
        n_heads: 4,
        vocab_size: 256,
        max_seq_len: 64,
        dropout: 0.1,
        lora_rank: 4,
        lora_alpha: 8.0,
        ..ModelConfig::default()
    };

    let tuner = FineTuner::builder()
        .model_config(config)
        .offload_location(OffloadLocation::Disk)
        .offload_dir(offload_dir.path())
        .seed(42)
        .build()?;

    let text = b"offloaded layers replay on the way back";
    let ids: Vec<u32> = text.iter().map(|&b| b as u32).collect();
    let (inputs, targets) = tuner.next_token_batch(&ids)?;

    println!("eval loss before: {:.4}", tuner.eval_loss(&inputs, &targets)?);
    for step in 0..3 {
        let out = tuner.step(&inputs, &targets)?;
        println!(
            "step {step}: loss {:.4}, {} layers replayed, peak resident {}",
            out.loss, out.report.layers_replayed, out.report.peak_resident
        );
    }
    println!("accumulated gradients for {} tensors", tuner.grads().len());

    let merged = offload_dir.path().join("merged.safetensors");
    tuner.save_merged(&merged)?;
    println!("merged weights written to {}", merged.display());

    Ok(())
}
