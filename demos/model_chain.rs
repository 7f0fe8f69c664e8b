//! Example: a chain of layers
//!
//! Each verified output is shifted back into the activation range, max
//! pooled where the model asks for it and fed to the next layer, flattened
//! before the dense layer.
//!
//! Run with: cargo run --example model_chain

use layer_to_systolic::{plan_model, run_model, AcceleratorConfig, EmulatedArray, ModelDescription, PostScale, RunOptions};

fn main() {
    println!("=== Model Chain Example ===\n");

    let source = "
        conv(in=12x12x2, filters=6, kernel=3, padding=same);
        maxpool(window=2);
        depthwise(in=6x6x6, kernel=3, stride=2, padding=same);
        dense(in=54, out=10)
    ";
    let model: ModelDescription = layer_to_systolic::load_model(source).unwrap();
    let config = AcceleratorConfig::default();

    for (i, plan) in plan_model(&config, &model).unwrap().iter().enumerate() {
        println!("Layer {}: {} ({} repetitions)", i, plan.shape, plan.needed_total_transmissions);
    }
    println!();

    let options = RunOptions {
        post_scale: PostScale::Shift(5),
        zero_skip: true,
        ..RunOptions::default()
    };
    let mut hardware = EmulatedArray::new(config.clone());
    for report in run_model(&config, &model, &options, &mut hardware).unwrap() {
        println!(
            "Layer {}: {} outputs, {} mismatches, {} words sent",
            report.layer,
            report.comparison.checked,
            report.comparison.mismatches.len(),
            report.words_sent
        );
    }
}
