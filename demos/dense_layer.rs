//! Example: a fully connected layer on both wire formats
//!
//! Encodes a 64 -> 10 dense layer, prints the serial DMA header and checks
//! the decoded output of both formats.
//!
//! Run with: cargo run --example dense_layer

use layer_to_systolic::stream::serialize_serial;
use layer_to_systolic::{
    compute_golden, encode_layer, parse_model, run_layer, AcceleratorConfig, EmulatedArray, EncodeContext,
    GeometryPlanner, LoopbackArray, RunOptions, StatusRegister, TensorStore, WireFormat,
};

fn main() {
    println!("=== Dense Layer Example ===\n");

    let config = AcceleratorConfig::default();
    let model = parse_model("dense(in=64, out=10)").unwrap();
    let plan = GeometryPlanner::new(config.clone()).plan(&model.layers[0].shape).unwrap();
    println!("{}", plan);

    let options = RunOptions::default();
    let mut store = TensorStore::initialize(&model).unwrap();
    store.quantize(&model, &config, &options).unwrap();

    // Serial header of the first repetition
    let ctx = EncodeContext::new(&config, &plan, store.layer_tensors(0).unwrap(), &options).unwrap();
    let frames = encode_layer(&ctx).unwrap();
    let words = serialize_serial(&config, &plan, &frames[0]).unwrap();
    let status = StatusRegister::from_dma_words(&words).unwrap();
    println!("Serial repetition 0: {} DMA words", words.len());
    println!("  status word 0: {:048b}", words[0]);
    println!("  status word 1: {:048b}", words[1]);
    println!("  decoded: {} psums per PE, capture = {}", status.used_psum_per_pe, status.capture_output);
    println!();

    // Parallel wire through the emulator
    let mut emulator = EmulatedArray::new(config.clone());
    let mut parallel_store = store.clone();
    let report = run_layer(&config, &plan, &mut parallel_store, 0, &options, &mut emulator).unwrap();
    println!("Parallel: {} outputs, match = {}", report.comparison.checked, report.comparison.is_match());

    // Serial wire answered with the golden output
    let golden = compute_golden(&store.layer_tensors(0).unwrap(), 0).unwrap();
    let mut loopback = LoopbackArray::new(config.clone(), golden);
    let serial = RunOptions {
        wire_format: WireFormat::Serial,
        ..options
    };
    let report = run_layer(&config, &plan, &mut store, 0, &serial, &mut loopback).unwrap();
    println!("Serial:   {} outputs, match = {}", report.comparison.checked, report.comparison.is_match());
}
