//! Example: one convolution layer
//!
//! Plans an 8x8x4 convolution with 8 filters, encodes it and runs it on the
//! emulated array.
//!
//! Run with: cargo run --example conv_layer

use layer_to_systolic::{
    parse_model, run_model, AcceleratorConfig, EmulatedArray, GeometryPlanner, LayerShape, Padding, RunOptions,
};

fn main() {
    println!("=== Convolution Layer Example ===\n");

    let config = AcceleratorConfig::default();
    let shape = LayerShape::conv(8, 8, 4, 8, (3, 3), (1, 1), Padding::Same);

    let plan = GeometryPlanner::new(config.clone()).plan(&shape).unwrap();
    println!("{}", plan);

    println!("Psum slots of repetition 0:");
    for slot in plan.psum_slots(&config, 0).iter().take(6) {
        println!(
            "  lane {:>3}: cluster ({}, {}) PE column {} -> filters {}.. at {:?}",
            slot.lane, slot.cl_x, slot.cl_y, slot.pe_x, slot.first_filter, slot.position
        );
    }
    println!();

    let model = parse_model("conv(in=8x8x4, filters=8, kernel=3, padding=same)").unwrap();
    let mut hardware = EmulatedArray::new(config.clone());
    let reports = run_model(&config, &model, &RunOptions::default(), &mut hardware).unwrap();

    let report = &reports[0];
    println!(
        "Checked {} outputs over {} repetitions ({} words): {}",
        report.comparison.checked,
        report.repetitions,
        report.words_sent,
        if report.comparison.is_match() { "match" } else { "MISMATCH" }
    );
}
