//! Layer mapper for a clustered systolic-array accelerator
//!
//! This library plans how the tensors of a neural-network layer are split
//! across the clusters and PEs of the array, encodes them into the
//! scratchpad images and transmission words the accelerator consumes, and
//! verifies the partial sums it sends back against a golden computation.
//!
//! # Example
//!
//! ```rust
//! use layer_to_systolic::{plan_model, parse_model, AcceleratorConfig};
//!
//! let config = AcceleratorConfig::default();
//! let model = parse_model("conv(in=8x8x4, filters=8, kernel=3); dense(in=512, out=10)").unwrap();
//! let plans = plan_model(&config, &model).unwrap();
//! println!("{}", plans[0].needed_total_transmissions);
//! ```

pub mod driver;
pub mod dump;
pub mod encoder;
pub mod error;
pub mod hardware;
pub mod layer;
pub mod lexer;
pub mod pack;
pub mod parallel;
pub mod parser;
pub mod routing;
pub mod status;
pub mod store;
pub mod stream;
pub mod tiling;
pub mod verify;

use tracing::{info, warn};

pub use driver::{run_layer, EmulatedArray, HardwareHandle, LayerReport, LoopbackArray};
pub use encoder::{encode_layer, encoder_for, EncodeContext, StreamEncoder};
pub use error::{MapError, MapResult};
pub use hardware::{AcceleratorConfig, Port, RunOptions, WireFormat};
pub use layer::{LayerKind, LayerShape, LayerSpec, ModelDescription, Padding};
pub use parser::{parse_model, Parser};
pub use status::StatusRegister;
pub use store::{PostScale, Tensor, TensorStore};
pub use stream::{RepetitionFrame, WirePayload};
pub use tiling::{GeometryPlanner, TilingPlan};
pub use verify::{compare, compute_golden, CapturedStream, Comparison, Mismatch};

/// Read a model from JSON or from the layer description language
pub fn load_model(source: &str) -> MapResult<ModelDescription> {
    if source.trim_start().starts_with('{') {
        ModelDescription::from_json(source)
    } else {
        parse_model(source)
    }
}

/// Plan every layer of a model; the first layer that cannot be mapped aborts
pub fn plan_model(config: &AcceleratorConfig, model: &ModelDescription) -> MapResult<Vec<TilingPlan>> {
    config.validate()?;
    let planner = GeometryPlanner::new(config.clone());
    model.shapes().map(|shape| planner.plan(shape)).collect()
}

/// Run a model layer by layer on `hardware`
///
/// Each verified layer output becomes the input of the next layer. The run
/// stops after the first layer whose output differs from the golden one;
/// its report is the last one returned.
pub fn run_model(
    config: &AcceleratorConfig,
    model: &ModelDescription,
    options: &RunOptions,
    hardware: &mut dyn HardwareHandle,
) -> MapResult<Vec<LayerReport>> {
    let plans = plan_model(config, model)?;
    let mut store = TensorStore::initialize(model)?;
    store.quantize(model, config, options)?;

    let mut reports = Vec::with_capacity(plans.len());
    for (layer, plan) in plans.iter().enumerate() {
        let report = run_layer(config, plan, &mut store, layer, options, hardware)?;
        let matched = report.comparison.is_match();
        info!(layer, checked = report.comparison.checked, matched, "layer finished");
        reports.push(report);
        if !matched {
            warn!(layer, "stopping after mismatching layer");
            break;
        }
    }
    Ok(reports)
}
