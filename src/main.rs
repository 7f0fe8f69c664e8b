//! Layer mapper CLI
//!
//! Usage:
//!   layer2systolic plan "conv(in=8x8x4, filters=8, kernel=3)"
//!   layer2systolic encode -f model.json --layer 1 --serial --json
//!   layer2systolic verify -f model.net --zero-skip --post-shift 6
//!   layer2systolic dump -f model.net --out dumps/ --against rtl_dumps/

use clap::{Args, Parser as ClapParser, Subcommand};
use colored::Colorize;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use layer_to_systolic::dump::{compare_dump_files, write_repetition_dumps};
use layer_to_systolic::stream::{serialize_parallel, serialize_serial};
use layer_to_systolic::verify::reference_output_stream;
use layer_to_systolic::{
    compute_golden, encode_layer, load_model, plan_model, run_layer, run_model, AcceleratorConfig, EmulatedArray,
    EncodeContext, LayerReport, LoopbackArray, MapError, MapResult, ModelDescription, PostScale, RunOptions,
    TensorStore, TilingPlan, WireFormat, WirePayload,
};

#[derive(ClapParser, Debug)]
#[command(name = "layer2systolic")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Plans, encodes and verifies layers for a clustered systolic array")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Accelerator configuration as JSON (defaults to the OpenEye geometry)
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Verbose output (debug logging unless RUST_LOG is set)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the tiling plan of every layer
    Plan {
        #[command(flatten)]
        model: ModelArgs,

        /// Output as JSON
        #[arg(short = 'j', long = "json")]
        json_output: bool,
    },
    /// Encode one layer into wire payloads
    Encode {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        run: RunArgs,

        /// Layer to encode
        #[arg(short = 'l', long = "layer", default_value = "0")]
        layer: usize,

        /// Output as JSON
        #[arg(short = 'j', long = "json")]
        json_output: bool,
    },
    /// Run the model and check every layer against the golden output
    Verify {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        run: RunArgs,
    },
    /// Write reference dumps of one layer
    Dump {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        run: RunArgs,

        #[arg(short = 'l', long = "layer", default_value = "0")]
        layer: usize,

        /// Directory for the dump files
        #[arg(short = 'o', long = "out", default_value = "dumps")]
        out: PathBuf,

        /// Compare against dumps of the same name in this directory
        #[arg(long = "against")]
        against: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Model in the layer description language or as JSON
    #[arg(value_name = "MODEL")]
    source: Option<String>,

    /// Read the model from a file
    #[arg(short = 'f', long = "file")]
    input_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Feed everything through the DMA channel
    #[arg(long = "serial")]
    serial: bool,

    /// Leave zero activations out of the scratchpads
    #[arg(long = "zero-skip")]
    zero_skip: bool,

    /// Arithmetic right shift applied on write-back
    #[arg(long = "post-shift")]
    post_shift: Option<u32>,

    /// Seed for generated weights and activations
    #[arg(long = "seed")]
    seed: Option<u64>,

    /// Maximum parallel jobs, 0 for one per core
    #[arg(short = 'J', long = "jobs", default_value = "0")]
    jobs: usize,
}

impl RunArgs {
    fn options(&self) -> RunOptions {
        let defaults = RunOptions::default();
        RunOptions {
            wire_format: if self.serial {
                WireFormat::Serial
            } else {
                WireFormat::Parallel
            },
            zero_skip: self.zero_skip,
            post_scale: self.post_shift.map(PostScale::Shift).unwrap_or(PostScale::None),
            max_parallel_jobs: self.jobs,
            seed: self.seed.unwrap_or(defaults.seed),
            ..defaults
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Configuration error".red(), e);
            std::process::exit(1);
        }
    };

    let result = match &cli.command {
        Command::Plan { model, json_output } => {
            read_model(model).and_then(|m| cmd_plan(&config, &m, *json_output, cli.verbose))
        }
        Command::Encode {
            model,
            run,
            layer,
            json_output,
        } => read_model(model).and_then(|m| cmd_encode(&config, &m, &run.options(), *layer, *json_output)),
        Command::Verify { model, run } => read_model(model).and_then(|m| cmd_verify(&config, &m, &run.options())),
        Command::Dump {
            model,
            run,
            layer,
            out,
            against,
        } => read_model(model)
            .and_then(|m| cmd_dump(&config, &m, &run.options(), *layer, out, against.as_deref())),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            let label = if e.is_planning() { "Planning error" } else { "Error" };
            eprintln!("{}: {}", label.red(), e);
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn load_config(path: Option<&Path>) -> MapResult<AcceleratorConfig> {
    let config = match path {
        Some(path) => AcceleratorConfig::from_json(&fs::read_to_string(path)?)?,
        None => AcceleratorConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn read_model(args: &ModelArgs) -> MapResult<ModelDescription> {
    let source = if let Some(source) = &args.source {
        source.clone()
    } else if let Some(file) = &args.input_file {
        fs::read_to_string(file)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };
    load_model(&source)
}

fn layer_plan(plans: &[TilingPlan], layer: usize) -> MapResult<&TilingPlan> {
    plans
        .get(layer)
        .ok_or_else(|| MapError::invalid_layer(format!("model has {} layers, no layer {}", plans.len(), layer)))
}

fn cmd_plan(config: &AcceleratorConfig, model: &ModelDescription, json_output: bool, verbose: bool) -> MapResult<bool> {
    let plans = plan_model(config, model)?;
    if json_output {
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(true);
    }

    println!("{}", "Layer Plans".bold().green());
    println!("{}", "=".repeat(50));
    println!(
        "{}: {}x{} clusters of {}x{} PEs",
        "Target".cyan(),
        config.cluster_rows,
        config.cluster_cols,
        config.pe_rows,
        config.pe_cols
    );
    for (i, plan) in plans.iter().enumerate() {
        println!();
        println!("{} {}: {}", "Layer".bold(), i.to_string().bold(), plan.shape);
        println!(
            "  {}: {} iact, {} wght, {} psum",
            "Occupancy".cyan(),
            plan.used_iact_per_pe,
            plan.used_wght_per_pe,
            plan.used_psum_per_pe
        );
        println!("  {}: {}", "Repetitions".cyan(), plan.needed_total_transmissions);
        println!("  {}: {}", "Active PEs".cyan(), plan.computing_mask.active_count());
        if verbose {
            print!("{}", plan);
        }
    }
    Ok(true)
}

fn payloads(
    config: &AcceleratorConfig,
    plan: &TilingPlan,
    store: &TensorStore,
    layer: usize,
    options: &RunOptions,
) -> MapResult<Vec<WirePayload>> {
    let ctx = EncodeContext::new(config, plan, store.layer_tensors(layer)?, options)?;
    encode_layer(&ctx)?
        .iter()
        .map(|frame| -> MapResult<WirePayload> {
            Ok(match options.wire_format {
                WireFormat::Parallel => WirePayload::Parallel(serialize_parallel(config, plan, frame)?),
                WireFormat::Serial => WirePayload::Serial {
                    repetition: frame.repetition,
                    words: serialize_serial(config, plan, frame)?,
                },
            })
        })
        .collect()
}

/// Store with quantized parameters; layers past the first read zeros
fn quantized_store(config: &AcceleratorConfig, model: &ModelDescription, options: &RunOptions) -> MapResult<TensorStore> {
    let mut store = TensorStore::initialize(model)?;
    store.quantize(model, config, options)?;
    Ok(store)
}

fn cmd_encode(
    config: &AcceleratorConfig,
    model: &ModelDescription,
    options: &RunOptions,
    layer: usize,
    json_output: bool,
) -> MapResult<bool> {
    let plans = plan_model(config, model)?;
    let plan = layer_plan(&plans, layer)?;
    let store = quantized_store(config, model, options)?;
    let payloads = payloads(config, plan, &store, layer, options)?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&payloads)?);
        return Ok(true);
    }
    println!("{} {}: {}", "Layer".bold(), layer, plan.shape);
    for payload in &payloads {
        println!(
            "  {} {:>4}: {} words",
            "Repetition".cyan(),
            payload.repetition(),
            payload.word_count()
        );
    }
    let total: usize = payloads.iter().map(WirePayload::word_count).sum();
    println!("{}: {} words", "Total".green(), total);
    Ok(true)
}

fn cmd_verify(config: &AcceleratorConfig, model: &ModelDescription, options: &RunOptions) -> MapResult<bool> {
    let reports = match options.wire_format {
        WireFormat::Parallel => run_model(config, model, options, &mut EmulatedArray::new(config.clone()))?,
        WireFormat::Serial => run_loopback(config, model, options)?,
    };

    let mut all_match = true;
    for report in &reports {
        let status = if report.comparison.is_match() {
            "OK".green()
        } else {
            all_match = false;
            "MISMATCH".red()
        };
        println!(
            "{} {}: {} ({} values, {} repetitions, {} words)",
            "Layer".bold(),
            report.layer,
            status,
            report.comparison.checked,
            report.repetitions,
            report.words_sent
        );
        if let Some(first) = report.comparison.mismatches.first() {
            println!(
                "  {}: filter {} at ({}, {}): expected {}, got {}",
                "First mismatch".yellow(),
                first.filter,
                first.x,
                first.y,
                first.golden,
                first.observed
            );
        }
    }
    Ok(all_match && reports.len() == model.layers.len())
}

/// Serial words cannot be emulated; each layer is answered with its golden
/// output to check the encode/decode path
fn run_loopback(config: &AcceleratorConfig, model: &ModelDescription, options: &RunOptions) -> MapResult<Vec<LayerReport>> {
    let plans = plan_model(config, model)?;
    let mut store = quantized_store(config, model, options)?;
    let mut reports = Vec::new();
    for (layer, plan) in plans.iter().enumerate() {
        let golden = compute_golden(&store.layer_tensors(layer)?, options.max_parallel_jobs)?;
        let mut hardware = LoopbackArray::new(config.clone(), golden);
        reports.push(run_layer(config, plan, &mut store, layer, options, &mut hardware)?);
    }
    Ok(reports)
}

fn cmd_dump(
    config: &AcceleratorConfig,
    model: &ModelDescription,
    options: &RunOptions,
    layer: usize,
    out: &Path,
    against: Option<&Path>,
) -> MapResult<bool> {
    let plans = plan_model(config, model)?;
    let plan = layer_plan(&plans, layer)?;
    let store = quantized_store(config, model, options)?;
    let golden = compute_golden(&store.layer_tensors(layer)?, options.max_parallel_jobs)?;
    let serial = options.wire_format == WireFormat::Serial;

    fs::create_dir_all(out)?;
    let mut written = Vec::new();
    for payload in payloads(config, plan, &store, layer, options)? {
        let r = payload.repetition();
        let expected = if plan.captures_output(r) {
            Some(reference_output_stream(config, plan, &golden, r, serial)?)
        } else {
            None
        };
        written.extend(write_repetition_dumps(out, config, &payload, expected.as_ref())?);
    }
    println!("{}: {} files in {}", "Wrote".green(), written.len(), out.display());

    let Some(dir) = against else {
        return Ok(true);
    };
    let mut all_match = true;
    for path in &written {
        let Some(name) = path.file_name() else {
            continue;
        };
        let other = dir.join(name);
        if !other.exists() {
            println!("  {}: {}", "Missing".yellow(), other.display());
            all_match = false;
            continue;
        }
        if let Some(diff) = compare_dump_files(path, &other)? {
            all_match = false;
            println!(
                "  {}: {} line {}: expected {:?}, got {:?}",
                "Differs".red(),
                name.to_string_lossy(),
                diff.line,
                diff.expected,
                diff.actual
            );
        }
    }
    if all_match {
        println!("{}", "All dumps match".green());
    }
    Ok(all_match)
}
