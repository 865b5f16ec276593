//! reservoir-node CLI - conditioning audits and golden-data verification

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use reservoir_node::debug::{load_npy_tensor, save_tensor_npy};
use reservoir_node::{
    Batch, DebugMode, EsnCell, Node, NodeConfig, NumericKernel, RidgeReadout, ToleranceAssertions,
    VERSION,
};

/// reservoir-node - reservoir computing node with numerical diagnostics
#[derive(Parser, Debug)]
#[command(name = "reservoir-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Audit and invert a matrix stored as .npy
    Condition {
        /// Matrix to invert
        #[arg(short, long)]
        matrix: PathBuf,

        /// Use the Moore-Penrose pseudo-inverse
        #[arg(long)]
        pseudo: bool,

        /// Where to save the (pseudo-)inverse
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Train the configured pipeline and check it against golden values
    Verify {
        /// Path to pipeline config file
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        /// Input signal (.npy, (batch, time, dim) or (time, dim))
        #[arg(short, long)]
        inputs: PathBuf,

        /// Training targets (.npy)
        #[arg(short, long)]
        targets: PathBuf,

        /// Directory of golden .npy debug points (overrides the config)
        #[arg(short, long)]
        golden: Option<PathBuf>,
    },

    /// Show the parsed configuration
    Info {
        /// Path to pipeline config file
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

fn condition(matrix: &Path, pseudo: bool, output: Option<&Path>) -> Result<()> {
    let device = Device::Cpu;
    let m = load_npy_tensor(matrix, &device)
        .with_context(|| format!("Failed to load matrix {:?}", matrix))?;
    let name = matrix
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "matrix".to_string());

    let kernel = NumericKernel::new(DebugMode::Output);
    let (result, report) = if pseudo {
        kernel.pseudo_invert(&name, &m)?
    } else {
        kernel.invert(&name, &m)?
    };

    match report {
        Some(r) => println!(
            "{}: {} condition number {:.3}{}",
            r.name,
            r.operation,
            r.condition_number,
            if r.ill_conditioned { " (ill-conditioned)" } else { "" }
        ),
        None => println!("{}: condition number unavailable", name),
    }

    if let Some(path) = output {
        save_tensor_npy(path, &result).with_context(|| format!("Failed to save {:?}", path))?;
        info!("Saved result to {:?}", path);
    }
    Ok(())
}

fn prepare_node<N: Node>(node: &mut N, config: &NodeConfig, golden: Option<&Path>) -> Result<()> {
    if node.core().debug_mode() == DebugMode::TestCase {
        node.core_mut()
            .set_test_case(Some(Box::new(ToleranceAssertions::new("verify"))));
    }
    if let Some(dir) = golden {
        let device = node.core().device().clone();
        let count = node
            .core_mut()
            .debug_points_mut()
            .load_npy_dir(dir, config.debug.precision, &device)?;
        info!("Loaded {} golden values from {:?}", count, dir);
    }
    node.initialize()?;
    Ok(())
}

fn verify(config_path: &Path, inputs: &Path, targets: &Path, golden: Option<PathBuf>) -> Result<()> {
    let config = NodeConfig::load(config_path)?;
    let golden = golden.or_else(|| config.debug.golden_dir.clone());
    if golden.is_some() && !config.node.debug_mode.is_enabled() {
        warn!("Golden values given but debug_mode is off; nothing will be checked");
    }

    let device = Device::Cpu;
    let inputs = load_npy_tensor(inputs, &device).context("Failed to load inputs")?;
    let targets = load_npy_tensor(targets, &device).context("Failed to load targets")?;

    let mut esn = match (config.esn.as_ref(), config.esn_options()) {
        (Some(esn), Some(options)) => Some(EsnCell::new(options, esn.params.clone())?),
        _ => None,
    };
    let mut readout = RidgeReadout::new(config.readout_options(), config.ridge.clone())?;

    if let Some(esn) = esn.as_mut() {
        prepare_node(esn, &config, golden.as_deref())?;
        info!("{}", esn.describe());
    }
    prepare_node(&mut readout, &config, golden.as_deref())?;
    info!("{}", readout.describe());

    let features = match esn.as_mut() {
        Some(esn) => esn.forward(&Batch::new(inputs))?,
        None => inputs,
    };
    readout.forward(&Batch::with_targets(features.clone(), targets.clone()))?;
    readout.finalize()?;

    let predictions = readout.forward(&Batch::new(features))?;
    let targets = targets.to_dtype(predictions.dtype())?.reshape(predictions.dims())?;
    let mse = (predictions - targets)?
        .sqr()?
        .mean_all()?
        .to_dtype(candle_core::DType::F64)?
        .to_scalar::<f64>()?;
    println!("Training MSE: {:.6e}", mse);

    let mut failures = 0;
    let registries = esn
        .iter()
        .map(|n| ("esn", n.debug_points(), n.condition_reports()))
        .chain(std::iter::once((
            "readout",
            readout.debug_points(),
            readout.condition_reports(),
        )));
    for (label, points, conditions) in registries {
        println!("\n== {} ==", label);
        for r in conditions {
            println!("{} {}: condition number {:.3}", r.operation, r.name, r.condition_number);
        }
        if !points.reports().is_empty() {
            println!("{}", points.summary());
        }
        failures += points.failures();
    }

    if failures > 0 {
        anyhow::bail!("{} debug point check(s) failed", failures);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    info!("reservoir-node v{}", VERSION);

    match cli.command {
        Commands::Condition {
            matrix,
            pseudo,
            output,
        } => condition(&matrix, pseudo, output.as_deref()),

        Commands::Verify {
            config,
            inputs,
            targets,
            golden,
        } => verify(&config, &inputs, &targets, golden),

        Commands::Info { config } => {
            info!("Loading config from {:?}", config);
            let cfg = NodeConfig::load(&config).context("Failed to load config")?;
            println!("{:#?}", cfg);
            Ok(())
        }
    }
}
