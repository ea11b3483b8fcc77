//! dermaseg CLI
//!
//! Trains and evaluates the UNet lesion segmentation model on pre-split
//! `.npy` datasets.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use dermaseg::backend::{backend_name, default_device, TrainingBackend};
use dermaseg::config::{ParamOverrides, ParamResolver, ResolvedParams, RunConfig};
use dermaseg::tracking::{tracker_for, NoopTracker};
use dermaseg::training::{Trainer, TrainingSession};
use dermaseg::utils::logging::{init_logging, LogConfig};

/// UNet lesion segmentation for dermoscopic images
#[derive(Parser, Debug)]
#[command(name = "dermaseg")]
#[command(version)]
#[command(about = "UNet lesion segmentation training and evaluation with Burn", long_about = None)]
struct Cli {
    /// Debug logging with module paths
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, default_value = "false", conflicts_with = "verbose")]
    quiet: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that resolves parameters
#[derive(clap::Args, Debug, Clone)]
struct ParamArgs {
    /// Run configuration JSON file; missing fields take their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Preprocessing overrides, a JSON object of option -> value
    #[arg(long)]
    preprocessing: Option<PathBuf>,

    /// Augmentation overrides, a JSON object of option -> value
    #[arg(long)]
    augmentation: Option<PathBuf>,

    /// Settings string enabling preprocessing flags by tag (AUG, HEQ, PCN, CC, ZCA, GAUS), e.g. "AUG_HEQ_CC"
    #[arg(short, long)]
    settings: Option<String>,

    /// Reject unknown parameter names instead of keeping them
    #[arg(long, default_value = "false")]
    strict: bool,

    /// Directory holding the split arrays
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Truncate every split to a few samples
    #[arg(long, default_value = "false")]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train the UNet and evaluate it on the test split
    Train {
        #[command(flatten)]
        params: ParamArgs,

        /// Maximum number of training epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Batch size
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Random seed for shuffling and augmentation
        #[arg(long)]
        seed: Option<u64>,

        /// Write params and metrics under this directory
        #[arg(long)]
        tracking_dir: Option<PathBuf>,

        /// Name of the tracking run
        #[arg(long, default_value = "unet")]
        run_name: String,
    },

    /// Evaluate saved weights on the test split
    Evaluate {
        #[command(flatten)]
        params: ParamArgs,

        /// Checkpoint path as printed by `train` (without extension)
        #[arg(short, long)]
        model: PathBuf,
    },

    /// Print the resolved preprocessing and augmentation parameters
    Params {
        #[command(flatten)]
        params: ParamArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = match (cli.verbose, cli.quiet) {
        (true, _) => LogConfig::verbose(),
        (_, true) => LogConfig::quiet(),
        _ => LogConfig::default(),
    };
    if let Err(e) = init_logging(&logging) {
        eprintln!("{}", e);
    }

    print_banner();

    match cli.command {
        Commands::Train {
            params,
            epochs,
            batch_size,
            seed,
            tracking_dir,
            run_name,
        } => {
            let mut run = load_run_config(&params)?;
            if let Some(epochs) = epochs {
                run.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                run.batch_size = batch_size;
            }
            if let Some(seed) = seed {
                run.seed = seed;
            }
            if tracking_dir.is_some() {
                run.tracking_dir = tracking_dir;
            }
            run.validate()?;
            cmd_train(run, resolve_params(&params)?, &run_name)?;
        }

        Commands::Evaluate { params, model } => {
            let run = load_run_config(&params)?;
            cmd_evaluate(run, resolve_params(&params)?, &model)?;
        }

        Commands::Params { params } => {
            cmd_params(&resolve_params(&params)?)?;
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
  dermaseg :: UNet lesion segmentation (burn)
  -------------------------------------------
  "#
        .green()
    );
}

fn load_run_config(args: &ParamArgs) -> Result<RunConfig> {
    let mut run = match &args.config {
        Some(path) => RunConfig::load(path)
            .with_context(|| format!("Failed to load run configuration {:?}", path))?,
        None => RunConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        run.data_dir = dir.clone();
    }
    if args.debug {
        run.debug_mode = true;
    }
    Ok(run)
}

fn read_overrides(path: Option<&Path>) -> Result<ParamOverrides> {
    let Some(path) = path else {
        return Ok(ParamOverrides::new());
    };
    let contents = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&contents).with_context(|| format!("{:?} is not a JSON object of options", path))
}

fn resolve_params(args: &ParamArgs) -> Result<ResolvedParams> {
    let preprocessing = read_overrides(args.preprocessing.as_deref())?;
    let augmentation = read_overrides(args.augmentation.as_deref())?;

    let resolver = if args.strict {
        ParamResolver::strict()
    } else {
        ParamResolver::new()
    };
    let mut resolved = resolver.resolve(&preprocessing, &augmentation)?;
    if let Some(settings) = &args.settings {
        resolved.apply_settings_string(settings);
    }
    Ok(resolved)
}

fn cmd_train(run: RunConfig, params: ResolvedParams, run_name: &str) -> Result<()> {
    println!("{}", "Run".cyan().bold());
    println!("  Data:             {:?}", run.data_dir);
    println!("  Feature channels: {:?}", run.feature_channels);
    println!("  Epochs:           {}", run.epochs);
    println!("  Batch size:       {}", run.batch_size);
    println!("  Learning rate:    {}", run.learning_rate);
    println!("  Seed:             {}", run.seed);
    println!("  Backend:          {}", backend_name());
    if run.debug_mode {
        println!("  {}", format!("Debug mode: {} samples per split", run.debug_samples).yellow());
    }
    println!();

    let mut tracker = tracker_for(run.tracking_dir.as_deref());
    let mut session = TrainingSession::new(run, params, tracker.as_mut());

    println!("{}", "Training UNet".green().bold());
    let report = session.execute::<TrainingBackend>(run_name, &default_device())?;

    println!();
    println!("{}", "Done".green().bold());
    if let Some(best) = report.history.best_epoch {
        println!(
            "  Best epoch: {} (val_loss {:.4}){}",
            best + 1,
            report.history.best_val_loss,
            if report.history.stopped_early { ", stopped early" } else { "" }
        );
    }
    println!("  Saved to: {}", report.model_path.display());
    for (name, value) in &report.test_performance {
        println!("  test {}: {:.4}", name, value);
    }
    let [accuracy, jaccard, precision, sensitivity, specificity] = report.test_metrics;
    println!(
        "  accuracy {:.4} | jaccard {:.4} | precision {:.4} | sensitivity {:.4} | specificity {:.4}",
        accuracy, jaccard, precision, sensitivity, specificity
    );

    Ok(())
}

fn cmd_evaluate(run: RunConfig, params: ResolvedParams, model: &Path) -> Result<()> {
    info!("Evaluating {:?}", model);

    let mut tracker = NoopTracker;
    let mut session = TrainingSession::new(run, params, &mut tracker);
    let splits = session.load_data()?;
    let outcome = session.preprocess(splits)?;
    let run = session.run_config().clone();

    println!("{}", "Restoring weights".cyan());
    let trainer = Trainer::<TrainingBackend>::from_saved(
        &run,
        outcome.input_channels,
        run.image_size,
        model,
        &default_device(),
    )?;

    println!("{}", "Test split".cyan());
    let performance = trainer.evaluate(&outcome.splits.test, run.batch_size)?;
    for (name, value) in &performance {
        println!("  {}: {:.4}", name, value);
    }

    let report = trainer.segmentation_report(&outcome.splits.test, run.batch_size)?;
    println!("{}", report);

    Ok(())
}

fn cmd_params(params: &ResolvedParams) -> Result<()> {
    println!("{}", "Preprocessing parameters:".cyan().bold());
    println!("{}", serde_json::to_string_pretty(&params.preprocessing_map())?);
    println!("{}", "Augmentation parameters:".cyan().bold());
    println!("{}", serde_json::to_string_pretty(&params.augmentation_map())?);
    println!("{}", "Effective training augmentation:".cyan().bold());
    println!("{}", serde_json::to_string_pretty(&params.effective_augmentation())?);
    Ok(())
}
