//! HVCM waveform study driver.
//!
//! Runs the full diagnostic pipeline over the four subsystem datasets:
//! load and partition, render averaged-signal and overlay figures, fit
//! channel-group scalers on the normal training subset, train or load the
//! CVAE, and render original-vs-reconstruction comparisons for a held-out
//! sample.
//!
//! # Usage
//!
//! ```bash
//! # Evaluate with an existing checkpoint
//! cargo run --release
//!
//! # Train from scratch, then evaluate
//! cargo run --release -- --train --epochs 50
//!
//! # Reconstruct a specific fault population instead of a held-out normal
//! cargo run --release -- --system RFQ --fault-type "A FLUX Low Fault"
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: logging level (default: info)

use anyhow::{bail, Context, Result};
use clap::Parser;
use ndarray::Axis;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tracing::{debug, info};

use hvcm_cvae::config::StudyConfig;
use hvcm_cvae::data::{channel_average, summarize_channels, GroupScalers, StudyData};
use hvcm_cvae::figures;
use hvcm_cvae::model::checkpoint::{CheckpointMetadata, StudyCheckpoint};
use hvcm_cvae::model::training;
use hvcm_cvae::model::{cvae_loss, Cvae, FeatureMap};
use hvcm_cvae::types::Subsystem;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "hvcm-study")]
#[command(about = "HVCM waveform CVAE study pipeline")]
#[command(version)]
struct CliArgs {
    /// Path to a study config TOML (built-in defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured seed
    #[arg(long)]
    seed: Option<u64>,

    /// Train a fresh model before evaluating (otherwise load the checkpoint)
    #[arg(long)]
    train: bool,

    /// Override the configured epoch count
    #[arg(long)]
    epochs: Option<usize>,

    /// Subsystem whose held-out sample is reconstructed
    #[arg(long, default_value = "RFQ")]
    system: Subsystem,

    /// Reconstruct the first fault sample of this type instead of a
    /// held-out normal sample
    #[arg(long)]
    fault_type: Option<String>,

    /// Skip figure rendering (train/evaluate only)
    #[arg(long)]
    no_figures: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    let mut config = StudyConfig::load(args.config.as_deref()).context("loading study config")?;
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }

    run(&config, &args)
}

fn run(config: &StudyConfig, args: &CliArgs) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(config.seed);

    let data = StudyData::load_all(&config.data_dir)
        .with_context(|| format!("loading datasets from {}", config.data_dir.display()))?;

    for dataset in &data.datasets {
        for summary in summarize_channels(&dataset.waveforms.view()) {
            debug!(
                system = %dataset.subsystem,
                channel = summary.name,
                mean = summary.mean,
                std = summary.std,
                min = summary.min,
                max = summary.max,
                "channel summary"
            );
        }
    }

    // Averaged normal waveform per subsystem, in raw units.
    if !args.no_figures {
        for dataset in &data.datasets {
            let subset = dataset.normal_subset(config.normal_subset)?;
            let average = channel_average(&subset.view());
            figures::render_channel_averages(&config.figure_dir, dataset.subsystem, &average.view())
                .context("rendering channel averages")?;
        }
    }

    // Train from the normalization subset, or restore model + fitted
    // scalers from the checkpoint.
    let (model, scalers) = if args.train {
        train_model(config, &data, &mut rng)?
    } else {
        let checkpoint = StudyCheckpoint::load(&config.checkpoint_path).with_context(|| {
            format!("loading checkpoint {}", config.checkpoint_path.display())
        })?;
        info!(
            created_at = %checkpoint.metadata.created_at,
            epochs = checkpoint.metadata.epochs_trained,
            "loaded checkpoint"
        );
        let (model, scalers) = checkpoint.restore(&config.model)?;
        (model, scalers)
    };

    // Overlay the first normal sample of every subsystem, normalized.
    if !args.no_figures {
        let mut firsts = Vec::new();
        for dataset in &data.datasets {
            let subset = dataset.normal_subset(1)?;
            let mut sample = subset.index_axis(Axis(0), 0).to_owned();
            scalers.transform_sample(sample.view_mut());
            firsts.push((dataset.subsystem, sample));
        }
        let views: Vec<_> = firsts.iter().map(|(sys, s)| (*sys, s.view())).collect();
        figures::render_subsystem_overlay(&config.figure_dir, &views)
            .context("rendering subsystem overlay")?;
    }

    evaluate(config, args, &data, &model, &scalers, &mut rng)
}

/// Fit scalers on the normalization subset, train the CVAE on the
/// normalized stack, and persist the checkpoint.
fn train_model(
    config: &StudyConfig,
    data: &StudyData,
    rng: &mut StdRng,
) -> Result<(Cvae, GroupScalers)> {
    let (mut stack, conditions) = data.normal_training_stack(config.normal_subset)?;
    let scalers = GroupScalers::fit(&stack.view())?;
    scalers.transform_stack(stack.view_mut());

    let mut model = Cvae::new(&config.model, rng);
    info!(
        params = model.num_params(),
        samples = stack.dim().0,
        epochs = config.training.epochs,
        "training CVAE"
    );
    let report = training::train(&mut model, &stack.view(), &conditions, &config.training, rng);
    info!(
        steps = report.steps,
        final_avg_loss = report.final_avg_loss,
        "training complete"
    );

    let metadata = CheckpointMetadata::now(config.seed, report.epochs, report.final_avg_loss);
    StudyCheckpoint::new(&model, &scalers, metadata)
        .save(&config.checkpoint_path)
        .context("saving checkpoint")?;
    Ok((model, scalers))
}

/// Reconstruct one sample of the chosen subsystem and render the
/// comparison figures.
fn evaluate(
    config: &StudyConfig,
    args: &CliArgs,
    data: &StudyData,
    model: &Cvae,
    scalers: &GroupScalers,
    rng: &mut StdRng,
) -> Result<()> {
    let dataset = data.get(args.system);

    let sample_idx = match &args.fault_type {
        Some(fault_type) => {
            let faults = dataset.fault_indices_of_type(fault_type);
            match faults.first() {
                Some(&idx) => idx,
                None => bail!("{} has no '{fault_type}' fault samples", args.system),
            }
        }
        None => {
            // First normal sample past the training subset.
            let normal = dataset.normal_indices();
            match normal.get(config.normal_subset) {
                Some(&idx) => idx,
                None => bail!(
                    "{} has no held-out normal sample beyond the training subset",
                    args.system
                ),
            }
        }
    };

    let mut sample = dataset.waveforms.index_axis(Axis(0), sample_idx).to_owned();
    scalers.transform_sample(sample.view_mut());

    let x = FeatureMap::from_sample(&sample.view());
    let condition = FeatureMap::from_condition(&args.system.one_hot());
    let output = model.forward_eval(&x, &condition, rng);
    let reconstruction = output.reconstruction.to_sample(0);

    let loss = cvae_loss(&output.reconstruction, &x, &output.mu, &output.logvar);
    info!(
        system = %args.system,
        sample = sample_idx,
        reconstruction_sse = loss.reconstruction,
        kl = loss.kl,
        "evaluated held-out sample"
    );

    if !args.no_figures {
        figures::render_reconstruction(
            &config.figure_dir,
            args.system,
            &sample.view(),
            &reconstruction.view(),
        )
        .context("rendering reconstruction comparison")?;
    }
    Ok(())
}
