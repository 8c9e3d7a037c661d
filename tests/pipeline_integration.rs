//! End-to-end pipeline test over a synthetic on-disk dataset.
//!
//! Writes small four-subsystem datasets in the real on-disk layout (npy
//! waveforms + CSV labels), then runs the full study path: load, partition,
//! fit scalers, train briefly, checkpoint round-trip, reconstruct, render
//! figures.

use hvcm_cvae::config::{ModelConfig, TrainingConfig};
use hvcm_cvae::data::{GroupScalers, StudyData};
use hvcm_cvae::figures;
use hvcm_cvae::model::checkpoint::{CheckpointMetadata, StudyCheckpoint};
use hvcm_cvae::model::{training, Cvae, FeatureMap};
use hvcm_cvae::types::{RunStatus, Subsystem, NUM_CHANNELS, SEQ_LEN};
use ndarray::{Array3, Axis};
use ndarray_npy::WriteNpyExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Per-system sample count: two normal pulses plus one fault.
const SAMPLES: usize = 3;
const NORMAL_PER_SYSTEM: usize = 2;

fn write_synthetic_dataset(dir: &Path, system: Subsystem) {
    // Smooth per-channel waveforms with a per-system offset so scalers see
    // non-degenerate statistics.
    let offset = system.index() as f64;
    let stack = Array3::from_shape_fn((SAMPLES, SEQ_LEN, NUM_CHANNELS), |(s, t, c)| {
        let phase = t as f64 * 0.01 + s as f64;
        (phase.sin() + offset) * (c + 1) as f64
    });
    let file = File::create(dir.join(format!("{system}.npy"))).expect("create npy");
    stack.write_npy(file).expect("write npy");

    let mut csv = File::create(dir.join(format!("{system}_labels.csv"))).expect("create csv");
    writeln!(csv, "id,status,fault_type").expect("header");
    for i in 0..SAMPLES {
        let status = if i < NORMAL_PER_SYSTEM {
            RunStatus::Run
        } else {
            RunStatus::Fault
        };
        let fault = match status {
            RunStatus::Run => "",
            RunStatus::Fault => "A FLUX Low Fault",
        };
        writeln!(csv, "{system}-pulse-{i},{},{fault}", status.as_str()).expect("row");
    }
}

fn tiny_model_config() -> ModelConfig {
    ModelConfig {
        conv_channels: 4,
        fc_width: 8,
        latent_dim: 6,
        dropout: 0.1,
        ..ModelConfig::default()
    }
}

#[test]
fn test_full_pipeline_on_synthetic_dataset() {
    let dir = tempfile::tempdir().expect("tmpdir");
    for system in Subsystem::ALL {
        write_synthetic_dataset(dir.path(), system);
    }

    // Load and partition.
    let data = StudyData::load_all(dir.path()).expect("load datasets");
    assert_eq!(data.datasets.len(), 4);
    for dataset in &data.datasets {
        assert_eq!(dataset.normal_indices().len(), NORMAL_PER_SYSTEM);
        assert_eq!(dataset.fault_indices().len(), 1);
    }

    // Normalization subset with aligned one-hot conditions.
    let (mut stack, conditions) = data
        .normal_training_stack(NORMAL_PER_SYSTEM)
        .expect("training stack");
    assert_eq!(stack.dim(), (4 * NORMAL_PER_SYSTEM, SEQ_LEN, NUM_CHANNELS));
    assert_eq!(conditions.len(), 4 * NORMAL_PER_SYSTEM);
    assert_eq!(conditions[0], Subsystem::Rfq.one_hot());
    assert_eq!(conditions[7], Subsystem::Scl.one_hot());

    // Scalers: fit once on the subset, transformed values land in [0, 1].
    let scalers = GroupScalers::fit(&stack.view()).expect("fit scalers");
    scalers.transform_stack(stack.view_mut());
    for &v in &stack {
        assert!((-1e-9..=1.0 + 1e-9).contains(&v), "normalized value {v}");
    }

    // Brief training pass.
    let model_cfg = tiny_model_config();
    let mut rng = StdRng::seed_from_u64(42);
    let mut model = Cvae::new(&model_cfg, &mut rng);
    let train_cfg = TrainingConfig {
        learning_rate: 1e-4,
        epochs: 1,
        batch_size: 4,
    };
    let report = training::train(&mut model, &stack.view(), &conditions, &train_cfg, &mut rng);
    assert_eq!(report.epochs, 1);
    assert_eq!(report.steps, 2);
    assert!(report.final_avg_loss.is_finite());

    // Checkpoint round trip.
    let checkpoint_path = dir.path().join("checkpoints/cvae.json");
    let metadata = CheckpointMetadata::now(42, report.epochs, report.final_avg_loss);
    StudyCheckpoint::new(&model, &scalers, metadata)
        .save(&checkpoint_path)
        .expect("save checkpoint");
    let (restored, restored_scalers) = StudyCheckpoint::load(&checkpoint_path)
        .expect("load checkpoint")
        .restore(&model_cfg)
        .expect("restore checkpoint");
    assert_eq!(restored_scalers, scalers);

    // Reconstruct the fault sample of RFQ with the restored model.
    let rfq = data.get(Subsystem::Rfq);
    let fault_idx = rfq.fault_indices_of_type("A FLUX Low Fault")[0];
    let mut sample = rfq.waveforms.index_axis(Axis(0), fault_idx).to_owned();
    restored_scalers.transform_sample(sample.view_mut());

    let x = FeatureMap::from_sample(&sample.view());
    let condition = FeatureMap::from_condition(&Subsystem::Rfq.one_hot());
    let out = restored.forward_eval(&x, &condition, &mut rng);
    assert_eq!(out.reconstruction.channels, NUM_CHANNELS);
    assert_eq!(out.reconstruction.len, SEQ_LEN);
    for &v in &out.reconstruction.data {
        assert!((0.0..=1.0).contains(&v));
    }

    // Figures: averages, overlay, reconstruction comparison.
    let figure_dir = dir.path().join("figures");
    let subset = rfq.normal_subset(NORMAL_PER_SYSTEM).expect("subset");
    let average = hvcm_cvae::data::channel_average(&subset.view());
    let avg_paths =
        figures::render_channel_averages(&figure_dir, Subsystem::Rfq, &average.view())
            .expect("avg figures");
    assert_eq!(avg_paths.len(), NUM_CHANNELS);

    let firsts: Vec<_> = data
        .datasets
        .iter()
        .map(|d| {
            let mut s = d.waveforms.index_axis(Axis(0), 0).to_owned();
            restored_scalers.transform_sample(s.view_mut());
            (d.subsystem, s)
        })
        .collect();
    let views: Vec<_> = firsts.iter().map(|(sys, s)| (*sys, s.view())).collect();
    figures::render_subsystem_overlay(&figure_dir, &views).expect("overlay figures");

    let recon = out.reconstruction.to_sample(0);
    let recon_paths =
        figures::render_reconstruction(&figure_dir, Subsystem::Rfq, &sample.view(), &recon.view())
            .expect("reconstruction figures");
    for path in recon_paths {
        assert!(path.exists());
        assert!(std::fs::metadata(&path).expect("metadata").len() > 0);
    }
    assert!(figure_dir.join("avg/RFQ/DV_DT.png").exists());
    assert!(figure_dir.join("overlay/A+_IGBT-I.png").exists());
}

#[test]
fn test_scaler_statistics_come_from_training_subset_only() {
    // Transforming a held-out sample must use the fitted statistics, not
    // refit on the new data: a sample far outside the training range maps
    // outside [0, 1] rather than being squashed into it.
    let dir = tempfile::tempdir().expect("tmpdir");
    for system in Subsystem::ALL {
        write_synthetic_dataset(dir.path(), system);
    }
    let data = StudyData::load_all(dir.path()).expect("load");
    let (stack, _) = data
        .normal_training_stack(NORMAL_PER_SYSTEM)
        .expect("stack");
    let scalers = GroupScalers::fit(&stack.view()).expect("fit");

    let mut outlier = Array3::from_elem((1, SEQ_LEN, NUM_CHANNELS), 1e6)
        .index_axis_move(Axis(0), 0);
    scalers.transform_sample(outlier.view_mut());
    assert!(
        outlier.iter().any(|&v| v > 1.0),
        "outlier sample should escape the fitted [0, 1] range"
    );
}
