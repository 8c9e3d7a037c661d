//! Model checkpoints: versioned serde snapshots with atomic persistence.
//!
//! A checkpoint carries the model (hyperparameters, weights, batch-norm
//! running stats) plus the fitted channel-group scalers: evaluation
//! transforms held-out samples with the training statistics, so the two
//! must travel together. Provenance metadata records when and how the
//! snapshot was produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::cvae::Cvae;
use crate::config::ModelConfig;
use crate::data::GroupScalers;

/// Format version for forward compatibility.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode checkpoint {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint version {got} not supported (expected {CHECKPOINT_VERSION})")]
    VersionMismatch { got: u32 },

    #[error("checkpoint model config does not match the study config: {0}")]
    ConfigMismatch(String),
}

/// Provenance attached to a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
    /// Seed the run was started with.
    pub seed: u64,
    /// Epochs of training behind these weights.
    pub epochs_trained: usize,
    /// Mean total loss over the final training epoch.
    pub final_loss: f64,
}

impl CheckpointMetadata {
    pub fn now(seed: u64, epochs_trained: usize, final_loss: f64) -> Self {
        Self {
            created_at: Utc::now(),
            seed,
            epochs_trained,
            final_loss,
        }
    }
}

/// Complete snapshot of a trained study: model + scalers + provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyCheckpoint {
    /// Format version.
    pub version: u32,
    model: Cvae,
    scalers: GroupScalers,
    /// Provenance metadata.
    pub metadata: CheckpointMetadata,
}

impl StudyCheckpoint {
    /// Snapshot the current model and scalers.
    pub fn new(model: &Cvae, scalers: &GroupScalers, metadata: CheckpointMetadata) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            model: model.clone(),
            scalers: scalers.clone(),
            metadata,
        }
    }

    /// Save to disk atomically (write temp file, then rename).
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec(self).map_err(CheckpointError::Encode)?;

        let tmp_path = path.with_extension("json.tmp");
        let io_err = |source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(&tmp_path, &json).map_err(io_err)?;
        std::fs::rename(&tmp_path, path).map_err(io_err)?;
        tracing::info!(path = %path.display(), bytes = json.len(), "saved checkpoint");
        Ok(())
    }

    /// Load from disk, rejecting unknown format versions.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let data = std::fs::read(path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let checkpoint: Self =
            serde_json::from_slice(&data).map_err(|source| CheckpointError::Decode {
                path: path.to_path_buf(),
                source,
            })?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                got: checkpoint.version,
            });
        }
        Ok(checkpoint)
    }

    /// Take the model and scalers out of the snapshot, validating that the
    /// stored architecture matches what the study expects.
    pub fn restore(self, expected: &ModelConfig) -> Result<(Cvae, GroupScalers), CheckpointError> {
        if self.model.config() != expected {
            return Err(CheckpointError::ConfigMismatch(format!(
                "stored {:?}, expected {expected:?}",
                self.model.config()
            )));
        }
        let mut model = self.model;
        // Gradient buffers are not serialized; re-arm them.
        model.zero_grads();
        Ok((model, self.scalers))
    }
}
