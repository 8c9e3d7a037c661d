//! Study configuration loaded from TOML files.
//!
//! Replaces the hardcoded paths and hyperparameters of the original study
//! with operator-tunable values. Built-in defaults match the source
//! configuration, so a missing file is not an error.
//!
//! The configuration is an explicitly constructed value passed by reference
//! through the pipeline; there is no process-wide singleton. Construct it
//! once in `main()` and hand `&StudyConfig` to whatever needs it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::{NUM_CHANNELS, NUM_SUBSYSTEMS, SEQ_LEN};

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level study configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    /// Directory holding `<SYSTEM>.npy` and `<SYSTEM>_labels.csv` files.
    pub data_dir: PathBuf,
    /// Directory figures are written under (one subdirectory per view).
    pub figure_dir: PathBuf,
    /// Path of the model checkpoint file.
    pub checkpoint_path: PathBuf,
    /// Seed for every stochastic step (init, dropout, latent noise).
    pub seed: u64,
    /// Number of normal samples per subsystem used for scaler fitting,
    /// averaging, and training.
    pub normal_subset: usize,
    /// Model architecture hyperparameters.
    pub model: ModelConfig,
    /// Training hyperparameters.
    pub training: TrainingConfig,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/hvcm"),
            figure_dir: PathBuf::from("figures"),
            checkpoint_path: PathBuf::from("checkpoints/cvae.json"),
            seed: 42,
            normal_subset: 524,
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

/// CVAE architecture hyperparameters.
///
/// `in_channels` and `seq_len` are data-determined and default to the
/// digitizer shape; the rest mirror the source configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Input channels (sensor count).
    pub in_channels: usize,
    /// Input time steps per sample.
    pub seq_len: usize,
    /// Feature channels carried through every conv stage.
    pub conv_channels: usize,
    /// Convolution kernel size.
    pub kernel_size: usize,
    /// Convolution padding.
    pub padding: usize,
    /// Width of the fully-connected bottleneck before the latent heads.
    pub fc_width: usize,
    /// Latent dimension.
    pub latent_dim: usize,
    /// Condition vector dimension (subsystem count).
    pub condition_dim: usize,
    /// Dropout probability used throughout encoder and decoder.
    pub dropout: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_channels: NUM_CHANNELS,
            seq_len: SEQ_LEN,
            conv_channels: 128,
            kernel_size: 12,
            padding: 6,
            fc_width: 512,
            latent_dim: 512,
            condition_dim: NUM_SUBSYSTEMS,
            dropout: 0.2,
        }
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Adam learning rate.
    pub learning_rate: f64,
    /// Number of passes over the training set.
    pub epochs: usize,
    /// Mini-batch size.
    pub batch_size: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-5,
            epochs: 50,
            batch_size: 16,
        }
    }
}

impl StudyConfig {
    /// Load configuration from a TOML file, or defaults when `path` is None.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                let config: Self =
                    toml::from_str(&text).map_err(|source| ConfigError::Parse {
                        path: path.to_path_buf(),
                        source,
                    })?;
                tracing::info!(path = %path.display(), "loaded study config");
                config
            }
            None => {
                tracing::info!("no config file given, using built-in defaults");
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a shape-consistent model.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.model;
        if m.in_channels == 0 || m.seq_len == 0 || m.conv_channels == 0 {
            return Err(ConfigError::Invalid(
                "in_channels, seq_len and conv_channels must be nonzero".into(),
            ));
        }
        if m.kernel_size == 0 || m.kernel_size > m.seq_len {
            return Err(ConfigError::Invalid(format!(
                "kernel_size {} out of range for seq_len {}",
                m.kernel_size, m.seq_len
            )));
        }
        if m.latent_dim == 0 || m.fc_width == 0 {
            return Err(ConfigError::Invalid(
                "latent_dim and fc_width must be nonzero".into(),
            ));
        }
        if !(0.0..1.0).contains(&m.dropout) {
            return Err(ConfigError::Invalid(format!(
                "dropout {} must be in [0, 1)",
                m.dropout
            )));
        }
        if self.normal_subset == 0 {
            return Err(ConfigError::Invalid("normal_subset must be nonzero".into()));
        }
        if self.training.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be nonzero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StudyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.in_channels, 14);
        assert_eq!(config.model.seq_len, 4500);
        assert_eq!(config.model.latent_dim, 512);
        assert_eq!(config.normal_subset, 524);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config: StudyConfig = toml::from_str(
            r#"
            seed = 7

            [model]
            conv_channels = 32
            "#,
        )
        .expect("parse");
        assert_eq!(config.seed, 7);
        assert_eq!(config.model.conv_channels, 32);
        assert_eq!(config.model.kernel_size, 12);
        assert_eq!(config.training.learning_rate, 1e-5);
    }

    #[test]
    fn test_invalid_dropout_rejected() {
        let mut config = StudyConfig::default();
        config.model.dropout = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = StudyConfig::load(Some(Path::new("/nonexistent/study.toml")));
        assert!(err.is_err());
    }
}
