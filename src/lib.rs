//! HVCM waveform diagnostics: conditional VAE over converter modulator
//! sensor data.
//!
//! Four accelerator subsystems (RFQ, DTL, CCL, SCL) share one generative
//! model of their 14-channel pulse waveforms, conditioned on subsystem
//! identity. The crate covers the full study pipeline:
//!
//! - **data**: dataset loading, normal/fault partitioning, channel-group
//!   scalers with a strict fit-once/transform-many lifecycle
//! - **model**: encoder, decoder, CVAE composition, loss, manual-backprop
//!   training, versioned checkpoints
//! - **figures**: per-channel diagnostic PNGs (averages, overlays,
//!   reconstruction comparisons)
//!
//! Every stochastic step draws from an explicitly passed `StdRng`; there is
//! no global random state and no global configuration.

pub mod config;
pub mod data;
pub mod figures;
pub mod model;
pub mod types;

// Re-export the study configuration
pub use config::{ConfigError, ModelConfig, StudyConfig, TrainingConfig};

// Re-export commonly used types
pub use types::{
    ChannelGroup, LabelRecord, RunStatus, Subsystem, CHANNEL_GROUPS, CHANNEL_NAMES,
    NUM_CHANNELS, NUM_SUBSYSTEMS, SEQ_LEN,
};

// Re-export data preparation
pub use data::{
    channel_average, summarize_channels, DataError, GroupScalers, StudyData, SubsystemDataset,
};

// Re-export the model
pub use model::{
    cvae_loss, encoded_len, Cvae, CvaeOutput, StudyCheckpoint, TrainReport,
};
