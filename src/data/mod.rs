//! HVCM dataset loading and preparation.
//!
//! Each subsystem ships as two files in the data directory:
//!
//! - `<SYSTEM>.npy`: waveform stack, f64, shape `[samples, 4500, 14]`
//! - `<SYSTEM>_labels.csv`: one label record per sample: `id,status,fault_type`
//!
//! Loading validates shapes up front so a miscounted channel axis fails as a
//! typed error instead of corrupting every downstream index. Partitioning
//! splits samples into normal ("Run") and fault pulses by exact status
//! match; only the normal population feeds scaler fitting and training.

pub mod scaler;

pub use scaler::{GroupScaler, GroupScalers, MinMaxScaler, ScalerError, StandardScaler};

use ndarray::{concatenate, Array2, Array3, ArrayView3, Axis};
use ndarray_npy::{ReadNpyError, ReadNpyExt};
use statrs::statistics::Statistics;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{
    LabelRecord, RunStatus, Subsystem, CHANNEL_NAMES, NUM_CHANNELS, NUM_SUBSYSTEMS, SEQ_LEN,
};

/// Dataset loading and preparation failures.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse waveform array {path}: {source}")]
    Npy {
        path: PathBuf,
        #[source]
        source: ReadNpyError,
    },

    #[error(
        "waveform array {path} has shape [{n}, {time}, {channels}], \
         expected [_, {SEQ_LEN}, {NUM_CHANNELS}]"
    )]
    ShapeMismatch {
        path: PathBuf,
        n: usize,
        time: usize,
        channels: usize,
    },

    #[error("{system}: {labels} label records for {samples} waveform samples")]
    LabelCount {
        system: Subsystem,
        labels: usize,
        samples: usize,
    },

    #[error("bad label record at {path}:{line}: {reason}")]
    BadLabel {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("{system} has {got} normal samples, need {want}")]
    NotEnoughNormal {
        system: Subsystem,
        want: usize,
        got: usize,
    },

    #[error(transparent)]
    Scaler(#[from] ScalerError),
}

/// One subsystem's waveform stack with parallel label records.
#[derive(Debug, Clone)]
pub struct SubsystemDataset {
    /// Which HVCM subsystem this data came from.
    pub subsystem: Subsystem,
    /// Waveforms, shape `[samples, time, channels]`.
    pub waveforms: Array3<f64>,
    /// One record per sample, same order as the waveform axis.
    pub labels: Vec<LabelRecord>,
}

impl SubsystemDataset {
    /// Load `<SYSTEM>.npy` and `<SYSTEM>_labels.csv` from `data_dir`.
    pub fn load(data_dir: &Path, subsystem: Subsystem) -> Result<Self, DataError> {
        let npy_path = data_dir.join(format!("{subsystem}.npy"));
        let file = File::open(&npy_path).map_err(|source| DataError::Io {
            path: npy_path.clone(),
            source,
        })?;
        let waveforms = Array3::<f64>::read_npy(file).map_err(|source| DataError::Npy {
            path: npy_path.clone(),
            source,
        })?;

        let (n, time, channels) = waveforms.dim();
        if time != SEQ_LEN || channels != NUM_CHANNELS {
            return Err(DataError::ShapeMismatch {
                path: npy_path,
                n,
                time,
                channels,
            });
        }

        let labels_path = data_dir.join(format!("{subsystem}_labels.csv"));
        let labels = load_labels(&labels_path)?;
        if labels.len() != n {
            return Err(DataError::LabelCount {
                system: subsystem,
                labels: labels.len(),
                samples: n,
            });
        }

        info!(
            system = %subsystem,
            samples = n,
            normal = labels.iter().filter(|l| l.is_normal()).count(),
            "loaded waveform dataset"
        );
        Ok(Self {
            subsystem,
            waveforms,
            labels,
        })
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the dataset holds no samples.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Sample indices whose pulse completed normally, in dataset order.
    pub fn normal_indices(&self) -> Vec<usize> {
        self.indices_with_status(RunStatus::Run)
    }

    /// Sample indices whose pulse faulted, in dataset order.
    pub fn fault_indices(&self) -> Vec<usize> {
        self.indices_with_status(RunStatus::Fault)
    }

    fn indices_with_status(&self, status: RunStatus) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, l)| l.status == status)
            .map(|(i, _)| i)
            .collect()
    }

    /// Fault sample indices whose fault-type string equals `fault_type` exactly.
    pub fn fault_indices_of_type(&self, fault_type: &str) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, l)| {
                l.status == RunStatus::Fault && l.fault_type.as_deref() == Some(fault_type)
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Copy out the samples at `indices` as a new `[k, time, channels]` stack.
    pub fn select(&self, indices: &[usize]) -> Array3<f64> {
        self.waveforms.select(Axis(0), indices)
    }

    /// The first `count` normal samples, the subset used for scaler fitting,
    /// averaging and training.
    pub fn normal_subset(&self, count: usize) -> Result<Array3<f64>, DataError> {
        let normal = self.normal_indices();
        if normal.len() < count {
            return Err(DataError::NotEnoughNormal {
                system: self.subsystem,
                want: count,
                got: normal.len(),
            });
        }
        Ok(self.select(&normal[..count]))
    }
}

/// Parse a label CSV: one `id,status,fault_type` record per line.
///
/// Quoted fields are honored so fault-type strings may contain commas. A
/// leading `id,status,fault_type` header row is skipped if present.
fn load_labels(path: &Path) -> Result<Vec<LabelRecord>, DataError> {
    let file = File::open(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        if idx == 0 && line.trim_start().starts_with("id,") {
            continue; // header row
        }

        let fields = csv_split(&line);
        if fields.len() < 2 {
            return Err(DataError::BadLabel {
                path: path.to_path_buf(),
                line: line_no,
                reason: format!("expected at least id,status but got {} field(s)", fields.len()),
            });
        }

        let status: RunStatus =
            fields[1]
                .parse()
                .map_err(|reason| DataError::BadLabel {
                    path: path.to_path_buf(),
                    line: line_no,
                    reason,
                })?;
        let fault_type = fields
            .get(2)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(String::from);

        records.push(LabelRecord {
            id: fields[0].trim().to_string(),
            status,
            fault_type,
        });
    }
    debug!(path = %path.display(), records = records.len(), "parsed label file");
    Ok(records)
}

/// Split a CSV line respecting quoted fields (handles commas inside quotes).
fn csv_split(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                if in_quotes && chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = !in_quotes;
                }
            }
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields
}

/// Mean waveform over the sample axis: `[k, time, channels]` → `[time, channels]`.
pub fn channel_average(stack: &ArrayView3<'_, f64>) -> Array2<f64> {
    stack
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array2::zeros((stack.len_of(Axis(1)), stack.len_of(Axis(2)))))
}

/// Per-channel population summary, logged after loading for sanity checks.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSummary {
    pub channel: usize,
    pub name: &'static str,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Summarize every channel of a `[k, time, channels]` stack.
pub fn summarize_channels(stack: &ArrayView3<'_, f64>) -> Vec<ChannelSummary> {
    (0..stack.len_of(Axis(2)))
        .map(|ch| {
            let column = stack.slice(ndarray::s![.., .., ch]);
            let values: Vec<f64> = column.iter().copied().collect();
            ChannelSummary {
                channel: ch,
                name: CHANNEL_NAMES.get(ch).copied().unwrap_or("?"),
                mean: Statistics::mean(values.iter()),
                std: Statistics::std_dev(values.iter()),
                min: Statistics::min(values.iter()),
                max: Statistics::max(values.iter()),
            }
        })
        .collect()
}

/// All four subsystem datasets plus derived training inputs.
#[derive(Debug, Clone)]
pub struct StudyData {
    pub datasets: Vec<SubsystemDataset>,
}

impl StudyData {
    /// Load every subsystem dataset from `data_dir`.
    pub fn load_all(data_dir: &Path) -> Result<Self, DataError> {
        let datasets = Subsystem::ALL
            .iter()
            .map(|&sys| SubsystemDataset::load(data_dir, sys))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { datasets })
    }

    /// Dataset for one subsystem.
    pub fn get(&self, subsystem: Subsystem) -> &SubsystemDataset {
        &self.datasets[subsystem.index()]
    }

    /// Concatenate the first `per_system` normal samples of every subsystem
    /// into one `[4 * per_system, time, channels]` stack with aligned one-hot
    /// condition vectors.
    ///
    /// This stack is the designated normalization subset: scalers are fitted
    /// here and nowhere else.
    pub fn normal_training_stack(
        &self,
        per_system: usize,
    ) -> Result<(Array3<f64>, Vec<[f64; NUM_SUBSYSTEMS]>), DataError> {
        let mut stacks = Vec::with_capacity(self.datasets.len());
        let mut conditions = Vec::with_capacity(self.datasets.len() * per_system);
        for dataset in &self.datasets {
            stacks.push(dataset.normal_subset(per_system)?);
            conditions.extend(std::iter::repeat(dataset.subsystem.one_hot()).take(per_system));
        }
        let views: Vec<_> = stacks.iter().map(Array3::view).collect();
        let stack = concatenate(Axis(0), &views).unwrap_or_else(|_| Array3::zeros((0, 0, 0)));
        Ok((stack, conditions))
    }
}
