//! Core domain types for the HVCM waveform study.
//!
//! A waveform sample is a fixed-shape time series recorded from one
//! high-voltage converter modulator pulse: [`SEQ_LEN`] time steps of
//! [`NUM_CHANNELS`] sensor channels (IGBT currents, magnetic flux,
//! capacitor bank, modulator output). Samples are immutable once loaded.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of sensor channels per waveform sample.
pub const NUM_CHANNELS: usize = 14;

/// Number of time steps per waveform sample.
pub const SEQ_LEN: usize = 4500;

/// Sample period of the digitizer: 400 ns per step (1.8 ms per pulse).
pub const SAMPLE_PERIOD_SECS: f64 = 400e-9;

/// Number of HVCM subsystems (condition categories).
pub const NUM_SUBSYSTEMS: usize = 4;

/// Channel names in digitizer order. Index positions are load-bearing:
/// the channel-group table below slices this axis by fixed indices.
pub const CHANNEL_NAMES: [&str; NUM_CHANNELS] = [
    "A+IGBT-I", "A+*IGBT-I", "B+IGBT-I", "B+*IGBT-I", "C+IGBT-I", "C+*IGBT-I",
    "A-FLUX", "B-FLUX", "C-FLUX",
    "CB-I", "CB-V",
    "MOD-V", "MOD-I", "DV/DT",
];

/// A named contiguous range of channels sharing one normalization scaler.
///
/// Serializes as its name alone; deserialization resolves the name against
/// [`CHANNEL_GROUPS`], so index ranges can never drift from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelGroup {
    /// Group name used in logs and figure directories.
    pub name: &'static str,
    /// First channel index (inclusive).
    pub start: usize,
    /// One past the last channel index (exclusive).
    pub end: usize,
}

impl ChannelGroup {
    /// Channel indices covered by this group.
    pub fn indices(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }

    /// Number of channels in the group.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Whether the group covers no channels.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Whether `channel` falls inside this group.
    pub fn contains(&self, channel: usize) -> bool {
        channel >= self.start && channel < self.end
    }
}

impl Serialize for ChannelGroup {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name)
    }
}

impl<'de> Deserialize<'de> for ChannelGroup {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        CHANNEL_GROUPS
            .iter()
            .find(|g| g.name == name)
            .copied()
            .ok_or_else(|| serde::de::Error::custom(format!("unknown channel group: {name}")))
    }
}

/// Declarative channel-group table: name, index range.
///
/// The four groups partition the 14-channel axis exactly:
/// 6 IGBT currents, 3 flux loops, 2 capacitor bank, 3 modulator output.
pub const CHANNEL_GROUPS: [ChannelGroup; 4] = [
    ChannelGroup { name: "igbt", start: 0, end: 6 },
    ChannelGroup { name: "flux", start: 6, end: 9 },
    ChannelGroup { name: "cap", start: 9, end: 11 },
    ChannelGroup { name: "mod", start: 11, end: 14 },
];

/// HVCM subsystem identity. Doubles as the condition category fed to the
/// CVAE: `index()` is the hot position in the one-hot condition vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subsystem {
    /// Radio-frequency quadrupole.
    Rfq,
    /// Drift-tube linac.
    Dtl,
    /// Coupled-cavity linac.
    Ccl,
    /// Superconducting linac.
    Scl,
}

impl Subsystem {
    /// All subsystems in condition-index order.
    pub const ALL: [Self; NUM_SUBSYSTEMS] = [Self::Rfq, Self::Dtl, Self::Ccl, Self::Scl];

    /// Condition index (0-3).
    pub fn index(self) -> usize {
        match self {
            Self::Rfq => 0,
            Self::Dtl => 1,
            Self::Ccl => 2,
            Self::Scl => 3,
        }
    }

    /// One-hot condition vector for this subsystem.
    pub fn one_hot(self) -> [f64; NUM_SUBSYSTEMS] {
        let mut v = [0.0; NUM_SUBSYSTEMS];
        v[self.index()] = 1.0;
        v
    }

    /// Canonical uppercase name, matching the on-disk dataset layout.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rfq => "RFQ",
            Self::Dtl => "DTL",
            Self::Ccl => "CCL",
            Self::Scl => "SCL",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subsystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RFQ" => Ok(Self::Rfq),
            "DTL" => Ok(Self::Dtl),
            "CCL" => Ok(Self::Ccl),
            "SCL" => Ok(Self::Scl),
            other => Err(format!("unknown subsystem: {other}")),
        }
    }
}

/// Pulse outcome recorded alongside each waveform sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Normal pulse.
    Run,
    /// Faulted pulse.
    Fault,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "Run",
            Self::Fault => "Fault",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Run" => Ok(Self::Run),
            "Fault" => Ok(Self::Fault),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Per-sample metadata: pulse identity, outcome, and fault classification.
///
/// Used only to partition samples; label contents are never fed to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRecord {
    /// Pulse identifier from the archiver (opaque string).
    pub id: String,
    /// Run/fault outcome.
    pub status: RunStatus,
    /// Fault-type string (e.g. "A FLUX Low Fault"); empty for normal pulses.
    pub fault_type: Option<String>,
}

impl LabelRecord {
    /// Whether this pulse completed normally.
    pub fn is_normal(&self) -> bool {
        self.status == RunStatus::Run
    }
}
