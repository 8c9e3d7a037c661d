//! Channel-group normalization scalers.
//!
//! Two fitted transformations, composed per channel group:
//!
//! - [`StandardScaler`]: zero-mean unit-variance standardization
//! - [`MinMaxScaler`]: affine rescale to [0, 1]
//!
//! [`GroupScalers`] fits one (standard, min-max) pair per entry of the
//! declarative [`CHANNEL_GROUPS`] table, pooling every value of every
//! channel in the group. Lifecycle contract: `fit` runs exactly once, on
//! the designated normalization subset; `transform` applies the same fitted
//! parameters to any later sample, including held-out test data. Scalers
//! are never refit per-sample.

use ndarray::{ArrayView3, ArrayViewMut2, ArrayViewMut3, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ChannelGroup, CHANNEL_GROUPS, NUM_CHANNELS};

/// Floor applied to fitted standard deviations and min-max spans so a
/// constant channel cannot produce a divide-by-zero.
const SPAN_FLOOR: f64 = 1e-8;

#[derive(Debug, Error)]
pub enum ScalerError {
    #[error("cannot fit scaler on an empty value set")]
    EmptyFit,

    #[error("scaler fit input has {got} channels, expected {expected}")]
    ChannelMismatch { got: usize, expected: usize },

    #[error("non-finite value encountered while fitting group {group}")]
    NonFinite { group: &'static str },
}

/// Zero-mean unit-variance standardization with fit-once parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: f64,
    std: f64,
}

impl StandardScaler {
    /// Fit mean and standard deviation over the given values.
    ///
    /// Uses Welford's single-pass update for numerical stability on long
    /// waveform runs.
    pub fn fit<I: IntoIterator<Item = f64>>(values: I) -> Result<Self, ScalerError> {
        let mut count = 0u64;
        let mut mean = 0.0;
        let mut m2 = 0.0;
        for x in values {
            count += 1;
            let delta = x - mean;
            mean += delta / count as f64;
            m2 += delta * (x - mean);
        }
        if count == 0 {
            return Err(ScalerError::EmptyFit);
        }
        let variance = if count > 1 { m2 / (count - 1) as f64 } else { 0.0 };
        Ok(Self {
            mean,
            std: variance.sqrt().max(SPAN_FLOOR),
        })
    }

    pub fn transform(&self, x: f64) -> f64 {
        (x - self.mean) / self.std
    }

    pub fn inverse_transform(&self, x: f64) -> f64 {
        x * self.std + self.mean
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn std(&self) -> f64 {
        self.std
    }
}

/// Affine rescale to [0, 1] with fit-once bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    min: f64,
    span: f64,
}

impl MinMaxScaler {
    /// Fit min/max bounds over the given values.
    pub fn fit<I: IntoIterator<Item = f64>>(values: I) -> Result<Self, ScalerError> {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut any = false;
        for x in values {
            any = true;
            min = min.min(x);
            max = max.max(x);
        }
        if !any {
            return Err(ScalerError::EmptyFit);
        }
        Ok(Self {
            min,
            span: (max - min).max(SPAN_FLOOR),
        })
    }

    pub fn transform(&self, x: f64) -> f64 {
        (x - self.min) / self.span
    }

    pub fn inverse_transform(&self, x: f64) -> f64 {
        x * self.span + self.min
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.min + self.span
    }
}

/// One fitted scaler pair for one channel group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupScaler {
    /// The channel range this scaler covers.
    pub group: ChannelGroup,
    /// Standardization fitted on raw values.
    pub standard: StandardScaler,
    /// Min-max fitted on standardized values.
    pub minmax: MinMaxScaler,
}

impl GroupScaler {
    /// Standardize then rescale to [0, 1].
    pub fn transform(&self, x: f64) -> f64 {
        self.minmax.transform(self.standard.transform(x))
    }

    /// Invert both stages, restoring original units.
    pub fn inverse_transform(&self, x: f64) -> f64 {
        self.standard.inverse_transform(self.minmax.inverse_transform(x))
    }
}

/// Fitted scalers for every channel group, applied by channel index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupScalers {
    groups: Vec<GroupScaler>,
}

impl GroupScalers {
    /// Fit one scaler pair per channel group over a normalization subset of
    /// shape `[samples, time, channels]`.
    ///
    /// All values of all channels in a group are pooled, matching how the
    /// study normalized the six IGBT currents (and each other group) with a
    /// shared scaler rather than per-channel statistics.
    pub fn fit(data: &ArrayView3<'_, f64>) -> Result<Self, ScalerError> {
        let channels = data.len_of(Axis(2));
        if channels != NUM_CHANNELS {
            return Err(ScalerError::ChannelMismatch {
                got: channels,
                expected: NUM_CHANNELS,
            });
        }

        let mut groups = Vec::with_capacity(CHANNEL_GROUPS.len());
        for group in CHANNEL_GROUPS {
            let slab = data.slice(ndarray::s![.., .., group.indices()]);
            if slab.iter().any(|v| !v.is_finite()) {
                return Err(ScalerError::NonFinite { group: group.name });
            }

            let standard = StandardScaler::fit(slab.iter().copied())?;
            let minmax = MinMaxScaler::fit(slab.iter().map(|&v| standard.transform(v)))?;
            tracing::debug!(
                group = group.name,
                mean = standard.mean(),
                std = standard.std(),
                "fitted group scaler"
            );
            groups.push(GroupScaler { group, standard, minmax });
        }
        Ok(Self { groups })
    }

    /// The fitted scaler covering `channel`, if any.
    pub fn for_channel(&self, channel: usize) -> Option<&GroupScaler> {
        self.groups.iter().find(|g| g.group.contains(channel))
    }

    /// Transform one sample of shape `[time, channels]` in place.
    pub fn transform_sample(&self, mut sample: ArrayViewMut2<'_, f64>) {
        for scaler in &self.groups {
            for ch in scaler.group.indices() {
                for v in sample.column_mut(ch) {
                    *v = scaler.transform(*v);
                }
            }
        }
    }

    /// Invert [`Self::transform_sample`] in place.
    pub fn inverse_transform_sample(&self, mut sample: ArrayViewMut2<'_, f64>) {
        for scaler in &self.groups {
            for ch in scaler.group.indices() {
                for v in sample.column_mut(ch) {
                    *v = scaler.inverse_transform(*v);
                }
            }
        }
    }

    /// Transform a whole stack of samples `[samples, time, channels]` in place.
    pub fn transform_stack(&self, mut stack: ArrayViewMut3<'_, f64>) {
        for mut sample in stack.outer_iter_mut() {
            self.transform_sample(sample.view_mut());
        }
    }

    /// Fitted group scalers in table order.
    pub fn groups(&self) -> &[GroupScaler] {
        &self.groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn ramp_stack() -> Array3<f64> {
        // 3 samples x 10 steps x 14 channels with per-channel ramps.
        Array3::from_shape_fn((3, 10, NUM_CHANNELS), |(s, t, c)| {
            (s * 10 + t) as f64 * 0.5 + c as f64 * 100.0
        })
    }

    #[test]
    fn test_standard_scaler_zero_mean_unit_std() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let scaler = StandardScaler::fit(values.iter().copied()).expect("fit");
        assert!((scaler.mean() - 3.0).abs() < 1e-12);

        let transformed: Vec<f64> = values.iter().map(|&v| scaler.transform(v)).collect();
        let mean: f64 = transformed.iter().sum::<f64>() / transformed.len() as f64;
        assert!(mean.abs() < 1e-12);
    }

    #[test]
    fn test_minmax_bounds() {
        let scaler = MinMaxScaler::fit([2.0, 8.0, 5.0]).expect("fit");
        assert_eq!(scaler.transform(2.0), 0.0);
        assert_eq!(scaler.transform(8.0), 1.0);
        assert!((scaler.transform(5.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_empty_fit_rejected() {
        assert!(StandardScaler::fit(std::iter::empty()).is_err());
        assert!(MinMaxScaler::fit(std::iter::empty()).is_err());
    }

    #[test]
    fn test_constant_channel_does_not_blow_up() {
        let scaler = StandardScaler::fit([7.0; 20]).expect("fit");
        let y = scaler.transform(7.0);
        assert!(y.is_finite());
        assert!(y.abs() < 1e-6);
    }

    #[test]
    fn test_group_round_trip() {
        let stack = ramp_stack();
        let scalers = GroupScalers::fit(&stack.view()).expect("fit");

        let mut sample = stack.index_axis(Axis(0), 1).to_owned();
        let original = sample.clone();
        scalers.transform_sample(sample.view_mut());

        // Fitted subset must land inside [0, 1].
        for &v in &sample {
            assert!((-1e-9..=1.0 + 1e-9).contains(&v), "out of range: {v}");
        }

        scalers.inverse_transform_sample(sample.view_mut());
        for (a, b) in sample.iter().zip(original.iter()) {
            assert!((a - b).abs() < 1e-9, "round trip diverged: {a} vs {b}");
        }
    }

    #[test]
    fn test_transform_is_deterministic_across_calls() {
        // Same fitted parameters must apply to later samples (no refitting).
        let stack = ramp_stack();
        let scalers = GroupScalers::fit(&stack.view()).expect("fit");

        let held_out = Array3::from_shape_fn((1, 10, NUM_CHANNELS), |(_, t, c)| {
            t as f64 * 2.0 + c as f64 * 100.0
        });
        let mut a = held_out.index_axis(Axis(0), 0).to_owned();
        let mut b = a.clone();
        scalers.transform_sample(a.view_mut());
        scalers.transform_sample(b.view_mut());
        assert_eq!(a, b);
    }

    #[test]
    fn test_wrong_channel_count_rejected() {
        let bad = Array3::<f64>::zeros((2, 10, 5));
        assert!(matches!(
            GroupScalers::fit(&bad.view()),
            Err(ScalerError::ChannelMismatch { got: 5, .. })
        ));
    }

    #[test]
    fn test_for_channel_lookup() {
        let stack = ramp_stack();
        let scalers = GroupScalers::fit(&stack.view()).expect("fit");
        assert_eq!(scalers.for_channel(0).map(|g| g.group.name), Some("igbt"));
        assert_eq!(scalers.for_channel(8).map(|g| g.group.name), Some("flux"));
        assert_eq!(scalers.for_channel(10).map(|g| g.group.name), Some("cap"));
        assert_eq!(scalers.for_channel(13).map(|g| g.group.name), Some("mod"));
        assert!(scalers.for_channel(14).is_none());
    }
}
