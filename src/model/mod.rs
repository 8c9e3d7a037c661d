//! Conditional variational autoencoder over HVCM waveforms.
//!
//! The model maps a `(channels × time)` waveform plus a subsystem one-hot
//! condition to a latent Gaussian, samples it with the reparameterization
//! trick, and decodes back to a `[0, 1]`-bounded waveform of the original
//! shape.
//!
//! ## Architecture
//!
//! - **Encoder**: 3 × (Conv1d → BatchNorm → MaxPool → ReLU → Dropout),
//!   then flatten → Linear → concat condition → BatchNorm → ReLU → Dropout
//!   → mean / log-variance heads.
//! - **Decoder**: concat latent + condition → Linear × 2 → reshape →
//!   3 × (Upsample → BatchNorm → ConvTranspose1d → activation → Dropout),
//!   final activation sigmoid, final upsample pinned to the exact length
//!   that undoes the encoder's pooling arithmetic.
//! - **Loss**: summed squared error + closed-form KL against N(0, I).
//!
//! All math is plain f64 over flat buffers; gradients are derived by hand
//! and applied with Adam. Every stochastic step (weight init, dropout,
//! latent noise) draws from an explicitly passed `StdRng`.

pub mod checkpoint;
pub mod cvae;
pub mod decoder;
pub mod encoder;
pub mod layers;
pub mod loss;
pub mod training;

pub use checkpoint::{CheckpointError, CheckpointMetadata, StudyCheckpoint};
pub use cvae::{Cvae, CvaeOutput};
pub use decoder::Decoder;
pub use encoder::{encoded_len, Encoder};
pub use loss::{cvae_loss, kl_divergence, sum_squared_error, LossBreakdown};
pub use training::{train, AdamOptimizer, TrainReport};

use ndarray::{Array2, ArrayView2};

/// A batched feature map: `[batch][channel][time]` in one flat row-major
/// buffer. Vectors (e.g. latent codes) are maps with `len == 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    pub batch: usize,
    pub channels: usize,
    pub len: usize,
    pub data: Vec<f64>,
}

impl FeatureMap {
    /// Zero-filled map of the given shape.
    pub fn zeros(batch: usize, channels: usize, len: usize) -> Self {
        Self {
            batch,
            channels,
            len,
            data: vec![0.0; batch * channels * len],
        }
    }

    /// Wrap an existing buffer. The buffer length must match the shape.
    pub fn from_vec(batch: usize, channels: usize, len: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), batch * channels * len);
        Self {
            batch,
            channels,
            len,
            data,
        }
    }

    /// Build a single-sample map from a `[time, channels]` waveform view,
    /// transposing to the model's `[channel][time]` layout.
    pub fn from_sample(sample: &ArrayView2<'_, f64>) -> Self {
        let (time, channels) = sample.dim();
        let mut map = Self::zeros(1, channels, time);
        for t in 0..time {
            for c in 0..channels {
                map.data[c * time + t] = sample[[t, c]];
            }
        }
        map
    }

    /// Build a single-row condition map (shape `[1][dim][1]`).
    pub fn from_condition(condition: &[f64]) -> Self {
        Self::from_vec(1, condition.len(), 1, condition.to_vec())
    }

    /// Extract batch element `b` as a `[time, channels]` array.
    pub fn to_sample(&self, b: usize) -> Array2<f64> {
        let mut out = Array2::zeros((self.len, self.channels));
        for c in 0..self.channels {
            for t in 0..self.len {
                out[[t, c]] = self.at(b, c, t);
            }
        }
        out
    }

    /// Features per batch element.
    pub fn features(&self) -> usize {
        self.channels * self.len
    }

    #[inline]
    pub fn idx(&self, b: usize, c: usize, t: usize) -> usize {
        (b * self.channels + c) * self.len + t
    }

    #[inline]
    pub fn at(&self, b: usize, c: usize, t: usize) -> f64 {
        self.data[self.idx(b, c, t)]
    }

    #[inline]
    pub fn at_mut(&mut self, b: usize, c: usize, t: usize) -> &mut f64 {
        let i = self.idx(b, c, t);
        &mut self.data[i]
    }

    /// One batch element's contiguous slice.
    pub fn sample_slice(&self, b: usize) -> &[f64] {
        let stride = self.channels * self.len;
        &self.data[b * stride..(b + 1) * stride]
    }

    /// Reinterpret `(B, C, L)` as `(B, C·L, 1)`. Zero-copy: the layout is
    /// already row-major per batch element.
    pub fn flatten_channels(mut self) -> Self {
        self.channels *= self.len;
        self.len = 1;
        self
    }

    /// Reinterpret `(B, F, 1)` as `(B, channels, len)` with `F == channels·len`.
    pub fn reshape(mut self, channels: usize, len: usize) -> Self {
        debug_assert_eq!(self.channels * self.len, channels * len);
        self.channels = channels;
        self.len = len;
        self
    }

    /// Elementwise in-place addition of a same-shaped map.
    pub fn add_assign_map(&mut self, other: &Self) {
        debug_assert_eq!(self.data.len(), other.data.len());
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
    }

    /// Concatenate two vector maps (`len == 1`) along the feature axis.
    pub fn concat_features(a: &Self, b: &Self) -> Self {
        debug_assert_eq!(a.batch, b.batch);
        debug_assert_eq!(a.len, 1);
        debug_assert_eq!(b.len, 1);
        let channels = a.channels + b.channels;
        let mut out = Self::zeros(a.batch, channels, 1);
        for i in 0..a.batch {
            let dst = &mut out.data[i * channels..(i + 1) * channels];
            dst[..a.channels].copy_from_slice(a.sample_slice(i));
            dst[a.channels..].copy_from_slice(b.sample_slice(i));
        }
        out
    }

    /// Split a vector map back into two along the feature axis.
    pub fn split_features(&self, first: usize) -> (Self, Self) {
        debug_assert_eq!(self.len, 1);
        debug_assert!(first <= self.channels);
        let second = self.channels - first;
        let mut a = Self::zeros(self.batch, first, 1);
        let mut b = Self::zeros(self.batch, second, 1);
        for i in 0..self.batch {
            let src = self.sample_slice(i);
            a.data[i * first..(i + 1) * first].copy_from_slice(&src[..first]);
            b.data[i * second..(i + 1) * second].copy_from_slice(&src[first..]);
        }
        (a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_from_sample_transposes() {
        let sample = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]; // [time=3, ch=2]
        let map = FeatureMap::from_sample(&sample.view());
        assert_eq!((map.batch, map.channels, map.len), (1, 2, 3));
        assert_eq!(map.at(0, 0, 0), 1.0);
        assert_eq!(map.at(0, 0, 2), 5.0);
        assert_eq!(map.at(0, 1, 1), 4.0);

        let back = map.to_sample(0);
        assert_eq!(back, sample);
    }

    #[test]
    fn test_flatten_reshape_round_trip() {
        let map = FeatureMap::from_vec(2, 3, 4, (0..24).map(f64::from).collect());
        let flat = map.clone().flatten_channels();
        assert_eq!((flat.channels, flat.len), (12, 1));
        let restored = flat.reshape(3, 4);
        assert_eq!(restored, map);
    }

    #[test]
    fn test_concat_split_round_trip() {
        let a = FeatureMap::from_vec(2, 2, 1, vec![1.0, 2.0, 5.0, 6.0]);
        let b = FeatureMap::from_vec(2, 3, 1, vec![3.0, 4.0, 7.0, 8.0, 9.0, 10.0]);
        let joined = FeatureMap::concat_features(&a, &b);
        assert_eq!(joined.channels, 5);
        assert_eq!(joined.sample_slice(1), &[5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);

        let (a2, b2) = joined.split_features(2);
        assert_eq!(a2, a);
        assert_eq!(b2, b);
    }
}
