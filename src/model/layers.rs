//! Neural network layers: plain f64 forward passes and hand-derived
//! backward passes over flat buffers.
//!
//! Layout conventions:
//!
//! - `Conv1d` weights: `[out][in][kernel]`, flat index `(o·in + i)·k + j`
//! - `ConvTranspose1d` weights: `[in][out][kernel]`, flat index `(i·out + o)·k + j`
//! - `Linear` weights: `[out][in]`, flat index `o·in + i`
//!
//! Gradient buffers live next to their weights and are excluded from
//! serialization; `zero_grads` re-sizes them, so a freshly deserialized
//! layer is trainable again after one call.
//!
//! Stride is fixed at 1 for both conv variants (the only stride the model
//! uses); pooling and upsampling own the resolution changes.

use rand::rngs::StdRng;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::FeatureMap;

/// Output length of a stride-1 convolution.
pub fn conv1d_out_len(len: usize, kernel: usize, padding: usize) -> usize {
    len + 2 * padding - kernel + 1
}

/// Output length of a max pool.
pub fn pool_out_len(len: usize, kernel: usize, stride: usize) -> usize {
    (len - kernel) / stride + 1
}

/// Output length of a stride-1 transposed convolution.
pub fn conv_transpose1d_out_len(len: usize, kernel: usize, padding: usize) -> usize {
    len - 1 + kernel - 2 * padding
}

/// Xavier-uniform draw: `U(-std, std)` with `std = sqrt(2 / (fan_in + fan_out))`.
fn xavier(count: usize, fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Vec<f64> {
    let std = (2.0 / (fan_in + fan_out) as f64).sqrt();
    (0..count).map(|_| rng.gen::<f64>() * 2.0 * std - std).collect()
}

// ============================================================================
// Conv1d
// ============================================================================

/// 1D convolution, stride 1, zero padding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv1d {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub padding: usize,
    w: Vec<f64>,
    b: Vec<f64>,
    #[serde(skip)]
    dw: Vec<f64>,
    #[serde(skip)]
    db: Vec<f64>,
}

impl Conv1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        padding: usize,
        rng: &mut StdRng,
    ) -> Self {
        let fan_in = in_channels * kernel;
        let fan_out = out_channels * kernel;
        Self {
            in_channels,
            out_channels,
            kernel,
            padding,
            w: xavier(out_channels * in_channels * kernel, fan_in, fan_out, rng),
            b: vec![0.0; out_channels],
            dw: Vec::new(),
            db: Vec::new(),
        }
    }

    pub fn out_len(&self, len: usize) -> usize {
        conv1d_out_len(len, self.kernel, self.padding)
    }

    pub fn forward(&self, x: &FeatureMap) -> FeatureMap {
        debug_assert_eq!(x.channels, self.in_channels);
        let l_in = x.len;
        let l_out = self.out_len(l_in);
        let k = self.kernel;
        let pad = self.padding as isize;

        let mut out = FeatureMap::zeros(x.batch, self.out_channels, l_out);
        out.data
            .par_chunks_mut(l_out)
            .enumerate()
            .for_each(|(row, chunk)| {
                let b = row / self.out_channels;
                let o = row % self.out_channels;
                for (t, slot) in chunk.iter_mut().enumerate() {
                    let mut sum = self.b[o];
                    for i in 0..self.in_channels {
                        let x_row = &x.data[(b * self.in_channels + i) * l_in..][..l_in];
                        let w_row = &self.w[(o * self.in_channels + i) * k..][..k];
                        for (j, &wj) in w_row.iter().enumerate() {
                            let ti = t as isize + j as isize - pad;
                            if (0..l_in as isize).contains(&ti) {
                                sum += wj * x_row[ti as usize];
                            }
                        }
                    }
                    *slot = sum;
                }
            });
        out
    }

    /// Accumulate weight gradients and return the input gradient.
    pub fn backward(&mut self, x: &FeatureMap, gout: &FeatureMap) -> FeatureMap {
        debug_assert_eq!(self.dw.len(), self.w.len());
        let l_in = x.len;
        let l_out = gout.len;
        let k = self.kernel;
        let pad = self.padding as isize;

        let mut dx = FeatureMap::zeros(x.batch, self.in_channels, l_in);
        for b in 0..x.batch {
            for o in 0..self.out_channels {
                for t in 0..l_out {
                    let g = gout.at(b, o, t);
                    if g == 0.0 {
                        continue;
                    }
                    self.db[o] += g;
                    for i in 0..self.in_channels {
                        for j in 0..k {
                            let ti = t as isize + j as isize - pad;
                            if (0..l_in as isize).contains(&ti) {
                                let w_idx = (o * self.in_channels + i) * k + j;
                                let x_idx = x.idx(b, i, ti as usize);
                                self.dw[w_idx] += g * x.data[x_idx];
                                dx.data[x_idx] += g * self.w[w_idx];
                            }
                        }
                    }
                }
            }
        }
        dx
    }

    pub fn zero_grads(&mut self) {
        self.dw.clear();
        self.dw.resize(self.w.len(), 0.0);
        self.db.clear();
        self.db.resize(self.b.len(), 0.0);
    }

    pub fn params(&self) -> Vec<&Vec<f64>> {
        vec![&self.w, &self.b]
    }

    pub fn params_mut(&mut self) -> Vec<&mut Vec<f64>> {
        vec![&mut self.w, &mut self.b]
    }

    pub fn grads(&self) -> Vec<&Vec<f64>> {
        vec![&self.dw, &self.db]
    }
}

// ============================================================================
// ConvTranspose1d
// ============================================================================

/// 1D transposed convolution, stride 1, zero padding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvTranspose1d {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub padding: usize,
    w: Vec<f64>,
    b: Vec<f64>,
    #[serde(skip)]
    dw: Vec<f64>,
    #[serde(skip)]
    db: Vec<f64>,
}

impl ConvTranspose1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        padding: usize,
        rng: &mut StdRng,
    ) -> Self {
        let fan_in = in_channels * kernel;
        let fan_out = out_channels * kernel;
        Self {
            in_channels,
            out_channels,
            kernel,
            padding,
            w: xavier(in_channels * out_channels * kernel, fan_in, fan_out, rng),
            b: vec![0.0; out_channels],
            dw: Vec::new(),
            db: Vec::new(),
        }
    }

    pub fn out_len(&self, len: usize) -> usize {
        conv_transpose1d_out_len(len, self.kernel, self.padding)
    }

    pub fn forward(&self, x: &FeatureMap) -> FeatureMap {
        debug_assert_eq!(x.channels, self.in_channels);
        let l_in = x.len;
        let l_out = self.out_len(l_in);
        let k = self.kernel;
        let pad = self.padding as isize;

        let mut out = FeatureMap::zeros(x.batch, self.out_channels, l_out);
        out.data
            .par_chunks_mut(l_out)
            .enumerate()
            .for_each(|(row, chunk)| {
                let b = row / self.out_channels;
                let o = row % self.out_channels;
                for (t, slot) in chunk.iter_mut().enumerate() {
                    let mut sum = self.b[o];
                    for i in 0..self.in_channels {
                        let x_row = &x.data[(b * self.in_channels + i) * l_in..][..l_in];
                        let w_row = &self.w[(i * self.out_channels + o) * k..][..k];
                        for (j, &wj) in w_row.iter().enumerate() {
                            // Output position t receives x[t'] where t = t' + j - pad.
                            let ti = t as isize - j as isize + pad;
                            if (0..l_in as isize).contains(&ti) {
                                sum += wj * x_row[ti as usize];
                            }
                        }
                    }
                    *slot = sum;
                }
            });
        out
    }

    pub fn backward(&mut self, x: &FeatureMap, gout: &FeatureMap) -> FeatureMap {
        debug_assert_eq!(self.dw.len(), self.w.len());
        let l_in = x.len;
        let l_out = gout.len;
        let k = self.kernel;
        let pad = self.padding as isize;

        let mut dx = FeatureMap::zeros(x.batch, self.in_channels, l_in);
        for b in 0..x.batch {
            for o in 0..self.out_channels {
                for t in 0..l_out {
                    let g = gout.at(b, o, t);
                    if g == 0.0 {
                        continue;
                    }
                    self.db[o] += g;
                    for i in 0..self.in_channels {
                        for j in 0..k {
                            let ti = t as isize - j as isize + pad;
                            if (0..l_in as isize).contains(&ti) {
                                let w_idx = (i * self.out_channels + o) * k + j;
                                let x_idx = x.idx(b, i, ti as usize);
                                self.dw[w_idx] += g * x.data[x_idx];
                                dx.data[x_idx] += g * self.w[w_idx];
                            }
                        }
                    }
                }
            }
        }
        dx
    }

    pub fn zero_grads(&mut self) {
        self.dw.clear();
        self.dw.resize(self.w.len(), 0.0);
        self.db.clear();
        self.db.resize(self.b.len(), 0.0);
    }

    pub fn params(&self) -> Vec<&Vec<f64>> {
        vec![&self.w, &self.b]
    }

    pub fn params_mut(&mut self) -> Vec<&mut Vec<f64>> {
        vec![&mut self.w, &mut self.b]
    }

    pub fn grads(&self) -> Vec<&Vec<f64>> {
        vec![&self.dw, &self.db]
    }
}

// ============================================================================
// Linear
// ============================================================================

/// Fully connected layer over vector maps (`len == 1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    pub in_features: usize,
    pub out_features: usize,
    w: Vec<f64>,
    b: Vec<f64>,
    #[serde(skip)]
    dw: Vec<f64>,
    #[serde(skip)]
    db: Vec<f64>,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        Self {
            in_features,
            out_features,
            w: xavier(out_features * in_features, in_features, out_features, rng),
            b: vec![0.0; out_features],
            dw: Vec::new(),
            db: Vec::new(),
        }
    }

    pub fn forward(&self, x: &FeatureMap) -> FeatureMap {
        debug_assert_eq!(x.features(), self.in_features);
        let n_in = self.in_features;
        let n_out = self.out_features;

        let mut out = FeatureMap::zeros(x.batch, n_out, 1);
        out.data
            .par_chunks_mut(n_out)
            .enumerate()
            .for_each(|(b, chunk)| {
                let x_row = x.sample_slice(b);
                for (o, slot) in chunk.iter_mut().enumerate() {
                    let w_row = &self.w[o * n_in..][..n_in];
                    let mut sum = self.b[o];
                    for (wv, xv) in w_row.iter().zip(x_row.iter()) {
                        sum += wv * xv;
                    }
                    *slot = sum;
                }
            });
        out
    }

    pub fn backward(&mut self, x: &FeatureMap, gout: &FeatureMap) -> FeatureMap {
        debug_assert_eq!(self.dw.len(), self.w.len());
        let n_in = self.in_features;
        let n_out = self.out_features;

        let mut dx = FeatureMap::zeros(x.batch, x.channels, x.len);
        for b in 0..x.batch {
            let x_row = x.sample_slice(b);
            let stride = x.channels * x.len;
            let dx_row = &mut dx.data[b * stride..(b + 1) * stride];
            for o in 0..n_out {
                let g = gout.at(b, o, 0);
                if g == 0.0 {
                    continue;
                }
                self.db[o] += g;
                let w_row = &self.w[o * n_in..][..n_in];
                let dw_row = &mut self.dw[o * n_in..][..n_in];
                for i in 0..n_in {
                    dw_row[i] += g * x_row[i];
                    dx_row[i] += g * w_row[i];
                }
            }
        }
        dx
    }

    pub fn zero_grads(&mut self) {
        self.dw.clear();
        self.dw.resize(self.w.len(), 0.0);
        self.db.clear();
        self.db.resize(self.b.len(), 0.0);
    }

    pub fn params(&self) -> Vec<&Vec<f64>> {
        vec![&self.w, &self.b]
    }

    pub fn params_mut(&mut self) -> Vec<&mut Vec<f64>> {
        vec![&mut self.w, &mut self.b]
    }

    pub fn grads(&self) -> Vec<&Vec<f64>> {
        vec![&self.dw, &self.db]
    }
}

// ============================================================================
// BatchNorm1d
// ============================================================================

/// Batch normalization over the channel axis of `(B, C, L)` maps.
///
/// Vector inputs `(B, F)` normalize per feature by passing `L == 1`.
/// Training mode normalizes with biased batch statistics and maintains
/// running estimates (momentum 0.1, unbiased variance); evaluation mode
/// normalizes with the running estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNorm1d {
    pub num_features: usize,
    pub eps: f64,
    pub momentum: f64,
    gamma: Vec<f64>,
    beta: Vec<f64>,
    running_mean: Vec<f64>,
    running_var: Vec<f64>,
    #[serde(skip)]
    dgamma: Vec<f64>,
    #[serde(skip)]
    dbeta: Vec<f64>,
}

/// Values cached by a training-mode forward pass, needed for backprop.
#[derive(Debug, Clone)]
pub struct BatchNormCache {
    xhat: FeatureMap,
    inv_std: Vec<f64>,
}

impl BatchNorm1d {
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            eps: 1e-5,
            momentum: 0.1,
            gamma: vec![1.0; num_features],
            beta: vec![0.0; num_features],
            running_mean: vec![0.0; num_features],
            running_var: vec![1.0; num_features],
            dgamma: Vec::new(),
            dbeta: Vec::new(),
        }
    }

    pub fn forward_eval(&self, x: &FeatureMap) -> FeatureMap {
        debug_assert_eq!(x.channels, self.num_features);
        let mut out = FeatureMap::zeros(x.batch, x.channels, x.len);
        for c in 0..self.num_features {
            let inv_std = 1.0 / (self.running_var[c] + self.eps).sqrt();
            for b in 0..x.batch {
                for t in 0..x.len {
                    let xhat = (x.at(b, c, t) - self.running_mean[c]) * inv_std;
                    *out.at_mut(b, c, t) = self.gamma[c] * xhat + self.beta[c];
                }
            }
        }
        out
    }

    pub fn forward_train(&mut self, x: &FeatureMap) -> (FeatureMap, BatchNormCache) {
        debug_assert_eq!(x.channels, self.num_features);
        let m = (x.batch * x.len) as f64;
        let mut out = FeatureMap::zeros(x.batch, x.channels, x.len);
        let mut xhat = FeatureMap::zeros(x.batch, x.channels, x.len);
        let mut inv_stds = vec![0.0; self.num_features];

        for c in 0..self.num_features {
            let mut mean = 0.0;
            for b in 0..x.batch {
                for t in 0..x.len {
                    mean += x.at(b, c, t);
                }
            }
            mean /= m;

            let mut var = 0.0;
            for b in 0..x.batch {
                for t in 0..x.len {
                    let d = x.at(b, c, t) - mean;
                    var += d * d;
                }
            }
            var /= m;

            let inv_std = 1.0 / (var + self.eps).sqrt();
            inv_stds[c] = inv_std;
            for b in 0..x.batch {
                for t in 0..x.len {
                    let h = (x.at(b, c, t) - mean) * inv_std;
                    *xhat.at_mut(b, c, t) = h;
                    *out.at_mut(b, c, t) = self.gamma[c] * h + self.beta[c];
                }
            }

            // Running stats: unbiased variance when the batch allows it.
            let unbiased = if m > 1.0 { var * m / (m - 1.0) } else { var };
            self.running_mean[c] = (1.0 - self.momentum) * self.running_mean[c] + self.momentum * mean;
            self.running_var[c] = (1.0 - self.momentum) * self.running_var[c] + self.momentum * unbiased;
        }

        (out, BatchNormCache { xhat, inv_std: inv_stds })
    }

    pub fn backward(&mut self, cache: &BatchNormCache, gout: &FeatureMap) -> FeatureMap {
        debug_assert_eq!(self.dgamma.len(), self.gamma.len());
        let x = &cache.xhat;
        let m = (x.batch * x.len) as f64;
        let mut dx = FeatureMap::zeros(x.batch, x.channels, x.len);

        for c in 0..self.num_features {
            let mut sum_g = 0.0;
            let mut sum_gx = 0.0;
            for b in 0..x.batch {
                for t in 0..x.len {
                    let g = gout.at(b, c, t);
                    sum_g += g;
                    sum_gx += g * x.at(b, c, t);
                }
            }
            self.dgamma[c] += sum_gx;
            self.dbeta[c] += sum_g;

            let scale = self.gamma[c] * cache.inv_std[c];
            for b in 0..x.batch {
                for t in 0..x.len {
                    let g = gout.at(b, c, t);
                    let h = x.at(b, c, t);
                    *dx.at_mut(b, c, t) = scale * (g - sum_g / m - h * sum_gx / m);
                }
            }
        }
        dx
    }

    pub fn zero_grads(&mut self) {
        self.dgamma.clear();
        self.dgamma.resize(self.gamma.len(), 0.0);
        self.dbeta.clear();
        self.dbeta.resize(self.beta.len(), 0.0);
    }

    pub fn params(&self) -> Vec<&Vec<f64>> {
        vec![&self.gamma, &self.beta]
    }

    pub fn params_mut(&mut self) -> Vec<&mut Vec<f64>> {
        vec![&mut self.gamma, &mut self.beta]
    }

    pub fn grads(&self) -> Vec<&Vec<f64>> {
        vec![&self.dgamma, &self.dbeta]
    }
}

// ============================================================================
// MaxPool1d
// ============================================================================

/// Max pooling along the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxPool1d {
    pub kernel: usize,
    pub stride: usize,
}

impl MaxPool1d {
    pub fn new(kernel: usize, stride: usize) -> Self {
        Self { kernel, stride }
    }

    pub fn out_len(&self, len: usize) -> usize {
        pool_out_len(len, self.kernel, self.stride)
    }

    /// Returns the pooled map and the flat input index of each selected
    /// maximum (parallel to the output buffer).
    pub fn forward(&self, x: &FeatureMap) -> (FeatureMap, Vec<usize>) {
        let l_out = self.out_len(x.len);
        let mut out = FeatureMap::zeros(x.batch, x.channels, l_out);
        let mut argmax = vec![0usize; out.data.len()];

        let mut cursor = 0;
        for b in 0..x.batch {
            for c in 0..x.channels {
                for t in 0..l_out {
                    let start = t * self.stride;
                    let mut best_idx = x.idx(b, c, start);
                    let mut best = x.data[best_idx];
                    for offset in 1..self.kernel {
                        let idx = x.idx(b, c, start + offset);
                        if x.data[idx] > best {
                            best = x.data[idx];
                            best_idx = idx;
                        }
                    }
                    out.data[cursor] = best;
                    argmax[cursor] = best_idx;
                    cursor += 1;
                }
            }
        }
        (out, argmax)
    }

    /// Scatter output gradients back to the selected maxima.
    pub fn backward(
        &self,
        input_shape: (usize, usize, usize),
        argmax: &[usize],
        gout: &FeatureMap,
    ) -> FeatureMap {
        let (batch, channels, len) = input_shape;
        let mut dx = FeatureMap::zeros(batch, channels, len);
        for (slot, &src) in argmax.iter().enumerate() {
            dx.data[src] += gout.data[slot];
        }
        dx
    }
}

// ============================================================================
// Upsample
// ============================================================================

/// Nearest-neighbor upsampling along the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Upsample {
    /// Multiply the length by an integer factor.
    Scale(usize),
    /// Resize to an exact output length (used to undo pooling round-off).
    Exact(usize),
}

impl Upsample {
    pub fn out_len(&self, len: usize) -> usize {
        match *self {
            Self::Scale(factor) => len * factor,
            Self::Exact(target) => target,
        }
    }

    pub fn forward(&self, x: &FeatureMap) -> FeatureMap {
        let l_in = x.len;
        let l_out = self.out_len(l_in);
        let mut out = FeatureMap::zeros(x.batch, x.channels, l_out);
        for b in 0..x.batch {
            for c in 0..x.channels {
                for t in 0..l_out {
                    let src = t * l_in / l_out;
                    *out.at_mut(b, c, t) = x.at(b, c, src);
                }
            }
        }
        out
    }

    pub fn backward(&self, input_len: usize, gout: &FeatureMap) -> FeatureMap {
        let l_out = gout.len;
        let mut dx = FeatureMap::zeros(gout.batch, gout.channels, input_len);
        for b in 0..gout.batch {
            for c in 0..gout.channels {
                for t in 0..l_out {
                    let src = t * input_len / l_out;
                    *dx.at_mut(b, c, src) += gout.at(b, c, t);
                }
            }
        }
        dx
    }
}

// ============================================================================
// Dropout
// ============================================================================

/// Inverted dropout: active elements are scaled by `1 / (1 - p)` during
/// training so evaluation mode is the identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dropout {
    pub p: f64,
}

impl Dropout {
    pub fn new(p: f64) -> Self {
        debug_assert!((0.0..1.0).contains(&p));
        Self { p }
    }

    /// Returns the masked map and the mask (0 or the keep-scale) for backprop.
    pub fn forward_train(&self, x: &FeatureMap, rng: &mut StdRng) -> (FeatureMap, Vec<f64>) {
        if self.p == 0.0 {
            return (x.clone(), vec![1.0; x.data.len()]);
        }
        let keep_scale = 1.0 / (1.0 - self.p);
        let mask: Vec<f64> = (0..x.data.len())
            .map(|_| if rng.gen::<f64>() < self.p { 0.0 } else { keep_scale })
            .collect();
        let mut out = x.clone();
        for (v, m) in out.data.iter_mut().zip(mask.iter()) {
            *v *= m;
        }
        (out, mask)
    }

    pub fn backward(mask: &[f64], gout: &FeatureMap) -> FeatureMap {
        let mut dx = gout.clone();
        for (v, m) in dx.data.iter_mut().zip(mask.iter()) {
            *v *= m;
        }
        dx
    }
}

// ============================================================================
// Activations
// ============================================================================

pub fn relu(x: &FeatureMap) -> FeatureMap {
    let mut out = x.clone();
    for v in &mut out.data {
        *v = v.max(0.0);
    }
    out
}

/// ReLU backward via the forward output (nonzero iff the input was positive).
pub fn relu_backward(y: &FeatureMap, gout: &FeatureMap) -> FeatureMap {
    let mut dx = gout.clone();
    for (v, &yv) in dx.data.iter_mut().zip(y.data.iter()) {
        if yv <= 0.0 {
            *v = 0.0;
        }
    }
    dx
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn sigmoid_map(x: &FeatureMap) -> FeatureMap {
    let mut out = x.clone();
    for v in &mut out.data {
        *v = sigmoid(*v);
    }
    out
}

/// Sigmoid backward via the forward output: `dy/dx = y (1 - y)`.
pub fn sigmoid_backward(y: &FeatureMap, gout: &FeatureMap) -> FeatureMap {
    let mut dx = gout.clone();
    for (v, &yv) in dx.data.iter_mut().zip(y.data.iter()) {
        *v *= yv * (1.0 - yv);
    }
    dx
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    /// Central-difference gradient check: perturb each weight, compare the
    /// loss delta against the analytic gradient. Loss is 0.5 * sum(y^2), so
    /// the output gradient is y itself.
    fn numeric_grad_matches<F>(params: &mut [f64], grads: &[f64], mut loss: F)
    where
        F: FnMut(&[f64]) -> f64,
    {
        let h = 1e-5;
        for i in 0..params.len() {
            let saved = params[i];
            params[i] = saved + h;
            let up = loss(params);
            params[i] = saved - h;
            let down = loss(params);
            params[i] = saved;
            let numeric = (up - down) / (2.0 * h);
            assert!(
                (numeric - grads[i]).abs() < 1e-5 * (1.0 + numeric.abs()),
                "grad mismatch at {i}: numeric {numeric} vs analytic {}",
                grads[i]
            );
        }
    }

    #[test]
    fn test_conv1d_shape_and_identity_kernel() {
        let mut rng = rng();
        let mut conv = Conv1d::new(1, 1, 3, 1, &mut rng);
        assert_eq!(conv.out_len(10), 10); // 10 + 2 - 3 + 1
        // Set an identity kernel: center tap 1.
        conv.w = vec![0.0, 1.0, 0.0];
        conv.b = vec![0.0];
        let x = FeatureMap::from_vec(1, 1, 4, vec![1.0, 2.0, 3.0, 4.0]);
        let y = conv.forward(&x);
        assert_eq!(y.data, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_conv1d_gradcheck() {
        let mut rng = rng();
        let mut conv = Conv1d::new(2, 3, 3, 1, &mut rng);
        let x = FeatureMap::from_vec(2, 2, 5, (0..20).map(|i| f64::from(i) * 0.1).collect());

        conv.zero_grads();
        let y = conv.forward(&x);
        let dx = conv.backward(&x, &y);

        // Analytic weight gradients against numeric.
        let dw = conv.dw.clone();
        let x2 = x.clone();
        let mut probe = conv.clone();
        numeric_grad_matches(&mut conv.w.clone(), &dw, |w| {
            probe.w.copy_from_slice(w);
            let y = probe.forward(&x2);
            0.5 * y.data.iter().map(|v| v * v).sum::<f64>()
        });

        // Analytic input gradients against numeric.
        let mut x_mut = x.data.clone();
        let conv2 = conv.clone();
        numeric_grad_matches(&mut x_mut, &dx.data, |xs| {
            let xm = FeatureMap::from_vec(2, 2, 5, xs.to_vec());
            let y = conv2.forward(&xm);
            0.5 * y.data.iter().map(|v| v * v).sum::<f64>()
        });
    }

    #[test]
    fn test_conv_transpose_inverts_length() {
        let mut rng = rng();
        let tconv = ConvTranspose1d::new(2, 2, 12, 6, &mut rng);
        assert_eq!(tconv.out_len(100), 99);

        let x = FeatureMap::zeros(1, 2, 100);
        let y = tconv.forward(&x);
        assert_eq!((y.batch, y.channels, y.len), (1, 2, 99));
    }

    #[test]
    fn test_conv_transpose_gradcheck() {
        let mut rng = rng();
        let mut tconv = ConvTranspose1d::new(2, 2, 3, 1, &mut rng);
        let x = FeatureMap::from_vec(1, 2, 6, (0..12).map(|i| f64::from(i) * 0.2).collect());

        tconv.zero_grads();
        let y = tconv.forward(&x);
        let dx = tconv.backward(&x, &y);

        let dw = tconv.dw.clone();
        let x2 = x.clone();
        let mut probe = tconv.clone();
        numeric_grad_matches(&mut tconv.w.clone(), &dw, |w| {
            probe.w.copy_from_slice(w);
            let y = probe.forward(&x2);
            0.5 * y.data.iter().map(|v| v * v).sum::<f64>()
        });

        let mut x_mut = x.data.clone();
        let tconv2 = tconv.clone();
        numeric_grad_matches(&mut x_mut, &dx.data, |xs| {
            let xm = FeatureMap::from_vec(1, 2, 6, xs.to_vec());
            let y = tconv2.forward(&xm);
            0.5 * y.data.iter().map(|v| v * v).sum::<f64>()
        });
    }

    #[test]
    fn test_linear_gradcheck() {
        let mut rng = rng();
        let mut fc = Linear::new(4, 3, &mut rng);
        let x = FeatureMap::from_vec(2, 4, 1, (0..8).map(|i| f64::from(i) * 0.3).collect());

        fc.zero_grads();
        let y = fc.forward(&x);
        let dx = fc.backward(&x, &y);

        let dw = fc.dw.clone();
        let x2 = x.clone();
        let mut probe = fc.clone();
        numeric_grad_matches(&mut fc.w.clone(), &dw, |w| {
            probe.w.copy_from_slice(w);
            let y = probe.forward(&x2);
            0.5 * y.data.iter().map(|v| v * v).sum::<f64>()
        });

        let mut x_mut = x.data.clone();
        let fc2 = fc.clone();
        numeric_grad_matches(&mut x_mut, &dx.data, |xs| {
            let xm = FeatureMap::from_vec(2, 4, 1, xs.to_vec());
            let y = fc2.forward(&xm);
            0.5 * y.data.iter().map(|v| v * v).sum::<f64>()
        });
    }

    #[test]
    fn test_batchnorm_train_normalizes() {
        let mut bn = BatchNorm1d::new(2);
        let x = FeatureMap::from_vec(2, 2, 3, vec![
            1.0, 2.0, 3.0, 10.0, 20.0, 30.0,
            4.0, 5.0, 6.0, 40.0, 50.0, 60.0,
        ]);
        let (y, _) = bn.forward_train(&x);

        // Per channel, the normalized output has ~zero mean and ~unit std.
        for c in 0..2 {
            let mut mean = 0.0;
            let mut var = 0.0;
            for b in 0..2 {
                for t in 0..3 {
                    mean += y.at(b, c, t);
                }
            }
            mean /= 6.0;
            for b in 0..2 {
                for t in 0..3 {
                    let d = y.at(b, c, t) - mean;
                    var += d * d;
                }
            }
            var /= 6.0;
            assert!(mean.abs() < 1e-9, "channel {c} mean {mean}");
            assert!((var - 1.0).abs() < 1e-3, "channel {c} var {var}");
        }
    }

    #[test]
    fn test_batchnorm_eval_uses_running_stats() {
        let bn = BatchNorm1d::new(1);
        // Fresh running stats are mean 0, var 1, so eval is the identity.
        let x = FeatureMap::from_vec(1, 1, 3, vec![0.5, -0.25, 2.0]);
        let y = bn.forward_eval(&x);
        for (a, b) in x.data.iter().zip(y.data.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_batchnorm_gradcheck_gamma_beta() {
        let mut bn = BatchNorm1d::new(2);
        bn.zero_grads();
        let x = FeatureMap::from_vec(2, 2, 2, vec![
            0.3, -0.6, 1.2, 0.9,
            -1.1, 0.4, 0.0, 2.2,
        ]);
        let (y, cache) = bn.forward_train(&x);
        bn.backward(&cache, &y);

        let dgamma = bn.dgamma.clone();
        let x2 = x.clone();
        let mut probe = bn.clone();
        numeric_grad_matches(&mut bn.gamma.clone(), &dgamma, |g| {
            probe.gamma.copy_from_slice(g);
            // Re-run training forward; running-stat drift does not affect
            // the batch-statistics output.
            let (y, _) = probe.forward_train(&x2);
            0.5 * y.data.iter().map(|v| v * v).sum::<f64>()
        });
    }

    #[test]
    fn test_maxpool_halves_and_routes_gradient() {
        let pool = MaxPool1d::new(2, 2);
        let x = FeatureMap::from_vec(1, 1, 6, vec![1.0, 5.0, 2.0, 2.0, 9.0, 0.0]);
        let (y, argmax) = pool.forward(&x);
        assert_eq!(y.len, 3);
        assert_eq!(y.data, vec![5.0, 2.0, 9.0]);

        let gout = FeatureMap::from_vec(1, 1, 3, vec![1.0, 1.0, 1.0]);
        let dx = pool.backward((1, 1, 6), &argmax, &gout);
        assert_eq!(dx.data, vec![0.0, 1.0, 1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_upsample_scale_and_exact() {
        let x = FeatureMap::from_vec(1, 1, 3, vec![1.0, 2.0, 3.0]);
        let y = Upsample::Scale(2).forward(&x);
        assert_eq!(y.data, vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);

        let y = Upsample::Exact(7).forward(&x);
        assert_eq!(y.len, 7);
        assert_eq!(y.data[0], 1.0);
        assert_eq!(y.data[6], 3.0);

        // Backward accumulates each output slot onto its source.
        let gout = FeatureMap::from_vec(1, 1, 6, vec![1.0; 6]);
        let dx = Upsample::Scale(2).backward(3, &gout);
        assert_eq!(dx.data, vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_dropout_eval_identity_train_scales() {
        let mut rng = rng();
        let drop = Dropout::new(0.5);
        let x = FeatureMap::from_vec(1, 1, 1000, vec![1.0; 1000]);
        let (y, mask) = drop.forward_train(&x, &mut rng);

        let kept = mask.iter().filter(|&&m| m > 0.0).count();
        // Roughly half survive, each scaled by 2.
        assert!((350..=650).contains(&kept), "kept {kept}");
        for (&v, &m) in y.data.iter().zip(mask.iter()) {
            assert!(v == 0.0 || (v - 2.0).abs() < 1e-12);
            assert!(m == 0.0 || (m - 2.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_relu_and_sigmoid_backward() {
        let x = FeatureMap::from_vec(1, 1, 4, vec![-1.0, 0.0, 0.5, 2.0]);
        let y = relu(&x);
        assert_eq!(y.data, vec![0.0, 0.0, 0.5, 2.0]);
        let gout = FeatureMap::from_vec(1, 1, 4, vec![1.0; 4]);
        let dx = relu_backward(&y, &gout);
        assert_eq!(dx.data, vec![0.0, 0.0, 1.0, 1.0]);

        let s = sigmoid_map(&x);
        assert!((s.data[1] - 0.5).abs() < 1e-12);
        let ds = sigmoid_backward(&s, &gout);
        assert!((ds.data[1] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_zero_grads_restores_buffers_after_serde() {
        let mut rng = rng();
        let conv = Conv1d::new(2, 2, 3, 1, &mut rng);
        let json = serde_json::to_string(&conv).expect("serialize");
        let mut restored: Conv1d = serde_json::from_str(&json).expect("deserialize");
        assert!(restored.dw.is_empty());
        restored.zero_grads();
        assert_eq!(restored.dw.len(), restored.w.len());
        assert_eq!(restored.params()[0], conv.params()[0]);
    }
}
