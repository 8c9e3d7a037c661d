//! Mini-batch training: manual backprop + Adam with gradient clipping.
//!
//! Parameters live in per-layer buffers; each step flattens them (and the
//! matching gradients) into contiguous vectors for the optimizer, then
//! writes the updated values back. The flat layout is fixed by the order
//! `Cvae::params` yields tensors, which the Adam moment vectors share.

use ndarray::ArrayView3;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, info};

use super::cvae::Cvae;
use super::loss::{cvae_loss, kl_grads, reconstruction_grad, LossBreakdown};
use super::FeatureMap;
use crate::config::TrainingConfig;
use crate::types::NUM_SUBSYSTEMS;

/// Max gradient norm for global gradient clipping.
pub const MAX_GRAD_NORM: f64 = 5.0;

/// Adam optimizer over a flattened parameter layout.
#[derive(Debug, Clone)]
pub struct AdamOptimizer {
    /// Learning rate.
    pub lr: f64,
    /// First moment decay.
    pub beta1: f64,
    /// Second moment decay.
    pub beta2: f64,
    /// Numerical stability epsilon.
    pub eps: f64,
    /// Total steps taken.
    pub steps: u64,
    /// First moment estimates, same layout as the flattened weights.
    m: Vec<f64>,
    /// Second moment estimates, same layout as the flattened weights.
    v: Vec<f64>,
}

impl AdamOptimizer {
    pub fn new(num_params: usize, lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            steps: 0,
            m: vec![0.0; num_params],
            v: vec![0.0; num_params],
        }
    }

    /// Apply one Adam update to the flattened weights.
    pub fn apply(&mut self, weights_flat: &mut [f64], grads_flat: &[f64]) {
        debug_assert_eq!(weights_flat.len(), self.m.len());
        debug_assert_eq!(grads_flat.len(), self.m.len());
        self.steps += 1;
        let t = self.steps as f64;

        // Bias-corrected LR
        let lr_t = self.lr * (1.0 - self.beta2.powf(t)).sqrt() / (1.0 - self.beta1.powf(t));

        for i in 0..weights_flat.len() {
            let g = grads_flat[i];
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * g;
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * g * g;
            weights_flat[i] -= lr_t * self.m[i] / (self.v[i].sqrt() + self.eps);
        }
    }
}

/// Concatenate tensors into one flat vector.
fn flatten(tensors: &[&Vec<f64>]) -> Vec<f64> {
    let total: usize = tensors.iter().map(|t| t.len()).sum();
    let mut flat = Vec::with_capacity(total);
    for t in tensors {
        flat.extend_from_slice(t);
    }
    flat
}

/// Write a flat vector back into per-layer tensors.
fn write_back(flat: &[f64], tensors: Vec<&mut Vec<f64>>) {
    let mut offset = 0;
    for t in tensors {
        let len = t.len();
        t.copy_from_slice(&flat[offset..offset + len]);
        offset += len;
    }
    debug_assert_eq!(offset, flat.len());
}

/// Build a `(B, channels, time)` batch from `[n, time, channels]` stack rows.
pub fn batch_from_stack(stack: &ArrayView3<'_, f64>, indices: &[usize]) -> FeatureMap {
    let (_, time, channels) = stack.dim();
    let mut map = FeatureMap::zeros(indices.len(), channels, time);
    for (b, &sample) in indices.iter().enumerate() {
        for c in 0..channels {
            for t in 0..time {
                *map.at_mut(b, c, t) = stack[[sample, t, c]];
            }
        }
    }
    map
}

/// Build a `(B, condition_dim)` batch of one-hot condition vectors.
pub fn conditions_batch(conditions: &[[f64; NUM_SUBSYSTEMS]], indices: &[usize]) -> FeatureMap {
    let mut map = FeatureMap::zeros(indices.len(), NUM_SUBSYSTEMS, 1);
    for (b, &sample) in indices.iter().enumerate() {
        let dst = b * NUM_SUBSYSTEMS;
        map.data[dst..dst + NUM_SUBSYSTEMS].copy_from_slice(&conditions[sample]);
    }
    map
}

/// One optimizer step on one mini-batch. Returns the loss breakdown.
pub fn train_step(
    model: &mut Cvae,
    x: &FeatureMap,
    condition: &FeatureMap,
    optimizer: &mut AdamOptimizer,
    rng: &mut StdRng,
) -> LossBreakdown {
    model.zero_grads();

    let (out, cache) = model.forward_train(x, condition, rng);
    let loss = cvae_loss(&out.reconstruction, x, &out.mu, &out.logvar);

    let d_recon = reconstruction_grad(&out.reconstruction, x);
    let (d_mu, d_logvar) = kl_grads(&out.mu, &out.logvar);
    model.backward(&cache, &d_recon, &d_mu, &d_logvar);

    let mut flat_g = flatten(&model.grads());
    let norm: f64 = flat_g.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > MAX_GRAD_NORM {
        let scale = MAX_GRAD_NORM / norm;
        for g in &mut flat_g {
            *g *= scale;
        }
    }

    let mut flat_w = flatten(&model.params());
    optimizer.apply(&mut flat_w, &flat_g);
    write_back(&flat_w, model.params_mut());

    loss
}

/// Summary of a completed training run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainReport {
    /// Epochs completed.
    pub epochs: usize,
    /// Optimizer steps taken.
    pub steps: u64,
    /// Mean total loss over the final epoch.
    pub final_avg_loss: f64,
}

/// Train on a normalized `[n, time, channels]` stack with aligned condition
/// vectors. Batch order reshuffles every epoch from the shared `rng`.
pub fn train(
    model: &mut Cvae,
    stack: &ArrayView3<'_, f64>,
    conditions: &[[f64; NUM_SUBSYSTEMS]],
    cfg: &TrainingConfig,
    rng: &mut StdRng,
) -> TrainReport {
    let n = stack.dim().0;
    debug_assert_eq!(n, conditions.len());
    let mut optimizer = AdamOptimizer::new(model.num_params(), cfg.learning_rate);
    let mut indices: Vec<usize> = (0..n).collect();
    let mut final_avg_loss = 0.0;

    for epoch in 0..cfg.epochs {
        indices.shuffle(rng);
        let mut epoch_loss = 0.0;
        let mut batches = 0;

        for batch in indices.chunks(cfg.batch_size) {
            let x = batch_from_stack(stack, batch);
            let cond = conditions_batch(conditions, batch);
            let loss = train_step(model, &x, &cond, &mut optimizer, rng);
            debug!(
                epoch,
                batch = batches,
                total = loss.total,
                reconstruction = loss.reconstruction,
                kl = loss.kl,
                "train step"
            );
            epoch_loss += loss.total;
            batches += 1;
        }

        final_avg_loss = epoch_loss / batches.max(1) as f64;
        info!(epoch, avg_loss = final_avg_loss, "epoch complete");
    }

    TrainReport {
        epochs: cfg.epochs,
        steps: optimizer.steps,
        final_avg_loss,
    }
}
