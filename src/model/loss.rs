//! CVAE loss: summed squared error plus closed-form KL divergence.
//!
//! Both terms are sums over all elements, not per-sample means, so the
//! loss magnitude scales with batch size and sequence length. Callers
//! comparing runs across batch sizes must account for that.

use super::FeatureMap;

/// Additive epsilon inside the KL sum for numerical stability.
pub const KL_EPSILON: f64 = 1e-8;

/// Loss terms for one forward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossBreakdown {
    /// Sum of squared reconstruction errors.
    pub reconstruction: f64,
    /// KL divergence of the latent posterior against N(0, I).
    pub kl: f64,
    /// `reconstruction + kl`.
    pub total: f64,
}

/// `Σ (x̂ − x)²` over every element.
pub fn sum_squared_error(recon: &FeatureMap, x: &FeatureMap) -> f64 {
    debug_assert_eq!(recon.data.len(), x.data.len());
    recon
        .data
        .iter()
        .zip(x.data.iter())
        .map(|(r, t)| (r - t) * (r - t))
        .sum()
}

/// Closed-form KL between `N(mu, exp(logvar))` and `N(0, 1)`, summed over
/// every latent dimension of every batch element:
///
/// `−0.5 · Σ (1 + logvar − mu² − exp(logvar) + ε)`
pub fn kl_divergence(mu: &FeatureMap, logvar: &FeatureMap) -> f64 {
    debug_assert_eq!(mu.data.len(), logvar.data.len());
    let sum: f64 = mu
        .data
        .iter()
        .zip(logvar.data.iter())
        .map(|(m, lv)| 1.0 + lv - m * m - lv.exp() + KL_EPSILON)
        .sum();
    -0.5 * sum
}

/// Combined CVAE loss.
pub fn cvae_loss(
    recon: &FeatureMap,
    x: &FeatureMap,
    mu: &FeatureMap,
    logvar: &FeatureMap,
) -> LossBreakdown {
    let reconstruction = sum_squared_error(recon, x);
    let kl = kl_divergence(mu, logvar);
    LossBreakdown {
        reconstruction,
        kl,
        total: reconstruction + kl,
    }
}

/// Gradient of the summed squared error with respect to the reconstruction:
/// `2 (x̂ − x)`.
pub fn reconstruction_grad(recon: &FeatureMap, x: &FeatureMap) -> FeatureMap {
    let mut g = recon.clone();
    for (v, t) in g.data.iter_mut().zip(x.data.iter()) {
        *v = 2.0 * (*v - t);
    }
    g
}

/// Direct KL gradients: `∂KL/∂mu = mu`, `∂KL/∂logvar = −0.5 (1 − exp(logvar))`.
pub fn kl_grads(mu: &FeatureMap, logvar: &FeatureMap) -> (FeatureMap, FeatureMap) {
    let d_mu = mu.clone();
    let mut d_logvar = logvar.clone();
    for v in &mut d_logvar.data {
        *v = -0.5 * (1.0 - v.exp());
    }
    (d_mu, d_logvar)
}
