//! CVAE composition: encoder → reparameterized latent → decoder.

use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use super::decoder::{Decoder, DecoderCache};
use super::encoder::{Encoder, EncoderCache};
use super::FeatureMap;
use crate::config::ModelConfig;

/// Result of one forward pass. No hidden state persists across calls.
#[derive(Debug, Clone)]
pub struct CvaeOutput {
    /// Reconstructed waveform, same shape as the input, values in [0, 1].
    pub reconstruction: FeatureMap,
    /// Latent posterior mean.
    pub mu: FeatureMap,
    /// Latent posterior log-variance.
    pub logvar: FeatureMap,
}

/// Forward intermediates for one training step.
#[derive(Debug, Clone)]
pub struct CvaeCache {
    encoder: EncoderCache,
    decoder: DecoderCache,
    /// Standard-normal draws used for the latent sample.
    eps: Vec<f64>,
    /// `exp(0.5 · logvar)` at draw time.
    std: Vec<f64>,
}

/// Conditional variational autoencoder over multichannel waveforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cvae {
    config: ModelConfig,
    encoder: Encoder,
    decoder: Decoder,
}

impl Cvae {
    /// Build a freshly initialized model. All weight draws come from `rng`.
    pub fn new(config: &ModelConfig, rng: &mut StdRng) -> Self {
        let encoder = Encoder::new(config, rng);
        let decoder = Decoder::new(config, encoder.encoded_len(), rng);
        Self {
            config: config.clone(),
            encoder,
            decoder,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Draw a latent sample `z = mu + exp(0.5 · logvar) ⊙ ε`, ε ~ N(0, I).
    ///
    /// The noise enters multiplicatively against a deterministic function of
    /// the posterior parameters, which keeps the draw differentiable with
    /// respect to `mu` and `logvar`.
    pub fn reparameterize(mu: &FeatureMap, logvar: &FeatureMap, rng: &mut StdRng) -> FeatureMap {
        Self::reparameterize_cached(mu, logvar, rng).0
    }

    /// Reparameterize and keep the draws for backprop.
    fn reparameterize_cached(
        mu: &FeatureMap,
        logvar: &FeatureMap,
        rng: &mut StdRng,
    ) -> (FeatureMap, Vec<f64>, Vec<f64>) {
        debug_assert_eq!(mu.data.len(), logvar.data.len());
        let mut z = mu.clone();
        let mut eps = vec![0.0; mu.data.len()];
        let mut std = vec![0.0; mu.data.len()];
        for i in 0..z.data.len() {
            let e: f64 = StandardNormal.sample(rng);
            let s = (0.5 * logvar.data[i]).exp();
            eps[i] = e;
            std[i] = s;
            z.data[i] += e * s;
        }
        (z, eps, std)
    }

    /// Inference forward: dropout inactive, batch norm on running stats.
    /// The latent draw still samples; pass a seeded `rng` for reproducible
    /// reconstructions.
    pub fn forward_eval(
        &self,
        x: &FeatureMap,
        condition: &FeatureMap,
        rng: &mut StdRng,
    ) -> CvaeOutput {
        let (mu, logvar) = self.encoder.forward_eval(x, condition);
        let z = Self::reparameterize(&mu, &logvar, rng);
        let reconstruction = self.decoder.forward_eval(&z, condition);
        CvaeOutput {
            reconstruction,
            mu,
            logvar,
        }
    }

    /// Training forward with cache for [`Self::backward`].
    pub fn forward_train(
        &mut self,
        x: &FeatureMap,
        condition: &FeatureMap,
        rng: &mut StdRng,
    ) -> (CvaeOutput, CvaeCache) {
        let (mu, logvar, encoder_cache) = self.encoder.forward_train(x, condition, rng);
        let (z, eps, std) = Self::reparameterize_cached(&mu, &logvar, rng);
        let (reconstruction, decoder_cache) = self.decoder.forward_train(&z, condition, rng);
        (
            CvaeOutput {
                reconstruction,
                mu,
                logvar,
            },
            CvaeCache {
                encoder: encoder_cache,
                decoder: decoder_cache,
                eps,
                std,
            },
        )
    }

    /// Backpropagate the loss gradients through decoder, latent draw and
    /// encoder, accumulating parameter gradients in every layer.
    ///
    /// `d_mu_extra` and `d_logvar_extra` carry the KL term's direct
    /// gradients; the reconstruction path's contribution flows through the
    /// latent sample:
    /// `∂z/∂mu = 1`, `∂z/∂logvar = 0.5 · ε · exp(0.5 · logvar)`.
    pub fn backward(
        &mut self,
        cache: &CvaeCache,
        d_recon: &FeatureMap,
        d_mu_extra: &FeatureMap,
        d_logvar_extra: &FeatureMap,
    ) {
        let dz = self.decoder.backward(&cache.decoder, d_recon);

        let mut d_mu = dz.clone();
        d_mu.add_assign_map(d_mu_extra);

        let mut d_logvar = d_logvar_extra.clone();
        for i in 0..d_logvar.data.len() {
            d_logvar.data[i] += dz.data[i] * cache.eps[i] * 0.5 * cache.std[i];
        }

        // The input gradient is discarded: the waveform is data, not a
        // trainable parameter.
        let _ = self.encoder.backward(&cache.encoder, &d_mu, &d_logvar);
    }

    pub fn zero_grads(&mut self) {
        self.encoder.zero_grads();
        self.decoder.zero_grads();
    }

    pub fn params(&self) -> Vec<&Vec<f64>> {
        let mut out = self.encoder.params();
        out.extend(self.decoder.params());
        out
    }

    pub fn params_mut(&mut self) -> Vec<&mut Vec<f64>> {
        let mut out = self.encoder.params_mut();
        out.extend(self.decoder.params_mut());
        out
    }

    pub fn grads(&self) -> Vec<&Vec<f64>> {
        let mut out = self.encoder.grads();
        out.extend(self.decoder.grads());
        out
    }

    /// Total trainable parameter count.
    pub fn num_params(&self) -> usize {
        self.encoder.num_params() + self.decoder.num_params()
    }
}
