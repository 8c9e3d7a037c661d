//! Waveform decoder: latent draw + condition back to a [0, 1] waveform.
//!
//! Mirrors the encoder in reverse. The last upsample resizes to exactly
//! `seq_len + 1` so the final transposed convolution (which shortens by
//! one) lands on the original `seq_len`, undoing the rounding drift the
//! encoder's integer pooling introduced.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::layers::{
    relu, relu_backward, sigmoid_backward, sigmoid_map, BatchNorm1d, BatchNormCache,
    ConvTranspose1d, Dropout, Linear, Upsample,
};
use super::FeatureMap;
use crate::config::ModelConfig;

/// Decoder network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decoder {
    fc1: Linear,
    fc2: Linear,
    bn0: BatchNorm1d,
    drop0: Dropout,

    up1: Upsample,
    bn1: BatchNorm1d,
    tconv1: ConvTranspose1d,
    drop1: Dropout,

    up2: Upsample,
    bn2: BatchNorm1d,
    tconv2: ConvTranspose1d,
    drop2: Dropout,

    up3: Upsample,
    bn3: BatchNorm1d,
    tconv3: ConvTranspose1d,
    drop3: Dropout,

    latent_dim: usize,
    conv_channels: usize,
    encoded_len: usize,
}

/// Forward intermediates needed to backpropagate through the decoder.
#[derive(Debug, Clone)]
pub struct DecoderCache {
    fc1_input: FeatureMap,
    fc1_out: FeatureMap,
    reshaped: FeatureMap,
    bn0_cache: BatchNormCache,
    bn0_relu_out: FeatureMap,
    drop0_mask: Vec<f64>,

    up1_in_len: usize,
    bn1_cache: BatchNormCache,
    tconv1_input: FeatureMap,
    relu1_out: FeatureMap,
    drop1_mask: Vec<f64>,

    up2_in_len: usize,
    bn2_cache: BatchNormCache,
    tconv2_input: FeatureMap,
    relu2_out: FeatureMap,
    drop2_mask: Vec<f64>,

    up3_in_len: usize,
    bn3_cache: BatchNormCache,
    tconv3_input: FeatureMap,
    sigmoid_out: FeatureMap,
    drop3_mask: Vec<f64>,
}

impl Decoder {
    pub fn new(cfg: &ModelConfig, encoded_len: usize, rng: &mut StdRng) -> Self {
        let joined = cfg.latent_dim + cfg.condition_dim;
        let c = cfg.conv_channels;
        Self {
            fc1: Linear::new(joined, cfg.fc_width, rng),
            fc2: Linear::new(cfg.fc_width, c * encoded_len, rng),
            bn0: BatchNorm1d::new(c),
            drop0: Dropout::new(cfg.dropout),

            up1: Upsample::Scale(2),
            bn1: BatchNorm1d::new(c),
            tconv1: ConvTranspose1d::new(c, c, cfg.kernel_size, cfg.padding, rng),
            drop1: Dropout::new(cfg.dropout),

            up2: Upsample::Scale(2),
            bn2: BatchNorm1d::new(c),
            tconv2: ConvTranspose1d::new(c, c, cfg.kernel_size, cfg.padding, rng),
            drop2: Dropout::new(cfg.dropout),

            // Resize to seq_len + 1; the final transposed conv shortens by one.
            up3: Upsample::Exact(cfg.seq_len + 1),
            bn3: BatchNorm1d::new(c),
            tconv3: ConvTranspose1d::new(c, cfg.in_channels, cfg.kernel_size, cfg.padding, rng),
            drop3: Dropout::new(cfg.dropout),

            latent_dim: cfg.latent_dim,
            conv_channels: c,
            encoded_len,
        }
    }

    /// Inference forward: dropout inactive, batch norm on running stats.
    pub fn forward_eval(&self, z: &FeatureMap, condition: &FeatureMap) -> FeatureMap {
        let joined = FeatureMap::concat_features(z, condition);
        let h = self.fc1.forward(&joined);
        let h = self.fc2.forward(&h);
        let h = h.reshape(self.conv_channels, self.encoded_len);
        let h = self.bn0.forward_eval(&h);
        let h = relu(&h);

        let h = self.up1.forward(&h);
        let h = self.bn1.forward_eval(&h);
        let h = relu(&self.tconv1.forward(&h));

        let h = self.up2.forward(&h);
        let h = self.bn2.forward_eval(&h);
        let h = relu(&self.tconv2.forward(&h));

        let h = self.up3.forward(&h);
        let h = self.bn3.forward_eval(&h);
        sigmoid_map(&self.tconv3.forward(&h))
    }

    /// Training forward with cache.
    pub fn forward_train(
        &mut self,
        z: &FeatureMap,
        condition: &FeatureMap,
        rng: &mut StdRng,
    ) -> (FeatureMap, DecoderCache) {
        let fc1_input = FeatureMap::concat_features(z, condition);
        let fc1_out = self.fc1.forward(&fc1_input);
        let flat = self.fc2.forward(&fc1_out);
        let reshaped = flat.reshape(self.conv_channels, self.encoded_len);
        let (h, bn0_cache) = self.bn0.forward_train(&reshaped);
        let bn0_relu_out = relu(&h);
        let (h, drop0_mask) = self.drop0.forward_train(&bn0_relu_out, rng);

        let up1_in_len = h.len;
        let h = self.up1.forward(&h);
        let (h, bn1_cache) = self.bn1.forward_train(&h);
        let tconv1_input = h;
        let relu1_out = relu(&self.tconv1.forward(&tconv1_input));
        let (h, drop1_mask) = self.drop1.forward_train(&relu1_out, rng);

        let up2_in_len = h.len;
        let h = self.up2.forward(&h);
        let (h, bn2_cache) = self.bn2.forward_train(&h);
        let tconv2_input = h;
        let relu2_out = relu(&self.tconv2.forward(&tconv2_input));
        let (h, drop2_mask) = self.drop2.forward_train(&relu2_out, rng);

        let up3_in_len = h.len;
        let h = self.up3.forward(&h);
        let (h, bn3_cache) = self.bn3.forward_train(&h);
        let tconv3_input = h;
        let sigmoid_out = sigmoid_map(&self.tconv3.forward(&tconv3_input));
        let (recon, drop3_mask) = self.drop3.forward_train(&sigmoid_out, rng);

        let cache = DecoderCache {
            fc1_input,
            fc1_out,
            reshaped,
            bn0_cache,
            bn0_relu_out,
            drop0_mask,
            up1_in_len,
            bn1_cache,
            tconv1_input,
            relu1_out,
            drop1_mask,
            up2_in_len,
            bn2_cache,
            tconv2_input,
            relu2_out,
            drop2_mask,
            up3_in_len,
            bn3_cache,
            tconv3_input,
            sigmoid_out,
            drop3_mask,
        };
        (recon, cache)
    }

    /// Backpropagate the reconstruction gradient to the latent gradient.
    pub fn backward(&mut self, cache: &DecoderCache, d_recon: &FeatureMap) -> FeatureMap {
        let g = Dropout::backward(&cache.drop3_mask, d_recon);
        let g = sigmoid_backward(&cache.sigmoid_out, &g);
        let g = self.tconv3.backward(&cache.tconv3_input, &g);
        let g = self.bn3.backward(&cache.bn3_cache, &g);
        let g = self.up3.backward(cache.up3_in_len, &g);

        let g = Dropout::backward(&cache.drop2_mask, &g);
        let g = relu_backward(&cache.relu2_out, &g);
        let g = self.tconv2.backward(&cache.tconv2_input, &g);
        let g = self.bn2.backward(&cache.bn2_cache, &g);
        let g = self.up2.backward(cache.up2_in_len, &g);

        let g = Dropout::backward(&cache.drop1_mask, &g);
        let g = relu_backward(&cache.relu1_out, &g);
        let g = self.tconv1.backward(&cache.tconv1_input, &g);
        let g = self.bn1.backward(&cache.bn1_cache, &g);
        let g = self.up1.backward(cache.up1_in_len, &g);

        let g = Dropout::backward(&cache.drop0_mask, &g);
        let g = relu_backward(&cache.bn0_relu_out, &g);
        let g = self.bn0.backward(&cache.bn0_cache, &g);
        let g = g.flatten_channels();
        let g = self.fc2.backward(&cache.fc1_out, &g);
        let g = self.fc1.backward(&cache.fc1_input, &g);

        // The condition is an input, not a parameter; its gradient is dropped.
        let (d_latent, _d_condition) = g.split_features(self.latent_dim);
        d_latent
    }

    pub fn zero_grads(&mut self) {
        self.fc1.zero_grads();
        self.fc2.zero_grads();
        self.bn0.zero_grads();
        self.bn1.zero_grads();
        self.bn2.zero_grads();
        self.bn3.zero_grads();
        self.tconv1.zero_grads();
        self.tconv2.zero_grads();
        self.tconv3.zero_grads();
    }

    pub fn params(&self) -> Vec<&Vec<f64>> {
        let mut out = Vec::new();
        out.extend(self.fc1.params());
        out.extend(self.fc2.params());
        out.extend(self.bn0.params());
        out.extend(self.bn1.params());
        out.extend(self.tconv1.params());
        out.extend(self.bn2.params());
        out.extend(self.tconv2.params());
        out.extend(self.bn3.params());
        out.extend(self.tconv3.params());
        out
    }

    pub fn params_mut(&mut self) -> Vec<&mut Vec<f64>> {
        let mut out = Vec::new();
        out.extend(self.fc1.params_mut());
        out.extend(self.fc2.params_mut());
        out.extend(self.bn0.params_mut());
        out.extend(self.bn1.params_mut());
        out.extend(self.tconv1.params_mut());
        out.extend(self.bn2.params_mut());
        out.extend(self.tconv2.params_mut());
        out.extend(self.bn3.params_mut());
        out.extend(self.tconv3.params_mut());
        out
    }

    pub fn grads(&self) -> Vec<&Vec<f64>> {
        let mut out = Vec::new();
        out.extend(self.fc1.grads());
        out.extend(self.fc2.grads());
        out.extend(self.bn0.grads());
        out.extend(self.bn1.grads());
        out.extend(self.tconv1.grads());
        out.extend(self.bn2.grads());
        out.extend(self.tconv2.grads());
        out.extend(self.bn3.grads());
        out.extend(self.tconv3.grads());
        out
    }

    /// Total trainable parameter count.
    pub fn num_params(&self) -> usize {
        self.params().iter().map(|p| p.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::encoder::encoded_len;
    use rand::SeedableRng;

    fn small_config() -> ModelConfig {
        ModelConfig {
            in_channels: 14,
            seq_len: 64,
            conv_channels: 8,
            kernel_size: 12,
            padding: 6,
            fc_width: 16,
            latent_dim: 10,
            condition_dim: 4,
            dropout: 0.2,
        }
    }

    #[test]
    fn test_decoder_restores_input_shape() {
        let cfg = small_config();
        let enc_len = encoded_len(cfg.seq_len, cfg.kernel_size, cfg.padding);
        let mut rng = StdRng::seed_from_u64(42);
        let decoder = Decoder::new(&cfg, enc_len, &mut rng);

        let z = FeatureMap::zeros(2, cfg.latent_dim, 1);
        let cond = FeatureMap::from_vec(2, 4, 1, vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        let recon = decoder.forward_eval(&z, &cond);

        assert_eq!(
            (recon.batch, recon.channels, recon.len),
            (2, cfg.in_channels, cfg.seq_len)
        );
        // Sigmoid output must lie in (0, 1).
        for &v in &recon.data {
            assert!((0.0..=1.0).contains(&v), "out of range: {v}");
        }
    }

    #[test]
    fn test_decoder_backward_shapes() {
        let cfg = small_config();
        let enc_len = encoded_len(cfg.seq_len, cfg.kernel_size, cfg.padding);
        let mut rng = StdRng::seed_from_u64(42);
        let mut decoder = Decoder::new(&cfg, enc_len, &mut rng);
        decoder.zero_grads();

        let z = FeatureMap::from_vec(1, cfg.latent_dim, 1, vec![0.1; cfg.latent_dim]);
        let cond = FeatureMap::from_vec(1, 4, 1, vec![0.0, 1.0, 0.0, 0.0]);
        let (recon, cache) = decoder.forward_train(&z, &cond, &mut rng);
        assert_eq!(recon.len, cfg.seq_len);

        let d_latent = decoder.backward(&cache, &recon);
        assert_eq!(
            (d_latent.batch, d_latent.channels, d_latent.len),
            (1, cfg.latent_dim, 1)
        );
        assert!(d_latent.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_param_grad_layouts_match() {
        let cfg = small_config();
        let enc_len = encoded_len(cfg.seq_len, cfg.kernel_size, cfg.padding);
        let mut rng = StdRng::seed_from_u64(3);
        let mut decoder = Decoder::new(&cfg, enc_len, &mut rng);
        decoder.zero_grads();
        let params = decoder.params();
        let grads = decoder.grads();
        assert_eq!(params.len(), grads.len());
        for (p, g) in params.iter().zip(grads.iter()) {
            assert_eq!(p.len(), g.len());
        }
    }
}
