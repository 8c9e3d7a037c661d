//! Waveform encoder: three conv/pool stages to a conditioned latent Gaussian.

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::layers::{
    conv1d_out_len, pool_out_len, relu, relu_backward, BatchNorm1d, BatchNormCache, Conv1d,
    Dropout, Linear, MaxPool1d,
};
use super::FeatureMap;
use crate::config::ModelConfig;

/// Time length after the three conv/pool stages.
///
/// Each stage grows the length by one (stride-1 conv, kernel 12, padding 6)
/// and then halves it (pool kernel 2, stride 2). The decoder's reshape
/// target must equal this value or shapes cannot round-trip.
pub fn encoded_len(seq_len: usize, kernel: usize, padding: usize) -> usize {
    let mut len = seq_len;
    for _ in 0..3 {
        len = conv1d_out_len(len, kernel, padding);
        len = pool_out_len(len, 2, 2);
    }
    len
}

/// One conv stage: Conv1d → BatchNorm → MaxPool → ReLU → Dropout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ConvStage {
    conv: Conv1d,
    bn: BatchNorm1d,
    pool: MaxPool1d,
    drop: Dropout,
}

/// Per-stage forward intermediates for backprop.
#[derive(Debug, Clone)]
struct ConvStageCache {
    input: FeatureMap,
    bn_cache: BatchNormCache,
    prepool_shape: (usize, usize, usize),
    argmax: Vec<usize>,
    relu_out: FeatureMap,
    drop_mask: Vec<f64>,
}

impl ConvStage {
    fn new(in_channels: usize, cfg: &ModelConfig, rng: &mut StdRng) -> Self {
        Self {
            conv: Conv1d::new(
                in_channels,
                cfg.conv_channels,
                cfg.kernel_size,
                cfg.padding,
                rng,
            ),
            bn: BatchNorm1d::new(cfg.conv_channels),
            pool: MaxPool1d::new(2, 2),
            drop: Dropout::new(cfg.dropout),
        }
    }

    fn forward_eval(&self, x: &FeatureMap) -> FeatureMap {
        let h = self.conv.forward(x);
        let h = self.bn.forward_eval(&h);
        let (h, _) = self.pool.forward(&h);
        relu(&h)
    }

    fn forward_train(&mut self, x: &FeatureMap, rng: &mut StdRng) -> (FeatureMap, ConvStageCache) {
        let h = self.conv.forward(x);
        let (h, bn_cache) = self.bn.forward_train(&h);
        let prepool_shape = (h.batch, h.channels, h.len);
        let (h, argmax) = self.pool.forward(&h);
        let relu_out = relu(&h);
        let (out, drop_mask) = self.drop.forward_train(&relu_out, rng);
        (
            out,
            ConvStageCache {
                input: x.clone(),
                bn_cache,
                prepool_shape,
                argmax,
                relu_out,
                drop_mask,
            },
        )
    }

    fn backward(&mut self, cache: &ConvStageCache, gout: &FeatureMap) -> FeatureMap {
        let g = Dropout::backward(&cache.drop_mask, gout);
        let g = relu_backward(&cache.relu_out, &g);
        let g = self.pool.backward(cache.prepool_shape, &cache.argmax, &g);
        let g = self.bn.backward(&cache.bn_cache, &g);
        self.conv.backward(&cache.input, &g)
    }

    fn zero_grads(&mut self) {
        self.conv.zero_grads();
        self.bn.zero_grads();
    }
}

/// Encoder: waveform + condition → latent mean and log-variance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encoder {
    stage1: ConvStage,
    stage2: ConvStage,
    stage3: ConvStage,
    fc: Linear,
    bn0: BatchNorm1d,
    drop0: Dropout,
    fc_mu: Linear,
    fc_logvar: Linear,
    encoded_len: usize,
    conv_channels: usize,
}

/// Forward intermediates needed to backpropagate through the encoder.
#[derive(Debug, Clone)]
pub struct EncoderCache {
    stage1: ConvStageCache,
    stage2: ConvStageCache,
    stage3: ConvStageCache,
    flat_input: FeatureMap,
    bn0_cache: BatchNormCache,
    bn0_relu_out: FeatureMap,
    drop0_mask: Vec<f64>,
    head_input: FeatureMap,
}

impl Encoder {
    pub fn new(cfg: &ModelConfig, rng: &mut StdRng) -> Self {
        let encoded_len = encoded_len(cfg.seq_len, cfg.kernel_size, cfg.padding);
        let flat_features = cfg.conv_channels * encoded_len;
        let joined = cfg.fc_width + cfg.condition_dim;
        Self {
            stage1: ConvStage::new(cfg.in_channels, cfg, rng),
            stage2: ConvStage::new(cfg.conv_channels, cfg, rng),
            stage3: ConvStage::new(cfg.conv_channels, cfg, rng),
            fc: Linear::new(flat_features, cfg.fc_width, rng),
            bn0: BatchNorm1d::new(joined),
            drop0: Dropout::new(cfg.dropout),
            fc_mu: Linear::new(joined, cfg.latent_dim, rng),
            fc_logvar: Linear::new(joined, cfg.latent_dim, rng),
            encoded_len,
            conv_channels: cfg.conv_channels,
        }
    }

    /// Time length entering the decoder's reshape.
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    /// Inference forward: dropout inactive, batch norm on running stats.
    pub fn forward_eval(
        &self,
        x: &FeatureMap,
        condition: &FeatureMap,
    ) -> (FeatureMap, FeatureMap) {
        let h = self.stage1.forward_eval(x);
        let h = self.stage2.forward_eval(&h);
        let h = self.stage3.forward_eval(&h);

        let flat = h.flatten_channels();
        let hidden = self.fc.forward(&flat);
        let joined = FeatureMap::concat_features(&hidden, condition);
        let normed = self.bn0.forward_eval(&joined);
        let activated = relu(&normed);

        let mu = self.fc_mu.forward(&activated);
        let logvar = self.fc_logvar.forward(&activated);
        (mu, logvar)
    }

    /// Training forward: batch statistics, live dropout, cache for backprop.
    pub fn forward_train(
        &mut self,
        x: &FeatureMap,
        condition: &FeatureMap,
        rng: &mut StdRng,
    ) -> (FeatureMap, FeatureMap, EncoderCache) {
        let (h, cache1) = self.stage1.forward_train(x, rng);
        let (h, cache2) = self.stage2.forward_train(&h, rng);
        let (h, cache3) = self.stage3.forward_train(&h, rng);

        let flat = h.flatten_channels();
        let hidden = self.fc.forward(&flat);
        let joined = FeatureMap::concat_features(&hidden, condition);
        let (normed, bn0_cache) = self.bn0.forward_train(&joined);
        let activated = relu(&normed);
        let (head_input, drop0_mask) = self.drop0.forward_train(&activated, rng);

        let mu = self.fc_mu.forward(&head_input);
        let logvar = self.fc_logvar.forward(&head_input);
        let cache = EncoderCache {
            stage1: cache1,
            stage2: cache2,
            stage3: cache3,
            flat_input: flat,
            bn0_cache,
            bn0_relu_out: activated,
            drop0_mask,
            head_input,
        };
        (mu, logvar, cache)
    }

    /// Backpropagate head gradients to the input waveform gradient.
    pub fn backward(
        &mut self,
        cache: &EncoderCache,
        d_mu: &FeatureMap,
        d_logvar: &FeatureMap,
    ) -> FeatureMap {
        let mut d_head = self.fc_mu.backward(&cache.head_input, d_mu);
        let d_head_logvar = self.fc_logvar.backward(&cache.head_input, d_logvar);
        d_head.add_assign_map(&d_head_logvar);

        let g = Dropout::backward(&cache.drop0_mask, &d_head);
        let g = relu_backward(&cache.bn0_relu_out, &g);
        let g = self.bn0.backward(&cache.bn0_cache, &g);

        // The condition is an input, not a parameter; its gradient is dropped.
        let (d_hidden, _d_condition) = g.split_features(self.fc.out_features);
        let d_flat = self.fc.backward(&cache.flat_input, &d_hidden);

        let g = d_flat.reshape(self.conv_channels, self.encoded_len);
        let g = self.stage3.backward(&cache.stage3, &g);
        let g = self.stage2.backward(&cache.stage2, &g);
        self.stage1.backward(&cache.stage1, &g)
    }

    pub fn zero_grads(&mut self) {
        self.stage1.zero_grads();
        self.stage2.zero_grads();
        self.stage3.zero_grads();
        self.fc.zero_grads();
        self.bn0.zero_grads();
        self.fc_mu.zero_grads();
        self.fc_logvar.zero_grads();
    }

    pub fn params(&self) -> Vec<&Vec<f64>> {
        let mut out = Vec::new();
        for stage in [&self.stage1, &self.stage2, &self.stage3] {
            out.extend(stage.conv.params());
            out.extend(stage.bn.params());
        }
        out.extend(self.fc.params());
        out.extend(self.bn0.params());
        out.extend(self.fc_mu.params());
        out.extend(self.fc_logvar.params());
        out
    }

    pub fn params_mut(&mut self) -> Vec<&mut Vec<f64>> {
        let mut out = Vec::new();
        for stage in [&mut self.stage1, &mut self.stage2, &mut self.stage3] {
            out.extend(stage.conv.params_mut());
            out.extend(stage.bn.params_mut());
        }
        out.extend(self.fc.params_mut());
        out.extend(self.bn0.params_mut());
        out.extend(self.fc_mu.params_mut());
        out.extend(self.fc_logvar.params_mut());
        out
    }

    pub fn grads(&self) -> Vec<&Vec<f64>> {
        let mut out = Vec::new();
        for stage in [&self.stage1, &self.stage2, &self.stage3] {
            out.extend(stage.conv.grads());
            out.extend(stage.bn.grads());
        }
        out.extend(self.fc.grads());
        out.extend(self.bn0.grads());
        out.extend(self.fc_mu.grads());
        out.extend(self.fc_logvar.grads());
        out
    }

    /// Total trainable parameter count.
    pub fn num_params(&self) -> usize {
        self.params().iter().map(|p| p.len()).sum()
    }
}
