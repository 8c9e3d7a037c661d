//! Shape and range contracts of the CVAE at the full waveform length.
//!
//! Conv widths are reduced so the tests stay fast; the time axis runs at
//! the real 4500-step digitizer length, which is what the pooling and
//! upsampling arithmetic must round-trip exactly.

use hvcm_cvae::config::ModelConfig;
use hvcm_cvae::model::{encoded_len, Cvae, FeatureMap};
use hvcm_cvae::types::{NUM_CHANNELS, SEQ_LEN};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Narrow model over the full 4500-step time axis.
fn full_length_config() -> ModelConfig {
    ModelConfig {
        conv_channels: 8,
        fc_width: 32,
        latent_dim: 16,
        ..ModelConfig::default()
    }
}

#[test]
fn test_encoded_len_of_default_configuration() {
    let cfg = ModelConfig::default();
    assert_eq!(cfg.seq_len, SEQ_LEN);
    assert_eq!(encoded_len(cfg.seq_len, cfg.kernel_size, cfg.padding), 563);
}

#[test]
fn test_decoder_output_matches_encoder_input_shape() {
    let cfg = full_length_config();
    let mut rng = StdRng::seed_from_u64(42);
    let model = Cvae::new(&cfg, &mut rng);

    let x = FeatureMap::from_vec(
        1,
        NUM_CHANNELS,
        SEQ_LEN,
        (0..NUM_CHANNELS * SEQ_LEN)
            .map(|i| ((i % 100) as f64) / 100.0)
            .collect(),
    );
    let condition = FeatureMap::from_condition(&[0.0, 1.0, 0.0, 0.0]);
    let out = model.forward_eval(&x, &condition, &mut rng);

    assert_eq!(
        (
            out.reconstruction.batch,
            out.reconstruction.channels,
            out.reconstruction.len
        ),
        (1, NUM_CHANNELS, SEQ_LEN)
    );
}

#[test]
fn test_zero_sample_end_to_end() {
    // A zero-valued (14, 4500) sample with a valid one-hot condition must
    // produce a (14, 4500) reconstruction bounded in [0, 1].
    let cfg = full_length_config();
    let mut rng = StdRng::seed_from_u64(7);
    let model = Cvae::new(&cfg, &mut rng);

    let x = FeatureMap::zeros(1, NUM_CHANNELS, SEQ_LEN);
    let condition = FeatureMap::from_condition(&[1.0, 0.0, 0.0, 0.0]);
    let out = model.forward_eval(&x, &condition, &mut rng);

    assert_eq!(out.reconstruction.channels, NUM_CHANNELS);
    assert_eq!(out.reconstruction.len, SEQ_LEN);
    for &v in &out.reconstruction.data {
        assert!(v.is_finite());
        assert!((0.0..=1.0).contains(&v), "reconstruction out of [0,1]: {v}");
    }
    assert!(out.mu.data.iter().all(|v| v.is_finite()));
    assert!(out.logvar.data.iter().all(|v| v.is_finite()));
}
