//! Diagnostic figure rendering: one PNG per channel per view.
//!
//! Three views, mirroring the study's figure tree:
//!
//! - `avg/<SYSTEM>/`: per-subsystem averaged normal waveform
//! - `overlay/`: one normal sample from every subsystem on shared axes
//! - `reconstruction/<SYSTEM>/`: original vs. reconstructed sample
//!
//! Charts are rendered text-free (color-coded series only) so the crate
//! stays headless-safe: no font stack is required to produce output.

use ndarray::ArrayView2;
use plotters::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::{Subsystem, CHANNEL_NAMES, NUM_CHANNELS};

/// Figure output size in pixels.
const FIGURE_SIZE: (u32, u32) = (1200, 600);

/// Series colors in draw order.
const SERIES_COLORS: [RGBColor; 4] = [BLUE, RED, GREEN, MAGENTA];

#[derive(Debug, Error)]
pub enum FigureError {
    #[error("figure io failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("figure rendering failed: {0}")]
    Render(String),

    #[error("channel waveforms have mismatched lengths")]
    LengthMismatch,
}

/// Filename-safe form of a channel name: `*` and `/` become `_`
/// (`A+*IGBT-I` → `A+_IGBT-I`, `DV/DT` → `DV_DT`).
pub fn channel_file_stem(name: &str) -> String {
    name.replace(['*', '/'], "_")
}

/// Render one PNG of overlaid series.
fn render_series(path: &Path, series: &[Vec<f64>]) -> Result<(), FigureError> {
    let len = series.first().map_or(0, Vec::len);
    if series.iter().any(|s| s.len() != len) {
        return Err(FigureError::LengthMismatch);
    }

    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for value in series.iter().flatten() {
        lo = lo.min(*value);
        hi = hi.max(*value);
    }
    if !lo.is_finite() || !hi.is_finite() {
        lo = 0.0;
        hi = 1.0;
    }
    if hi - lo < 1e-12 {
        lo -= 0.5;
        hi += 0.5;
    }
    let pad = (hi - lo) * 0.05;

    let root = BitMapBackend::new(path, FIGURE_SIZE).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|e| FigureError::Render(e.to_string()))?;

    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .build_cartesian_2d(0f64..len.max(1) as f64, (lo - pad)..(hi + pad))
        .map_err(|e| FigureError::Render(e.to_string()))?;

    for (i, values) in series.iter().enumerate() {
        let color = SERIES_COLORS[i % SERIES_COLORS.len()];
        chart
            .draw_series(LineSeries::new(
                values.iter().enumerate().map(|(t, &v)| (t as f64, v)),
                &color,
            ))
            .map_err(|e| FigureError::Render(e.to_string()))?;
    }

    root.present()
        .map_err(|e| FigureError::Render(e.to_string()))?;
    Ok(())
}

fn channel_column(sample: &ArrayView2<'_, f64>, channel: usize) -> Vec<f64> {
    sample.column(channel).iter().copied().collect()
}

/// Per-channel figures of an averaged `[time, channels]` waveform.
///
/// Writes `out_dir/avg/<SYSTEM>/<channel>.png` and returns the paths.
pub fn render_channel_averages(
    out_dir: &Path,
    subsystem: Subsystem,
    average: &ArrayView2<'_, f64>,
) -> Result<Vec<PathBuf>, FigureError> {
    let dir = out_dir.join("avg").join(subsystem.as_str());
    std::fs::create_dir_all(&dir)?;

    let mut paths = Vec::with_capacity(NUM_CHANNELS);
    for (ch, name) in CHANNEL_NAMES.iter().enumerate() {
        let path = dir.join(format!("{}.png", channel_file_stem(name)));
        render_series(&path, &[channel_column(average, ch)])?;
        paths.push(path);
    }
    tracing::info!(system = %subsystem, figures = paths.len(), "rendered channel averages");
    Ok(paths)
}

/// Per-channel overlay of one sample per subsystem on shared axes.
///
/// Writes `out_dir/overlay/<channel>.png` and returns the paths.
pub fn render_subsystem_overlay(
    out_dir: &Path,
    samples: &[(Subsystem, ArrayView2<'_, f64>)],
) -> Result<Vec<PathBuf>, FigureError> {
    let dir = out_dir.join("overlay");
    std::fs::create_dir_all(&dir)?;

    let mut paths = Vec::with_capacity(NUM_CHANNELS);
    for (ch, name) in CHANNEL_NAMES.iter().enumerate() {
        let series: Vec<Vec<f64>> = samples
            .iter()
            .map(|(_, sample)| channel_column(sample, ch))
            .collect();
        let path = dir.join(format!("{}.png", channel_file_stem(name)));
        render_series(&path, &series)?;
        paths.push(path);
    }
    tracing::info!(figures = paths.len(), "rendered subsystem overlays");
    Ok(paths)
}

/// Per-channel original-vs-reconstruction comparison.
///
/// Writes `out_dir/reconstruction/<SYSTEM>/<channel>.png` and returns the paths.
pub fn render_reconstruction(
    out_dir: &Path,
    subsystem: Subsystem,
    original: &ArrayView2<'_, f64>,
    reconstruction: &ArrayView2<'_, f64>,
) -> Result<Vec<PathBuf>, FigureError> {
    let dir = out_dir.join("reconstruction").join(subsystem.as_str());
    std::fs::create_dir_all(&dir)?;

    let mut paths = Vec::with_capacity(NUM_CHANNELS);
    for (ch, name) in CHANNEL_NAMES.iter().enumerate() {
        let path = dir.join(format!("{}.png", channel_file_stem(name)));
        render_series(
            &path,
            &[
                channel_column(original, ch),
                channel_column(reconstruction, ch),
            ],
        )?;
        paths.push(path);
    }
    tracing::info!(system = %subsystem, figures = paths.len(), "rendered reconstruction comparison");
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn wave(time: usize, phase: f64) -> Array2<f64> {
        Array2::from_shape_fn((time, NUM_CHANNELS), |(t, c)| {
            ((t as f64 * 0.1) + phase + c as f64).sin()
        })
    }

    #[test]
    fn test_channel_file_stem_sanitizes() {
        assert_eq!(channel_file_stem("A+*IGBT-I"), "A+_IGBT-I");
        assert_eq!(channel_file_stem("DV/DT"), "DV_DT");
        assert_eq!(channel_file_stem("CB-V"), "CB-V");
    }

    #[test]
    fn test_render_channel_averages_writes_one_png_per_channel() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let avg = wave(100, 0.0);
        let paths =
            render_channel_averages(dir.path(), Subsystem::Rfq, &avg.view()).expect("render");
        assert_eq!(paths.len(), NUM_CHANNELS);
        for path in &paths {
            let meta = std::fs::metadata(path).expect("figure exists");
            assert!(meta.len() > 0, "empty figure at {}", path.display());
        }
        assert!(dir.path().join("avg/RFQ/DV_DT.png").exists());
    }

    #[test]
    fn test_render_overlay_all_subsystems() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let waves: Vec<Array2<f64>> = (0..4).map(|i| wave(80, i as f64)).collect();
        let samples: Vec<(Subsystem, _)> = Subsystem::ALL
            .iter()
            .zip(waves.iter())
            .map(|(&sys, w)| (sys, w.view()))
            .collect();

        let paths = render_subsystem_overlay(dir.path(), &samples).expect("render");
        assert_eq!(paths.len(), NUM_CHANNELS);
        assert!(dir.path().join("overlay/A+_IGBT-I.png").exists());
    }

    #[test]
    fn test_render_reconstruction_rejects_mismatched_lengths() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let original = wave(100, 0.0);
        let recon = wave(90, 0.0);
        assert!(matches!(
            render_reconstruction(dir.path(), Subsystem::Scl, &original.view(), &recon.view()),
            Err(FigureError::LengthMismatch)
        ));
    }

    #[test]
    fn test_render_flat_series_does_not_panic() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let flat = Array2::zeros((50, NUM_CHANNELS));
        render_channel_averages(dir.path(), Subsystem::Dtl, &flat.view()).expect("render");
    }
}
