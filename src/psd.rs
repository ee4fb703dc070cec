//! Welch power-spectral-density estimation over epochs.
//!
//! Hann-windowed segments of `n_fft` samples are averaged into a one-sided
//! density estimate per channel, then cropped to the requested frequency
//! band. Segment FFTs go through `rustfft`; one plan is shared across all
//! channels of an epoch.

use std::f32::consts::PI;

use rustfft::{num_complex::Complex32, FftPlanner};

use crate::error::{Error, Result};
use crate::types::{Epoch, PsdResult};

// ── Configuration ─────────────────────────────────────────────────────────────

/// Parameters for [`welch_psd`].
#[derive(Debug, Clone)]
pub struct PsdConfig {
    /// Lower frequency bound in Hz (inclusive).
    pub fmin: f32,
    /// Upper frequency bound in Hz (inclusive).
    pub fmax: f32,
    /// Segment length in samples. Must not exceed the epoch length.
    pub n_fft: usize,
    /// Overlap between consecutive segments in samples.
    /// `None` selects the 50 % default (`n_fft / 2`).
    pub n_overlap: Option<usize>,
}

impl PsdConfig {
    /// Estimate over `[fmin, fmax]` with the given segment length and the
    /// default 50 % overlap.
    pub fn new(fmin: f32, fmax: f32, n_fft: usize) -> Self {
        Self {
            fmin,
            fmax,
            n_fft,
            n_overlap: None,
        }
    }
}

// ── Estimator ─────────────────────────────────────────────────────────────────

/// Estimate the PSD of every channel in `epoch` using Welch's method.
///
/// The density scaling is `2 / (fs · Σw²)` on interior bins (DC and, for
/// even `n_fft`, Nyquist are not doubled), so a unit-amplitude sine spread
/// over enough segments integrates to ~0.5 regardless of `n_fft`.
///
/// Frequency filtering to `[fmin, fmax]` happens after estimation; the
/// returned frequency axis is strictly increasing and fully contained in
/// the requested band.
///
/// Fails with [`Error::InvalidParameter`] instead of producing a
/// wrong-shaped result when the configuration cannot be satisfied:
/// `n_fft` of zero or longer than the epoch, overlap at or beyond the
/// segment length, a negative or empty frequency band, or a band that
/// contains no FFT bins.
pub fn welch_psd(epoch: &Epoch, config: &PsdConfig) -> Result<PsdResult> {
    let n_samples = epoch.n_samples();
    let n_fft = config.n_fft;

    if n_fft == 0 {
        return Err(Error::invalid("n_fft must be at least one sample"));
    }
    if n_fft > n_samples {
        return Err(Error::invalid(format!(
            "n_fft ({n_fft}) exceeds the epoch length ({n_samples} samples)"
        )));
    }
    let n_overlap = config.n_overlap.unwrap_or(n_fft / 2);
    if n_overlap >= n_fft {
        return Err(Error::invalid(format!(
            "overlap ({n_overlap}) must be smaller than n_fft ({n_fft})"
        )));
    }
    if config.fmin < 0.0 || !(config.fmin < config.fmax) {
        return Err(Error::invalid(format!(
            "invalid frequency band [{}, {}]",
            config.fmin, config.fmax
        )));
    }

    let fs = epoch.sfreq;
    let n_bins = n_fft / 2 + 1;

    // Bin selection for the requested band, decided once up front so an
    // empty band fails before any FFT work happens.
    let bin_freq = |k: usize| k as f32 * fs / n_fft as f32;
    let kept: Vec<usize> = (0..n_bins)
        .filter(|&k| bin_freq(k) >= config.fmin && bin_freq(k) <= config.fmax)
        .collect();
    if kept.is_empty() {
        return Err(Error::invalid(format!(
            "band [{}, {}] Hz contains no FFT bins at {} Hz / n_fft {}",
            config.fmin, config.fmax, fs, n_fft
        )));
    }

    let window = hann_window(n_fft);
    let window_power: f32 = window.iter().map(|w| w * w).sum();
    let step = n_fft - n_overlap;
    let n_segments = 1 + (n_samples - n_fft) / step;

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(n_fft);
    let mut scratch = vec![Complex32::ZERO; n_fft];

    let power = epoch
        .data
        .iter()
        .map(|channel| {
            let mut acc = vec![0.0f32; n_bins];
            for seg in 0..n_segments {
                let start = seg * step;
                for (slot, (&v, &w)) in scratch
                    .iter_mut()
                    .zip(channel[start..start + n_fft].iter().zip(&window))
                {
                    *slot = Complex32::new(v * w, 0.0);
                }
                fft.process(&mut scratch);
                for (bin, slot) in acc.iter_mut().zip(&scratch) {
                    *bin += slot.norm_sqr();
                }
            }

            let base = 1.0 / (fs * window_power * n_segments as f32);
            kept.iter()
                .map(|&k| {
                    // One-sided density: interior bins carry both halves of
                    // the spectrum, DC and Nyquist only one.
                    let one_sided = if k == 0 || (n_fft % 2 == 0 && k == n_fft / 2) {
                        1.0
                    } else {
                        2.0
                    };
                    acc[k] * base * one_sided
                })
                .collect()
        })
        .collect();

    Ok(PsdResult {
        freqs: kept.iter().map(|&k| bin_freq(k)).collect(),
        power,
    })
}

/// Hann window of length `n`, matching the `0.5 (1 − cos)` form.
fn hann_window(n: usize) -> Vec<f32> {
    if n == 1 {
        return vec![1.0];
    }
    let denom = (n - 1) as f32;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / denom).cos()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_epoch(freq: f32, sfreq: f32, n_samples: usize, n_channels: usize) -> Epoch {
        let data = (0..n_channels)
            .map(|_| {
                (0..n_samples)
                    .map(|i| (2.0 * PI * freq * i as f32 / sfreq).sin())
                    .collect()
            })
            .collect();
        Epoch {
            start_sample: 0,
            sfreq,
            channel_names: (0..n_channels).map(|c| format!("ch{c}")).collect(),
            data,
        }
    }

    #[test]
    fn frequencies_stay_inside_the_requested_band() {
        let epoch = sine_epoch(40.0, 600.0, 2048, 3);
        let psd = welch_psd(&epoch, &PsdConfig::new(2.0, 200.0, 256)).unwrap();

        assert!(!psd.freqs.is_empty());
        assert!(psd.freqs.first().copied().unwrap() >= 2.0);
        assert!(psd.freqs.last().copied().unwrap() <= 200.0);
        assert!(psd.freqs.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(psd.n_channels(), 3);
        assert!(psd.power.iter().all(|ch| ch.len() == psd.n_freqs()));
    }

    #[test]
    fn sine_power_peaks_at_its_frequency() {
        // 32 Hz sine at 256 Hz with n_fft 256 → exactly bin 32.
        let epoch = sine_epoch(32.0, 256.0, 1024, 1);
        let psd = welch_psd(&epoch, &PsdConfig::new(1.0, 100.0, 256)).unwrap();

        let (peak_idx, _) = psd.power[0]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        assert!((psd.freqs[peak_idx] - 32.0).abs() < 1.0);
    }

    #[test]
    fn oversized_n_fft_is_rejected() {
        let epoch = sine_epoch(10.0, 256.0, 128, 1);
        let err = welch_psd(&epoch, &PsdConfig::new(1.0, 100.0, 256)).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn degenerate_configs_are_rejected() {
        let epoch = sine_epoch(10.0, 256.0, 512, 1);
        assert!(welch_psd(&epoch, &PsdConfig::new(1.0, 100.0, 0)).is_err());
        assert!(welch_psd(&epoch, &PsdConfig::new(100.0, 2.0, 256)).is_err());
        assert!(welch_psd(&epoch, &PsdConfig::new(-5.0, 100.0, 256)).is_err());
        let overlapped = PsdConfig {
            n_overlap: Some(256),
            ..PsdConfig::new(1.0, 100.0, 256)
        };
        assert!(welch_psd(&epoch, &overlapped).is_err());
        // Band entirely above Nyquist: no bins.
        assert!(welch_psd(&epoch, &PsdConfig::new(200.0, 400.0, 256)).is_err());
    }

    #[test]
    fn band_filtering_happens_after_estimation() {
        // The 32 Hz component must not leak into a band that excludes it,
        // and the narrow band must still be estimated from the full signal.
        let epoch = sine_epoch(32.0, 256.0, 1024, 1);
        let narrow = welch_psd(&epoch, &PsdConfig::new(60.0, 100.0, 256)).unwrap();
        let wide = welch_psd(&epoch, &PsdConfig::new(1.0, 100.0, 256)).unwrap();

        let narrow_max = narrow.power[0].iter().cloned().fold(0.0f32, f32::max);
        let wide_max = wide.power[0].iter().cloned().fold(0.0f32, f32::max);
        assert!(narrow_max < wide_max * 1e-3);
    }
}
