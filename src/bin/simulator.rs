//! Companion data-producing process.
//!
//! Serves a FieldTrip-style buffer on a local port while streaming either
//! a CSV recording or a built-in synthetic signal into it:
//!
//! ```text
//! cargo run --bin ft-simulator                          # synthetic, 600 Hz
//! cargo run --bin ft-simulator -- --file rec.csv --speed 10
//! ```
//!
//! CSV input: header row = channel names, one row of values per sample.
//! Playback loops when the file runs out. `--speed` multiplies the pacing
//! (10 = ten times faster than real time); the nominal rate comes from
//! `--sfreq`. The process runs until it is terminated (or Ctrl-C).

use std::f32::consts::PI;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use fieldtrip_rs::protocol::DEFAULT_PORT;
use fieldtrip_rs::server::BufferServer;

/// Frames pushed per block. At 600 Hz and speed 1 a block lands every
/// ~53 ms, comparable to a real acquisition bridge's packet cadence.
const BLOCK_FRAMES: usize = 32;

// ── CLI options ───────────────────────────────────────────────────────────────

struct Options {
    port: u16,
    speed: f32,
    sfreq: f32,
    file: Option<PathBuf>,
}

impl Options {
    fn parse() -> Result<Self> {
        let mut opts = Options {
            port: DEFAULT_PORT,
            speed: 1.0,
            sfreq: 600.0,
            file: None,
        };
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            let mut value = || {
                args.next()
                    .with_context(|| format!("{arg} expects a value"))
            };
            match arg.as_str() {
                "--port" => opts.port = value()?.parse().context("--port expects a number")?,
                "--speed" => opts.speed = value()?.parse().context("--speed expects a number")?,
                "--sfreq" => opts.sfreq = value()?.parse().context("--sfreq expects a number")?,
                "--file" => opts.file = Some(PathBuf::from(value()?)),
                other => bail!("unknown option: {other}"),
            }
        }
        if opts.speed <= 0.0 || opts.sfreq <= 0.0 {
            bail!("--speed and --sfreq must be positive");
        }
        Ok(opts)
    }
}

// ── Synthetic signal ──────────────────────────────────────────────────────────

/// Neuromag-style channel set: gradiometer/magnetometer triplets, a few
/// EEG electrodes, one EOG, one stimulus channel. `MEG 2443` and `EEG 053`
/// are deliberately noisy so exclusion lists have something to exclude.
fn synthetic_channels() -> Vec<String> {
    let mut names = Vec::new();
    for block in ["011", "012", "013", "021", "022", "023", "244"] {
        for unit in 1..=3 {
            names.push(format!("MEG {block}{unit}"));
        }
    }
    for id in ["001", "002", "003", "053"] {
        names.push(format!("EEG {id}"));
    }
    names.push("EOG 061".into());
    names.push("STI 014".into());
    names
}

/// One synthetic sample: phase-shifted alpha/beta/theta mixture with
/// deterministic pseudo-noise, so repeated runs produce identical data.
fn sim_sample(t: f32, ch: usize, name: &str) -> f32 {
    if name.starts_with("STI") {
        // 1 Hz trigger train.
        return if (t.fract()) < 0.05 { 5.0 } else { 0.0 };
    }
    let phi = ch as f32 * PI / 2.5;
    let alpha = 20.0 * (2.0 * PI * 10.0 * t + phi).sin();
    let beta = 6.0 * (2.0 * PI * 22.0 * t + phi * 1.7).sin();
    let theta = 10.0 * (2.0 * PI * 6.0 * t + phi * 0.9).sin();
    let nx = t * 1000.7 + ch as f32 * 137.508;
    let mut noise = ((nx.sin() * 9973.1).fract() - 0.5) * 8.0;
    if name == "MEG 2443" || name == "EEG 053" {
        noise *= 40.0; // the designated bad channels
    }
    alpha + beta + theta + noise
}

// ── CSV playback ──────────────────────────────────────────────────────────────

/// Load a whole recording: header row as channel names, then one row of
/// values per sample.
fn load_recording(path: &Path) -> Result<(Vec<String>, Vec<Vec<f32>>)> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("cannot open {}", path.display()))?;
    let names: Vec<String> = reader
        .headers()
        .context("recording has no header row")?
        .iter()
        .map(str::to_owned)
        .collect();
    if names.is_empty() {
        bail!("recording declares no channels");
    }

    let mut frames = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("bad record at row {}", row + 2))?;
        if record.len() != names.len() {
            bail!(
                "row {} has {} values for {} channels",
                row + 2,
                record.len(),
                names.len()
            );
        }
        let frame = record
            .iter()
            .map(|v| v.trim().parse::<f32>())
            .collect::<std::result::Result<Vec<f32>, _>>()
            .with_context(|| format!("non-numeric value at row {}", row + 2))?;
        frames.push(frame);
    }
    if frames.is_empty() {
        bail!("recording contains no samples");
    }
    Ok((names, frames))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Options::parse()?;

    let recording = match &opts.file {
        Some(path) => {
            let (names, frames) = load_recording(path)?;
            info!(
                "loaded {}: {} channels × {} samples",
                path.display(),
                names.len(),
                frames.len()
            );
            Some((names, frames))
        }
        None => None,
    };
    let names = recording
        .as_ref()
        .map(|(names, _)| names.clone())
        .unwrap_or_else(synthetic_channels);

    let (server, publisher) = BufferServer::bind(&format!("127.0.0.1:{}", opts.port))
        .await
        .with_context(|| format!("cannot bind port {}", opts.port))?;
    info!(
        "serving {} channels at {} Hz on {} (speed ×{})",
        names.len(),
        opts.sfreq,
        server.local_addr()?,
        opts.speed
    );
    tokio::spawn(server.serve());

    publisher.set_header(names.clone(), opts.sfreq);

    // Pace blocks at the accelerated sample rate.
    let block_interval = Duration::from_secs_f32(BLOCK_FRAMES as f32 / (opts.sfreq * opts.speed));
    let mut ticker = tokio::time::interval(block_interval);
    let nchans = names.len();
    let mut frame_index: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping after {frame_index} samples");
                return Ok(());
            }
        }

        let mut block = Vec::with_capacity(BLOCK_FRAMES * nchans);
        for i in 0..BLOCK_FRAMES {
            let index = frame_index + i as u64;
            match &recording {
                Some((_, frames)) => {
                    block.extend_from_slice(&frames[(index as usize) % frames.len()]);
                }
                None => {
                    let t = index as f32 / opts.sfreq;
                    block.extend((0..nchans).map(|ch| sim_sample(t, ch, &names[ch])));
                }
            }
        }
        if !publisher.append(&block) {
            warn!("block dropped before header was set");
        }
        frame_index += BLOCK_FRAMES as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn recording_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "EEG 001,EEG 002").unwrap();
        writeln!(file, "1.0,2.0").unwrap();
        writeln!(file, "3.5,-4.25").unwrap();
        file.flush().unwrap();

        let (names, frames) = load_recording(file.path()).unwrap();
        assert_eq!(names, vec!["EEG 001".to_string(), "EEG 002".into()]);
        assert_eq!(frames, vec![vec![1.0, 2.0], vec![3.5, -4.25]]);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "a,b,c").unwrap();
        writeln!(file, "1.0,2.0").unwrap();
        file.flush().unwrap();
        assert!(load_recording(file.path()).is_err());
    }

    #[test]
    fn synthetic_set_includes_the_designated_bads() {
        let names = synthetic_channels();
        assert!(names.iter().any(|n| n == "MEG 2443"));
        assert!(names.iter().any(|n| n == "EEG 053"));
        assert!(names.iter().any(|n| n == "STI 014"));
    }

    #[test]
    fn synthetic_signal_is_deterministic() {
        let a = sim_sample(1.2345, 3, "MEG 0221");
        let b = sim_sample(1.2345, 3, "MEG 0221");
        assert_eq!(a, b);
        // The bad channel is visibly noisier than its neighbours.
        let clean: f32 = (0..100)
            .map(|i| sim_sample(i as f32 / 600.0, 0, "MEG 0111").abs())
            .sum();
        let noisy: f32 = (0..100)
            .map(|i| sim_sample(i as f32 / 600.0, 0, "MEG 2443").abs())
            .sum();
        assert!(noisy > clean);
    }
}
