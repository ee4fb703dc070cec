//! Visualization sink interface.
//!
//! Rendering proper is out of scope for this crate; consumers hand each
//! `(PSD, tmin, tmax)` frame to a [`PsdSink`] and pace the loop themselves.
//! [`TextSink`] is the built-in implementation: one summary line per frame
//! on any writer, with all display state held explicitly in the sink value
//! rather than in globals.

use std::io::{self, Write};

use crate::types::PsdResult;

/// Classic EEG/MEG frequency bands summarised by [`TextSink`].
const BANDS: [(&str, f32, f32); 5] = [
    ("delta", 1.0, 4.0),
    ("theta", 4.0, 8.0),
    ("alpha", 8.0, 13.0),
    ("beta", 13.0, 30.0),
    ("gamma", 30.0, 80.0),
];

/// Consumer of successive PSD frames.
pub trait PsdSink {
    /// Present one frame covering `tmin..tmax` seconds of signal.
    fn update(&mut self, psd: &PsdResult, tmin: f32, tmax: f32) -> io::Result<()>;
}

/// Terminal sink: per-frame band-power summary lines.
///
/// Keeps its display state (frame counter, running power ceiling for the
/// bar gauge) in the value itself; the ceiling is pinned on the first
/// frame and only widens afterwards, so bars stay comparable across frames.
pub struct TextSink<W: Write> {
    out: W,
    frame: u64,
    ceiling_db: Option<f32>,
}

impl TextSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> TextSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            frame: 0,
            ceiling_db: None,
        }
    }

    /// Frames presented so far.
    pub fn frames(&self) -> u64 {
        self.frame
    }
}

impl<W: Write> PsdSink for TextSink<W> {
    fn update(&mut self, psd: &PsdResult, tmin: f32, tmax: f32) -> io::Result<()> {
        let mut line = format!("frame {:>3}  t = {tmin:7.2}–{tmax:7.2} s ", self.frame);

        let mut total_db = f32::MIN;
        for (name, lo, hi) in BANDS {
            let mut sum = 0.0f64;
            let mut count = 0usize;
            for (bin, &freq) in psd.freqs.iter().enumerate() {
                if freq >= lo && freq < hi {
                    for channel in &psd.power {
                        sum += f64::from(channel[bin]);
                    }
                    count += psd.n_channels();
                }
            }
            if count == 0 {
                line.push_str(&format!(" {name} ——— "));
                continue;
            }
            let db = 10.0 * ((sum / count as f64).max(1e-30)).log10() as f32;
            total_db = total_db.max(db);
            line.push_str(&format!(" {name} {db:6.1}"));
        }

        // First frame pins the gauge ceiling, like an initial clim.
        let ceiling = *self.ceiling_db.get_or_insert(total_db);
        if total_db > ceiling {
            self.ceiling_db = Some(total_db);
        }
        let filled = if total_db <= ceiling - 40.0 {
            0
        } else {
            (((total_db - (ceiling - 40.0)) / 40.0) * 10.0).round() as usize
        };
        line.push_str(&format!("  [{}{}]", "#".repeat(filled.min(10)), "-".repeat(10 - filled.min(10))));

        writeln!(self.out, "{line}")?;
        self.out.flush()?;
        self.frame += 1;
        Ok(())
    }
}
