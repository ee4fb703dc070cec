use crate::error::{Error, Result};
use crate::parse::HeaderBlock;

// ── Session state ─────────────────────────────────────────────────────────────

/// Lifecycle state of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport established (only observable before `connect` returns).
    Disconnected,
    /// Transport is up; header retrieval and epoch retrieval are allowed.
    Connected,
    /// Closed by the caller or by a transport failure. Terminal.
    Closed,
}

// ── Channel kinds ─────────────────────────────────────────────────────────────

/// Channel modality, guessed from the channel name.
///
/// The buffer protocol's header carries no channel-type information, so the
/// kind is inferred from Neuromag-style names:
///
/// | Name pattern | Kind |
/// |---|---|
/// | `MEG …1` | `Magnetometer` |
/// | `MEG …2` / `MEG …3` | `Gradiometer` |
/// | `EEG …` | `Eeg` |
/// | `EOG …` | `Eog` |
/// | `ECG …` | `Ecg` |
/// | `STI …` | `Stim` |
/// | anything else | `Misc` |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Gradiometer,
    Magnetometer,
    Eeg,
    Eog,
    Ecg,
    Stim,
    Misc,
}

impl ChannelKind {
    /// Guess the kind from a channel name.
    pub fn from_name(name: &str) -> Self {
        let upper = name.to_ascii_uppercase();
        if upper.starts_with("MEG") {
            // Neuromag convention: the trailing digit distinguishes the
            // magnetometer (1) from the two planar gradiometers (2, 3).
            return match name.trim_end().chars().last() {
                Some('1') => ChannelKind::Magnetometer,
                Some('2') | Some('3') => ChannelKind::Gradiometer,
                _ => ChannelKind::Misc,
            };
        }
        if upper.starts_with("EEG") {
            ChannelKind::Eeg
        } else if upper.starts_with("EOG") {
            ChannelKind::Eog
        } else if upper.starts_with("ECG") {
            ChannelKind::Ecg
        } else if upper.starts_with("STI") {
            ChannelKind::Stim
        } else {
            ChannelKind::Misc
        }
    }
}

// ── Measurement info ──────────────────────────────────────────────────────────

/// Immutable snapshot of the acquisition setup, retrieved once per session.
///
/// Invariant: does not change for the lifetime of the session — the client
/// caches the first successful retrieval and never re-reads it.
#[derive(Debug, Clone)]
pub struct MeasurementInfo {
    channel_names: Vec<String>,
    kinds: Vec<ChannelKind>,
    sfreq: f32,
}

impl MeasurementInfo {
    /// Build an info snapshot from explicit names and a sampling rate,
    /// guessing each channel's kind from its name.
    pub fn new(channel_names: Vec<String>, sfreq: f32) -> Self {
        let kinds = channel_names
            .iter()
            .map(|n| ChannelKind::from_name(n))
            .collect();
        Self {
            channel_names,
            kinds,
            sfreq,
        }
    }

    /// Build from a decoded header, generating `ch0..chN-1` placeholder
    /// names when the server did not send a names chunk.
    pub(crate) fn from_header(header: &HeaderBlock) -> Self {
        let names = if header.channel_names.is_empty() {
            (0..header.nchans).map(|i| format!("ch{i}")).collect()
        } else {
            header.channel_names.clone()
        };
        Self::new(names, header.fsample)
    }

    /// Number of channels in the stream.
    pub fn nchan(&self) -> usize {
        self.channel_names.len()
    }

    /// Sampling frequency in Hz.
    pub fn sfreq(&self) -> f32 {
        self.sfreq
    }

    /// Channel names in server (native) order.
    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    /// Guessed kind of channel `idx`.
    pub fn kind(&self, idx: usize) -> Option<ChannelKind> {
        self.kinds.get(idx).copied()
    }
}

// ── Channel selection ─────────────────────────────────────────────────────────

/// Criteria for building a [`ChannelSelection`] from a [`MeasurementInfo`].
///
/// All kind flags default to `false`; enable the modalities you want.
/// `include` adds channels by exact name regardless of kind; `exclude`
/// removes by exact name and wins over everything else. The exclusion list
/// is caller-supplied because the server's metadata does not mark bad
/// channels itself.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    pub gradiometers: bool,
    pub magnetometers: bool,
    pub eeg: bool,
    pub eog: bool,
    pub ecg: bool,
    pub stim: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// An ordered set of channel indices into the native stream.
///
/// The order of `indices` is the order of the channel axis in every epoch
/// retrieved with this selection.
#[derive(Debug, Clone)]
pub struct ChannelSelection {
    indices: Vec<usize>,
    names: Vec<String>,
}

impl ChannelSelection {
    /// Build a selection from explicit native indices, preserving their
    /// order. Fails when an index is out of range or duplicated.
    pub fn from_indices(info: &MeasurementInfo, indices: Vec<usize>) -> Result<Self> {
        if indices.is_empty() {
            return Err(Error::invalid("channel selection is empty"));
        }
        let mut seen = vec![false; info.nchan()];
        let mut names = Vec::with_capacity(indices.len());
        for &idx in &indices {
            let name = info
                .channel_names()
                .get(idx)
                .ok_or_else(|| Error::invalid(format!("channel index {idx} out of range")))?;
            if std::mem::replace(&mut seen[idx], true) {
                return Err(Error::invalid(format!("channel index {idx} selected twice")));
            }
            names.push(name.clone());
        }
        Ok(Self { indices, names })
    }

    /// Native channel indices, in selection order.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Channel names, in selection order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Build a [`ChannelSelection`] from kind flags plus include/exclude name
/// sets, in native channel order.
///
/// Fails with [`Error::InvalidParameter`] when nothing matches — an empty
/// selection can never produce a usable epoch.
pub fn select_channels(info: &MeasurementInfo, selector: &Selector) -> Result<ChannelSelection> {
    let wanted_kind = |kind: ChannelKind| match kind {
        ChannelKind::Gradiometer => selector.gradiometers,
        ChannelKind::Magnetometer => selector.magnetometers,
        ChannelKind::Eeg => selector.eeg,
        ChannelKind::Eog => selector.eog,
        ChannelKind::Ecg => selector.ecg,
        ChannelKind::Stim => selector.stim,
        ChannelKind::Misc => false,
    };

    let indices: Vec<usize> = info
        .channel_names()
        .iter()
        .enumerate()
        .filter(|(idx, name)| {
            if selector.exclude.iter().any(|e| e == *name) {
                return false;
            }
            selector.include.iter().any(|i| i == *name)
                || info.kind(*idx).map(wanted_kind).unwrap_or(false)
        })
        .map(|(idx, _)| idx)
        .collect();

    if indices.is_empty() {
        return Err(Error::invalid("channel selection matched no channels"));
    }
    ChannelSelection::from_indices(info, indices)
}

// ── Epoch ─────────────────────────────────────────────────────────────────────

/// A fixed-length window of multichannel samples extracted from the stream.
///
/// Invariants:
/// * every channel holds exactly the requested number of samples;
/// * the channel axis follows the selection order used to retrieve it;
/// * `start_sample` is the absolute index (since acquisition start) of the
///   first sample in the window.
#[derive(Debug, Clone)]
pub struct Epoch {
    pub start_sample: u64,
    pub sfreq: f32,
    /// Channel names in selection order.
    pub channel_names: Vec<String>,
    /// Channel-major samples: `data[ch][t]`.
    pub data: Vec<Vec<f32>>,
}

impl Epoch {
    pub fn n_channels(&self) -> usize {
        self.data.len()
    }

    pub fn n_samples(&self) -> usize {
        self.data.first().map(Vec::len).unwrap_or(0)
    }

    /// Start of the window in seconds since acquisition start.
    pub fn tmin(&self) -> f32 {
        self.start_sample as f32 / self.sfreq
    }

    /// End of the window in seconds since acquisition start.
    pub fn tmax(&self) -> f32 {
        (self.start_sample + self.n_samples() as u64) as f32 / self.sfreq
    }
}

// ── PSD result ────────────────────────────────────────────────────────────────

/// Per-channel power spectral density over a common frequency axis.
///
/// Invariant: `freqs` is strictly increasing and bounded by the `[fmin,
/// fmax]` the estimate was requested with; `power[ch].len() == freqs.len()`
/// for every channel.
#[derive(Debug, Clone)]
pub struct PsdResult {
    /// Frequency bin centres in Hz, ascending.
    pub freqs: Vec<f32>,
    /// Power density per channel and bin: `power[ch][bin]`.
    pub power: Vec<Vec<f32>>,
}

impl PsdResult {
    pub fn n_channels(&self) -> usize {
        self.power.len()
    }

    pub fn n_freqs(&self) -> usize {
        self.freqs.len()
    }
}
