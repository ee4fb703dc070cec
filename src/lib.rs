//! # fieldtrip-rs
//!
//! Async Rust client for FieldTrip-style real-time acquisition buffers —
//! the streaming interface served by `neuromag2ft` and compatible MEG/EEG
//! acquisition bridges — with blocking epoch extraction and Welch
//! power-spectral-density estimation on top.
//!
//! ## Quick start
//!
//! ```no_run
//! use fieldtrip_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = RtClient::new(RtClientConfig::default());
//!     let mut session = client.connect().await?;
//!
//!     let info = session.get_measurement_info().await?;
//!     let picks = select_channels(
//!         &info,
//!         &Selector {
//!             gradiometers: true,
//!             eog: true,
//!             exclude: vec!["MEG 2443".into(), "EEG 053".into()],
//!             ..Default::default()
//!         },
//!     )?;
//!
//!     let epoch = session.get_epoch(2048, &picks).await?;
//!     let psd = welch_psd(&epoch, &PsdConfig::new(2.0, 200.0, 256))?;
//!     println!("{} channels × {} bins", psd.n_channels(), psd.n_freqs());
//!
//!     session.close();
//!     Ok(())
//! }
//! ```
//!
//! The session owns a background reader task that pumps arriving sample
//! blocks into a bounded ring; [`client::RtSession::get_epoch`] suspends
//! until the requested window is complete and never returns a short one.
//! Closing the session — explicitly or by dropping it — wakes any pending
//! retrieval with [`Error::SessionClosed`].
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the commonly needed types |
//! | [`client`] | Connecting, header retrieval, and blocking epoch retrieval |
//! | [`types`] | Measurement info, channel selection, epochs, PSD results |
//! | [`psd`] | Welch PSD estimation over epochs |
//! | [`sink`] | Visualization sink interface and the terminal text sink |
//! | [`protocol`] | Buffer-protocol constants and message framing |
//! | [`parse`] | Low-level binary decoders for protocol messages |
//! | [`server`] | Loopback buffer server for simulators and tests |
//! | [`error`] | The error taxonomy |

mod buffer;

pub mod client;
pub mod error;
pub mod parse;
pub mod protocol;
pub mod psd;
pub mod server;
pub mod sink;
pub mod types;

pub use error::{Error, Result};

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
///
/// A single glob import covers connecting, channel selection, epoch
/// retrieval, and spectral estimation:
///
/// ```no_run
/// use fieldtrip_rs::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let mut session = RtClient::new(RtClientConfig::default()).connect().await?;
/// let info = session.get_measurement_info().await?;
/// let picks = select_channels(&info, &Selector { eeg: true, ..Default::default() })?;
/// let epoch = session.get_epoch(1024, &picks).await?;
/// let psd = welch_psd(&epoch, &PsdConfig::new(2.0, 40.0, 256))?;
/// # let _ = psd;
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    // ── Client ────────────────────────────────────────────────────────────────
    pub use crate::client::{CloseHandle, RtClient, RtClientConfig, RtSession};

    // ── Data model ────────────────────────────────────────────────────────────
    pub use crate::types::{
        select_channels, ChannelKind, ChannelSelection, Epoch, MeasurementInfo, PsdResult,
        Selector, SessionState,
    };

    // ── Estimation and presentation ───────────────────────────────────────────
    pub use crate::psd::{welch_psd, PsdConfig};
    pub use crate::sink::{PsdSink, TextSink};

    // ── Errors ────────────────────────────────────────────────────────────────
    pub use crate::error::{Error, Result};
}
