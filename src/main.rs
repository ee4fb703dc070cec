//! Real-time PSD demo.
//!
//! Spawns the companion `ft-simulator` process, connects to it, and
//! continuously estimates the power spectrum of the selected channels:
//!
//! ```text
//! cargo run --bin rt-psd                      # synthetic data, 5 frames
//! cargo run --bin rt-psd -- --file rec.csv --speed 10
//! ```
//!
//! The simulator is terminated on every exit path — normal completion,
//! errors, and panics alike.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use tokio::process::{Child, Command};

use fieldtrip_rs::prelude::*;
use fieldtrip_rs::protocol::DEFAULT_PORT;

// ── CLI options ───────────────────────────────────────────────────────────────

struct Options {
    host: String,
    port: u16,
    /// CSV recording for the simulator; synthetic data when absent.
    file: Option<PathBuf>,
    /// Playback speed factor handed to the simulator and used for pacing.
    speed: f32,
    frames: u32,
    /// Channels to exclude from analysis. The server's metadata cannot
    /// mark bad channels, so the list lives here.
    bads: Vec<String>,
    /// Simulator executable; looked up next to this binary first.
    simulator: String,
}

impl Options {
    fn parse() -> Result<Self> {
        let mut opts = Options {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            file: None,
            speed: 10.0,
            frames: 5,
            bads: vec![],
            simulator: "ft-simulator".into(),
        };
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            let mut value = || {
                args.next()
                    .with_context(|| format!("{arg} expects a value"))
            };
            match arg.as_str() {
                "--host" => opts.host = value()?,
                "--port" => opts.port = value()?.parse().context("--port expects a number")?,
                "--file" => opts.file = Some(PathBuf::from(value()?)),
                "--speed" => opts.speed = value()?.parse().context("--speed expects a number")?,
                "--frames" => {
                    opts.frames = value()?.parse().context("--frames expects a number")?
                }
                "--bad" => opts.bads.push(value()?),
                "--simulator" => opts.simulator = value()?,
                other => bail!("unknown option: {other}"),
            }
        }
        if opts.bads.is_empty() {
            // The channels the simulator marks noisy by default.
            opts.bads = vec!["MEG 2443".into(), "EEG 053".into()];
        }
        Ok(opts)
    }
}

// ── Simulator subprocess guard ────────────────────────────────────────────────

/// Running companion process, terminated when the guard is consumed or
/// dropped (`kill_on_drop` covers the panic and early-`?` paths).
struct RunningSimulator {
    child: Child,
}

impl RunningSimulator {
    fn spawn(opts: &Options) -> Result<Self> {
        // Prefer the simulator that was built alongside this binary.
        let program = std::env::current_exe()
            .ok()
            .and_then(|exe| {
                let sibling = exe.parent()?.join(&opts.simulator);
                sibling.exists().then_some(sibling)
            })
            .unwrap_or_else(|| PathBuf::from(&opts.simulator));

        let mut command = Command::new(&program);
        command
            .arg("--port")
            .arg(opts.port.to_string())
            .arg("--speed")
            .arg(opts.speed.to_string());
        if let Some(file) = &opts.file {
            command.arg("--file").arg(file);
        }
        let child = command
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", program.display()))?;
        info!("started {} (pid {:?})", program.display(), child.id());
        Ok(Self { child })
    }

    /// Explicit termination; the exit code is not inspected.
    async fn terminate(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("could not terminate simulator: {e}");
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=fieldtrip_rs=debug cargo run --bin rt-psd
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Options::parse()?;

    let simulator = RunningSimulator::spawn(&opts)?;

    // connect() retries while the subprocess binds its listener.
    let client = RtClient::new(RtClientConfig {
        host: opts.host.clone(),
        port: opts.port,
        ..Default::default()
    });

    // Teardown runs no matter how the streaming loop ends; dropping the
    // session and the guard would also clean up, but do it deliberately.
    let result = match client.connect().await {
        Ok(mut session) => {
            let outcome = stream_psd(&mut session, &opts).await;
            session.close();
            outcome
        }
        Err(e) => Err(e.into()),
    };
    simulator.terminate().await;
    result
}

/// The acquisition loop: pick channels, then epoch → PSD → sink.
async fn stream_psd(session: &mut RtSession, opts: &Options) -> Result<()> {
    let info = session.get_measurement_info().await?;
    info!(
        "measurement info: {} channels at {} Hz",
        info.nchan(),
        info.sfreq()
    );

    let picks = select_channels(
        &info,
        &Selector {
            gradiometers: true,
            eog: true,
            exclude: opts.bads.clone(),
            ..Default::default()
        },
    )?;
    info!("selected {} channels ({} excluded as bad)", picks.len(), opts.bads.len());

    let n_fft = 256; // segment size; ideally a power of two
    let n_samples = 2048; // window on which each spectrum is computed
    let psd_config = PsdConfig::new(2.0, 200.0, n_fft);
    let mut sink = TextSink::stdout();

    for _ in 0..opts.frames {
        let epoch = session.get_epoch(n_samples, &picks).await?;
        let psd = welch_psd(&epoch, &psd_config)?;
        sink.update(&psd, epoch.tmin(), epoch.tmax())?;

        // Pace the display against the accelerated playback.
        tokio::time::sleep(Duration::from_secs_f32(0.5 / opts.speed)).await;
    }

    info!("done: {} frames", sink.frames());
    Ok(())
}
