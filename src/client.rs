use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::buffer::{Extraction, SampleRing};
use crate::error::{Error, Result};
use crate::parse::{
    decode_data_block, decode_header_block, decode_message_def, decode_wait_payload,
};
use crate::protocol::{
    get_dat_request, get_hdr_request, wait_dat_request, MessageDef, DEFAULT_PORT, GET_ERR, GET_OK,
    WAIT_OK,
};
use crate::types::{ChannelSelection, Epoch, MeasurementInfo, SessionState};

// ── RtClientConfig ────────────────────────────────────────────────────────────

/// Configuration for [`RtClient`].
#[derive(Debug, Clone)]
pub struct RtClientConfig {
    /// Acquisition server host. Default: `"localhost"`.
    pub host: String,
    /// Acquisition server port. Default: `1972` (the `neuromag2ft` port).
    pub port: u16,
    /// Seconds to wait for the TCP connection before giving up.
    /// Default: `5`.
    pub connect_timeout_secs: u64,
    /// Seconds [`RtSession::get_measurement_info`] keeps polling for a
    /// header before failing — acquisition bridges publish theirs a moment
    /// after they start. Default: `5`.
    pub wait_max_secs: u64,
    /// Sample history retained client-side, in seconds of signal.
    /// Bounds the largest retrievable epoch. Default: `60.0`.
    pub buffer_secs: f32,
    /// Server-side wait timeout per reader poll, in milliseconds.
    /// Also bounds how long shutdown can lag behind a quiet stream.
    /// Default: `250`.
    pub poll_interval_ms: u32,
}

impl Default for RtClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            connect_timeout_secs: 5,
            wait_max_secs: 5,
            buffer_secs: 60.0,
            poll_interval_ms: 250,
        }
    }
}

// ── Shared reader/retriever state ─────────────────────────────────────────────

/// State shared between the reader task, epoch retrieval, and close
/// handles.
///
/// The ring exists once the header has been retrieved; only the reader
/// mutates it, and retrieval drains windows under the same lock. `closed`
/// flips exactly once, after which every pending and future retrieval
/// fails with [`Error::SessionClosed`].
struct Shared {
    ring: Mutex<Option<SampleRing>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Shared {
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Clonable handle that closes a session from anywhere — including while
/// that session is suspended inside [`RtSession::get_epoch`], whose
/// `&mut` borrow would otherwise make cancellation impossible.
#[derive(Clone)]
pub struct CloseHandle {
    shared: Arc<Shared>,
}

impl CloseHandle {
    /// Close the session: idempotent, wakes any pending retrieval with
    /// [`Error::SessionClosed`].
    pub fn close(&self) {
        self.shared.close();
    }
}

// ── RtClient ──────────────────────────────────────────────────────────────────

/// Connector for FieldTrip-style real-time acquisition buffers.
///
/// `RtClient` only holds configuration; [`RtClient::connect`] produces an
/// [`RtSession`] that owns the transport. The usual flow mirrors a live
/// acquisition run:
///
/// ```no_run
/// use fieldtrip_rs::prelude::*;
///
/// # async fn run() -> fieldtrip_rs::Result<()> {
/// let mut session = RtClient::new(RtClientConfig::default()).connect().await?;
/// let info = session.get_measurement_info().await?;
/// let picks = select_channels(&info, &Selector { eeg: true, ..Default::default() })?;
/// let epoch = session.get_epoch(2048, &picks).await?;
/// session.close();
/// # Ok(())
/// # }
/// ```
pub struct RtClient {
    config: RtClientConfig,
}

impl RtClient {
    pub fn new(config: RtClientConfig) -> Self {
        Self { config }
    }

    /// Open a session to the configured server.
    ///
    /// Refused attempts are retried until `connect_timeout_secs` runs out,
    /// since acquisition bridges typically bind their listener a moment
    /// after they are launched. Fails with [`Error::Connection`] when no
    /// attempt succeeds within the budget.
    pub async fn connect(&self) -> Result<RtSession> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("connecting to acquisition server at {addr} …");

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.connect_timeout_secs);
        let stream = loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(stream)) => break stream,
                Ok(Err(e)) => {
                    debug!("connect attempt failed: {e}");
                    if tokio::time::Instant::now() + Duration::from_millis(250) >= deadline {
                        return Err(Error::Connection {
                            host: self.config.host.clone(),
                            port: self.config.port,
                            reason: e.to_string(),
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                Err(_) => {
                    return Err(Error::Connection {
                        host: self.config.host.clone(),
                        port: self.config.port,
                        reason: format!("no answer within {} s", self.config.connect_timeout_secs),
                    })
                }
            }
        };
        stream.set_nodelay(true).ok();
        info!("connected to {addr}");

        Ok(RtSession {
            config: self.config.clone(),
            conn: Some(stream),
            info: None,
            shared: Arc::new(Shared {
                ring: Mutex::new(None),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
            reader: None,
            state: SessionState::Connected,
        })
    }
}

// ── RtSession ─────────────────────────────────────────────────────────────────

/// A live session against an acquisition server.
///
/// Retrieval methods take `&mut self`, so a single in-flight epoch request
/// per session is enforced at compile time. Dropping the session closes it;
/// [`RtSession::close`] does the same explicitly and is idempotent.
pub struct RtSession {
    config: RtClientConfig,
    /// Transport, held here until the reader task takes it over.
    conn: Option<TcpStream>,
    info: Option<MeasurementInfo>,
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
    state: SessionState,
}

impl RtSession {
    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        if self.shared.is_closed() {
            SessionState::Closed
        } else {
            self.state
        }
    }

    /// A handle that can close this session from another task, e.g. while
    /// an epoch retrieval is in flight.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Retrieve the measurement info, polling the server for up to
    /// `wait_max_secs` until it has published a header.
    ///
    /// The first successful retrieval is cached (the info never changes
    /// within a session) and starts the background reader; later calls
    /// return the cached snapshot. Must be called before
    /// [`RtSession::get_epoch`].
    pub async fn get_measurement_info(&mut self) -> Result<MeasurementInfo> {
        if let Some(info) = &self.info {
            return Ok(info.clone());
        }
        if self.state() == SessionState::Closed {
            return Err(Error::SessionClosed);
        }
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| Error::protocol("transport already handed to the reader"))?;

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.wait_max_secs);
        let header = loop {
            conn.write_all(&get_hdr_request())
                .await
                .map_err(|e| Error::protocol(format!("transport error: {e}")))?;
            let (def, payload) = read_message(&mut conn, Some(deadline)).await?;
            match def.command {
                GET_OK => break decode_header_block(&payload)?,
                GET_ERR => {
                    // No header yet — the producer has not started.
                    debug!("server has no header yet, retrying …");
                    if tokio::time::Instant::now() + Duration::from_millis(100) >= deadline {
                        return Err(Error::protocol(format!(
                            "server produced no header within {} s",
                            self.config.wait_max_secs
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected response 0x{other:04x} to header request"
                    )))
                }
            }
        };

        let info = MeasurementInfo::from_header(&header);
        info!(
            "header: {} channels at {} Hz, {} samples already buffered",
            info.nchan(),
            info.sfreq(),
            header.nsamples
        );

        let capacity = (self.config.buffer_secs * info.sfreq()).ceil() as usize;
        *self.shared.ring.lock().unwrap() = Some(SampleRing::new(
            info.nchan(),
            capacity.max(1),
            u64::from(header.nsamples),
        ));

        self.reader = Some(tokio::spawn(reader_loop(
            conn,
            Arc::clone(&self.shared),
            u64::from(header.nsamples),
            self.config.poll_interval_ms,
        )));
        self.info = Some(info.clone());
        Ok(info)
    }

    /// Block until a full `n_samples`-long window is available for the
    /// selected channels and return it as an [`Epoch`].
    ///
    /// Never returns a short window: the call suspends while the buffer
    /// accumulates and is woken by the reader on every arriving block. The
    /// epoch's channel axis follows the selection order. Closing the
    /// session (or losing the transport) while the call is suspended fails
    /// it promptly with [`Error::SessionClosed`].
    pub async fn get_epoch(
        &mut self,
        n_samples: usize,
        channels: &ChannelSelection,
    ) -> Result<Epoch> {
        let info = self
            .info
            .clone()
            .ok_or_else(|| Error::protocol("measurement info must be retrieved first"))?;
        let shared = Arc::clone(&self.shared);

        loop {
            // Arm the wakeup before checking, so an append or close landing
            // between the check and the await cannot be missed.
            let notified = shared.notify.notified();

            if shared.is_closed() {
                return Err(Error::SessionClosed);
            }
            {
                let mut guard = shared.ring.lock().unwrap();
                let ring = guard
                    .as_mut()
                    .ok_or_else(|| Error::protocol("measurement info must be retrieved first"))?;
                match ring.extract(n_samples, channels.indices())? {
                    Extraction::Ready { start_sample, data } => {
                        return Ok(Epoch {
                            start_sample,
                            sfreq: info.sfreq(),
                            channel_names: channels.names().to_vec(),
                            data,
                        });
                    }
                    Extraction::Accumulating => {}
                }
            }
            notified.await;
        }
    }

    /// Close the session.
    ///
    /// Idempotent and safe to call at any point, including after a
    /// transport failure: wakes any pending retrieval with
    /// [`Error::SessionClosed`], stops the reader task, and drops the
    /// socket. Dropping the session calls this automatically.
    pub fn close(&mut self) {
        self.shared.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.conn = None;
        if self.state != SessionState::Closed {
            info!("session closed");
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for RtSession {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Reader task ───────────────────────────────────────────────────────────────

/// Pump the transport: wait server-side for fresh samples, fetch each new
/// range exactly once, and append it to the ring in arrival order.
///
/// Any transport or protocol failure is terminal — the session fails
/// closed, waking every pending retrieval. Gap recovery is intentionally
/// absent: a server that discarded samples we have not fetched yet counts
/// as a failure too.
async fn reader_loop(mut conn: TcpStream, shared: Arc<Shared>, start: u64, poll_ms: u32) {
    let mut seen = start;

    let outcome: Result<()> = async {
        loop {
            if shared.is_closed() {
                return Ok(());
            }

            conn.write_all(&wait_dat_request(seen as u32, 0, poll_ms))
                .await
                .map_err(|e| Error::protocol(format!("transport error: {e}")))?;
            let (def, payload) = read_message(&mut conn, None).await?;
            if def.command != WAIT_OK {
                return Err(Error::protocol(format!(
                    "unexpected response 0x{:04x} to sample wait",
                    def.command
                )));
            }
            let (nsamples, _nevents) = decode_wait_payload(&payload)?;
            let nsamples = u64::from(nsamples);
            if nsamples <= seen {
                continue; // poll timed out with nothing new
            }

            conn.write_all(&get_dat_request(seen as u32, (nsamples - 1) as u32))
                .await
                .map_err(|e| Error::protocol(format!("transport error: {e}")))?;
            let (def, payload) = read_message(&mut conn, None).await?;
            match def.command {
                GET_OK => {
                    let block = decode_data_block(&payload)?;
                    let mut guard = shared.ring.lock().unwrap();
                    let ring = guard
                        .as_mut()
                        .ok_or_else(|| Error::protocol("reader started before the ring"))?;
                    if block.nchans as usize != ring.nchans() {
                        return Err(Error::protocol(format!(
                            "data block has {} channels, header declared {}",
                            block.nchans,
                            ring.nchans()
                        )));
                    }
                    ring.append_interleaved(&block.samples)?;
                    debug!(
                        "appended {} samples (total {})",
                        block.nsamples,
                        ring.total()
                    );
                }
                GET_ERR => {
                    // The requested range is gone from the server: a stream
                    // gap we do not attempt to bridge.
                    return Err(Error::protocol(format!(
                        "server discarded samples {seen}..{nsamples} before they were read"
                    )));
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected response 0x{other:04x} to sample request"
                    )));
                }
            }
            seen = nsamples;
            shared.notify.notify_waiters();
        }
    }
    .await;

    if let Err(e) = outcome {
        warn!("stream reader stopped: {e}");
    }
    shared.close();
}

// ── Transport helpers ─────────────────────────────────────────────────────────

/// Read one complete protocol message (envelope + payload).
///
/// With a `deadline`, expiry maps to [`Error::Protocol`] — used while
/// polling for the header, where the caller promised `wait_max`.
async fn read_message(
    conn: &mut TcpStream,
    deadline: Option<tokio::time::Instant>,
) -> Result<(MessageDef, Vec<u8>)> {
    let read = async {
        let mut envelope = [0u8; 8];
        conn.read_exact(&mut envelope)
            .await
            .map_err(|e| Error::protocol(format!("transport error: {e}")))?;
        let def = decode_message_def(&envelope)?;
        let mut payload = vec![0u8; def.bufsize as usize];
        conn.read_exact(&mut payload)
            .await
            .map_err(|e| Error::protocol(format!("transport error: {e}")))?;
        Ok((def, payload))
    };

    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, read)
            .await
            .map_err(|_| Error::protocol("timed out waiting for a server response"))?,
        None => read.await,
    }
}
