//! In-process buffer server.
//!
//! [`BufferServer`] answers `GET_HDR` / `GET_DAT` / `WAIT_DAT` requests
//! from any number of loopback clients out of shared state that a
//! [`Publisher`] feeds in-process. The simulator binary publishes played
//! back or synthetic data through it, and the integration tests use it as
//! the synthetic stand-in for a real acquisition bridge.
//!
//! The store is sample-major and bounded: old frames are discarded once
//! [`DEFAULT_RETAIN_FRAMES`] is reached, while absolute sample indices keep
//! counting, so late `GET_DAT` requests for discarded ranges fail instead
//! of silently shifting.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::parse::{decode_message_def, decode_sample_range, decode_wait_request};
use crate::protocol::{
    data_response, error_response, header_response, wait_response, GET_DAT, GET_ERR, GET_HDR,
    WAIT_DAT, WAIT_ERR,
};

/// Frames retained before the oldest are discarded (~35 min at 600 Hz).
pub const DEFAULT_RETAIN_FRAMES: usize = 1 << 21;

// ── Shared state ─────────────────────────────────────────────────────────────

struct HeaderRecord {
    nchans: usize,
    fsample: f32,
    channel_names: Vec<String>,
}

struct Store {
    header: Option<HeaderRecord>,
    /// Interleaved sample-major values for the retained frame range.
    samples: VecDeque<f32>,
    /// Absolute index of the first retained frame.
    first_frame: u64,
    /// Absolute count of frames appended since the header was set.
    total_frames: u64,
    retain_frames: usize,
}

struct Shared {
    store: Mutex<Store>,
    /// Signalled on every append so pending WAIT_DAT handlers re-check.
    notify: Notify,
}

// ── Publisher ────────────────────────────────────────────────────────────────

/// Producing half of a [`BufferServer`].
///
/// Cheap to clone; all clones feed the same store.
#[derive(Clone)]
pub struct Publisher {
    shared: Arc<Shared>,
}

impl Publisher {
    /// Publish the acquisition header. Must be called before [`append`];
    /// clients polling `GET_HDR` succeed from this point on.
    ///
    /// [`append`]: Publisher::append
    pub fn set_header(&self, channel_names: Vec<String>, fsample: f32) {
        let mut store = self.shared.store.lock().unwrap();
        store.samples.clear();
        store.first_frame = 0;
        store.total_frames = 0;
        store.header = Some(HeaderRecord {
            nchans: channel_names.len(),
            fsample,
            channel_names,
        });
        drop(store);
        self.shared.notify.notify_waiters();
    }

    /// Append interleaved sample-major frames and wake waiting clients.
    ///
    /// Returns `false` (dropping the block) when no header is set or the
    /// value count does not divide into whole frames.
    pub fn append(&self, interleaved: &[f32]) -> bool {
        let mut store = self.shared.store.lock().unwrap();
        let nchans = match &store.header {
            Some(h) if h.nchans > 0 && interleaved.len() % h.nchans == 0 => h.nchans,
            _ => return false,
        };
        let frames = interleaved.len() / nchans;
        store.samples.extend(interleaved.iter().copied());
        store.total_frames += frames as u64;
        while store.samples.len() > store.retain_frames * nchans {
            for _ in 0..nchans {
                store.samples.pop_front();
            }
            store.first_frame += 1;
        }
        drop(store);
        self.shared.notify.notify_waiters();
        true
    }

    /// Absolute frame count appended so far.
    pub fn total_frames(&self) -> u64 {
        self.shared.store.lock().unwrap().total_frames
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

/// Accept loop half of the loopback buffer server.
pub struct BufferServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl BufferServer {
    /// Bind to `addr` (use port 0 to let the OS pick one) and return the
    /// server plus its publishing handle.
    pub async fn bind(addr: &str) -> io::Result<(Self, Publisher)> {
        let listener = TcpListener::bind(addr).await?;
        let shared = Arc::new(Shared {
            store: Mutex::new(Store {
                header: None,
                samples: VecDeque::new(),
                first_frame: 0,
                total_frames: 0,
                retain_frames: DEFAULT_RETAIN_FRAMES,
            }),
            notify: Notify::new(),
        });
        let publisher = Publisher {
            shared: Arc::clone(&shared),
        };
        Ok((Self { listener, shared }, publisher))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop forever, one task per client connection.
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("client connected from {peer}");
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, shared).await {
                            debug!("client {peer} dropped: {e}");
                        }
                    });
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

// ── Per-connection request loop ───────────────────────────────────────────────

async fn handle_client(mut stream: TcpStream, shared: Arc<Shared>) -> io::Result<()> {
    let mut envelope = [0u8; 8];
    loop {
        if stream.read_exact(&mut envelope).await.is_err() {
            return Ok(()); // normal disconnect
        }
        let def = match decode_message_def(&envelope) {
            Ok(def) => def,
            Err(e) => {
                debug!("bad envelope: {e}");
                return Ok(());
            }
        };
        let mut payload = vec![0u8; def.bufsize as usize];
        stream.read_exact(&mut payload).await?;

        let response = match def.command {
            GET_HDR => respond_header(&shared),
            GET_DAT => respond_data(&shared, &payload),
            WAIT_DAT => respond_wait(&shared, &payload).await,
            other => {
                debug!("unsupported command 0x{other:04x}");
                error_response(GET_ERR)
            }
        };
        stream.write_all(&response).await?;
    }
}

fn respond_header(shared: &Shared) -> Vec<u8> {
    let store = shared.store.lock().unwrap();
    match &store.header {
        Some(h) => header_response(
            h.nchans as u32,
            store.total_frames as u32,
            h.fsample,
            &h.channel_names,
        ),
        None => error_response(GET_ERR),
    }
}

fn respond_data(shared: &Shared, payload: &[u8]) -> Vec<u8> {
    let (beg, end) = match decode_sample_range(payload) {
        Ok(range) => range,
        Err(_) => return error_response(GET_ERR),
    };
    let store = shared.store.lock().unwrap();
    let nchans = match &store.header {
        Some(h) => h.nchans,
        None => return error_response(GET_ERR),
    };
    let (beg, end) = (beg as u64, end as u64);
    if beg > end || beg < store.first_frame || end >= store.total_frames {
        return error_response(GET_ERR);
    }

    let offset = ((beg - store.first_frame) as usize) * nchans;
    let len = ((end - beg + 1) as usize) * nchans;
    let values: Vec<f32> = store.samples.iter().skip(offset).take(len).copied().collect();
    data_response(nchans as u32, &values)
}

async fn respond_wait(shared: &Shared, payload: &[u8]) -> Vec<u8> {
    let (threshold, _nevents, timeout_ms) = match decode_wait_request(payload) {
        Ok(req) => req,
        Err(_) => return error_response(WAIT_ERR),
    };
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms as u64);

    loop {
        // Arm the notification before checking so an append between the
        // check and the await cannot be missed.
        let notified = shared.notify.notified();
        {
            let store = shared.store.lock().unwrap();
            if store.header.is_none() {
                return error_response(WAIT_ERR);
            }
            if store.total_frames > threshold as u64 {
                return wait_response(store.total_frames as u32, 0);
            }
        }
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep_until(deadline) => {
                let store = shared.store.lock().unwrap();
                return wait_response(store.total_frames as u32, 0);
            }
        }
    }
}

/// Convenience for demos and tests: bind on a loopback port, start serving
/// in a background task, and hand back the bound address and publisher.
pub async fn spawn_loopback() -> io::Result<(SocketAddr, Publisher)> {
    let (server, publisher) = BufferServer::bind("127.0.0.1:0").await?;
    let addr = server.local_addr()?;
    info!("buffer server listening on {addr}");
    tokio::spawn(server.serve());
    Ok((addr, publisher))
}
