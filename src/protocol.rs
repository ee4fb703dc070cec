//! Wire constants and request/response framing for the FieldTrip-style
//! buffer protocol.
//!
//! Every message — request or response — starts with the same 8-byte
//! envelope ([`MessageDef`]), followed by `bufsize` payload bytes. All
//! integers and floats are little-endian.
//!
//! Only the subset of the protocol this client needs is implemented:
//! header retrieval, sample retrieval, and the blocking sample wait.
//! Event messages and the PUT side of the protocol are out of scope.

// ── Envelope ─────────────────────────────────────────────────────────────────

/// Protocol version carried in every envelope.
pub const VERSION: u16 = 1;

/// The 8-byte message envelope shared by requests and responses.
///
/// ```text
/// bytes 0-1 : protocol version (= 1)
/// bytes 2-3 : command code
/// bytes 4-7 : payload size in bytes
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageDef {
    pub version: u16,
    pub command: u16,
    pub bufsize: u32,
}

impl MessageDef {
    pub fn new(command: u16, bufsize: u32) -> Self {
        Self {
            version: VERSION,
            command,
            bufsize,
        }
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&self.version.to_le_bytes());
        out[2..4].copy_from_slice(&self.command.to_le_bytes());
        out[4..8].copy_from_slice(&self.bufsize.to_le_bytes());
        out
    }
}

// ── Command codes ─────────────────────────────────────────────────────────────

/// Request the acquisition header (channel count, rate, name chunk).
pub const GET_HDR: u16 = 0x201;
/// Request a sample range: payload is `begsample, endsample` (inclusive).
pub const GET_DAT: u16 = 0x202;
/// Successful GET response; payload is a header or data block.
pub const GET_OK: u16 = 0x204;
/// Failed GET response (most commonly: no header published yet).
pub const GET_ERR: u16 = 0x205;
/// Block until the server holds more than a threshold number of samples.
/// Payload: `nsamples, nevents, timeout_ms`.
pub const WAIT_DAT: u16 = 0x402;
/// Successful WAIT response; payload is the current `nsamples, nevents`.
pub const WAIT_OK: u16 = 0x404;
/// Failed WAIT response (no header, or a malformed request).
pub const WAIT_ERR: u16 = 0x405;

// ── Data types and chunks ─────────────────────────────────────────────────────

/// Single-precision float samples — the only data type this crate produces
/// or accepts. Anything else in a header or data block is a protocol error.
pub const DATA_TYPE_FLOAT32: u32 = 9;

/// Header chunk carrying NUL-separated channel names.
pub const CHUNK_CHANNEL_NAMES: u32 = 1;

// ── Defaults ─────────────────────────────────────────────────────────────────

/// Port served by `neuromag2ft` and compatible acquisition bridges.
pub const DEFAULT_PORT: u16 = 1972;

// ── Request encoders ──────────────────────────────────────────────────────────

fn message(command: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&MessageDef::new(command, payload.len() as u32).encode());
    out.extend_from_slice(payload);
    out
}

/// Encode a `GET_HDR` request (no payload).
pub fn get_hdr_request() -> Vec<u8> {
    message(GET_HDR, &[])
}

/// Encode a `GET_DAT` request for samples `begsample..=endsample`.
///
/// # Example
///
/// ```
/// # use fieldtrip_rs::protocol::get_dat_request;
/// let req = get_dat_request(0, 511);
/// assert_eq!(req.len(), 8 + 8);
/// assert_eq!(&req[8..12], &0u32.to_le_bytes());
/// assert_eq!(&req[12..16], &511u32.to_le_bytes());
/// ```
pub fn get_dat_request(begsample: u32, endsample: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&begsample.to_le_bytes());
    payload.extend_from_slice(&endsample.to_le_bytes());
    message(GET_DAT, &payload)
}

/// Encode a `WAIT_DAT` request.
///
/// The server replies with `WAIT_OK` as soon as it holds **more than**
/// `nsamples` samples (or `nevents` events), or after `timeout_ms`
/// milliseconds with the then-current counts — whichever comes first.
pub fn wait_dat_request(nsamples: u32, nevents: u32, timeout_ms: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&nsamples.to_le_bytes());
    payload.extend_from_slice(&nevents.to_le_bytes());
    payload.extend_from_slice(&timeout_ms.to_le_bytes());
    message(WAIT_DAT, &payload)
}

// ── Response encoders (server side) ───────────────────────────────────────────

/// Encode a `GET_OK` response carrying a header block.
///
/// Block layout:
/// ```text
/// u32 nchans | u32 nsamples | u32 nevents | f32 fsample
/// u32 data_type | u32 chunk_bytes | chunks…
/// ```
/// A single [`CHUNK_CHANNEL_NAMES`] chunk is appended when `channel_names`
/// is non-empty.
pub fn header_response(
    nchans: u32,
    nsamples: u32,
    fsample: f32,
    channel_names: &[String],
) -> Vec<u8> {
    let mut chunks = Vec::new();
    if !channel_names.is_empty() {
        let mut names = Vec::new();
        for name in channel_names {
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }
        chunks.extend_from_slice(&CHUNK_CHANNEL_NAMES.to_le_bytes());
        chunks.extend_from_slice(&(names.len() as u32).to_le_bytes());
        chunks.extend_from_slice(&names);
    }

    let mut block = Vec::with_capacity(24 + chunks.len());
    block.extend_from_slice(&nchans.to_le_bytes());
    block.extend_from_slice(&nsamples.to_le_bytes());
    block.extend_from_slice(&0u32.to_le_bytes()); // nevents: always 0 here
    block.extend_from_slice(&fsample.to_le_bytes());
    block.extend_from_slice(&DATA_TYPE_FLOAT32.to_le_bytes());
    block.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
    block.extend_from_slice(&chunks);
    message(GET_OK, &block)
}

/// Encode a `GET_OK` response carrying a data block.
///
/// `samples` is sample-major: `nsamples × nchans` interleaved values, i.e.
/// all channels of sample 0, then all channels of sample 1, and so on.
pub fn data_response(nchans: u32, samples: &[f32]) -> Vec<u8> {
    debug_assert!(nchans > 0 && samples.len() % nchans as usize == 0);
    let nsamples = samples.len() as u32 / nchans;
    let nbytes = samples.len() * 4;

    let mut block = Vec::with_capacity(16 + nbytes);
    block.extend_from_slice(&nchans.to_le_bytes());
    block.extend_from_slice(&nsamples.to_le_bytes());
    block.extend_from_slice(&DATA_TYPE_FLOAT32.to_le_bytes());
    block.extend_from_slice(&(nbytes as u32).to_le_bytes());
    for v in samples {
        block.extend_from_slice(&v.to_le_bytes());
    }
    message(GET_OK, &block)
}

/// Encode a `WAIT_OK` response with the current sample/event counts.
pub fn wait_response(nsamples: u32, nevents: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&nsamples.to_le_bytes());
    payload.extend_from_slice(&nevents.to_le_bytes());
    message(WAIT_OK, &payload)
}

/// Encode an empty error response (`GET_ERR` or `WAIT_ERR`).
pub fn error_response(command: u16) -> Vec<u8> {
    message(command, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let def = MessageDef::new(GET_HDR, 0);
        let bytes = def.encode();
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), VERSION);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), GET_HDR);
        assert_eq!(
            u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            0
        );
    }

    #[test]
    fn wait_request_payload_layout() {
        let req = wait_dat_request(2048, 0, 250);
        assert_eq!(req.len(), 8 + 12);
        assert_eq!(&req[8..12], &2048u32.to_le_bytes());
        assert_eq!(&req[16..20], &250u32.to_le_bytes());
    }

    #[test]
    fn data_response_counts_samples_per_channel() {
        // 2 channels × 3 samples, sample-major.
        let resp = data_response(2, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        // envelope + 16-byte datadef + 24 bytes of floats
        assert_eq!(resp.len(), 8 + 16 + 24);
        assert_eq!(&resp[8..12], &2u32.to_le_bytes()); // nchans
        assert_eq!(&resp[12..16], &3u32.to_le_bytes()); // nsamples
    }
}
