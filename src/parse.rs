//! Binary decoders for buffer-protocol messages.
//!
//! All functions in this module are pure (no I/O, no state) and are the
//! inverse of the encoders in [`crate::protocol`]. The client uses them to
//! decode responses; the server uses them to decode request payloads.
//!
//! | Function | Decodes | Layout |
//! |---|---|---|
//! | [`decode_message_def`] | 8-byte envelope | `u16 version, u16 command, u32 bufsize` |
//! | [`decode_header_block`] | `GET_OK` header payload | fixed 24 bytes + chunks |
//! | [`decode_data_block`] | `GET_OK` data payload | 16-byte datadef + f32 samples |
//! | [`decode_wait_payload`] | `WAIT_OK` payload | `u32 nsamples, u32 nevents` |
//! | [`decode_sample_range`] | `GET_DAT` request payload | `u32 begsample, u32 endsample` |
//! | [`decode_wait_request`] | `WAIT_DAT` request payload | `u32, u32, u32 timeout_ms` |

use crate::error::{Error, Result};
use crate::protocol::{CHUNK_CHANNEL_NAMES, DATA_TYPE_FLOAT32, MessageDef, VERSION};

// ── Little-endian field readers ───────────────────────────────────────────────

fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| Error::protocol(format!("message truncated at byte {offset}")))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::protocol(format!("message truncated at byte {offset}")))
}

fn read_f32(data: &[u8], offset: usize) -> Result<f32> {
    read_u32(data, offset).map(f32::from_bits)
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// Decode the 8-byte message envelope.
///
/// Fails on short input or a version other than [`VERSION`].
pub fn decode_message_def(data: &[u8]) -> Result<MessageDef> {
    let version = read_u16(data, 0)?;
    if version != VERSION {
        return Err(Error::protocol(format!(
            "unsupported protocol version {version} (expected {VERSION})"
        )));
    }
    Ok(MessageDef {
        version,
        command: read_u16(data, 2)?,
        bufsize: read_u32(data, 4)?,
    })
}

// ── Header block ─────────────────────────────────────────────────────────────

/// A decoded acquisition header.
#[derive(Debug, Clone)]
pub struct HeaderBlock {
    pub nchans: u32,
    /// Samples the server held when the header was read.
    pub nsamples: u32,
    pub fsample: f32,
    /// Channel names from the names chunk; empty when the chunk is absent.
    pub channel_names: Vec<String>,
}

/// Decode a `GET_OK` header payload, walking the trailing chunk list for
/// channel names. Unknown chunk types are skipped.
///
/// Fails when the fixed part is truncated, the data type is not
/// [`DATA_TYPE_FLOAT32`], a chunk overruns the declared chunk region, or
/// the names chunk does not contain exactly `nchans` names.
pub fn decode_header_block(data: &[u8]) -> Result<HeaderBlock> {
    let nchans = read_u32(data, 0)?;
    let nsamples = read_u32(data, 4)?;
    let _nevents = read_u32(data, 8)?;
    let fsample = read_f32(data, 12)?;
    let data_type = read_u32(data, 16)?;
    let chunk_bytes = read_u32(data, 20)? as usize;

    if data_type != DATA_TYPE_FLOAT32 {
        return Err(Error::protocol(format!(
            "unsupported sample data type {data_type} (only float32 is supported)"
        )));
    }
    if nchans == 0 {
        return Err(Error::protocol("header declares zero channels"));
    }
    if fsample <= 0.0 || !fsample.is_finite() {
        return Err(Error::protocol(format!(
            "header declares invalid sampling rate {fsample}"
        )));
    }
    let chunk_end = 24usize
        .checked_add(chunk_bytes)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| Error::protocol("header chunk region exceeds payload"))?;

    let mut channel_names = Vec::new();
    let mut offset = 24;
    while offset < chunk_end {
        let chunk_type = read_u32(data, offset)?;
        let chunk_size = read_u32(data, offset + 4)? as usize;
        let body_start = offset + 8;
        let body_end = body_start
            .checked_add(chunk_size)
            .filter(|&end| end <= chunk_end)
            .ok_or_else(|| Error::protocol("header chunk overruns chunk region"))?;

        if chunk_type == CHUNK_CHANNEL_NAMES {
            channel_names = data[body_start..body_end]
                .split(|&b| b == 0)
                .filter(|s| !s.is_empty())
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect();
        }
        offset = body_end;
    }

    if !channel_names.is_empty() && channel_names.len() != nchans as usize {
        return Err(Error::protocol(format!(
            "names chunk lists {} channels but header declares {nchans}",
            channel_names.len()
        )));
    }

    Ok(HeaderBlock {
        nchans,
        nsamples,
        fsample,
        channel_names,
    })
}

// ── Data block ───────────────────────────────────────────────────────────────

/// A decoded block of samples.
#[derive(Debug, Clone)]
pub struct DataBlock {
    pub nchans: u32,
    pub nsamples: u32,
    /// Sample-major values: `nsamples × nchans`, channels interleaved.
    pub samples: Vec<f32>,
}

/// Decode a `GET_OK` data payload into interleaved f32 samples.
///
/// Fails on truncation, a non-float32 data type, or a byte count that does
/// not match `nchans × nsamples × 4`.
pub fn decode_data_block(data: &[u8]) -> Result<DataBlock> {
    let nchans = read_u32(data, 0)?;
    let nsamples = read_u32(data, 4)?;
    let data_type = read_u32(data, 8)?;
    let nbytes = read_u32(data, 12)? as usize;

    if data_type != DATA_TYPE_FLOAT32 {
        return Err(Error::protocol(format!(
            "unsupported sample data type {data_type} in data block"
        )));
    }
    let expected = (nchans as usize)
        .checked_mul(nsamples as usize)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| Error::protocol("data block dimensions overflow"))?;
    if nbytes != expected || data.len() < 16 + expected {
        return Err(Error::protocol(format!(
            "data block size mismatch: declared {nbytes} bytes for {nchans}×{nsamples} samples"
        )));
    }

    let samples = data[16..16 + expected]
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Ok(DataBlock {
        nchans,
        nsamples,
        samples,
    })
}

// ── Small payloads ───────────────────────────────────────────────────────────

/// Decode a `WAIT_OK` payload into `(nsamples, nevents)`.
pub fn decode_wait_payload(data: &[u8]) -> Result<(u32, u32)> {
    Ok((read_u32(data, 0)?, read_u32(data, 4)?))
}

/// Decode a `GET_DAT` request payload into `(begsample, endsample)`.
pub fn decode_sample_range(data: &[u8]) -> Result<(u32, u32)> {
    Ok((read_u32(data, 0)?, read_u32(data, 4)?))
}

/// Decode a `WAIT_DAT` request payload into
/// `(nsamples_threshold, nevents_threshold, timeout_ms)`.
pub fn decode_wait_request(data: &[u8]) -> Result<(u32, u32, u32)> {
    Ok((read_u32(data, 0)?, read_u32(data, 4)?, read_u32(data, 8)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{data_response, header_response, GET_OK};

    #[test]
    fn header_roundtrip_with_names() {
        let names: Vec<String> = vec!["MEG 0113".into(), "EEG 053".into(), "EOG 061".into()];
        let msg = header_response(3, 1024, 600.0, &names);

        let def = decode_message_def(&msg[..8]).unwrap();
        assert_eq!(def.command, GET_OK);

        let hdr = decode_header_block(&msg[8..]).unwrap();
        assert_eq!(hdr.nchans, 3);
        assert_eq!(hdr.nsamples, 1024);
        assert_eq!(hdr.fsample, 600.0);
        assert_eq!(hdr.channel_names, names);
    }

    #[test]
    fn header_without_names_chunk() {
        let msg = header_response(8, 0, 1000.0, &[]);
        let hdr = decode_header_block(&msg[8..]).unwrap();
        assert_eq!(hdr.nchans, 8);
        assert!(hdr.channel_names.is_empty());
    }

    #[test]
    fn header_rejects_wrong_data_type() {
        let mut msg = header_response(2, 0, 250.0, &[]);
        // Overwrite the data_type field (payload offset 16) with float64.
        msg[8 + 16..8 + 20].copy_from_slice(&10u32.to_le_bytes());
        let err = decode_header_block(&msg[8..]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn header_rejects_name_count_mismatch() {
        let names: Vec<String> = vec!["a".into(), "b".into()];
        let msg = header_response(3, 0, 100.0, &names);
        assert!(decode_header_block(&msg[8..]).is_err());
    }

    #[test]
    fn data_roundtrip() {
        let samples = [1.0f32, -2.0, 3.5, 0.25];
        let msg = data_response(2, &samples);
        let block = decode_data_block(&msg[8..]).unwrap();
        assert_eq!(block.nchans, 2);
        assert_eq!(block.nsamples, 2);
        assert_eq!(block.samples, samples);
    }

    #[test]
    fn data_rejects_size_mismatch() {
        let mut msg = data_response(2, &[0.0; 4]);
        msg[8 + 12..8 + 16].copy_from_slice(&999u32.to_le_bytes());
        assert!(decode_data_block(&msg[8..]).is_err());
    }

    #[test]
    fn truncated_envelope_fails() {
        assert!(decode_message_def(&[1, 0, 1]).is_err());
    }
}
