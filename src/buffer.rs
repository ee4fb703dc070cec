//! Sample ring and epoch extraction.
//!
//! One [`SampleRing`] sits between the session's reader task (which appends
//! interleaved sample blocks in arrival order) and the epoch-retrieval path
//! (which drains windows on demand). The ring itself is synchronous and
//! lock-free-agnostic; the client wraps it in a mutex and pairs it with a
//! notifier so blocked retrievals wake on every append.

use std::collections::VecDeque;

use crate::error::{Error, Result};

/// Outcome of a single epoch-extraction attempt.
///
/// A pending request cycles `Accumulating` → `Ready` as samples arrive;
/// a request whose window is already buffered is `Ready` immediately.
#[derive(Debug)]
pub(crate) enum Extraction {
    /// The window is available: `data[ch][t]` in selection order, starting
    /// at absolute sample index `start_sample`.
    Ready {
        start_sample: u64,
        data: Vec<Vec<f32>>,
    },
    /// Not enough samples yet; try again after the next append.
    Accumulating,
}

/// Bounded per-channel sample history with absolute indexing.
///
/// Samples are appended in arrival order only; the oldest samples are
/// evicted once a channel reaches `capacity`. `total` counts every sample
/// ever appended, so window start positions remain meaningful after
/// eviction.
pub(crate) struct SampleRing {
    channels: Vec<VecDeque<f32>>,
    capacity: usize,
    /// Absolute count of samples appended per channel since the stream began.
    total: u64,
    /// Start index of the most recently delivered epoch.
    last_epoch_start: Option<u64>,
}

impl SampleRing {
    /// `base` is the absolute index of the next sample to arrive — the
    /// server's sample count at attach time — so epoch start positions
    /// line up with the server's own indexing.
    pub(crate) fn new(nchans: usize, capacity: usize, base: u64) -> Self {
        Self {
            channels: (0..nchans)
                .map(|_| VecDeque::with_capacity(capacity.min(1 << 20)))
                .collect(),
            capacity,
            total: base,
            last_epoch_start: None,
        }
    }

    pub(crate) fn nchans(&self) -> usize {
        self.channels.len()
    }

    /// Total samples appended since the stream began (per channel).
    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    /// Append one block of sample-major interleaved values.
    ///
    /// `interleaved.len()` must be a multiple of the channel count; the
    /// block is `nsamples` consecutive frames of one value per channel.
    pub(crate) fn append_interleaved(&mut self, interleaved: &[f32]) -> Result<()> {
        let nchans = self.channels.len();
        if nchans == 0 || interleaved.len() % nchans != 0 {
            return Err(Error::protocol(format!(
                "sample block of {} values does not divide into {nchans} channels",
                interleaved.len()
            )));
        }
        let nsamples = interleaved.len() / nchans;
        for frame in interleaved.chunks_exact(nchans) {
            for (queue, &value) in self.channels.iter_mut().zip(frame) {
                if queue.len() == self.capacity {
                    queue.pop_front();
                }
                queue.push_back(value);
            }
        }
        self.total += nsamples as u64;
        Ok(())
    }

    /// Reject requests that can never be satisfied, regardless of how many
    /// samples eventually arrive.
    pub(crate) fn validate_request(&self, n_samples: usize) -> Result<()> {
        if n_samples == 0 {
            return Err(Error::invalid("epoch length must be at least one sample"));
        }
        if n_samples > self.capacity {
            return Err(Error::invalid(format!(
                "epoch of {n_samples} samples exceeds the ring capacity of {} \
                 (raise buffer_secs)",
                self.capacity
            )));
        }
        Ok(())
    }

    /// Attempt to extract the most recent `n_samples`-long window for the
    /// given native channel indices, in the order given.
    ///
    /// Readiness requires the stream to have advanced at least `n_samples`
    /// past the previous epoch's start (or simply to hold `n_samples` for
    /// the first request), so consecutive windows never move backwards.
    /// Whether they are back-to-back, overlapping, or far apart depends
    /// entirely on how fast samples arrive between calls.
    pub(crate) fn extract(&mut self, n_samples: usize, indices: &[usize]) -> Result<Extraction> {
        self.validate_request(n_samples)?;
        for &idx in indices {
            if idx >= self.channels.len() {
                return Err(Error::invalid(format!(
                    "channel index {idx} out of range for {}-channel stream",
                    self.channels.len()
                )));
            }
        }

        let available = self.channels.first().map(VecDeque::len).unwrap_or(0);
        let advanced_enough = match self.last_epoch_start {
            None => true,
            Some(start) => self.total >= start + n_samples as u64,
        };
        if available < n_samples || !advanced_enough {
            return Ok(Extraction::Accumulating);
        }

        let start_sample = self.total - n_samples as u64;
        let data = indices
            .iter()
            .map(|&idx| {
                let queue = &self.channels[idx];
                queue.iter().skip(queue.len() - n_samples).copied().collect()
            })
            .collect();
        self.last_epoch_start = Some(start_sample);
        Ok(Extraction::Ready { start_sample, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One frame per sample, channel values encoded as `sample*10 + ch`.
    fn frames(nchans: usize, start: usize, count: usize) -> Vec<f32> {
        (start..start + count)
            .flat_map(|s| (0..nchans).map(move |c| (s * 10 + c) as f32))
            .collect()
    }

    #[test]
    fn accumulates_until_window_is_full() {
        let mut ring = SampleRing::new(2, 64, 0);
        ring.append_interleaved(&frames(2, 0, 3)).unwrap();
        assert!(matches!(
            ring.extract(4, &[0, 1]).unwrap(),
            Extraction::Accumulating
        ));

        ring.append_interleaved(&frames(2, 3, 1)).unwrap();
        match ring.extract(4, &[0, 1]).unwrap() {
            Extraction::Ready { start_sample, data } => {
                assert_eq!(start_sample, 0);
                assert_eq!(data[0], vec![0.0, 10.0, 20.0, 30.0]);
                assert_eq!(data[1], vec![1.0, 11.0, 21.0, 31.0]);
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn returns_most_recent_window() {
        let mut ring = SampleRing::new(1, 64, 0);
        ring.append_interleaved(&frames(1, 0, 10)).unwrap();
        match ring.extract(3, &[0]).unwrap() {
            Extraction::Ready { start_sample, data } => {
                assert_eq!(start_sample, 7);
                assert_eq!(data[0], vec![70.0, 80.0, 90.0]);
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn windows_never_move_backwards() {
        let mut ring = SampleRing::new(1, 64, 0);
        ring.append_interleaved(&frames(1, 0, 5)).unwrap();
        let first = match ring.extract(4, &[0]).unwrap() {
            Extraction::Ready { start_sample, .. } => start_sample,
            _ => panic!("first window should be ready"),
        };

        ring.append_interleaved(&frames(1, 5, 2)).unwrap();
        match ring.extract(4, &[0]).unwrap() {
            Extraction::Ready { start_sample, .. } => assert!(start_sample >= first),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn channel_axis_follows_request_order() {
        let mut ring = SampleRing::new(3, 16, 0);
        ring.append_interleaved(&frames(3, 0, 2)).unwrap();
        match ring.extract(2, &[2, 0]).unwrap() {
            Extraction::Ready { data, .. } => {
                assert_eq!(data.len(), 2);
                assert_eq!(data[0], vec![2.0, 12.0]); // channel 2 first
                assert_eq!(data[1], vec![0.0, 10.0]);
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn eviction_keeps_absolute_indexing() {
        let mut ring = SampleRing::new(1, 4, 0);
        ring.append_interleaved(&frames(1, 0, 10)).unwrap();
        assert_eq!(ring.total(), 10);
        match ring.extract(4, &[0]).unwrap() {
            Extraction::Ready { start_sample, data } => {
                assert_eq!(start_sample, 6);
                assert_eq!(data[0], vec![60.0, 70.0, 80.0, 90.0]);
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn base_offsets_window_positions() {
        // Attaching mid-stream: the server already held 100 samples.
        let mut ring = SampleRing::new(1, 8, 100);
        ring.append_interleaved(&frames(1, 0, 3)).unwrap();
        assert!(matches!(
            ring.extract(4, &[0]).unwrap(),
            Extraction::Accumulating
        ));
        ring.append_interleaved(&frames(1, 3, 1)).unwrap();
        match ring.extract(4, &[0]).unwrap() {
            Extraction::Ready { start_sample, .. } => assert_eq!(start_sample, 100),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn impossible_requests_are_rejected_up_front() {
        let mut ring = SampleRing::new(1, 8, 0);
        assert!(matches!(
            ring.extract(0, &[0]),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            ring.extract(9, &[0]),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            ring.extract(2, &[5]),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn misaligned_block_is_a_protocol_error() {
        let mut ring = SampleRing::new(3, 8, 0);
        assert!(ring.append_interleaved(&[0.0; 4]).is_err());
    }
}
