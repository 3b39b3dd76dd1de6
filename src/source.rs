//! Producer contract and sources.
//!
//! This module defines [`AudioSourceCallback`], the pull-model interface a
//! data producer implements, plus two concrete sources: [`PushSource`], which
//! adapts a push-style writer into the pull contract, and [`SineWaveSource`],
//! a tone generator used for playback validation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::packet::{Packet, PacketQueue};

// =============================================================================
// Producer contract
// =============================================================================

/// Pull-model producer contract.
///
/// A backend pulls data from the producer on its own schedule. Calls arrive
/// from an unspecified thread; implementations must not assume the UI thread
/// and must not perform blocking UI work.
///
/// The producer's lifetime is shared: the backend holds a counted reference
/// from `start` until teardown, so implementations use interior mutability
/// for their own state.
pub trait AudioSourceCallback: Send + Sync {
    /// Fill at most `dest.len()` bytes and return the number produced.
    ///
    /// Returning fewer bytes than requested signals a temporary underrun to
    /// the caller; it is not itself an error. The call may block briefly;
    /// backends never hold their internal lock across it.
    fn on_more_data(&self, dest: &mut [u8]) -> usize;

    /// Called at most once, after the backend has fully released its device
    /// resources. The producer may free its own resources here.
    fn on_close(&self) {}

    /// Called when the device reports a platform-specific failure.
    ///
    /// The stream is not necessarily closed yet: the producer should stop
    /// assuming further data requests, but must not free resources it has
    /// not been told are safe to free via [`on_close`](Self::on_close).
    fn on_error(&self, code: i32) {
        let _ = code;
    }
}

// =============================================================================
// Push adapter
// =============================================================================

/// Bridges a push-style writer into the pull-model producer contract.
///
/// Producers write in whatever chunk sizes come naturally; the device reads
/// in its own packet size. The adapter buffers arbitrarily-sized writes into
/// packets that `on_more_data` consumes, losslessly and in order.
///
/// `write` never blocks and never rejects. There is no enforced ceiling on
/// buffered bytes: the writer is expected to watch
/// [`un_processed_bytes`](Self::un_processed_bytes) and slow down when it
/// grows; the backpressure policy lives with the caller.
pub struct PushSource {
    queue: Mutex<PacketQueue>,
}

impl PushSource {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(PacketQueue::new()),
        }
    }

    /// Copy `data` into a new packet and append it to the queue.
    ///
    /// Accepts writes of any size, independent of the consumer's read
    /// granularity. Returns `true` on success.
    pub fn write(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        let packet = Packet::from_slice(data);
        self.queue.lock().unwrap().push(packet);
        true
    }

    /// Bytes written but not yet consumed by the device.
    pub fn un_processed_bytes(&self) -> usize {
        self.queue.lock().unwrap().buffered_bytes()
    }
}

impl Default for PushSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSourceCallback for PushSource {
    fn on_more_data(&self, dest: &mut [u8]) -> usize {
        self.queue.lock().unwrap().read_into(dest)
    }

    fn on_close(&self) {
        self.queue.lock().unwrap().clear();
    }

    fn on_error(&self, _code: i32) {
        self.queue.lock().unwrap().clear();
    }
}

// =============================================================================
// Sine wave source
// =============================================================================

/// Generates a continuous 16-bit mono sine wave.
///
/// Samples are little-endian `i16` at full scale; the running sample index
/// survives across calls so consecutive buffers are phase-continuous.
pub struct SineWaveSource {
    frequency: f64,
    sample_rate: u32,
    position: AtomicU64,
}

impl SineWaveSource {
    /// Create a generator for `frequency` Hz at the given sample rate.
    pub fn new(frequency: f64, sample_rate: u32) -> Self {
        Self {
            frequency,
            sample_rate,
            position: AtomicU64::new(0),
        }
    }
}

impl AudioSourceCallback for SineWaveSource {
    fn on_more_data(&self, dest: &mut [u8]) -> usize {
        let samples = dest.len() / 2;
        let start = self
            .position
            .fetch_add(samples as u64, Ordering::Relaxed);

        for i in 0..samples {
            let n = (start + i as u64) as f64;
            let angle = std::f64::consts::TAU * self.frequency * n / self.sample_rate as f64;
            let value = (i16::MAX as f64 * angle.sin()) as i16;
            dest[i * 2..i * 2 + 2].copy_from_slice(&value.to_le_bytes());
        }

        samples * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(source: &PushSource, chunk: usize) -> Vec<u8> {
        let mut buf = vec![0u8; chunk];
        let n = source.on_more_data(&mut buf);
        buf.truncate(n);
        buf
    }

    #[test]
    fn push_source_round_trips_in_order() {
        let source = PushSource::new();
        source.write(&[1, 2, 3]);
        source.write(&[4, 5]);
        assert_eq!(source.un_processed_bytes(), 5);

        assert_eq!(read(&source, 4), vec![1, 2, 3, 4]);
        assert_eq!(read(&source, 4), vec![5]);
        assert_eq!(source.un_processed_bytes(), 0);
    }

    #[test]
    fn push_source_accepts_empty_writes() {
        let source = PushSource::new();
        assert!(source.write(&[]));
        assert_eq!(source.un_processed_bytes(), 0);
    }

    #[test]
    fn push_source_underrun_returns_short() {
        let source = PushSource::new();
        let mut buf = [0u8; 8];
        assert_eq!(source.on_more_data(&mut buf), 0);
    }

    #[test]
    fn on_close_releases_queued_packets() {
        let source = PushSource::new();
        source.write(&[0; 128]);
        source.on_close();
        assert_eq!(source.un_processed_bytes(), 0);
    }

    #[test]
    fn on_error_releases_queued_packets() {
        let source = PushSource::new();
        source.write(&[0; 64]);
        source.on_error(-5);
        assert_eq!(source.un_processed_bytes(), 0);
    }

    #[test]
    fn small_writes_large_reads_lossless() {
        let source = PushSource::new();
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        for chunk in data.chunks(13) {
            source.write(chunk);
        }

        let mut out = Vec::new();
        loop {
            let piece = read(&source, 57);
            if piece.is_empty() {
                break;
            }
            out.extend_from_slice(&piece);
        }
        assert_eq!(out, data);
        assert_eq!(source.un_processed_bytes(), 0);
    }

    #[test]
    fn sine_source_matches_expected_samples() {
        // 200 Hz at 8000 Hz: half period is 20 samples.
        let source = SineWaveSource::new(200.0, 8000);
        let mut buf = vec![0u8; 1024 * 2];
        assert_eq!(source.on_more_data(&mut buf), buf.len());

        let sample = |i: usize| i16::from_le_bytes([buf[i * 2], buf[i * 2 + 1]]);
        assert_eq!(sample(0), 0);
        assert!((sample(1) - 5126).abs() <= 1, "sample(1) = {}", sample(1));
        assert_eq!(sample(20), 0);
        assert!((sample(21) + 5126).abs() <= 1, "sample(21) = {}", sample(21));
    }

    #[test]
    fn sine_source_is_phase_continuous() {
        let source = SineWaveSource::new(200.0, 8000);
        let mut first = vec![0u8; 42 * 2];
        source.on_more_data(&mut first);

        // Continuing from sample 42 must match a fresh generator's sample 42.
        let fresh = SineWaveSource::new(200.0, 8000);
        let mut all = vec![0u8; 44 * 2];
        fresh.on_more_data(&mut all);

        let mut next = vec![0u8; 2 * 2];
        source.on_more_data(&mut next);
        assert_eq!(&next[..], &all[42 * 2..]);
    }
}
