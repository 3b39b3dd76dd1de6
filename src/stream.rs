//! Stream contract, lifecycle state machine, and stream parameters.
//!
//! Every backend implements [`AudioOutputStream`] and honours the same
//! lifecycle:
//!
//! | Call | Valid from | Result state |
//! |---|---|---|
//! | `open` | `Created` | `Opened` (or `Error` on failure) |
//! | `start` | `Opened` | `Started` |
//! | `stop` | `Started` | `Stopped`, then async resource release |
//! | `close` | `Opened` / `Stopped` / `Error` | `Closed` |
//! | `set_volume` / `volume` | any non-terminal state | unchanged |
//!
//! An operation invoked from any other state fails with
//! [`Error::InvalidState`](crate::Error::InvalidState): the call is a no-op
//! plus a diagnostic, never a corruption of state or device resources.

use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::source::AudioSourceCallback;

/// 8000 Hz, telephone quality.
pub const SAMPLE_RATE_TELEPHONE: u32 = 8_000;
/// 44100 Hz, CD quality.
pub const SAMPLE_RATE_CD: u32 = 44_100;
/// 48000 Hz, DAT quality.
pub const SAMPLE_RATE_DAT: u32 = 48_000;

/// Lifecycle state of a stream. Initial is `Created`, terminal is `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StreamState {
    /// Brand new; `open` has not been called.
    Created,
    /// Device handle acquired, buffer plumbing allocated.
    Opened,
    /// Producer registered, feeding mechanism running.
    Started,
    /// Stop requested; waiting for the feeding mechanism to quiesce.
    Stopping,
    /// Stopped; resource release may still be in flight on the worker.
    Stopped,
    /// Close requested; final teardown pending on the worker.
    Closing,
    /// Terminal. All resources released.
    Closed,
    /// A device failure occurred. No further data will be played; `close`
    /// is still required to release anything remaining and reclaim the
    /// stream object.
    Error,
}

impl StreamState {
    /// True for the state from which no operation is ever valid again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Sample encoding requested from the factory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Format {
    /// Interleaved linear PCM.
    PcmLinear,
    /// Delta-encoded PCM. Reserved; no backend implements it.
    PcmDelta,
    /// Test double that records the last buffer written.
    Mock,
}

/// Parameters for creating a stream.
///
/// Only interleaved layouts are supported: one sample per channel per frame,
/// channel-interleaved. `bits_per_sample` must be a multiple of 8.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StreamParams {
    pub format: Format,
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl StreamParams {
    /// Create new stream parameters.
    pub fn new(format: Format, channels: u16, sample_rate: u32, bits_per_sample: u16) -> Self {
        Self {
            format,
            channels,
            sample_rate,
            bits_per_sample,
        }
    }

    /// Bytes in one frame (one sample per channel).
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bits_per_sample / 8) as usize
    }

    /// Whether the combination is one the engine supports at all.
    pub fn is_valid(&self) -> bool {
        self.channels > 0
            && self.sample_rate > 0
            && self.bits_per_sample > 0
            && self.bits_per_sample % 8 == 0
    }

    /// Default packet size: roughly 100 ms of audio.
    ///
    /// Used when `open` is given a packet size of 0.
    pub fn default_packet_size(&self) -> usize {
        (self.sample_rate as usize / 10).max(1) * self.bytes_per_frame()
    }
}

/// The abstract lifecycle every backend must honour.
///
/// See the module docs for the state-machine table. `stop` must be safe to
/// call while the feeding mechanism is mid-callback and must not deadlock
/// against it; `close` returns only after all teardown, including the final
/// `on_close` to the producer, has completed.
pub trait AudioOutputStream: Send {
    /// Acquire the device handle and allocate buffer plumbing.
    ///
    /// `packet_size` of 0 means "choose ~100 ms of frames".
    fn open(&mut self, packet_size: usize) -> Result<()>;

    /// Register the producer and launch the feeding mechanism.
    fn start(&mut self, source: Arc<dyn AudioSourceCallback>) -> Result<()>;

    /// Stop playback. The state change is observed synchronously; resource
    /// release happens asynchronously on the feeding thread.
    fn stop(&mut self) -> Result<()>;

    /// Tear the stream down. Valid from `Opened`, `Stopped`, and `Error`;
    /// calling it twice is a programming error.
    fn close(&mut self) -> Result<()>;

    /// Set the per-stream volume, `0.0..=1.0`. May be a no-op where the
    /// backend does not support it; must not crash.
    fn set_volume(&mut self, volume: f64) -> Result<()>;

    /// Current per-stream volume.
    fn volume(&self) -> f64;

    /// Current lifecycle state.
    fn state(&self) -> StreamState;
}

/// Build the illegal-state error for `op`, logging the diagnostic the
/// contract requires.
pub(crate) fn invalid_state(op: &'static str, state: StreamState) -> Error {
    log::warn!("{}() called in state {:?}; ignoring", op, state);
    Error::InvalidState { op, state }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_frame_is_channels_times_sample_bytes() {
        let params = StreamParams::new(Format::PcmLinear, 2, SAMPLE_RATE_CD, 16);
        assert_eq!(params.bytes_per_frame(), 4);

        let mono8 = StreamParams::new(Format::PcmLinear, 1, SAMPLE_RATE_TELEPHONE, 8);
        assert_eq!(mono8.bytes_per_frame(), 1);
    }

    #[test]
    fn non_byte_aligned_bits_are_invalid() {
        let params = StreamParams::new(Format::PcmLinear, 2, SAMPLE_RATE_CD, 12);
        assert!(!params.is_valid());
    }

    #[test]
    fn zero_channels_or_rate_are_invalid() {
        assert!(!StreamParams::new(Format::PcmLinear, 0, 44100, 16).is_valid());
        assert!(!StreamParams::new(Format::PcmLinear, 2, 0, 16).is_valid());
    }

    #[test]
    fn default_packet_size_is_about_100ms() {
        let params = StreamParams::new(Format::PcmLinear, 1, 8000, 16);
        // 800 frames * 2 bytes.
        assert_eq!(params.default_packet_size(), 1600);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn stream_params_serde_roundtrip() {
        let params = StreamParams::new(Format::PcmLinear, 2, SAMPLE_RATE_DAT, 16);
        let json = serde_json::to_string(&params).expect("serialize");
        let restored: StreamParams = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored, params);
    }
}
