//! Opaque device seams.
//!
//! The OS audio driver is out of scope for the engine: backends talk to it
//! through one of two narrow traits and never name a platform API directly.
//!
//! - [`PcmDevice`] is the buffered-streaming shape (ALSA-style): the backend
//!   asks how many frames the ring buffer can take, writes interleaved bytes,
//!   and queries the playback delay.
//! - [`CallbackDevice`] is the completion-callback shape (WaveOut-style): the
//!   backend submits fixed buffers and the device reports each one consumed
//!   via a callback on a thread the engine does not own.
//!
//! Real implementations live behind Cargo features
//! ([`backends::alsa`](crate::backends), [`backends::cpal_device`](crate::backends));
//! tests supply fakes.

use std::sync::Arc;

use crate::error::Result;
use crate::stream::StreamParams;

/// Error reported by a device operation.
#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    /// The ring buffer underran (or overran). Recoverable once via
    /// [`PcmDevice::recover`].
    #[error("device buffer underrun")]
    Underrun,

    /// The stream was suspended by the driver. Recoverable once via
    /// [`PcmDevice::recover`].
    #[error("device stream suspended")]
    Suspended,

    /// Unrecoverable driver failure.
    #[error("device failure (code {code}): {message}")]
    Fatal { code: i32, message: String },
}

impl DeviceError {
    /// Whether a single driver-level recovery attempt is worth making.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Underrun | Self::Suspended)
    }

    /// Platform-specific code surfaced to the producer via `on_error`.
    pub fn code(&self) -> i32 {
        match self {
            // Errno values ALSA reports for these conditions.
            Self::Underrun => -32,
            Self::Suspended => -86,
            Self::Fatal { code, .. } => *code,
        }
    }
}

// =============================================================================
// Buffered streaming device (ALSA-style)
// =============================================================================

/// A playback device with a ring buffer the backend keeps topped up.
///
/// The handle is exclusively owned by the stream's worker thread once opened;
/// no other thread touches it.
pub trait PcmDevice: Send {
    /// Frames the device ring buffer can currently accept.
    fn writable_frames(&mut self) -> std::result::Result<usize, DeviceError>;

    /// Write interleaved frames; returns the number of frames accepted.
    ///
    /// `data.len()` must be a whole number of frames.
    fn write(&mut self, data: &[u8]) -> std::result::Result<usize, DeviceError>;

    /// Frames written but not yet played (the device-side delay).
    fn delay_frames(&mut self) -> std::result::Result<usize, DeviceError>;

    /// Attempt driver-level recovery from a recoverable error.
    fn recover(&mut self, error: &DeviceError) -> std::result::Result<(), DeviceError>;

    /// Release the device handle. Called from the owning worker thread.
    fn close(&mut self);
}

/// Factory for [`PcmDevice`] handles.
///
/// The injectable seam that keeps the buffered backend testable without
/// hardware: production code installs a platform opener, tests install fakes.
pub trait PcmDeviceOpener: Send + Sync {
    /// Open a playback device for `params`, sized so that at least
    /// `packet_frames` frames fit comfortably in its ring buffer.
    fn open(&self, params: &StreamParams, packet_frames: usize) -> Result<Box<dyn PcmDevice>>;
}

// =============================================================================
// Completion-callback device (WaveOut-style)
// =============================================================================

/// Completion callback: invoked with the index of a consumed buffer.
///
/// Invoked on a thread the device owns, never on the stream's own thread.
pub type CompletionFn = Arc<dyn Fn(usize) + Send + Sync>;

/// A playback device that consumes submitted buffers and reports each
/// completion through the callback given at open time.
///
/// Contract for implementors: completions may be invoked concurrently with
/// stream teardown right up until [`reset`](Self::reset) returns. `reset` is
/// the hard stop: it cancels in-flight buffers and forcibly terminates the
/// callback thread, so the caller must first make sure no completion is
/// executing user code (the stream's stop handshake does exactly that).
pub trait CallbackDevice: Send {
    /// Submit a filled buffer for playback. The device will report it
    /// consumed via the completion callback.
    fn submit(&mut self, buffer_index: usize, data: &[u8]) -> Result<()>;

    /// Hard reset: cancel in-flight buffers and terminate the callback
    /// thread. Idempotent.
    fn reset(&mut self);

    /// Release the device handle. Resets first if still running.
    fn close(&mut self);
}

/// Factory for [`CallbackDevice`] handles.
pub trait CallbackDeviceOpener: Send + Sync {
    /// Open a device for `params` that will cycle `buffer_count` buffers,
    /// reporting consumption through `on_done`.
    fn open(
        &self,
        params: &StreamParams,
        buffer_count: usize,
        on_done: CompletionFn,
    ) -> Result<Box<dyn CallbackDevice>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(DeviceError::Underrun.is_recoverable());
        assert!(DeviceError::Suspended.is_recoverable());
        assert!(!DeviceError::Fatal {
            code: -5,
            message: "io".into()
        }
        .is_recoverable());
    }

    #[test]
    fn fatal_code_passes_through() {
        let err = DeviceError::Fatal {
            code: -19,
            message: "no such device".into(),
        };
        assert_eq!(err.code(), -19);
    }
}
