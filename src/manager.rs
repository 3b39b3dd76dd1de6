//! Stream factory and process-wide audio services.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::backends::{BufferedStream, DoubleBufferStream, MockStream};
use crate::device::{CallbackDeviceOpener, PcmDeviceOpener};
use crate::stream::{AudioOutputStream, Format, StreamParams};

/// Creates output streams and owns the state they share: the global mute
/// flag and the mock-stream recording buffer.
///
/// One manager per process is the intended shape. Construct it explicitly,
/// hand out `&AudioManager` (or wrap it in an `Arc`) to the code that makes
/// streams, and call [`AudioManager::shutdown`] when audio is done for good.
///
/// # Example
///
/// ```no_run
/// use audio_output::{AudioManager, Format, StreamParams};
///
/// let manager = AudioManager::new();
/// let params = StreamParams::new(Format::PcmLinear, 2, 44_100, 16);
/// if let Some(mut stream) = manager.make_audio_stream(params) {
///     stream.open(0).unwrap();
///     // ... start, stop ...
///     stream.close().unwrap();
/// }
/// ```
pub struct AudioManager {
    muted: Arc<AtomicBool>,
    last_mock_buffer: Arc<Mutex<Vec<u8>>>,
    pcm_opener: Option<Arc<dyn PcmDeviceOpener>>,
    callback_opener: Option<Arc<dyn CallbackDeviceOpener>>,
    shut_down: bool,
}

impl AudioManager {
    /// Create a manager wired to the platform audio backends compiled in.
    pub fn new() -> Self {
        Self {
            muted: Arc::new(AtomicBool::new(false)),
            last_mock_buffer: Arc::new(Mutex::new(Vec::new())),
            pcm_opener: platform_pcm_opener(),
            callback_opener: platform_callback_opener(),
            shut_down: false,
        }
    }

    /// Create a manager whose linear streams open devices through `opener`.
    /// The seam the integration tests use to stand in fake hardware.
    pub fn with_pcm_opener(opener: Arc<dyn PcmDeviceOpener>) -> Self {
        Self {
            muted: Arc::new(AtomicBool::new(false)),
            last_mock_buffer: Arc::new(Mutex::new(Vec::new())),
            pcm_opener: Some(opener),
            callback_opener: None,
            shut_down: false,
        }
    }

    /// Like [`AudioManager::with_pcm_opener`], for the callback backend.
    pub fn with_callback_opener(opener: Arc<dyn CallbackDeviceOpener>) -> Self {
        Self {
            muted: Arc::new(AtomicBool::new(false)),
            last_mock_buffer: Arc::new(Mutex::new(Vec::new())),
            pcm_opener: None,
            callback_opener: Some(opener),
            shut_down: false,
        }
    }

    /// Whether any real output path is available. Mock streams do not count.
    pub fn has_audio_devices(&self) -> bool {
        !self.shut_down && (self.pcm_opener.is_some() || self.callback_opener.is_some())
    }

    /// Create a stream for `params`, or `None` when the parameters are
    /// invalid or no backend can serve the requested format.
    ///
    /// The returned stream is in the created state; the caller owns its
    /// whole lifecycle and must `close()` it.
    pub fn make_audio_stream(&self, params: StreamParams) -> Option<Box<dyn AudioOutputStream>> {
        if self.shut_down || !params.is_valid() {
            return None;
        }
        match params.format {
            Format::Mock => Some(Box::new(MockStream::new(
                params,
                Arc::clone(&self.last_mock_buffer),
            ))),
            Format::PcmLinear => {
                if let Some(opener) = &self.pcm_opener {
                    Some(Box::new(BufferedStream::with_mute_flag(
                        params,
                        Arc::clone(opener),
                        Arc::clone(&self.muted),
                    )))
                } else if let Some(opener) = &self.callback_opener {
                    Some(Box::new(DoubleBufferStream::with_mute_flag(
                        params,
                        Arc::clone(opener),
                        Arc::clone(&self.muted),
                    )))
                } else {
                    log::warn!("no output backend available for {:?}", params);
                    None
                }
            }
            Format::PcmDelta => None,
        }
    }

    /// The packet most recently captured by any mock stream this manager
    /// created.
    pub fn last_mock_buffer(&self) -> Vec<u8> {
        self.last_mock_buffer.lock().unwrap().clone()
    }

    /// Silence every stream this manager created, current and future.
    /// Streams keep running; their device writes are zeroed.
    pub fn mute_all(&self) {
        self.muted.store(true, Ordering::Relaxed);
    }

    /// Undo [`AudioManager::mute_all`].
    pub fn unmute_all(&self) {
        self.muted.store(false, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Stop handing out streams. Streams already created keep working and
    /// still must be closed by their owners.
    pub fn shutdown(&mut self) {
        self.shut_down = true;
        self.pcm_opener = None;
        self.callback_opener = None;
        log::info!("audio manager shut down");
    }
}

impl Default for AudioManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(feature = "alsa", target_os = "linux"))]
fn platform_pcm_opener() -> Option<Arc<dyn PcmDeviceOpener>> {
    Some(Arc::new(crate::backends::alsa::AlsaDeviceOpener::default()))
}

#[cfg(not(all(feature = "alsa", target_os = "linux")))]
fn platform_pcm_opener() -> Option<Arc<dyn PcmDeviceOpener>> {
    None
}

#[cfg(feature = "cpal")]
fn platform_callback_opener() -> Option<Arc<dyn CallbackDeviceOpener>> {
    Some(Arc::new(crate::backends::cpal_device::CpalDeviceOpener))
}

#[cfg(not(feature = "cpal"))]
fn platform_callback_opener() -> Option<Arc<dyn CallbackDeviceOpener>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SineWaveSource;
    use crate::stream::SAMPLE_RATE_TELEPHONE;

    fn mock_params() -> StreamParams {
        StreamParams::new(Format::Mock, 1, SAMPLE_RATE_TELEPHONE, 16)
    }

    #[test]
    fn mock_streams_need_no_devices() {
        let manager = AudioManager::new();
        let stream = manager.make_audio_stream(mock_params());
        assert!(stream.is_some());
    }

    #[test]
    fn invalid_params_yield_no_stream() {
        let manager = AudioManager::new();
        let params = StreamParams::new(Format::PcmLinear, 0, 8000, 16);
        assert!(manager.make_audio_stream(params).is_none());
        let params = StreamParams::new(Format::PcmLinear, 2, 8000, 12);
        assert!(manager.make_audio_stream(params).is_none());
    }

    #[test]
    fn delta_encoding_is_unsupported() {
        let manager = AudioManager::new();
        let params = StreamParams::new(Format::PcmDelta, 2, 44_100, 16);
        assert!(manager.make_audio_stream(params).is_none());
    }

    #[test]
    fn shutdown_stops_stream_creation() {
        let mut manager = AudioManager::new();
        manager.shutdown();
        assert!(manager.make_audio_stream(mock_params()).is_none());
        assert!(!manager.has_audio_devices());
    }

    #[test]
    fn mute_state_toggles() {
        let manager = AudioManager::new();
        assert!(!manager.is_muted());
        manager.mute_all();
        assert!(manager.is_muted());
        manager.unmute_all();
        assert!(!manager.is_muted());
    }

    #[test]
    fn mock_stream_records_into_the_manager() {
        let manager = AudioManager::new();
        let mut stream = manager.make_audio_stream(mock_params()).unwrap();
        stream.open(64).unwrap();
        stream
            .start(Arc::new(SineWaveSource::new(200.0, SAMPLE_RATE_TELEPHONE)))
            .unwrap();
        let buffer = manager.last_mock_buffer();
        assert_eq!(buffer.len(), 64);
        // Second sample of a 200 Hz tone at 8 kHz.
        let sample = i16::from_le_bytes([buffer[2], buffer[3]]);
        assert!((sample - 5126).abs() <= 1);
        stream.stop().unwrap();
        stream.close().unwrap();
    }
}
