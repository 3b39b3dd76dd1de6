//! Low-latency audio output engine.
//!
//! Producers hand audio to the hardware through a pull model: a stream asks
//! its [`AudioSourceCallback`] for more data whenever the device is about to
//! run dry, so latency stays bounded by the buffering the backend chooses,
//! not by how far ahead the producer writes. Push-style producers adapt with
//! [`PushSource`], which buffers writes and answers the pull on their behalf.
//!
//! Streams come from an [`AudioManager`] and walk a strict lifecycle:
//! open, start, stop, close, in that order, with every resource released by
//! `close` (or by the stream itself on a device failure, after which the
//! stream reports [`StreamState::Error`] and still must be closed).
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use audio_output::{
//!     AudioManager, AudioSourceCallback, Format, PushSource, StreamParams,
//! };
//!
//! let manager = AudioManager::new();
//! let params = StreamParams::new(Format::PcmLinear, 2, 44_100, 16);
//! let source = Arc::new(PushSource::new());
//!
//! if let Some(mut stream) = manager.make_audio_stream(params) {
//!     stream.open(0).unwrap();
//!     source.write(&[0u8; 4096]);
//!     stream.start(Arc::clone(&source) as Arc<dyn AudioSourceCallback>).unwrap();
//!     // ... keep calling source.write() with fresh audio ...
//!     stream.stop().unwrap();
//!     stream.close().unwrap();
//! }
//! ```
//!
//! # Backends
//!
//! Real hardware is reached through one of two strategies: a buffered
//! worker-thread backend for devices polled for writable space (ALSA style,
//! `alsa` feature), and a double-buffer backend for devices that drive
//! refills from their own completion callbacks (`cpal` feature). A mock
//! backend is always available for tests and records the last packet played.

pub mod backends;
pub mod device;
pub mod error;
pub mod manager;
pub mod packet;
pub mod source;
pub mod stream;

pub use device::{
    CallbackDevice, CallbackDeviceOpener, CompletionFn, DeviceError, PcmDevice, PcmDeviceOpener,
};
pub use error::{Error, Result};
pub use manager::AudioManager;
pub use packet::{Packet, PacketQueue};
pub use source::{AudioSourceCallback, PushSource, SineWaveSource};
pub use stream::{
    AudioOutputStream, Format, StreamParams, StreamState, SAMPLE_RATE_CD, SAMPLE_RATE_DAT,
    SAMPLE_RATE_TELEPHONE,
};
