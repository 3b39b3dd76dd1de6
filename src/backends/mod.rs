//! Output stream backends.
//!
//! Two real-hardware strategies plus a mock:
//!
//! - [`buffered`]: worker-thread streaming into a device ring buffer, for
//!   drivers polled through a writable-space API (ALSA and the like).
//! - [`double_buffer`]: two circulating packet buffers refilled from the
//!   device's own completion callbacks (WaveOut and the like).
//! - [`mock`]: no hardware, records the last packet for tests.

pub mod buffered;
pub mod double_buffer;
pub mod mock;

#[cfg(all(feature = "alsa", target_os = "linux"))]
pub mod alsa;

#[cfg(feature = "cpal")]
pub mod cpal_device;

pub use buffered::BufferedStream;
pub use double_buffer::DoubleBufferStream;
pub use mock::MockStream;
