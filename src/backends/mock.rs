//! In-process mock stream. No hardware, no threads.
//!
//! `start` pulls exactly one packet from the producer and records it into a
//! buffer shared with the factory, so tests can inspect the last audio any
//! mock stream "played". Everything else is pure state machine bookkeeping,
//! which makes this the backend of choice for transition-legality tests.

use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::source::AudioSourceCallback;
use crate::stream::{invalid_state, AudioOutputStream, StreamParams, StreamState};

pub struct MockStream {
    params: StreamParams,
    state: StreamState,
    packet_size: usize,
    volume: f64,
    source: Option<Arc<dyn AudioSourceCallback>>,
    /// Shared with the factory that created this stream.
    last_buffer: Arc<Mutex<Vec<u8>>>,
}

impl MockStream {
    pub fn new(params: StreamParams, last_buffer: Arc<Mutex<Vec<u8>>>) -> Self {
        Self {
            params,
            state: StreamState::Created,
            packet_size: 0,
            volume: 1.0,
            source: None,
            last_buffer,
        }
    }

    fn notify_close(&mut self) {
        if let Some(source) = self.source.take() {
            source.on_close();
        }
    }
}

impl AudioOutputStream for MockStream {
    fn open(&mut self, packet_size: usize) -> Result<()> {
        if self.state != StreamState::Created {
            return Err(invalid_state("open", self.state));
        }
        self.packet_size = if packet_size == 0 {
            self.params.default_packet_size()
        } else {
            packet_size
        };
        self.state = StreamState::Opened;
        Ok(())
    }

    fn start(&mut self, source: Arc<dyn AudioSourceCallback>) -> Result<()> {
        if self.state != StreamState::Opened {
            return Err(invalid_state("start", self.state));
        }
        let mut buffer = vec![0u8; self.packet_size];
        let filled = source.on_more_data(&mut buffer);
        buffer.truncate(filled.min(self.packet_size));
        *self.last_buffer.lock().unwrap() = buffer;
        self.source = Some(source);
        self.state = StreamState::Started;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.state != StreamState::Started {
            return Err(invalid_state("stop", self.state));
        }
        self.state = StreamState::Stopped;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.state {
            StreamState::Opened | StreamState::Stopped | StreamState::Error => {}
            state => return Err(invalid_state("close", state)),
        }
        self.notify_close();
        self.state = StreamState::Closed;
        Ok(())
    }

    fn set_volume(&mut self, volume: f64) -> Result<()> {
        if self.state.is_terminal() {
            return Err(invalid_state("set_volume", self.state));
        }
        self.volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    fn volume(&self) -> f64 {
        self.volume
    }

    fn state(&self) -> StreamState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Format;

    struct RampSource;

    impl AudioSourceCallback for RampSource {
        fn on_more_data(&self, dest: &mut [u8]) -> usize {
            for (i, byte) in dest.iter_mut().enumerate() {
                *byte = i as u8;
            }
            dest.len()
        }
    }

    fn mock_params() -> StreamParams {
        StreamParams::new(Format::Mock, 1, 8000, 16)
    }

    #[test]
    fn records_the_started_packet() {
        let last = Arc::new(Mutex::new(Vec::new()));
        let mut stream = MockStream::new(mock_params(), Arc::clone(&last));
        stream.open(16).unwrap();
        stream.start(Arc::new(RampSource)).unwrap();

        let recorded = last.lock().unwrap().clone();
        assert_eq!(recorded.len(), 16);
        assert_eq!(recorded[3], 3);

        stream.stop().unwrap();
        stream.close().unwrap();
    }

    #[test]
    fn zero_packet_size_uses_the_default() {
        let last = Arc::new(Mutex::new(Vec::new()));
        let mut stream = MockStream::new(mock_params(), Arc::clone(&last));
        stream.open(0).unwrap();
        stream.start(Arc::new(RampSource)).unwrap();
        assert_eq!(
            last.lock().unwrap().len(),
            mock_params().default_packet_size()
        );
        stream.stop().unwrap();
        stream.close().unwrap();
    }

    #[test]
    fn illegal_transitions_leave_the_buffer_untouched() {
        let last = Arc::new(Mutex::new(Vec::new()));
        let mut stream = MockStream::new(mock_params(), Arc::clone(&last));

        // Start before open, stop before start, close from Created.
        assert!(stream.start(Arc::new(RampSource)).unwrap_err().is_invalid_state());
        assert!(stream.stop().unwrap_err().is_invalid_state());
        assert!(stream.close().unwrap_err().is_invalid_state());
        assert!(last.lock().unwrap().is_empty());
        assert_eq!(stream.state(), StreamState::Created);
    }

    #[test]
    fn close_notifies_the_source_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Closes(AtomicUsize);
        impl AudioSourceCallback for Closes {
            fn on_more_data(&self, dest: &mut [u8]) -> usize {
                dest.len()
            }
            fn on_close(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let last = Arc::new(Mutex::new(Vec::new()));
        let mut stream = MockStream::new(mock_params(), Arc::clone(&last));
        let source = Arc::new(Closes(AtomicUsize::new(0)));
        stream.open(8).unwrap();
        stream.start(Arc::clone(&source) as Arc<dyn AudioSourceCallback>).unwrap();
        stream.stop().unwrap();
        stream.close().unwrap();
        assert_eq!(source.0.load(Ordering::SeqCst), 1);
        assert!(stream.close().is_err());
        assert_eq!(source.0.load(Ordering::SeqCst), 1);
    }
}
