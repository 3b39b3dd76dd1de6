//! Double-buffered callback backend (WaveOut-style).
//!
//! Two fixed packet buffers circulate between the stream and the device:
//! whenever the device finishes playing one it fires a completion, the
//! completion thread refills the buffer from the producer and resubmits it.
//! With two buffers one is always playing while the other is being filled.
//!
//! Completions arrive on a thread the device owns, so stopping is a
//! handshake rather than a join: `stop()` raises a flag that makes further
//! completions return immediately, then waits on a condition variable until
//! no completion is still inside producer code before resetting the device.
//! The device handle itself is only ever reset or closed from the caller's
//! thread, never from the completion thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::device::{CallbackDevice, CallbackDeviceOpener};
use crate::error::Result;
use crate::source::AudioSourceCallback;
use crate::stream::{invalid_state, AudioOutputStream, StreamParams, StreamState};

const BUFFER_COUNT: usize = 2;

fn error_code(err: &crate::error::Error) -> i32 {
    match err {
        crate::error::Error::DeviceWrite { code, .. } => *code,
        _ => -1,
    }
}

struct DbInner {
    state: StreamState,
    device: Option<Box<dyn CallbackDevice>>,
    source: Option<Arc<dyn AudioSourceCallback>>,
    /// Reusable packet buffers, `None` while checked out by a completion.
    buffers: Vec<Option<Vec<u8>>>,
    resources_released: bool,
}

struct DbShared {
    control: Mutex<DbInner>,
    /// Once set, completions bail out before touching the producer or the
    /// device. Checked without taking the control lock.
    stopping: AtomicBool,
    /// Number of completions currently executing producer code.
    active: Mutex<usize>,
    idle: Condvar,
    muted: Arc<AtomicBool>,
    /// Volume as f64 bits, so completions read it without a lock.
    volume_bits: AtomicU64,
    /// Sample width; volume scaling only understands 16-bit samples.
    bits_per_sample: u16,
}

impl DbShared {
    fn volume(&self) -> f64 {
        f64::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }
}

/// WaveOut-style callback-driven stream.
pub struct DoubleBufferStream {
    params: StreamParams,
    opener: Arc<dyn CallbackDeviceOpener>,
    shared: Arc<DbShared>,
    packet_size: usize,
}

impl DoubleBufferStream {
    pub fn new(params: StreamParams, opener: Arc<dyn CallbackDeviceOpener>) -> Self {
        Self::with_mute_flag(params, opener, Arc::new(AtomicBool::new(false)))
    }

    pub(crate) fn with_mute_flag(
        params: StreamParams,
        opener: Arc<dyn CallbackDeviceOpener>,
        muted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            params,
            opener,
            shared: Arc::new(DbShared {
                control: Mutex::new(DbInner {
                    state: StreamState::Created,
                    device: None,
                    source: None,
                    buffers: Vec::new(),
                    resources_released: false,
                }),
                stopping: AtomicBool::new(false),
                active: Mutex::new(0),
                idle: Condvar::new(),
                muted,
                volume_bits: AtomicU64::new(1.0f64.to_bits()),
                bits_per_sample: params.bits_per_sample,
            }),
            packet_size: 0,
        }
    }

    /// Fill `buffer` from the producer, zero-padding whatever the producer
    /// did not supply, then apply mute and volume.
    fn fill_buffer(shared: &DbShared, source: &dyn AudioSourceCallback, buffer: &mut [u8]) {
        let filled = source.on_more_data(buffer);
        let filled = filled.min(buffer.len());
        buffer[filled..].fill(0);

        if shared.muted.load(Ordering::Relaxed) {
            buffer.fill(0);
        } else {
            let volume = shared.volume();
            // Scaling other sample widths would corrupt them; volume stays
            // a no-op there.
            if volume < 0.999 && shared.bits_per_sample == 16 {
                for sample in buffer.chunks_exact_mut(2) {
                    let value = i16::from_le_bytes([sample[0], sample[1]]);
                    let scaled = (value as f64 * volume) as i16;
                    sample.copy_from_slice(&scaled.to_le_bytes());
                }
            }
        }
    }

    /// Completion handler: runs on the device's callback thread every time a
    /// submitted buffer finishes playing.
    fn on_buffer_done(shared: &Arc<DbShared>, index: usize) {
        if shared.stopping.load(Ordering::SeqCst) {
            return;
        }
        // Mark this completion in flight so stop() can wait for it.
        *shared.active.lock().unwrap() += 1;
        // Re-check under the in-flight mark; stop() may have won the race.
        if !shared.stopping.load(Ordering::SeqCst) {
            Self::refill_and_resubmit(shared, index);
        }
        let mut active = shared.active.lock().unwrap();
        *active -= 1;
        if *active == 0 {
            shared.idle.notify_all();
        }
    }

    fn refill_and_resubmit(shared: &Arc<DbShared>, index: usize) {
        let (source, mut buffer) = {
            let mut inner = shared.control.lock().unwrap();
            if inner.state != StreamState::Started {
                return;
            }
            let source = match &inner.source {
                Some(source) => Arc::clone(source),
                None => return,
            };
            let buffer = match inner.buffers.get_mut(index).and_then(Option::take) {
                Some(buffer) => buffer,
                None => return,
            };
            (source, buffer)
        };

        // Producer runs without the control lock held.
        Self::fill_buffer(shared, source.as_ref(), &mut buffer);

        let mut inner = shared.control.lock().unwrap();
        let submit = if inner.state == StreamState::Started {
            match &mut inner.device {
                Some(device) => device.submit(index, &buffer),
                None => Ok(()),
            }
        } else {
            Ok(())
        };
        inner.buffers[index] = Some(buffer);

        if let Err(err) = submit {
            // Device teardown must not run on this thread; it is deferred to
            // close(), and on_close with it, so the producer hears it only
            // after the device is actually released.
            log::error!("buffer resubmit failed: {}", err);
            let code = error_code(&err);
            shared.stopping.store(true, Ordering::SeqCst);
            inner.state = StreamState::Error;
            let source = inner.source.clone();
            drop(inner);
            if let Some(source) = source {
                source.on_error(code);
            }
        }
    }

    /// Close the device and notify the producer. Caller thread only.
    fn release(&mut self) {
        let (device, source) = {
            let mut inner = self.shared.control.lock().unwrap();
            if inner.resources_released {
                return;
            }
            inner.resources_released = true;
            inner.buffers.clear();
            (inner.device.take(), inner.source.take())
        };
        if let Some(mut device) = device {
            device.reset();
            device.close();
        }
        if let Some(source) = source {
            source.on_close();
        }
    }
}

impl AudioOutputStream for DoubleBufferStream {
    fn open(&mut self, packet_size: usize) -> Result<()> {
        {
            let inner = self.shared.control.lock().unwrap();
            if inner.state != StreamState::Created {
                return Err(invalid_state("open", inner.state));
            }
        }
        if !self.params.is_valid() {
            let mut inner = self.shared.control.lock().unwrap();
            inner.state = StreamState::Error;
            inner.resources_released = true;
            return Err(crate::error::Error::UnsupportedParams(format!(
                "{:?}",
                self.params
            )));
        }

        let bytes_per_frame = self.params.bytes_per_frame();
        let requested = if packet_size == 0 {
            self.params.default_packet_size()
        } else {
            packet_size
        };
        self.packet_size = (requested / bytes_per_frame).max(1) * bytes_per_frame;

        let shared = Arc::clone(&self.shared);
        let on_done = Arc::new(move |index: usize| {
            Self::on_buffer_done(&shared, index);
        });

        let device = match self.opener.open(&self.params, BUFFER_COUNT, on_done) {
            Ok(device) => device,
            Err(err) => {
                let mut inner = self.shared.control.lock().unwrap();
                inner.state = StreamState::Error;
                inner.resources_released = true;
                return Err(err);
            }
        };

        let mut inner = self.shared.control.lock().unwrap();
        inner.device = Some(device);
        inner.buffers = (0..BUFFER_COUNT)
            .map(|_| Some(vec![0u8; self.packet_size]))
            .collect();
        inner.state = StreamState::Opened;
        log::debug!(
            "opened double-buffer stream: {:?}, packet size {} bytes",
            self.params,
            self.packet_size
        );
        Ok(())
    }

    fn start(&mut self, source: Arc<dyn AudioSourceCallback>) -> Result<()> {
        let mut inner = self.shared.control.lock().unwrap();
        if inner.state != StreamState::Opened {
            return Err(invalid_state("start", inner.state));
        }
        self.shared.stopping.store(false, Ordering::SeqCst);
        inner.source = Some(Arc::clone(&source));
        inner.state = StreamState::Started;

        // Prime and submit both buffers. The device starts calling back
        // as soon as the first one finishes.
        for index in 0..BUFFER_COUNT {
            let mut buffer = match inner.buffers[index].take() {
                Some(buffer) => buffer,
                None => continue,
            };
            Self::fill_buffer(&self.shared, source.as_ref(), &mut buffer);
            if let Some(device) = &mut inner.device {
                if let Err(err) = device.submit(index, &buffer) {
                    inner.buffers[index] = Some(buffer);
                    inner.state = StreamState::Error;
                    self.shared.stopping.store(true, Ordering::SeqCst);
                    let registered = inner.source.clone();
                    drop(inner);
                    // on_close waits for close(), after the device release.
                    if let Some(source) = registered {
                        source.on_error(error_code(&err));
                    }
                    return Err(err);
                }
            }
            inner.buffers[index] = Some(buffer);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        {
            let mut inner = self.shared.control.lock().unwrap();
            if inner.state != StreamState::Started {
                return Err(invalid_state("stop", inner.state));
            }
            inner.state = StreamState::Stopping;
        }
        self.shared.stopping.store(true, Ordering::SeqCst);

        // Wait until no completion is still inside producer code. New
        // completions see the stopping flag and return immediately.
        {
            let mut active = self.shared.active.lock().unwrap();
            while *active > 0 {
                active = self.shared.idle.wait(active).unwrap();
            }
        }

        let mut inner = self.shared.control.lock().unwrap();
        if let Some(device) = &mut inner.device {
            device.reset();
        }
        inner.state = StreamState::Stopped;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        {
            let mut inner = self.shared.control.lock().unwrap();
            match inner.state {
                StreamState::Opened | StreamState::Stopped | StreamState::Error => {}
                state => return Err(invalid_state("close", state)),
            }
            inner.state = StreamState::Closing;
        }
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.release();
        self.shared.control.lock().unwrap().state = StreamState::Closed;
        Ok(())
    }

    fn set_volume(&mut self, volume: f64) -> Result<()> {
        let inner = self.shared.control.lock().unwrap();
        if inner.state.is_terminal() {
            return Err(invalid_state("set_volume", inner.state));
        }
        self.shared
            .volume_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn volume(&self) -> f64 {
        self.shared.volume()
    }

    fn state(&self) -> StreamState {
        self.shared.control.lock().unwrap().state
    }
}

impl Drop for DoubleBufferStream {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        {
            let mut active = self.shared.active.lock().unwrap();
            while *active > 0 {
                active = self.shared.idle.wait(active).unwrap();
            }
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CompletionFn;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::{self, Sender};
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    /// A fake device whose "hardware" is a thread that fires the completion
    /// a moment after each submit, like a real callback-driven driver.
    struct FakeCallbackDevice {
        submissions: Arc<Mutex<Vec<Vec<u8>>>>,
        tx: Option<Sender<usize>>,
        callback_thread: Option<JoinHandle<()>>,
        closed: Arc<AtomicBool>,
        fail_submit_after: Option<usize>,
        submit_count: usize,
    }

    impl FakeCallbackDevice {
        fn new(
            on_done: CompletionFn,
            submissions: Arc<Mutex<Vec<Vec<u8>>>>,
            closed: Arc<AtomicBool>,
            fail_submit_after: Option<usize>,
        ) -> Self {
            let (tx, rx) = mpsc::channel::<usize>();
            let callback_thread = thread::spawn(move || {
                while let Ok(index) = rx.recv() {
                    thread::sleep(Duration::from_millis(1));
                    on_done(index);
                }
            });
            Self {
                submissions,
                tx: Some(tx),
                callback_thread: Some(callback_thread),
                closed,
                fail_submit_after,
                submit_count: 0,
            }
        }
    }

    impl CallbackDevice for FakeCallbackDevice {
        fn submit(&mut self, buffer_index: usize, data: &[u8]) -> Result<()> {
            if let Some(limit) = self.fail_submit_after {
                if self.submit_count >= limit {
                    return Err(Error::DeviceWrite {
                        code: -1,
                        message: "submit rejected".into(),
                    });
                }
            }
            self.submit_count += 1;
            self.submissions.lock().unwrap().push(data.to_vec());
            if let Some(tx) = &self.tx {
                let _ = tx.send(buffer_index);
            }
            Ok(())
        }

        fn reset(&mut self) {
            // Dropping the sender stops the callback thread; joining it
            // guarantees no completion is pending when reset returns.
            self.tx.take();
            if let Some(handle) = self.callback_thread.take() {
                let _ = handle.join();
            }
        }

        fn close(&mut self) {
            self.reset();
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeCallbackOpener {
        submissions: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<AtomicBool>,
        fail_submit_after: Option<usize>,
    }

    impl FakeCallbackOpener {
        fn new() -> Self {
            Self {
                submissions: Arc::new(Mutex::new(Vec::new())),
                closed: Arc::new(AtomicBool::new(false)),
                fail_submit_after: None,
            }
        }
    }

    impl CallbackDeviceOpener for FakeCallbackOpener {
        fn open(
            &self,
            _params: &StreamParams,
            _buffer_count: usize,
            on_done: CompletionFn,
        ) -> Result<Box<dyn CallbackDevice>> {
            Ok(Box::new(FakeCallbackDevice::new(
                on_done,
                Arc::clone(&self.submissions),
                Arc::clone(&self.closed),
                self.fail_submit_after,
            )))
        }
    }

    struct CountingSource {
        calls: AtomicUsize,
        closes: AtomicUsize,
        errors: AtomicUsize,
    }

    impl CountingSource {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                errors: AtomicUsize::new(0),
            }
        }
    }

    impl AudioSourceCallback for CountingSource {
        fn on_more_data(&self, dest: &mut [u8]) -> usize {
            self.calls.fetch_add(1, Ordering::SeqCst);
            dest.fill(0x5A);
            dest.len()
        }

        fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, _code: i32) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn params() -> StreamParams {
        StreamParams::new(crate::stream::Format::PcmLinear, 1, 8000, 16)
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn start_primes_both_buffers() {
        let opener = FakeCallbackOpener::new();
        let submissions = Arc::clone(&opener.submissions);
        let mut stream = DoubleBufferStream::new(params(), Arc::new(opener));
        let source = Arc::new(CountingSource::new());

        stream.open(160).unwrap();
        stream.start(Arc::clone(&source) as Arc<dyn AudioSourceCallback>).unwrap();

        assert!(submissions.lock().unwrap().len() >= BUFFER_COUNT);
        assert!(source.calls.load(Ordering::SeqCst) >= BUFFER_COUNT);

        stream.stop().unwrap();
        stream.close().unwrap();
    }

    #[test]
    fn completions_keep_the_device_fed() {
        let opener = FakeCallbackOpener::new();
        let submissions = Arc::clone(&opener.submissions);
        let mut stream = DoubleBufferStream::new(params(), Arc::new(opener));
        let source = Arc::new(CountingSource::new());

        stream.open(160).unwrap();
        stream.start(Arc::clone(&source) as Arc<dyn AudioSourceCallback>).unwrap();

        // Well past the initial priming: the callback loop is resubmitting.
        assert!(wait_until(Duration::from_secs(2), || {
            submissions.lock().unwrap().len() >= 10
        }));
        assert!(submissions
            .lock()
            .unwrap()
            .iter()
            .all(|buffer| buffer.iter().all(|&b| b == 0x5A)));

        stream.stop().unwrap();
        stream.close().unwrap();
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_waits_out_in_flight_completions() {
        let opener = FakeCallbackOpener::new();
        let closed = Arc::clone(&opener.closed);
        let mut stream = DoubleBufferStream::new(params(), Arc::new(opener));
        let source = Arc::new(CountingSource::new());

        stream.open(160).unwrap();
        stream.start(Arc::clone(&source) as Arc<dyn AudioSourceCallback>).unwrap();
        thread::sleep(Duration::from_millis(10));

        // Must return without deadlocking even while completions race it.
        stream.stop().unwrap();
        assert_eq!(stream.state(), StreamState::Stopped);
        let calls_at_stop = source.calls.load(Ordering::SeqCst);

        // No producer callbacks after stop returned.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(source.calls.load(Ordering::SeqCst), calls_at_stop);

        stream.close().unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_start_cycle_restarts_playback() {
        let opener = FakeCallbackOpener::new();
        let mut stream = DoubleBufferStream::new(params(), Arc::new(opener));
        let source = Arc::new(CountingSource::new());

        stream.open(160).unwrap();
        stream.start(Arc::clone(&source) as Arc<dyn AudioSourceCallback>).unwrap();
        stream.stop().unwrap();

        // Stopped -> Started is not a legal edge; only Opened is.
        assert!(stream
            .start(Arc::clone(&source) as Arc<dyn AudioSourceCallback>)
            .unwrap_err()
            .is_invalid_state());
        stream.close().unwrap();
    }

    #[test]
    fn submit_failure_after_start_enters_error() {
        let mut opener = FakeCallbackOpener::new();
        opener.fail_submit_after = Some(4);
        let closed = Arc::clone(&opener.closed);
        let mut stream = DoubleBufferStream::new(params(), Arc::new(opener));
        let source = Arc::new(CountingSource::new());

        stream.open(160).unwrap();
        stream.start(Arc::clone(&source) as Arc<dyn AudioSourceCallback>).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            stream.state() == StreamState::Error
        }));
        // The producer hears the failure right away, but on_close only
        // comes once the device has actually been released.
        assert_eq!(source.errors.load(Ordering::SeqCst), 1);
        assert_eq!(source.closes.load(Ordering::SeqCst), 0);
        assert!(!closed.load(Ordering::SeqCst));

        stream.close().unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn volume_is_a_no_op_for_8_bit_samples() {
        struct Ramp8;
        impl AudioSourceCallback for Ramp8 {
            fn on_more_data(&self, dest: &mut [u8]) -> usize {
                for (i, byte) in dest.iter_mut().enumerate() {
                    *byte = if i % 2 == 0 { 0 } else { 100 };
                }
                dest.len()
            }
        }

        let opener = FakeCallbackOpener::new();
        let submissions = Arc::clone(&opener.submissions);
        let params = StreamParams::new(crate::stream::Format::PcmLinear, 1, 8000, 8);
        let mut stream = DoubleBufferStream::new(params, Arc::new(opener));

        stream.open(64).unwrap();
        stream.set_volume(0.5).unwrap();
        stream.start(Arc::new(Ramp8)).unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            submissions.lock().unwrap().len() >= 4
        }));
        stream.stop().unwrap();
        stream.close().unwrap();

        // 8-bit samples pass through untouched instead of being rescaled
        // as 16-bit pairs.
        for buffer in submissions.lock().unwrap().iter() {
            for (i, &byte) in buffer.iter().enumerate() {
                assert_eq!(byte, if i % 2 == 0 { 0 } else { 100 });
            }
        }
    }
}
