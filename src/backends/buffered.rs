//! Buffered streaming backend (ALSA-style).
//!
//! A dedicated worker thread owns the device handle and pipelines two
//! feeding steps so the device cannot starve while the producer keeps up:
//!
//! - **BufferPackets** pulls data from the producer into the in-memory packet
//!   queue whenever the total buffered duration (device delay + queued bytes)
//!   falls below the target latency.
//! - **FillDevice** drains the packet queue into the device ring buffer
//!   whenever device capacity frees up, suspending itself when the queue
//!   empties rather than rescheduling uselessly.
//!
//! The stream object and the worker share state through a jointly owned
//! `Arc`; producer callbacks are never made while the stream lock is held.
//! `stop()` flips the state synchronously and schedules resource release on
//! the worker itself, since the device handle may only be closed from the thread
//! that owns it. `close()` joins the worker, so the caller observes `Closed`
//! only after teardown, including the final `on_close`, has completed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::device::{DeviceError, PcmDevice, PcmDeviceOpener};
use crate::error::{Error, Result};
use crate::packet::{Packet, PacketQueue};
use crate::source::AudioSourceCallback;
use crate::stream::{invalid_state, AudioOutputStream, StreamParams, StreamState};

/// Target latency window: how much buffered audio the worker tries to
/// maintain, and how often the device-fill step reruns while data flows.
const LATENCY_WINDOW: Duration = Duration::from_millis(10);

/// Floor on BufferPackets rescheduling, to avoid busy-looping.
const MIN_REBUFFER_DELAY: Duration = Duration::from_millis(10);

/// How long `open` waits for the worker to acquire the device handle.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Control messages from the stream object to its worker thread.
enum Control {
    /// Begin the feeding pipeline.
    Start,
    /// Release all resources and exit the run loop.
    Release,
}

/// State shared between the caller-visible stream and the worker.
struct Inner {
    state: StreamState,
    queue: PacketQueue,
    source: Option<Arc<dyn AudioSourceCallback>>,
    volume: f64,
    /// Set when the device-write step found the queue empty; cleared (and the
    /// write step rescheduled) as soon as new data arrives.
    device_write_suspended: bool,
    /// Guards against double-release of the device handle and double
    /// `on_close` delivery.
    resources_released: bool,
}

/// ALSA-style buffered streaming stream.
pub struct BufferedStream {
    params: StreamParams,
    opener: Arc<dyn PcmDeviceOpener>,
    muted: Arc<AtomicBool>,
    inner: Arc<Mutex<Inner>>,
    control_tx: Option<Sender<Control>>,
    worker: Option<JoinHandle<()>>,
    packet_size: usize,
}

impl BufferedStream {
    /// Create a stream that opens its device through `opener`.
    pub fn new(params: StreamParams, opener: Arc<dyn PcmDeviceOpener>) -> Self {
        Self::with_mute_flag(params, opener, Arc::new(AtomicBool::new(false)))
    }

    /// Create a stream sharing the factory's global mute flag.
    pub(crate) fn with_mute_flag(
        params: StreamParams,
        opener: Arc<dyn PcmDeviceOpener>,
        muted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            params,
            opener,
            muted,
            inner: Arc::new(Mutex::new(Inner {
                state: StreamState::Created,
                queue: PacketQueue::new(),
                source: None,
                volume: 1.0,
                device_write_suspended: false,
                resources_released: false,
            })),
            control_tx: None,
            worker: None,
            packet_size: 0,
        }
    }

    fn fail_open(&self, err: Error) -> Error {
        let mut inner = self.inner.lock().unwrap();
        inner.state = StreamState::Error;
        // Nothing was acquired; the release protocol is trivially done.
        inner.resources_released = true;
        err
    }
}

impl AudioOutputStream for BufferedStream {
    fn open(&mut self, packet_size: usize) -> Result<()> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.state != StreamState::Created {
                return Err(invalid_state("open", inner.state));
            }
        }
        if !self.params.is_valid() {
            return Err(self.fail_open(Error::UnsupportedParams(format!("{:?}", self.params))));
        }

        let bytes_per_frame = self.params.bytes_per_frame();
        let requested = if packet_size == 0 {
            self.params.default_packet_size()
        } else {
            packet_size
        };
        // Whole frames only.
        self.packet_size = (requested / bytes_per_frame).max(1) * bytes_per_frame;
        let packet_frames = self.packet_size / bytes_per_frame;

        let (control_tx, control_rx) = mpsc::channel();
        let (init_tx, init_rx) = mpsc::channel();
        let opener = Arc::clone(&self.opener);
        let params = self.params;
        let inner = Arc::clone(&self.inner);
        let muted = Arc::clone(&self.muted);
        let packet_size = self.packet_size;

        // The device handle is owned by the worker from the moment it is
        // opened; no other thread ever touches it.
        let handle = thread::spawn(move || {
            let device = match opener.open(&params, packet_frames) {
                Ok(device) => device,
                Err(err) => {
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };
            let _ = init_tx.send(Ok(()));

            Worker {
                device,
                rx: control_rx,
                inner,
                params,
                packet_size,
                min_buffer_frames: (params.sample_rate as usize / 100).max(1),
                muted,
                next_buffer: None,
                next_fill: None,
            }
            .run();
        });

        match init_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => {
                self.control_tx = Some(control_tx);
                self.worker = Some(handle);
                self.inner.lock().unwrap().state = StreamState::Opened;
                log::debug!(
                    "opened buffered stream: {:?}, packet size {} bytes",
                    self.params,
                    self.packet_size
                );
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(self.fail_open(err))
            }
            Err(_) => {
                let _ = handle.join();
                Err(self.fail_open(Error::open_failure("timed out waiting for device")))
            }
        }
    }

    fn start(&mut self, source: Arc<dyn AudioSourceCallback>) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != StreamState::Opened {
                return Err(invalid_state("start", inner.state));
            }
            inner.source = Some(source);
            inner.state = StreamState::Started;
        }
        if let Some(tx) = &self.control_tx {
            let _ = tx.send(Control::Start);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != StreamState::Started {
                return Err(invalid_state("stop", inner.state));
            }
            // Observed synchronously; the release itself runs on the worker.
            inner.state = StreamState::Stopped;
        }
        if let Some(tx) = &self.control_tx {
            let _ = tx.send(Control::Release);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                StreamState::Opened | StreamState::Stopped | StreamState::Error => {}
                state => return Err(invalid_state("close", state)),
            }
            if !inner.resources_released {
                inner.state = StreamState::Closing;
            }
        }
        if let Some(tx) = self.control_tx.take() {
            let _ = tx.send(Control::Release);
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        self.inner.lock().unwrap().state = StreamState::Closed;
        Ok(())
    }

    fn set_volume(&mut self, volume: f64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return Err(invalid_state("set_volume", inner.state));
        }
        inner.volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    fn volume(&self) -> f64 {
        self.inner.lock().unwrap().volume
    }

    fn state(&self) -> StreamState {
        self.inner.lock().unwrap().state
    }
}

impl Drop for BufferedStream {
    fn drop(&mut self) {
        // Disconnecting the channel makes the worker release and exit.
        self.control_tx.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// Worker thread
// =============================================================================

struct Worker {
    device: Box<dyn PcmDevice>,
    rx: Receiver<Control>,
    inner: Arc<Mutex<Inner>>,
    params: StreamParams,
    packet_size: usize,
    min_buffer_frames: usize,
    muted: Arc<AtomicBool>,
    next_buffer: Option<Instant>,
    next_fill: Option<Instant>,
}

impl Worker {
    fn run(mut self) {
        loop {
            let message = match self.next_deadline() {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match self.rx.recv_timeout(timeout) {
                        Ok(message) => Some(message),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => Some(Control::Release),
                    }
                }
                None => match self.rx.recv() {
                    Ok(message) => Some(message),
                    Err(_) => Some(Control::Release),
                },
            };

            match message {
                Some(Control::Start) => {
                    let now = Instant::now();
                    self.next_buffer = Some(now);
                    self.next_fill = Some(now);
                }
                Some(Control::Release) => {
                    self.release(None);
                    return;
                }
                None => {}
            }

            let now = Instant::now();
            if self.next_buffer.is_some_and(|at| at <= now) {
                self.buffer_packets();
            }
            if self.next_fill.is_some_and(|at| at <= now) {
                if let Err(err) = self.fill_device() {
                    log::error!("unrecoverable device write failure: {}", err);
                    self.release(Some(err));
                    return;
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.next_buffer, self.next_fill) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Pull data from the producer whenever buffered duration is below the
    /// target, then reschedule for when the buffer will next run low.
    fn buffer_packets(&mut self) {
        self.next_buffer = None;
        let bytes_per_frame = self.params.bytes_per_frame();

        let (source, queued_frames) = {
            let inner = self.inner.lock().unwrap();
            if inner.state != StreamState::Started {
                return;
            }
            (
                inner.source.clone(),
                inner.queue.buffered_bytes() / bytes_per_frame,
            )
        };
        let Some(source) = source else { return };

        let device_delay = self.device.delay_frames().unwrap_or(0);
        let mut frames_of_delay = device_delay + queued_frames;
        let mut produced = 0;

        if frames_of_delay < self.min_buffer_frames {
            // Producer call made without the stream lock so control
            // operations are not stalled behind producer latency.
            let mut packet = Packet::new(self.packet_size);
            produced = source.on_more_data(packet.writable());
            packet.set_size(produced);

            let mut inner = self.inner.lock().unwrap();
            if inner.state != StreamState::Started {
                return;
            }
            if packet.remaining() > 0 {
                inner.queue.push(packet);
                if inner.device_write_suspended {
                    inner.device_write_suspended = false;
                    self.next_fill = Some(Instant::now());
                }
            }
            frames_of_delay = device_delay + inner.queue.buffered_bytes() / bytes_per_frame;
        }

        self.next_buffer = Some(if frames_of_delay < self.min_buffer_frames && produced > 0 {
            // Still below target and the producer has data: go again now.
            Instant::now()
        } else {
            let surplus_frames = frames_of_delay.saturating_sub(self.min_buffer_frames);
            let until_low = Duration::from_secs_f64(
                surplus_frames as f64 / self.params.sample_rate as f64,
            );
            Instant::now() + until_low.max(MIN_REBUFFER_DELAY)
        });
    }

    /// Drain queued packets into the device while it has capacity.
    ///
    /// A recoverable device error gets one driver-level recovery attempt;
    /// anything else propagates so the run loop can release everything and
    /// enter the error state.
    fn fill_device(&mut self) -> std::result::Result<(), DeviceError> {
        self.next_fill = None;
        let bytes_per_frame = self.params.bytes_per_frame();

        let mut writable = match self.device.writable_frames() {
            Ok(frames) => frames,
            Err(err) if err.is_recoverable() => {
                self.device.recover(&err)?;
                self.device.writable_frames()?
            }
            Err(err) => return Err(err),
        };

        while writable > 0 {
            let chunk = {
                let mut inner = self.inner.lock().unwrap();
                if inner.state != StreamState::Started {
                    return Ok(());
                }
                match inner.queue.front() {
                    None => {
                        inner.device_write_suspended = true;
                        return Ok(());
                    }
                    Some(front) => {
                        let n = front.unread().len().min(writable * bytes_per_frame);
                        let n = n - n % bytes_per_frame;
                        if n == 0 {
                            // Partial frame at the head; wait for more data.
                            inner.device_write_suspended = true;
                            return Ok(());
                        }
                        let mut chunk = front.unread()[..n].to_vec();
                        self.apply_volume(&mut chunk, inner.volume);
                        chunk
                    }
                }
            };

            let mut recovery_attempted = false;
            let written = loop {
                match self.device.write(&chunk) {
                    Ok(frames) => break frames,
                    Err(err) if err.is_recoverable() && !recovery_attempted => {
                        log::warn!("recoverable device error ({}), retrying", err);
                        recovery_attempted = true;
                        self.device.recover(&err)?;
                    }
                    Err(err) => return Err(err),
                }
            };
            if written == 0 {
                break;
            }

            self.inner
                .lock()
                .unwrap()
                .queue
                .consume_front(written * bytes_per_frame);
            writable = writable.saturating_sub(written);
        }

        self.next_fill = Some(Instant::now() + LATENCY_WINDOW);
        Ok(())
    }

    fn apply_volume(&self, chunk: &mut [u8], volume: f64) {
        if self.muted.load(Ordering::Relaxed) {
            chunk.fill(0);
        } else if volume < 0.999 && self.params.bits_per_sample == 16 {
            for sample in chunk.chunks_exact_mut(2) {
                let value = i16::from_le_bytes([sample[0], sample[1]]);
                let scaled = (value as f64 * volume) as i16;
                sample.copy_from_slice(&scaled.to_le_bytes());
            }
        }
    }

    /// Tear everything down: close the device, free queued packets, notify
    /// the producer. Unconditional and idempotent. The error transition and
    /// the release happen together, never separately.
    fn release(&mut self, error: Option<DeviceError>) {
        let source = {
            let mut inner = self.inner.lock().unwrap();
            if inner.resources_released {
                if inner.state == StreamState::Closing {
                    inner.state = StreamState::Closed;
                }
                return;
            }
            inner.resources_released = true;
            inner.queue.clear();
            inner.state = match (&error, inner.state) {
                (Some(_), _) => StreamState::Error,
                (None, StreamState::Closing) => StreamState::Closed,
                (None, state) => state,
            };
            inner.source.take()
        };

        self.device.close();
        self.next_buffer = None;
        self.next_fill = None;

        if let Some(source) = source {
            if let Some(err) = &error {
                source.on_error(err.code());
            }
            source.on_close();
        }
        log::debug!("buffered stream resources released");
    }
}
