//! Cross-platform callback device on top of cpal, behind the `cpal` feature.
//!
//! The cpal stream handle is not `Send`, so a holder thread builds and owns
//! it for the device's whole life. Submitted packets travel to the audio
//! callback through a lock-free queue; the callback plays them in order and
//! fires the completion when it finishes one. `open` blocks on an init
//! handshake so failures surface synchronously.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_queue::ArrayQueue;

use crate::device::{CallbackDevice, CallbackDeviceOpener, CompletionFn};
use crate::error::{Error, Result};
use crate::stream::StreamParams;

const INIT_TIMEOUT: Duration = Duration::from_secs(5);

struct Submission {
    index: usize,
    data: Vec<u8>,
}

/// Opens the host's default output device.
#[derive(Default)]
pub struct CpalDeviceOpener;

impl CallbackDeviceOpener for CpalDeviceOpener {
    fn open(
        &self,
        params: &StreamParams,
        buffer_count: usize,
        on_done: CompletionFn,
    ) -> Result<Box<dyn CallbackDevice>> {
        if params.bits_per_sample != 16 {
            return Err(Error::UnsupportedParams(format!(
                "{} bits per sample",
                params.bits_per_sample
            )));
        }

        // Room for every circulating buffer plus one in-flight resubmit.
        let queue = Arc::new(ArrayQueue::<Submission>::new(buffer_count + 1));
        let (init_tx, init_rx) = mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let holder = spawn_holder(params, Arc::clone(&queue), on_done, init_tx, stop_rx);

        match init_rx.recv_timeout(INIT_TIMEOUT) {
            Ok(Ok(())) => Ok(Box::new(CpalCallbackDevice {
                queue,
                stop_tx: Some(stop_tx),
                holder: Some(holder),
            })),
            Ok(Err(err)) => {
                let _ = holder.join();
                Err(err)
            }
            Err(_) => {
                drop(stop_tx);
                let _ = holder.join();
                Err(Error::open_failure("timed out waiting for output stream"))
            }
        }
    }
}

fn spawn_holder(
    params: &StreamParams,
    queue: Arc<ArrayQueue<Submission>>,
    on_done: CompletionFn,
    init_tx: Sender<Result<()>>,
    stop_rx: Receiver<()>,
) -> JoinHandle<()> {
    let config = cpal::StreamConfig {
        channels: params.channels,
        sample_rate: cpal::SampleRate(params.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    thread::spawn(move || {
        let host = cpal::default_host();
        let device = match host.default_output_device() {
            Some(device) => device,
            None => {
                let _ = init_tx.send(Err(Error::open_failure("no output device")));
                return;
            }
        };

        // Callback-local playback cursor over the current submission.
        let mut current: Option<(Submission, usize)> = None;
        let data_callback = move |out: &mut [i16], _info: &cpal::OutputCallbackInfo| {
            for sample in out.iter_mut() {
                while current.is_none() {
                    match queue.pop() {
                        Some(submission) if submission.data.len() >= 2 => {
                            current = Some((submission, 0));
                        }
                        Some(submission) => on_done(submission.index),
                        None => break,
                    }
                }
                match &mut current {
                    Some((submission, pos)) => {
                        *sample = i16::from_le_bytes([
                            submission.data[*pos],
                            submission.data[*pos + 1],
                        ]);
                        *pos += 2;
                        if *pos + 1 >= submission.data.len() {
                            on_done(submission.index);
                            current = None;
                        }
                    }
                    None => *sample = 0,
                }
            }
        };

        let stream = match device.build_output_stream(
            &config,
            data_callback,
            |err| log::error!("output stream error: {}", err),
            None,
        ) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = init_tx.send(Err(Error::open_failure(format!(
                    "build output stream: {}",
                    err
                ))));
                return;
            }
        };
        if let Err(err) = stream.play() {
            let _ = init_tx
                .send(Err(Error::open_failure(format!("start stream: {}", err))));
            return;
        }
        let _ = init_tx.send(Ok(()));

        // Park until the device is reset or closed; dropping the stream
        // stops the audio callbacks.
        let _ = stop_rx.recv();
        drop(stream);
    })
}

struct CpalCallbackDevice {
    queue: Arc<ArrayQueue<Submission>>,
    stop_tx: Option<Sender<()>>,
    holder: Option<JoinHandle<()>>,
}

impl CallbackDevice for CpalCallbackDevice {
    fn submit(&mut self, buffer_index: usize, data: &[u8]) -> Result<()> {
        let submission = Submission {
            index: buffer_index,
            data: data.to_vec(),
        };
        self.queue.push(submission).map_err(|_| Error::DeviceWrite {
            code: -1,
            message: "submission queue full".into(),
        })
    }

    fn reset(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(holder) = self.holder.take() {
            let _ = holder.join();
        }
        while self.queue.pop().is_some() {}
    }

    fn close(&mut self) {
        self.reset();
    }
}

impl Drop for CpalCallbackDevice {
    fn drop(&mut self) {
        self.reset();
    }
}
