//! ALSA playback device for the buffered backend. Linux only, behind the
//! `alsa` feature.

use alsa::pcm::{Access, Format as AlsaFormat, HwParams, PCM};
use alsa::{Direction, ValueOr};

use crate::device::{DeviceError, PcmDevice, PcmDeviceOpener};
use crate::error::{Error, Result};
use crate::stream::StreamParams;

/// Ring buffer sized to hold this many packets.
const BUFFER_PACKETS: usize = 4;

fn map_error(err: alsa::Error) -> DeviceError {
    match err.errno().abs() {
        32 => DeviceError::Underrun,
        86 => DeviceError::Suspended,
        code => DeviceError::Fatal {
            code: -code,
            message: err.to_string(),
        },
    }
}

/// Opens ALSA playback handles by device name (`"default"` normally).
pub struct AlsaDeviceOpener {
    device_name: String,
}

impl AlsaDeviceOpener {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
        }
    }
}

impl Default for AlsaDeviceOpener {
    fn default() -> Self {
        Self::new("default")
    }
}

impl PcmDeviceOpener for AlsaDeviceOpener {
    fn open(&self, params: &StreamParams, packet_frames: usize) -> Result<Box<dyn PcmDevice>> {
        let pcm = PCM::new(&self.device_name, Direction::Playback, false)
            .map_err(|err| Error::open_failure(format!("alsa open: {}", err)))?;

        let format = match params.bits_per_sample {
            8 => AlsaFormat::U8,
            16 => AlsaFormat::s16(),
            bits => {
                return Err(Error::UnsupportedParams(format!(
                    "{} bits per sample",
                    bits
                )))
            }
        };

        {
            let hwp = HwParams::any(&pcm)
                .map_err(|err| Error::open_failure(format!("alsa hw params: {}", err)))?;
            hwp.set_channels(params.channels as u32)
                .and_then(|_| hwp.set_rate(params.sample_rate, ValueOr::Nearest))
                .and_then(|_| hwp.set_format(format))
                .and_then(|_| hwp.set_access(Access::RWInterleaved))
                .map_err(|err| Error::open_failure(format!("alsa hw params: {}", err)))?;
            hwp.set_buffer_size_near((packet_frames * BUFFER_PACKETS) as i64)
                .map_err(|err| Error::open_failure(format!("alsa buffer size: {}", err)))?;
            pcm.hw_params(&hwp)
                .map_err(|err| Error::open_failure(format!("alsa hw params: {}", err)))?;
        }

        log::info!(
            "opened alsa device {:?} at {} Hz, {} channels",
            self.device_name,
            params.sample_rate,
            params.channels
        );
        Ok(Box::new(AlsaPcmDevice { pcm }))
    }
}

struct AlsaPcmDevice {
    pcm: PCM,
}

impl PcmDevice for AlsaPcmDevice {
    fn writable_frames(&mut self) -> std::result::Result<usize, DeviceError> {
        self.pcm
            .avail_update()
            .map(|frames| frames.max(0) as usize)
            .map_err(map_error)
    }

    fn write(&mut self, data: &[u8]) -> std::result::Result<usize, DeviceError> {
        self.pcm.io_bytes().writei(data).map_err(map_error)
    }

    fn delay_frames(&mut self) -> std::result::Result<usize, DeviceError> {
        self.pcm
            .delay()
            .map(|frames| frames.max(0) as usize)
            .map_err(map_error)
    }

    fn recover(&mut self, error: &DeviceError) -> std::result::Result<(), DeviceError> {
        self.pcm.recover(error.code(), true).map_err(map_error)
    }

    fn close(&mut self) {
        if let Err(err) = self.pcm.drop() {
            log::warn!("alsa drop failed: {}", err);
        }
    }
}
