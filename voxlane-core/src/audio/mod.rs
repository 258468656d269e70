//! Audio sources that feed a stream writer.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It must not wait for readers, so capture always drives a
//! [`WriterPolicy::Nonblockable`](crate::stream::WriterPolicy) writer: a
//! write only copies into the ring and bumps atomics. Slow readers are
//! lapped and see an overrun instead of stalling the device.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). `AudioCapture` must be created and dropped on the same thread.

pub mod wav;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, StreamConfig,
};

use crate::{
    error::{Result, VoxlaneError},
    stream::{Writer, WriterPolicy},
};
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Native frame layout of an input device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per sample of one channel.
    pub sample_bytes: usize,
}

impl CaptureFormat {
    /// Bytes per interleaved frame: the word size a capture stream needs.
    pub fn frame_size(&self) -> usize {
        usize::from(self.channels) * self.sample_bytes
    }
}

/// Handle to an active capture feeding a stream writer.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread.
pub struct AudioCapture {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: cpal::Stream,
    /// Shared flag: set to `false` to make the callback a no-op.
    running: Arc<AtomicBool>,
    pub format: CaptureFormat,
}

#[cfg(feature = "audio-cpal")]
fn select_device(preferred_device_name: Option<&str>) -> Result<cpal::Device> {
    use cpal::traits::HostTrait;

    let host = cpal::default_host();

    if let Some(preferred_name) = preferred_device_name {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(device) = devices.find(|device| {
                    device
                        .name()
                        .map(|name| name == preferred_name)
                        .unwrap_or(false)
                }) {
                    return Ok(device);
                }
                warn!(
                    "preferred input device '{}' not found, falling back",
                    preferred_name
                );
            }
            Err(e) => {
                warn!("failed to list input devices while resolving preference: {e}");
            }
        }
    }

    if let Some(default) = host.default_input_device() {
        return Ok(default);
    }
    let mut devices = host
        .input_devices()
        .map_err(|e| VoxlaneError::AudioDevice(e.to_string()))?;
    let fallback = devices.next().ok_or(VoxlaneError::NoDefaultInputDevice)?;
    warn!("no default input device, falling back to first available input");
    Ok(fallback)
}

/// Push one callback's worth of interleaved samples, encoded little-endian.
/// `scratch` is reused across callbacks so steady state does not allocate.
#[cfg(feature = "audio-cpal")]
fn push_frames<T: Copy, const N: usize>(
    writer: &Writer,
    running: &AtomicBool,
    scratch: &mut Vec<u8>,
    data: &[T],
    frame_size: usize,
    encode: impl Fn(T) -> [u8; N],
) {
    if !running.load(Ordering::Relaxed) {
        return;
    }
    scratch.clear();
    for &sample in data {
        scratch.extend_from_slice(&encode(sample));
    }
    let words = scratch.len() / frame_size;
    match writer.write(scratch, words) {
        Ok(_) => {}
        Err(VoxlaneError::StreamClosed) => {
            running.store(false, Ordering::Relaxed);
            warn!("capture writer closed, dropping further audio");
        }
        Err(e) => error!("capture write failed: {e}"),
    }
}

impl AudioCapture {
    /// Report the native format of the preferred (or default) input device so
    /// the stream can be created with a matching word size.
    #[cfg(feature = "audio-cpal")]
    pub fn probe_format(preferred_device_name: Option<&str>) -> Result<CaptureFormat> {
        let device = select_device(preferred_device_name)?;
        let supported = device
            .default_input_config()
            .map_err(|e| VoxlaneError::AudioDevice(e.to_string()))?;
        Ok(CaptureFormat {
            sample_rate: supported.sample_rate().0,
            channels: supported.channels(),
            sample_bytes: supported.sample_format().sample_size(),
        })
    }

    /// Open an input device by preferred name, otherwise fall back to the
    /// default input device and then the first available one. Every device
    /// callback writes its frames into `writer`.
    ///
    /// # Errors
    /// - `IncompatibleFormat` if `writer` is not Nonblockable or the device
    ///   frame size differs from the stream word size.
    /// - `NoDefaultInputDevice` / `AudioDevice` / `AudioStream` from cpal.
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        writer: Arc<Writer>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        if writer.policy() != WriterPolicy::Nonblockable {
            return Err(VoxlaneError::IncompatibleFormat(format!(
                "capture needs a nonblockable writer, got {:?}",
                writer.policy()
            )));
        }

        let device = select_device(preferred_device_name)?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| VoxlaneError::AudioDevice(e.to_string()))?;
        let format = CaptureFormat {
            sample_rate: supported.sample_rate().0,
            channels: supported.channels(),
            sample_bytes: supported.sample_format().sample_size(),
        };
        let frame_size = format.frame_size();
        if frame_size != writer.word_size() {
            return Err(VoxlaneError::IncompatibleFormat(format!(
                "device frames are {frame_size} bytes ({} ch, {:?}), stream words are {} bytes",
                format.channels,
                supported.sample_format(),
                writer.word_size()
            )));
        }
        info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            frame_size,
            "audio config selected"
        );

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let mut scratch: Vec<u8> = Vec::new();

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _info| {
                    push_frames(&writer, &flag, &mut scratch, data, frame_size, f32::to_le_bytes)
                },
                |err| error!("audio stream error: {err}"),
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _info| {
                    push_frames(&writer, &flag, &mut scratch, data, frame_size, i16::to_le_bytes)
                },
                |err| error!("audio stream error: {err}"),
                None,
            ),
            SampleFormat::U8 => device.build_input_stream(
                &config,
                move |data: &[u8], _info| {
                    push_frames(&writer, &flag, &mut scratch, data, frame_size, |s| [s])
                },
                |err| error!("audio stream error: {err}"),
                None,
            ),
            fmt => {
                return Err(VoxlaneError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| VoxlaneError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| VoxlaneError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            format,
        })
    }

    /// Capture from the system default microphone.
    #[cfg(feature = "audio-cpal")]
    pub fn open_default(writer: Arc<Writer>) -> Result<Self> {
        Self::open_with_preference(writer, None)
    }

    /// Stop: the callback drops audio from its next invocation on.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn probe_format(_preferred_device_name: Option<&str>) -> Result<CaptureFormat> {
        Err(VoxlaneError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn open_with_preference(
        writer: Arc<Writer>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        if writer.policy() != WriterPolicy::Nonblockable {
            return Err(VoxlaneError::IncompatibleFormat(format!(
                "capture needs a nonblockable writer, got {:?}",
                writer.policy()
            )));
        }
        Err(VoxlaneError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn open_default(writer: Arc<Writer>) -> Result<Self> {
        Self::open_with_preference(writer, None)
    }
}
