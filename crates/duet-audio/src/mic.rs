//! cpal microphone driver.
//!
//! Every supported sample format is normalized to f32 on the callback
//! thread and handed to the session's [`CaptureSink`].

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, DefaultStreamConfigError, FromSample, Host, PlayStreamError, Sample};
use tracing::{error, info};

use crate::capture::{AudioFormat, AudioInput, CaptureError, CaptureSink, MicrophoneGuard};

type Result<T> = std::result::Result<T, CaptureError>;

/// The default input device of the default host.
pub struct CpalInput {
    host: Host,
}

impl Default for CpalInput {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalInput {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }
}

impl AudioInput for CpalInput {
    fn acquire(&self, sink: CaptureSink) -> Result<MicrophoneGuard> {
        let device = self
            .host
            .default_input_device()
            .ok_or(CaptureError::NoInputDevice)?;
        let config = device
            .default_input_config()
            .map_err(map_config_error)?;

        info!(
            device_name = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            config = ?config,
            "Recording from device"
        );

        let format = AudioFormat {
            sample_rate: config.sample_rate().0,
            channels: config.channels(),
        };
        let stream_config: cpal::StreamConfig = config.clone().into();

        let err_sink = sink.clone();
        let err_fn = move |err: cpal::StreamError| {
            error!("an error occurred on stream: {}", err);
            err_sink.fail(err.to_string());
        };

        let stream = match config.sample_format() {
            cpal::SampleFormat::I8 => build_stream::<i8>(&device, &stream_config, sink, err_fn)?,
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, sink, err_fn)?,
            cpal::SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, sink, err_fn)?,
            cpal::SampleFormat::U8 => build_stream::<u8>(&device, &stream_config, sink, err_fn)?,
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, sink, err_fn)?,
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, sink, err_fn)?,
            sample_format => {
                return Err(CaptureError::SampleFormatNotSupported(format!(
                    "{:?}",
                    sample_format
                )));
            }
        };

        stream.play().map_err(map_play_error)?;

        Ok(MicrophoneGuard::new(format, move || {
            // Pause before dropping so the callback stops before the stream
            // is torn down on every backend.
            stream.pause().ok();
            drop(stream);
        }))
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sink: CaptureSink,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &_| write_input_data(data, &sink),
            err_fn,
            None,
        )
        .map_err(map_build_error)
}

fn write_input_data<T>(input: &[T], sink: &CaptureSink)
where
    T: Sample,
    f32: FromSample<T>,
{
    let samples: Vec<f32> = input.iter().map(|&sample| f32::from_sample(sample)).collect();
    sink.push(&samples);
}

/// Backends only describe permission failures in their error text.
fn mentions_permission(description: &str) -> bool {
    let description = description.to_lowercase();
    ["permission", "denied", "not authorized", "unauthorized"]
        .iter()
        .any(|needle| description.contains(needle))
}

fn map_config_error(err: DefaultStreamConfigError) -> CaptureError {
    match err {
        DefaultStreamConfigError::DeviceNotAvailable => CaptureError::NoInputDevice,
        DefaultStreamConfigError::BackendSpecific { err }
            if mentions_permission(&err.description) =>
        {
            CaptureError::PermissionDenied(err.description)
        }
        other => CaptureError::Device(other.to_string()),
    }
}

fn map_build_error(err: BuildStreamError) -> CaptureError {
    match err {
        BuildStreamError::BackendSpecific { err } if mentions_permission(&err.description) => {
            CaptureError::PermissionDenied(err.description)
        }
        other => CaptureError::BuildStream(other),
    }
}

fn map_play_error(err: PlayStreamError) -> CaptureError {
    match err {
        PlayStreamError::BackendSpecific { err } if mentions_permission(&err.description) => {
            CaptureError::PermissionDenied(err.description)
        }
        other => CaptureError::PlayStream(other),
    }
}
