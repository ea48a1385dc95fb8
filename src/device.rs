//! `cpal` output-stream construction and lifecycle.
//!
//! Grounded on spottedcat's `Player::new`/`build_float_multi_track_stream`
//! (host -> default device -> `StreamConfig` -> `build_output_stream`),
//! generalized to honor [`EngineConfig`] (explicit device name, fixed
//! sample rate/channels instead of "whatever the device defaults to",
//! and a latency hint) and to hand the callback to a [`Mixer`] instead of
//! inlining the mix loop into the closure.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, StreamConfig};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::mixer::Mixer;

pub struct OutputDevice {
    stream: cpal::Stream,
}

impl OutputDevice {
    /// Open the configured output device and start streaming immediately.
    /// `mixer` is moved into the `cpal` callback closure and is the sole
    /// owner of its scratch buffers from this point on.
    pub fn open(mixer: Mixer, device_name: Option<&str>, sample_rate: u32, channels: u16, buffer_size: u32, latency: crate::config::StreamLatency) -> Result<Self> {
        let host = cpal::default_host();
        let device = select_device(&host, device_name)?;

        let name = device.name().unwrap_or_else(|_| "<unknown>".to_string());
        info!(device = %name, sample_rate, channels, buffer_size, "opening output stream");

        let requested_buffer = match latency {
            crate::config::StreamLatency::Low => BufferSize::Fixed(buffer_size.min(256)),
            crate::config::StreamLatency::Medium => BufferSize::Fixed(buffer_size),
            crate::config::StreamLatency::High => BufferSize::Fixed(buffer_size.max(2048)),
        };

        let config = StreamConfig {
            channels,
            sample_rate,
            buffer_size: requested_buffer,
        };

        let supported = device
            .supported_output_configs()
            .map_err(|e| EngineError::DeviceFailed(e.to_string()))?
            .find(|c| c.channels() == channels && c.sample_format() == SampleFormat::F32)
            .ok_or_else(|| EngineError::DeviceFailed("device does not support requested format".into()))?;
        let _ = supported;

        let stream = Self::build_stream(&device, &config, mixer)?;
        stream.play().map_err(|e| EngineError::DeviceFailed(e.to_string()))?;

        Ok(Self { stream })
    }

    fn build_stream(device: &cpal::Device, config: &StreamConfig, mut mixer: Mixer) -> Result<cpal::Stream> {
        let err_fn = |err: cpal::StreamError| warn!(error = %err, "output stream error");
        device
            .build_output_stream(
                config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    mixer.process(data);
                },
                err_fn,
                None,
            )
            .map_err(|e| EngineError::DeviceFailed(e.to_string()))
    }

    pub fn pause(&self) -> Result<()> {
        self.stream.pause().map_err(|e| EngineError::DeviceFailed(e.to_string()))
    }

    pub fn resume(&self) -> Result<()> {
        self.stream.play().map_err(|e| EngineError::DeviceFailed(e.to_string()))
    }
}

fn select_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| EngineError::DeviceFailed("no default output device available".into())),
        Some(wanted) => host
            .output_devices()
            .map_err(|e| EngineError::DeviceFailed(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| EngineError::DeviceFailed(format!("output device `{wanted}` not found"))),
    }
}
