//! Immutable engine configuration.

/// Relative priority hint passed down to the output device.
///
/// The engine itself does not change its behavior based on this value; it
/// is forwarded to `cpal`'s buffer-size negotiation as a hint (lower
/// latency implies a smaller requested buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamLatency {
    Low,
    #[default]
    Medium,
    High,
}

/// Engine construction options. Immutable after the engine starts.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Output channel count (1 or 2).
    pub channels: u16,
    /// Frames produced per device callback.
    pub buffer_size: u32,
    /// Maximum number of tracks loaded simultaneously.
    pub max_tracks: usize,
    /// Explicit output device name; `None` selects the host default.
    pub device: Option<String>,
    /// Latency hint forwarded to the output stream.
    pub stream_latency: StreamLatency,
    /// Whether `load_track` may open streaming (ring-buffer-backed) sources.
    pub enable_streaming: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            buffer_size: 1024,
            max_tracks: 32,
            device: None,
            stream_latency: StreamLatency::Medium,
            enable_streaming: true,
        }
    }
}

impl EngineConfig {
    pub fn callback_period_secs(&self) -> f64 {
        self.buffer_size as f64 / self.sample_rate as f64
    }
}
