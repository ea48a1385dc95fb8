//! `trackmix` — a real-time, multi-track audio mixing engine.
//!
//! Host code loads named audio sources, issues playback commands, and the
//! engine continuously produces interleaved `f32` frames for an output
//! device at a fixed sample rate and channel count. Decoding is delegated
//! to `symphonia`; the output stream is delegated to `cpal`.
//!
//! # Example
//! ```no_run
//! use trackmix::{Engine, EngineConfig, AudioSource, LoadOptions, PlayOptions, TrackId};
//!
//! let mut engine = Engine::new(EngineConfig::default());
//! engine.start().expect("failed to open output device");
//!
//! let id = TrackId::new("background-music");
//! engine
//!     .load_track(id.clone(), AudioSource::File("music.ogg".into()), LoadOptions::default())
//!     .expect("failed to load track");
//! engine.play(&id, PlayOptions::default()).expect("failed to play track");
//! ```

mod channel;
mod config;
mod control;
mod device;
mod error;
mod loader;
mod loudness;
mod mixer;
mod resampler;
mod ring_buffer;
mod source;
mod stats;
mod track;
mod track_id;
mod watcher;

pub use config::{EngineConfig, StreamLatency};
pub use control::{Engine, LoadOptions, PlayOptions};
pub use error::{EngineError, Result};
pub use loudness::{LoudnessAnalyzer, LoudnessMethod, PeakAnalyzer, RmsAnalyzer};
pub use resampler::{HighQualityResampler, SincResampler};
pub use source::AudioSource;
pub use stats::{PerformanceStats, TrackInfo};
pub use track::{OnComplete, TrackState};
pub use track_id::TrackId;
pub use watcher::{GlobalListenerToken, GlobalPositionListener, PositionCallback, RegistrationToken, WatcherStats};
