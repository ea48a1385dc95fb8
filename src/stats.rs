//! Query result types returned by the control plane.

use crate::track::TrackState;
use crate::track_id::TrackId;
use crate::watcher::WatcherStats;

/// Snapshot of one track's playback state, returned by `get_track_info`.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub id: TrackId,
    pub state: TrackState,
    pub position_seconds: f64,
    pub duration_seconds: f64,
    pub volume: f32,
    pub speed: f32,
    pub loop_enabled: bool,
    pub muted: bool,
    pub underrun_count: u64,
    /// The track's own source sample rate, in Hz.
    pub sample_rate: u32,
    /// The engine's output sample rate, in Hz.
    pub engine_sample_rate: u32,
    /// `sample_rate / engine_sample_rate` — the resampling ratio the mixer
    /// applies to this track before a `speed` multiplier.
    pub sample_rate_ratio: f64,
}

/// Engine-wide performance snapshot, returned by `get_performance_stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceStats {
    pub active_track_count: usize,
    pub loaded_track_count: usize,
    pub last_callback_peak: f32,
    pub callback_count: u64,
    /// Fraction of the last callback's budget the mixer actually used
    /// (`callback_time / buffer_period`).
    pub cpu_usage: f32,
    /// Sum of every loaded track's underrun count.
    pub underruns: u64,
    pub watcher: WatcherStats,
}
