//! Per-track playback state: lifecycle, DSP parameters, and the
//! control-plane -> audio-thread command queue.
//!
//! Generalized from spottedcat's `audio::track::Track` (which held a
//! `Mutex<PlaybackCommand>` and a `Mutex<u32>` cursor) into a lock-free
//! atomic layout: target/mixer-owned scalars live in `std::sync::atomic`
//! cells so the mixer never blocks on them, and discrete state transitions
//! (play/stop/pause/resume/mute/unmute) are serialized through a per-track
//! command queue drained at callback entry — the same shape as
//! spottedcat's `rx_command.try_recv()` loop in
//! `Player::build_float_multi_track_stream`, generalized from one
//! command kind (`PlaybackCommand`) to a fuller transition set.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

use crate::ring_buffer::RingConsumer;
use crate::track_id::TrackId;

/// Callback fired once per natural end, stop, or load failure.
pub type OnComplete = Box<dyn Fn(&TrackId, bool, Option<&str>) + Send + Sync>;

/// How a track's audio is sourced.
pub enum TrackMode {
    /// Entire source decoded up front; `data` is immutable and shared
    /// read-only by the mixer.
    Preloaded { data: Arc<[f32]> },
    /// Source streamed from a background loader thread through an SPSC
    /// ring buffer, the loader thread being its sole producer.
    Streaming { ring: Mutex<RingConsumer> },
}

/// Track lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackState {
    Idle = 0,
    Playing = 1,
    Paused = 2,
    FadingIn = 3,
    FadingOut = 4,
    Ending = 5,
}

impl TrackState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TrackState::Idle,
            1 => TrackState::Playing,
            2 => TrackState::Paused,
            3 => TrackState::FadingIn,
            4 => TrackState::FadingOut,
            _ => TrackState::Ending,
        }
    }

    /// A track whose state is one of these counts toward the active-track
    /// cap and is included in the mixer's snapshot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TrackState::Playing | TrackState::FadingIn | TrackState::FadingOut | TrackState::Ending
        )
    }
}

/// Discrete transition commands, applied in issue order at callback entry
/// by the per-track command queue.
#[derive(Debug, Clone)]
pub enum TrackCommand {
    Play {
        fade_in_frames: u64,
        loop_enabled: bool,
        seek_frames: Option<u64>,
        volume: Option<f32>,
    },
    Stop {
        fade_out_frames: u64,
    },
    Pause,
    Resume,
    Mute,
    Unmute,
}

const NO_SEEK: i64 = -1;
/// Per-buffer volume-smoothing window used whenever no explicit fade is
/// active, so a plain `set_volume` still ramps rather than stepping.
pub const DEFAULT_VOLUME_SMOOTH_FRAMES: u64 = 512;

pub struct Track {
    pub id: TrackId,
    pub mode: TrackMode,
    pub source_sample_rate: u32,
    pub source_channels: u16,
    pub duration_frames: u64,

    state: AtomicU8,
    /// Source-frame position, f64 bits. Mixer-owned; read with Acquire by
    /// the watcher/stats, written with Release by the mixer.
    cursor_bits: AtomicU64,
    current_volume_bits: AtomicU32,
    target_volume_bits: AtomicU32,
    target_speed_bits: AtomicU32,
    loop_enabled: AtomicBool,
    muted: AtomicBool,
    saved_volume_bits: AtomicU32,
    /// Frames remaining in an explicit play/stop fade; 0 = none active.
    fade_remaining: AtomicU64,
    fade_target_bits: AtomicU32,
    fade_step_bits: AtomicU32,
    /// Target slot for `seek`; `NO_SEEK` when empty, else a source-frame
    /// index the mixer applies on its next callback.
    pending_seek: AtomicI64,
    underrun_count: AtomicU64,

    cmd_tx: Sender<TrackCommand>,
    cmd_rx: Receiver<TrackCommand>,

    on_complete: Mutex<Option<OnComplete>>,
    /// Set by the loader thread on a decode error or failed loop rewind,
    /// read (and cleared) by the mixer the next time it observes the ring
    /// ended — so a streaming failure is reported through the single
    /// `CompletionEvent` dispatch path instead of the loader firing
    /// `on_complete` itself and the mixer firing it again for the same
    /// end-of-ring.
    failure_reason: Mutex<Option<String>>,
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Track {
    pub fn new_preloaded(
        id: TrackId,
        data: Arc<[f32]>,
        source_sample_rate: u32,
        source_channels: u16,
        duration_frames: u64,
        on_complete: Option<OnComplete>,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            id,
            TrackMode::Preloaded { data },
            source_sample_rate,
            source_channels,
            duration_frames,
            on_complete,
        ))
    }

    pub fn new_streaming(
        id: TrackId,
        ring: RingConsumer,
        source_sample_rate: u32,
        source_channels: u16,
        duration_frames: u64,
        on_complete: Option<OnComplete>,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            id,
            TrackMode::Streaming { ring: Mutex::new(ring) },
            source_sample_rate,
            source_channels,
            duration_frames,
            on_complete,
        ))
    }

    fn new(
        id: TrackId,
        mode: TrackMode,
        source_sample_rate: u32,
        source_channels: u16,
        duration_frames: u64,
        on_complete: Option<OnComplete>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        Self {
            id,
            mode,
            source_sample_rate,
            source_channels,
            duration_frames,
            state: AtomicU8::new(TrackState::Idle as u8),
            cursor_bits: AtomicU64::new(0f64.to_bits()),
            current_volume_bits: AtomicU32::new(1.0f32.to_bits()),
            target_volume_bits: AtomicU32::new(1.0f32.to_bits()),
            target_speed_bits: AtomicU32::new(1.0f32.to_bits()),
            loop_enabled: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            saved_volume_bits: AtomicU32::new(1.0f32.to_bits()),
            fade_remaining: AtomicU64::new(0),
            fade_target_bits: AtomicU32::new(1.0f32.to_bits()),
            fade_step_bits: AtomicU32::new(0f32.to_bits()),
            pending_seek: AtomicI64::new(NO_SEEK),
            underrun_count: AtomicU64::new(0),
            cmd_tx,
            cmd_rx,
            on_complete: Mutex::new(on_complete),
            failure_reason: Mutex::new(None),
        }
    }

    // ---- control-plane side: cheap, never blocks on the audio thread ----

    pub fn enqueue(&self, cmd: TrackCommand) {
        let _ = self.cmd_tx.send(cmd);
    }

    pub fn set_target_volume(&self, v: f32) {
        self.target_volume_bits.store(v.max(0.0).to_bits(), Ordering::Relaxed);
    }

    pub fn target_volume(&self) -> f32 {
        f32::from_bits(self.target_volume_bits.load(Ordering::Relaxed))
    }

    pub fn set_speed(&self, s: f32) {
        self.target_speed_bits.store(s.to_bits(), Ordering::Relaxed);
    }

    pub fn speed(&self) -> f32 {
        f32::from_bits(self.target_speed_bits.load(Ordering::Relaxed))
    }

    pub fn set_loop(&self, enabled: bool) {
        self.loop_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn loop_enabled(&self) -> bool {
        self.loop_enabled.load(Ordering::Relaxed)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn request_seek(&self, frame: u64) {
        self.pending_seek.store(frame as i64, Ordering::Release);
    }

    pub fn set_on_complete(&self, cb: Option<OnComplete>) {
        *self.on_complete.lock().unwrap() = cb;
    }

    // ---- shared read-only queries (watcher, stats, public API) ----

    pub fn state(&self) -> TrackState {
        TrackState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn cursor_frames(&self) -> f64 {
        f64::from_bits(self.cursor_bits.load(Ordering::Acquire))
    }

    pub fn position_seconds(&self) -> f64 {
        self.cursor_frames() / self.source_sample_rate.max(1) as f64
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration_frames as f64 / self.source_sample_rate.max(1) as f64
    }

    pub fn current_volume(&self) -> f32 {
        f32::from_bits(self.current_volume_bits.load(Ordering::Relaxed))
    }

    pub fn sample_rate_ratio(&self, engine_sample_rate: u32) -> f64 {
        self.source_sample_rate as f64 / engine_sample_rate.max(1) as f64
    }

    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    pub fn is_playing(&self) -> bool {
        matches!(self.state(), TrackState::Playing | TrackState::FadingIn | TrackState::FadingOut)
    }

    pub fn is_paused(&self) -> bool {
        self.state() == TrackState::Paused
    }

    // ---- mixer-only mutation, called from mixer.rs on the audio thread ----

    pub(crate) fn drain_commands(&self) -> Vec<TrackCommand> {
        self.cmd_rx.try_iter().collect()
    }

    pub(crate) fn take_pending_seek(&self) -> Option<u64> {
        let v = self.pending_seek.swap(NO_SEEK, Ordering::AcqRel);
        if v == NO_SEEK { None } else { Some(v as u64) }
    }

    pub(crate) fn set_state(&self, s: TrackState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub(crate) fn set_cursor(&self, frames: f64) {
        self.cursor_bits.store(frames.to_bits(), Ordering::Release);
    }

    pub(crate) fn set_current_volume(&self, v: f32) {
        self.current_volume_bits.store(v.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn fade_remaining(&self) -> u64 {
        self.fade_remaining.load(Ordering::Relaxed)
    }

    pub(crate) fn set_fade_remaining(&self, v: u64) {
        self.fade_remaining.store(v, Ordering::Relaxed);
    }

    pub(crate) fn fade_target(&self) -> f32 {
        f32::from_bits(self.fade_target_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn fade_step(&self) -> f32 {
        f32::from_bits(self.fade_step_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn start_fade(&self, target: f32, frames: u64) {
        let current = self.current_volume();
        let step = if frames > 0 { (target - current) / frames as f32 } else { 0.0 };
        self.fade_target_bits.store(target.to_bits(), Ordering::Relaxed);
        self.fade_step_bits.store(step.to_bits(), Ordering::Relaxed);
        self.fade_remaining.store(frames, Ordering::Relaxed);
    }

    pub(crate) fn mute_internal(&self) {
        self.saved_volume_bits
            .store(self.target_volume_bits.load(Ordering::Relaxed), Ordering::Relaxed);
        self.muted.store(true, Ordering::Relaxed);
        self.set_target_volume(0.0);
    }

    pub(crate) fn unmute_internal(&self) {
        let saved = f32::from_bits(self.saved_volume_bits.load(Ordering::Relaxed));
        self.muted.store(false, Ordering::Relaxed);
        self.set_target_volume(saved);
    }

    pub(crate) fn record_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fire_on_complete(&self, success: bool, reason: Option<&str>) {
        if let Ok(guard) = self.on_complete.lock() {
            if let Some(cb) = guard.as_ref() {
                cb(&self.id, success, reason);
            }
        }
    }

    pub(crate) fn set_failure_reason(&self, reason: String) {
        *self.failure_reason.lock().unwrap_or_else(|poison| poison.into_inner()) = Some(reason);
    }

    pub(crate) fn take_failure_reason(&self) -> Option<String> {
        self.failure_reason.lock().unwrap_or_else(|poison| poison.into_inner()).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_track() -> Arc<Track> {
        Track::new_preloaded(TrackId::new("t"), Arc::from(vec![0.0f32; 100]), 48_000, 1, 100, None)
    }

    #[test]
    fn starts_idle() {
        let t = test_track();
        assert_eq!(t.state(), TrackState::Idle);
        assert!(!t.state().is_active());
    }

    #[test]
    fn mute_then_unmute_restores_exact_volume() {
        let t = test_track();
        t.set_target_volume(0.8);
        t.mute_internal();
        assert_eq!(t.target_volume(), 0.0);
        t.unmute_internal();
        assert_eq!(t.target_volume(), 0.8);
    }

    #[test]
    fn pending_seek_round_trips_once() {
        let t = test_track();
        assert_eq!(t.take_pending_seek(), None);
        t.request_seek(42);
        assert_eq!(t.take_pending_seek(), Some(42));
        assert_eq!(t.take_pending_seek(), None);
    }

    #[test]
    fn commands_drain_in_order() {
        let t = test_track();
        t.enqueue(TrackCommand::Pause);
        t.enqueue(TrackCommand::Resume);
        let cmds = t.drain_commands();
        assert_eq!(cmds.len(), 2);
        assert!(matches!(cmds[0], TrackCommand::Pause));
        assert!(matches!(cmds[1], TrackCommand::Resume));
    }
}
