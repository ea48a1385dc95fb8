//! The real-time audio callback.
//!
//! Grounded on spottedcat's `Player::build_float_multi_track_stream`
//! (zero-then-sum-then-clip over a `Mutex<HashMap<_, Arc<Track>>>`),
//! generalized to a per-track pipeline of command-drain, resample,
//! channel-adapt, volume-ramp, and sum. Never allocates, never blocks: the
//! structural track map is only ever `try_lock`'d, and
//! every buffer this needs is pre-sized in [`Mixer::new`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use tracing::trace;

use crate::channel;
use crate::config::EngineConfig;
use crate::resampler;
use crate::track::{Track, TrackCommand, TrackMode, TrackState, DEFAULT_VOLUME_SMOOTH_FRAMES};
use crate::track_id::TrackId;

/// Headroom above the nominal source/output rate ratio the scratch
/// buffers are sized for; `speed` beyond this is clamped rather than
/// risking an allocation on the audio thread.
const MAX_RATIO_HEADROOM: f64 = 4.0;

/// Emitted once per track completion (natural end, explicit stop, or a
/// decode/streaming failure) and drained off the audio thread by the
/// watcher, which is where `on_complete` is actually invoked — the mixer
/// itself never calls into caller-supplied code.
pub struct CompletionEvent {
    pub id: TrackId,
    pub success: bool,
    pub reason: Option<String>,
}

/// Engine-wide mixer counters, shared between the audio thread (sole
/// writer) and the control plane (readers via `get_performance_stats`),
/// since the `Mixer` itself is moved into the `cpal` callback closure and
/// unreachable once the stream is built.
#[derive(Default)]
pub struct MixerStats {
    peak_bits: AtomicU32,
    callback_count: AtomicU64,
    cpu_usage_bits: AtomicU32,
}

impl MixerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peak(&self) -> f32 {
        f32::from_bits(self.peak_bits.load(Ordering::Relaxed))
    }

    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    /// Fraction of the callback period the last callback actually took
    /// (`callback_time / buffer_period`); 1.0 means the callback used its
    /// entire budget.
    pub fn cpu_usage(&self) -> f32 {
        f32::from_bits(self.cpu_usage_bits.load(Ordering::Relaxed))
    }

    fn record(&self, peak: f32, cpu_usage: f32) {
        self.peak_bits.store(peak.to_bits(), Ordering::Relaxed);
        self.cpu_usage_bits.store(cpu_usage.to_bits(), Ordering::Relaxed);
        self.callback_count.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Mixer {
    config: EngineConfig,
    tracks: Arc<Mutex<HashMap<TrackId, Arc<Track>>>>,
    completion_tx: Sender<CompletionEvent>,
    stats: Arc<MixerStats>,

    last_snapshot: Vec<Arc<Track>>,
    max_src_frames: usize,
    scratch_src: Vec<f32>,
    scratch_resampled: Vec<f32>,
    scratch_adapted: Vec<f32>,
    scratch_gains: Vec<f32>,
}

impl Mixer {
    pub fn new(
        config: EngineConfig,
        tracks: Arc<Mutex<HashMap<TrackId, Arc<Track>>>>,
        completion_tx: Sender<CompletionEvent>,
        stats: Arc<MixerStats>,
    ) -> Self {
        let out_frames = config.buffer_size as usize;
        let max_src_frames = resampler::frames_needed(out_frames, MAX_RATIO_HEADROOM);
        let out_channels = config.channels as usize;
        Self {
            config,
            tracks,
            completion_tx,
            stats,
            last_snapshot: Vec::new(),
            max_src_frames,
            scratch_src: vec![0.0; max_src_frames * 2],
            scratch_resampled: vec![0.0; out_frames * 2],
            scratch_adapted: vec![0.0; out_frames * out_channels],
            scratch_gains: vec![0.0; out_frames],
        }
    }

    /// Fill `out` (interleaved, `config.channels` wide) with one
    /// callback's worth of mixed audio. Called from the `cpal` stream
    /// callback; must never allocate, lock blockingly, or panic.
    pub fn process(&mut self, out: &mut [f32]) {
        let started = std::time::Instant::now();
        out.fill(0.0);
        let out_channels = self.config.channels as usize;
        let out_frames = out.len() / out_channels.max(1);

        self.refresh_snapshot();

        for track in self.last_snapshot.clone() {
            self.mix_one(&track, out, out_frames, out_channels);
        }
        // Tracks can sum beyond [-1, 1]; measure the pre-clip peak and
        // hard-clip in the same pass.
        let mut peak = 0.0f32;
        for sample in out.iter_mut() {
            peak = peak.max(sample.abs());
            *sample = sample.clamp(-1.0, 1.0);
        }

        let period = self.config.callback_period_secs().max(1e-9);
        let cpu_usage = (started.elapsed().as_secs_f64() / period) as f32;
        self.stats.record(peak, cpu_usage);
    }

    /// Snapshot the active track set. A blocked map (a load/unload racing
    /// this callback) falls back to the previous callback's snapshot
    /// rather than stalling the audio thread.
    fn refresh_snapshot(&mut self) {
        if let Ok(map) = self.tracks.try_lock() {
            self.last_snapshot.clear();
            self.last_snapshot.extend(
                map.values()
                    .filter(|t| t.state().is_active())
                    .cloned(),
            );
        }
        // else: keep last_snapshot as-is.
    }

    fn mix_one(&mut self, track: &Arc<Track>, out: &mut [f32], out_frames: usize, out_channels: usize) {
        self.apply_commands(track);
        self.apply_pending_seek(track);

        if !track.state().is_active() {
            return;
        }

        let speed = (track.speed().max(0.0) as f64).max(1e-6);
        // Clamped, not just the derived frame count below: `scratch_src`
        // is sized for `MAX_RATIO_HEADROOM`, and the clamp has to apply
        // before `resample_linear`/the cursor advance see `ratio`, or the
        // two would disagree on how many source frames this callback
        // actually consumed.
        let ratio = (track.sample_rate_ratio(self.config.sample_rate) * speed).clamp(1e-6, MAX_RATIO_HEADROOM);
        let n_src = resampler::frames_needed(out_frames, ratio).min(self.max_src_frames);
        let src_channels = track.source_channels as usize;

        let (filled, reached_end) = self.fill_source_window(track, n_src, src_channels);

        let cursor = track.cursor_frames();
        let cursor_frac = cursor.fract();
        let resampled_len = out_frames * src_channels;
        let resampled = &mut self.scratch_resampled[..resampled_len];
        let underflow = resampler::resample_linear(
            &self.scratch_src[..filled * src_channels],
            src_channels,
            cursor_frac,
            ratio,
            resampled,
        );
        if underflow > 0 {
            track.record_underrun();
        }

        let adapted_len = out_frames * out_channels;
        let adapted = &mut self.scratch_adapted[..adapted_len];
        channel::adapt(resampled, src_channels, adapted, out_channels, out_frames);

        let gains = &mut self.scratch_gains[..out_frames];
        apply_gain_ramp(track, out_frames, gains);

        for frame in 0..out_frames {
            let g = gains[frame];
            if g == 0.0 {
                continue;
            }
            for ch in 0..out_channels {
                out[frame * out_channels + ch] += adapted[frame * out_channels + ch] * g;
            }
        }

        self.advance_and_maybe_complete(track, cursor, out_frames as f64 * ratio, reached_end, out_frames);
    }

    /// Extract `n_src` source frames starting at the track's current
    /// floored cursor into `scratch_src`. Preloaded tracks get a
    /// two-segment read so a loop wrap doesn't require a contiguous
    /// buffer; streaming tracks pop straight from the ring.
    fn fill_source_window(&mut self, track: &Track, n_src: usize, src_channels: usize) -> (usize, bool) {
        let want = n_src * src_channels;
        match &track.mode {
            TrackMode::Preloaded { data } => {
                let total_frames = track.duration_frames as usize;
                if total_frames == 0 {
                    self.scratch_src[..want].fill(0.0);
                    return (0, true);
                }
                let start = track.cursor_frames().floor() as usize % total_frames.max(1);
                let mut written = 0usize;
                let mut pos = start;
                while written < n_src {
                    let remaining_in_source = total_frames - pos;
                    let take = remaining_in_source.min(n_src - written);
                    let src_slice = &data[pos * src_channels..(pos + take) * src_channels];
                    self.scratch_src[written * src_channels..(written + take) * src_channels]
                        .copy_from_slice(src_slice);
                    written += take;
                    pos += take;
                    if pos >= total_frames {
                        if !track.loop_enabled() {
                            break;
                        }
                        pos = 0;
                    }
                }
                let reached_end = !track.loop_enabled() && written < n_src;
                if written < n_src {
                    self.scratch_src[written * src_channels..want].fill(0.0);
                }
                (written, reached_end)
            }
            TrackMode::Streaming { ring } => {
                // The mixer is this ring's sole consumer, so
                // contention never happens; recovering from poison rather
                // than panicking keeps a stray loader-thread bug from ever
                // unwinding the audio callback.
                let mut ring = ring.lock().unwrap_or_else(|poison| poison.into_inner());
                let buf = &mut self.scratch_src[..want];
                let read = ring.pop_frames(buf);
                if read < n_src {
                    track.record_underrun();
                }
                let ended = ring.is_ended();
                (read, ended)
            }
        }
    }

    fn apply_commands(&self, track: &Arc<Track>) {
        for cmd in track.drain_commands() {
            match cmd {
                TrackCommand::Play {
                    fade_in_frames,
                    loop_enabled,
                    seek_frames,
                    volume,
                } => {
                    track.set_loop(loop_enabled);
                    track.set_cursor(seek_frames.unwrap_or(0) as f64);
                    if let Some(v) = volume {
                        track.set_target_volume(v);
                    }
                    track.set_current_volume(0.0);
                    if fade_in_frames > 0 {
                        track.start_fade(track.target_volume(), fade_in_frames);
                        track.set_state(TrackState::FadingIn);
                    } else {
                        track.set_current_volume(track.target_volume());
                        track.set_state(TrackState::Playing);
                    }
                }
                TrackCommand::Stop { fade_out_frames } => {
                    if fade_out_frames > 0 {
                        track.start_fade(0.0, fade_out_frames);
                        track.set_state(TrackState::FadingOut);
                    } else {
                        track.set_current_volume(0.0);
                        track.set_cursor(0.0);
                        track.set_state(TrackState::Idle);
                        self.notify(track.id.clone(), true, Some("stopped".to_string()));
                    }
                }
                TrackCommand::Pause => {
                    if track.is_playing() {
                        track.set_state(TrackState::Paused);
                    }
                }
                TrackCommand::Resume => {
                    if track.is_paused() {
                        track.set_state(TrackState::Playing);
                    }
                }
                TrackCommand::Mute => track.mute_internal(),
                TrackCommand::Unmute => track.unmute_internal(),
            }
        }
    }

    fn apply_pending_seek(&self, track: &Track) {
        if let Some(frame) = track.take_pending_seek() {
            track.set_cursor(frame as f64);
        }
    }

    fn advance_and_maybe_complete(
        &self,
        track: &Arc<Track>,
        cursor_before: f64,
        advance: f64,
        reached_end: bool,
        out_frames: usize,
    ) {
        let mut new_cursor = cursor_before + advance;

        if matches!(track.mode, TrackMode::Preloaded { .. }) {
            let total = track.duration_frames as f64;
            if total > 0.0 && track.loop_enabled() && new_cursor >= total {
                new_cursor %= total;
            }
        }
        track.set_cursor(new_cursor);

        let fade_done = self.advance_fade(track, out_frames);

        if reached_end && !track.loop_enabled() {
            track.set_state(TrackState::Ending);
        }
        // A fade-out from an explicit `Stop` completes in `FadingOut`, not
        // `Ending` (that state is reserved for natural end-of-source) — both
        // are terminal once their fade/end condition is satisfied.
        let stop_fade_done = track.state() == TrackState::FadingOut && fade_done;
        let natural_end_done = track.state() == TrackState::Ending && (fade_done || reached_end);
        if stop_fade_done || natural_end_done {
            track.set_current_volume(0.0);
            track.set_cursor(0.0);
            track.set_state(TrackState::Idle);
            match track.take_failure_reason() {
                Some(reason) => self.notify(track.id.clone(), false, Some(reason)),
                None => self.notify(track.id.clone(), true, None),
            }
        }
    }

    /// Move `current_volume` one callback closer to its target, either
    /// along an explicit play/stop fade or, absent one, a fixed-length
    /// smoothing window, covering the case where `set_volume` changed the
    /// target with no accompanying fade. Advances by the same per-frame
    /// rate `apply_gain_ramp` interpolated across this callback's buffer,
    /// so the two never disagree about how far the fade has moved.
    /// Returns `true` if an explicit fade just completed this callback.
    fn advance_fade(&self, track: &Track, out_frames: usize) -> bool {
        let remaining = track.fade_remaining();
        if remaining > 0 {
            let (step, target) = per_frame_volume_step(track);
            let left = remaining.saturating_sub(out_frames as u64);
            if left == 0 {
                track.set_current_volume(target);
                track.set_fade_remaining(0);
                return true;
            }
            let advanced = track.current_volume() + step * out_frames as f32;
            track.set_current_volume(clamp_toward(advanced, target, step));
            track.set_fade_remaining(left);
            return false;
        }

        let current = track.current_volume();
        let target = track.target_volume();
        if (current - target).abs() > f32::EPSILON {
            let (step, _) = per_frame_volume_step(track);
            let advanced = current + step * out_frames as f32;
            track.set_current_volume(clamp_toward(advanced, target, step));
        }
        false
    }

    fn notify(&self, id: TrackId, success: bool, reason: Option<String>) {
        trace!(track = %id, success, "track completion");
        let _ = self.completion_tx.send(CompletionEvent { id, success, reason });
    }
}


/// The per-frame volume delta and target `advance_fade` will apply this
/// callback, shared with `apply_gain_ramp` so the two never drift apart:
/// an explicit fade's `fade_step` is already a per-frame delta
/// (`Track::start_fade`), and the no-fade smoothing fallback gets one
/// computed the same way over `DEFAULT_VOLUME_SMOOTH_FRAMES`.
fn per_frame_volume_step(track: &Track) -> (f32, f32) {
    if track.fade_remaining() > 0 {
        (track.fade_step(), track.fade_target())
    } else {
        let current = track.current_volume();
        let target = track.target_volume();
        (per_frame_smoothing_step(current, target), target)
    }
}

fn per_frame_smoothing_step(current: f32, target: f32) -> f32 {
    (target - current) / DEFAULT_VOLUME_SMOOTH_FRAMES as f32
}

/// Move `value` by increments of `step` but never past `target` — guards
/// the last callback of a ramp, where `out_frames * step` can overshoot.
fn clamp_toward(value: f32, target: f32, step: f32) -> f32 {
    if step >= 0.0 {
        value.min(target)
    } else {
        value.max(target)
    }
}

/// Fill `gains` with this callback's per-frame volume multiplier,
/// interpolating linearly across the buffer so a fade's gain change is
/// spread over every output frame instead of snapping at buffer
/// boundaries (the zipper/click artifact fades exist to avoid).
fn apply_gain_ramp(track: &Track, frames: usize, gains: &mut [f32]) {
    let current = track.current_volume();
    let (step, target) = per_frame_volume_step(track);
    for (frame, gain) in gains[..frames].iter_mut().enumerate() {
        let value = clamp_toward(current + step * frame as f32, target, step);
        *gain = value.clamp(0.0, 1.0);
    }
}
