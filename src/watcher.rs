//! Position-callback watcher and completion-event dispatcher.
//!
//! A single background thread, Condvar-parked between polls the same way
//! `nethercore-zx::audio_thread`'s `AudioGenHandle` parks its generator
//! thread, doing two jobs once per wake:
//!
//! - firing registered position callbacks once a track's playhead enters
//!   `[target_s - tolerance_s, target_s + tolerance_s]`,
//! - draining [`CompletionEvent`]s the mixer pushed and invoking the
//!   owning track's `on_complete`, off the audio thread.
//!
//! Both run here, rather than on the real-time thread, so user-supplied
//! callbacks can allocate, log, or block without affecting playback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;
use tracing::trace;

use crate::mixer::CompletionEvent;
use crate::track::Track;
use crate::track_id::TrackId;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub type PositionCallback = Box<dyn Fn(&TrackId, f64) + Send + Sync>;
/// Fired every poll tick for every active track, unlike [`PositionCallback`]
/// which fires once a specific track crosses a specific target.
pub type GlobalPositionListener = Box<dyn Fn(&TrackId, f64) + Send + Sync>;

struct Registration {
    id: TrackId,
    target_s: f64,
    tolerance_s: f64,
    callback: PositionCallback,
    fired: bool,
}

/// Snapshot of the watcher's own activity, separate from [`crate::stats::PerformanceStats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WatcherStats {
    pub active_registrations: usize,
    pub triggered_count: u64,
    pub average_precision_s: f64,
}

struct WatcherShared {
    registrations: Mutex<Vec<Registration>>,
    global_listeners: Mutex<Vec<(u64, GlobalPositionListener)>>,
    triggered_count: AtomicU64,
    avg_precision_bits: AtomicU64,
}

pub struct WatcherHandle {
    shared: Arc<WatcherShared>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<(Mutex<bool>, Condvar)>,
    join: Option<JoinHandle<()>>,
    next_token: Mutex<u64>,
}

/// Opaque handle returned by [`WatcherHandle::register`], used to cancel
/// a position callback before it fires.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RegistrationToken(u64);

/// Opaque handle returned by [`WatcherHandle::add_global_listener`], used
/// to remove that listener later.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GlobalListenerToken(u64);

impl WatcherHandle {
    pub fn spawn(tracks: Arc<Mutex<HashMap<TrackId, Arc<Track>>>>, completion_rx: Receiver<CompletionEvent>) -> Self {
        let shared = Arc::new(WatcherShared {
            registrations: Mutex::new(Vec::new()),
            global_listeners: Mutex::new(Vec::new()),
            triggered_count: AtomicU64::new(0),
            avg_precision_bits: AtomicU64::new(0f64.to_bits()),
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let wake = Arc::new((Mutex::new(false), Condvar::new()));

        let thread_shared = shared.clone();
        let thread_shutdown = shutdown.clone();
        let thread_wake = wake.clone();

        let join = std::thread::Builder::new()
            .name("trackmix-watcher".into())
            .spawn(move || run_watcher(tracks, completion_rx, thread_shared, thread_shutdown, thread_wake))
            .expect("failed to spawn watcher thread");

        Self {
            shared,
            shutdown,
            wake,
            join: Some(join),
            next_token: Mutex::new(0),
        }
    }

    pub fn register(&self, id: TrackId, target_s: f64, tolerance_s: f64, callback: PositionCallback) -> RegistrationToken {
        let mut token_guard = self.next_token.lock().unwrap();
        let token = *token_guard;
        *token_guard += 1;
        drop(token_guard);

        self.shared.registrations.lock().unwrap().push(Registration {
            id,
            target_s,
            tolerance_s: tolerance_s.max(0.0),
            callback,
            fired: false,
        });
        self.wake();
        RegistrationToken(token)
    }

    pub fn unregister_for(&self, id: &TrackId) {
        self.shared.registrations.lock().unwrap().retain(|r| &r.id != id);
    }

    /// Cancel the single registration matching `id` and `target_s`, if one
    /// is still pending. A no-op if it already fired or never existed.
    pub fn remove_position_callback(&self, id: &TrackId, target_s: f64) {
        self.shared
            .registrations
            .lock()
            .unwrap()
            .retain(|r| !(&r.id == id && r.target_s == target_s));
    }

    /// Drop every pending per-track position callback. Global listeners
    /// are unaffected — use [`WatcherHandle::remove_global_listener`] for
    /// those.
    pub fn clear_all_position_callbacks(&self) {
        self.shared.registrations.lock().unwrap().clear();
    }

    /// Register a listener fired every poll tick for every currently
    /// active track with `(id, position_seconds)`.
    pub fn add_global_listener(&self, listener: GlobalPositionListener) -> GlobalListenerToken {
        let mut token_guard = self.next_token.lock().unwrap();
        let token = *token_guard;
        *token_guard += 1;
        drop(token_guard);

        self.shared.global_listeners.lock().unwrap().push((token, listener));
        self.wake();
        GlobalListenerToken(token)
    }

    pub fn remove_global_listener(&self, token: GlobalListenerToken) {
        self.shared.global_listeners.lock().unwrap().retain(|(t, _)| *t != token.0);
    }

    pub fn stats(&self) -> WatcherStats {
        let regs = self.shared.registrations.lock().unwrap();
        WatcherStats {
            active_registrations: regs.iter().filter(|r| !r.fired).count(),
            triggered_count: self.shared.triggered_count.load(Ordering::Relaxed),
            average_precision_s: f64::from_bits(self.shared.avg_precision_bits.load(Ordering::Relaxed)),
        }
    }

    fn wake(&self) {
        let (lock, cvar) = &*self.wake;
        let mut guard = lock.lock().unwrap();
        *guard = true;
        cvar.notify_one();
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run_watcher(
    tracks: Arc<Mutex<HashMap<TrackId, Arc<Track>>>>,
    completion_rx: Receiver<CompletionEvent>,
    shared: Arc<WatcherShared>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<(Mutex<bool>, Condvar)>,
) {
    let mut sample_count = 0u64;

    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        for event in completion_rx.try_iter() {
            dispatch_completion(&tracks, event);
        }

        poll_positions(&tracks, &shared, &mut sample_count);

        let interval = next_interval(&shared);
        let (lock, cvar) = &*wake;
        let mut guard = lock.lock().unwrap();
        if !*guard && !shutdown.load(Ordering::Acquire) {
            let (next_guard, _) = cvar.wait_timeout(guard, interval).unwrap();
            guard = next_guard;
        }
        *guard = false;
    }
}

fn dispatch_completion(tracks: &Arc<Mutex<HashMap<TrackId, Arc<Track>>>>, event: CompletionEvent) {
    trace!(track = %event.id, success = event.success, "dispatching completion");
    if let Ok(map) = tracks.lock() {
        if let Some(track) = map.get(&event.id) {
            track.fire_on_complete(event.success, event.reason.as_deref());
        }
    }
}

fn poll_positions(tracks: &Arc<Mutex<HashMap<TrackId, Arc<Track>>>>, shared: &Arc<WatcherShared>, sample_count: &mut u64) {
    let global = shared.global_listeners.lock().unwrap();
    let mut regs = shared.registrations.lock().unwrap();
    if global.is_empty() && regs.is_empty() {
        return;
    }
    let map = match tracks.lock() {
        Ok(m) => m,
        Err(_) => return,
    };

    if !global.is_empty() {
        for track in map.values().filter(|t| t.state().is_active()) {
            let position = track.position_seconds();
            for (_, listener) in global.iter() {
                listener(&track.id, position);
            }
        }
    }

    for reg in regs.iter_mut().filter(|r| !r.fired) {
        let Some(track) = map.get(&reg.id) else { continue };
        if !track.is_playing() {
            continue;
        }
        let position = track.position_seconds();
        let delta = (position - reg.target_s).abs();
        if delta <= reg.tolerance_s {
            (reg.callback)(&reg.id, position);
            reg.fired = true;

            let triggered = shared.triggered_count.fetch_add(1, Ordering::Relaxed) + 1;
            let prev_avg = f64::from_bits(shared.avg_precision_bits.load(Ordering::Relaxed));
            let new_avg = prev_avg + (delta - prev_avg) / triggered as f64;
            shared.avg_precision_bits.store(new_avg.to_bits(), Ordering::Relaxed);
        }
    }
    regs.retain(|r| !r.fired);
    *sample_count += 1;
}


fn next_interval(shared: &Arc<WatcherShared>) -> Duration {
    let regs = shared.registrations.lock().unwrap();
    let min_tolerance = regs
        .iter()
        .filter(|r| !r.fired)
        .map(|r| r.tolerance_s)
        .fold(f64::INFINITY, f64::min);
    if !min_tolerance.is_finite() {
        return DEFAULT_POLL_INTERVAL;
    }
    Duration::from_secs_f64((min_tolerance / 2.0).max(0.0)).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL)
}
