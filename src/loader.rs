//! Background decode thread for streaming tracks.
//!
//! One thread per streaming track, pulling bounded chunks from a
//! [`StreamDecoder`] and pushing them into a [`RingProducer`] (the loader
//! is the ring's sole producer). Shutdown is Condvar-parked
//! and `Drop`-ordered exactly like `AudioGenHandle` in
//! `nethercore-zx/src/audio_thread/handle.rs`: the flag and wake are
//! dropped before `join`, so the thread always observes shutdown instead
//! of blocking the drop forever. Back-pressure (ring full) and pause are
//! handled with a short poll-sleep rather than a second condvar, since
//! this thread has no real-time deadline to protect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::ring_buffer::RingProducer;
use crate::source::{StreamDecoder, StreamEnd};
use crate::track::Track;
use crate::track_id::TrackId;

const BACKPRESSURE_POLL: Duration = Duration::from_millis(2);
const PAUSE_POLL: Duration = Duration::from_millis(5);

/// Owns a streaming track's decode thread. Dropping it stops the thread.
pub struct LoaderHandle {
    shutdown: Arc<AtomicBool>,
    wake: Arc<(Mutex<bool>, Condvar)>,
    join: Option<JoinHandle<()>>,
}

impl LoaderHandle {
    /// Nudge the loader out of its pause/backpressure poll immediately,
    /// e.g. after `resume()` clears the track's paused state.
    pub fn wake(&self) {
        let (lock, cvar) = &*self.wake;
        let mut guard = lock.lock().unwrap();
        *guard = true;
        cvar.notify_one();
    }
}

impl Drop for LoaderHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawn the decode thread for `track`, reading through `decoder` and
/// filling `producer`. `chunk_frames` bounds how many frames are
/// requested from the decoder per `next_chunk` call (advisory; symphonia
/// yields whole packets regardless).
pub fn spawn_loader(
    id: TrackId,
    mut decoder: StreamDecoder,
    mut producer: RingProducer,
    track: Arc<Track>,
    chunk_frames: usize,
) -> LoaderHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new((Mutex::new(false), Condvar::new()));

    let thread_shutdown = shutdown.clone();
    let thread_wake = wake.clone();

    let join = std::thread::Builder::new()
        .name(format!("trackmix-loader-{id}"))
        .spawn(move || {
            run_loader(id, &mut decoder, &mut producer, &track, chunk_frames, &thread_shutdown, &thread_wake);
        })
        .expect("failed to spawn loader thread");

    LoaderHandle {
        shutdown,
        wake,
        join: Some(join),
    }
}

fn run_loader(
    id: TrackId,
    decoder: &mut StreamDecoder,
    producer: &mut RingProducer,
    track: &Arc<Track>,
    chunk_frames: usize,
    shutdown: &AtomicBool,
    wake: &(Mutex<bool>, Condvar),
) {
    let channels = decoder.channels() as usize;

    'outer: loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        if track.is_paused() {
            park_until_woken(wake, PAUSE_POLL, shutdown);
            continue;
        }

        let chunk = match decoder.next_chunk(chunk_frames) {
            Ok(chunk) => chunk,
            Err(StreamEnd::Eof) => {
                if track.loop_enabled() {
                    if let Err(err) = decoder.rewind() {
                        warn!(track = %id, error = %err, "loop rewind failed, ending stream");
                        track.set_failure_reason(err.to_string());
                        producer.mark_ended();
                        break;
                    }
                    producer.clear_ended();
                    continue;
                }
                producer.mark_ended();
                debug!(track = %id, "streaming source reached end of file");
                break;
            }
            Err(StreamEnd::Error(err)) => {
                warn!(track = %id, error = %err, "streaming decode error");
                track.set_failure_reason(err.to_string());
                producer.mark_ended();
                break;
            }
        };

        if chunk.is_empty() {
            continue;
        }

        let mut written = 0usize;
        let total_frames = chunk.len() / channels.max(1);
        while written < total_frames {
            if shutdown.load(Ordering::Acquire) {
                break 'outer;
            }
            let remaining = &chunk[written * channels..];
            let n = producer.push_frames(remaining);
            written += n;
            if n == 0 {
                std::thread::sleep(BACKPRESSURE_POLL);
            }
        }
    }
}

fn park_until_woken(wake: &(Mutex<bool>, Condvar), timeout: Duration, shutdown: &AtomicBool) {
    let (lock, cvar) = wake;
    let mut guard = lock.lock().unwrap();
    while !*guard && !shutdown.load(Ordering::Acquire) {
        let (next_guard, result) = cvar.wait_timeout(guard, timeout).unwrap();
        guard = next_guard;
        if result.timed_out() {
            break;
        }
    }
    *guard = false;
}
