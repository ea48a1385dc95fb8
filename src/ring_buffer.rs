//! Single-producer/single-consumer frame queue backing streaming tracks.
//!
//! Built on `ringbuf`'s lock-free heap ring (the same crate `cpal` is
//! paired with in `nethercore-zx`'s `audio_thread::output` module) with a
//! thin wrapper adding the "starving" flag, underrun counter, and
//! end-of-source marker streaming playback needs that raw `ringbuf`
//! doesn't expose.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

struct RingShared {
    starving: AtomicBool,
    underruns: AtomicU64,
    ended: AtomicBool,
}

/// Loader-thread side of the ring buffer. The loader is the sole producer.
pub struct RingProducer {
    inner: HeapProd<f32>,
    channels: usize,
    shared: Arc<RingShared>,
}

/// Mixer side of the ring buffer. The mixer is the sole consumer and
/// never blocks.
pub struct RingConsumer {
    inner: HeapCons<f32>,
    channels: usize,
    shared: Arc<RingShared>,
}

/// Create a ring buffer sized to hold `capacity_frames` frames of
/// `channels` interleaved samples each. Capacity is chosen by the caller
/// to cover at least `4 * buffer_size / ratio` worst case, so the loader
/// thread stays ahead of the mixer even under a slow decode.
pub fn streaming_ring(capacity_frames: usize, channels: usize) -> (RingProducer, RingConsumer) {
    let rb = HeapRb::<f32>::new(capacity_frames.max(1) * channels.max(1));
    let (prod, cons) = rb.split();
    let shared = Arc::new(RingShared {
        starving: AtomicBool::new(false),
        underruns: AtomicU64::new(0),
        ended: AtomicBool::new(false),
    });
    (
        RingProducer {
            inner: prod,
            channels,
            shared: shared.clone(),
        },
        RingConsumer {
            inner: cons,
            channels,
            shared,
        },
    )
}

impl RingProducer {
    /// Push interleaved frames. Returns the number of *frames* (not
    /// samples) actually written; fewer than requested means the ring is
    /// full.
    pub fn push_frames(&mut self, frames: &[f32]) -> usize {
        debug_assert_eq!(frames.len() % self.channels, 0);
        let written_samples = self.inner.push_slice(frames);
        written_samples / self.channels
    }

    pub fn free_frames(&self) -> usize {
        self.inner.vacant_len() / self.channels
    }

    /// Mark that no more frames will be pushed (end of source reached and
    /// not looping). The mixer observes this once the ring drains to
    /// empty and transitions the track to `ending`.
    pub fn mark_ended(&self) {
        self.shared.ended.store(true, Ordering::Release);
    }

    /// Clear the end marker, e.g. after a loop wrap restarts the decode.
    pub fn clear_ended(&self) {
        self.shared.ended.store(false, Ordering::Release);
    }
}

impl RingConsumer {
    /// Pop up to `out.len() / channels` frames into `out`. Any shortfall is
    /// zero-filled and counted as an underrun.
    /// Returns the number of frames actually read from the ring.
    pub fn pop_frames(&mut self, out: &mut [f32]) -> usize {
        debug_assert_eq!(out.len() % self.channels, 0);
        let read_samples = self.inner.pop_slice(out);
        let read_frames = read_samples / self.channels;
        let requested_frames = out.len() / self.channels;

        if read_frames < requested_frames {
            out[read_samples..].fill(0.0);
            self.shared.starving.store(true, Ordering::Relaxed);
            self.shared.underruns.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shared.starving.store(false, Ordering::Relaxed);
        }
        read_frames
    }

    pub fn is_starving(&self) -> bool {
        self.shared.starving.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    /// Natural end reached: the producer has pushed its last frame and the
    /// ring has fully drained.
    pub fn is_ended(&self) -> bool {
        self.shared.ended.load(Ordering::Acquire) && self.inner.occupied_len() == 0
    }

    pub fn occupied_frames(&self) -> usize {
        self.inner.occupied_len() / self.channels
    }
}
