//! Playback scheduler: accepts decoded chunks in arrival order and guarantees
//! seamless sequential playback.
//!
//! Ordering is enforced by a single monotonically non-decreasing cursor on
//! the output clock: every newly scheduled chunk starts at
//! `max(cursor, now)` and advances the cursor by its own duration, so chunks
//! render back-to-back with no overlap and no gap beyond scheduling jitter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use super::pcm::PlaybackChunk;

/// Clock of the output device timeline, in seconds. Injected so tests can
/// drive scheduling decisions deterministically.
pub trait OutputClock: Send + 'static {
    fn now(&self) -> f64;
}

/// Real output clock: seconds elapsed since scheduler creation.
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl OutputClock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Hand-advanced clock for deterministic tests.
#[derive(Clone, Default)]
pub struct ManualClock(Arc<Mutex<f64>>);

impl ManualClock {
    pub fn advance(&self, secs: f64) {
        *self.0.lock().unwrap() += secs;
    }

    pub fn set(&self, secs: f64) {
        *self.0.lock().unwrap() = secs;
    }
}

impl OutputClock for ManualClock {
    fn now(&self) -> f64 {
        *self.0.lock().unwrap()
    }
}

/// Rendering backend the scheduler submits chunks to (an audio device queue
/// in production, a recorder in tests). `halt` must tolerate ids whose
/// rendering already finished.
pub trait PlaybackSink: Send + 'static {
    /// Request that `chunk` begin rendering at `start_secs` on the output
    /// clock.
    fn begin(&mut self, id: u64, chunk: &PlaybackChunk, start_secs: f64);

    /// Forcibly halt a source. No-op for unknown or finished ids.
    fn halt(&mut self, id: u64);
}

struct ActiveSource {
    timer: AbortHandle,
}

pub struct PlaybackScheduler {
    clock: Box<dyn OutputClock>,
    sink: Box<dyn PlaybackSink>,
    ended_tx: mpsc::Sender<u64>,
    cursor: f64,
    next_id: u64,
    active: HashMap<u64, ActiveSource>,
}

impl PlaybackScheduler {
    /// Creates a scheduler on the real output clock. Completion events are
    /// delivered on `ended_tx`; the owner must feed them back through
    /// [`PlaybackScheduler::on_chunk_ended`].
    pub fn new(sink: Box<dyn PlaybackSink>, ended_tx: mpsc::Sender<u64>) -> Self {
        Self::with_clock(Box::new(MonotonicClock::default()), sink, ended_tx)
    }

    pub fn with_clock(
        clock: Box<dyn OutputClock>,
        sink: Box<dyn PlaybackSink>,
        ended_tx: mpsc::Sender<u64>,
    ) -> Self {
        Self {
            clock,
            sink,
            ended_tx,
            cursor: 0.0,
            next_id: 0,
            active: HashMap::new(),
        }
    }

    /// Schedules a decoded chunk for gapless playback after everything
    /// scheduled before it. Returns the source id used in completion events.
    pub fn schedule(&mut self, chunk: PlaybackChunk) -> u64 {
        let now = self.clock.now();
        let start = self.cursor.max(now);
        let duration = chunk.duration_secs();

        let id = self.next_id;
        self.next_id += 1;

        self.sink.begin(id, &chunk, start);
        self.cursor = start + duration;
        trace!(
            "[Scheduler] Source {} starts at {:.3}s for {:.3}s, cursor now {:.3}s",
            id, start, duration, self.cursor
        );

        let delay = (start + duration - now).max(0.0);
        let ended_tx = self.ended_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            let _ = ended_tx.send(id).await;
        })
        .abort_handle();

        self.active.insert(id, ActiveSource { timer });
        id
    }

    /// Removes a finished source from the active set. Returns `true` when
    /// playback went idle (active set emptied), which drives the "speaking"
    /// indicator off.
    pub fn on_chunk_ended(&mut self, id: u64) -> bool {
        if self.active.remove(&id).is_some() {
            debug!("[Scheduler] Source {} ended, {} still active", id, self.active.len());
        }
        self.active.is_empty()
    }

    /// Halts every active source, clears the set and resets the cursor to
    /// zero. Used on session teardown; safe to call when nothing is playing.
    pub fn stop_all(&mut self) {
        for (id, source) in self.active.drain() {
            source.timer.abort();
            self.sink.halt(id);
        }
        self.cursor = 0.0;
        debug!("[Scheduler] All sources stopped, cursor reset");
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        for source in self.active.values() {
            source.timer.abort();
        }
    }
}
