//! Gapless playback of agent audio
//!
//! Every decoded chunk is scheduled at `max(now, next)` and pushes `next`
//! forward by its own duration, so chunks that arrive faster than real time
//! queue up back to back with no gap and no overlap.
//!
//! ```text
//! chunk ──decode──▶ start = max(clock.now(), next) ──▶ OutputSink::schedule
//!                   next  = start + duration            │
//!                                                       ▼ on_ended
//!                                     speaking = now < next - slack
//! ```
//!
//! "Speaking" turns on as soon as a buffer is scheduled and turns off when a
//! buffer ends with nothing else queued (within `speaking_slack`).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;

use super::stats::SessionStats;
use crate::audio::{AudioError, OutputSink, ScheduledBuffer, VoiceId};
use crate::clock::AudioClock;
use crate::streaming::{AudioChunk, DecodeError, MediaChunk};

/// Configuration for the playback pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackConfig {
    /// Rate assumed for chunks whose MIME type carries none
    pub output_rate: u32,
    /// How close to `next` an ending buffer must be to clear "speaking" (seconds)
    pub speaking_slack: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            output_rate: 24000,
            speaking_slack: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackError {
    /// Chunk could not be decoded; it was dropped
    Decode(DecodeError),
    /// The output sink refused the buffer
    Output(AudioError),
    /// Playback was stopped
    Stopped,
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::Decode(e) => write!(f, "Dropped undecodable chunk: {}", e),
            PlaybackError::Output(e) => write!(f, "Output rejected chunk: {}", e),
            PlaybackError::Stopped => write!(f, "Playback stopped"),
        }
    }
}

impl std::error::Error for PlaybackError {}

impl From<DecodeError> for PlaybackError {
    fn from(e: DecodeError) -> Self {
        PlaybackError::Decode(e)
    }
}

impl From<AudioError> for PlaybackError {
    fn from(e: AudioError) -> Self {
        PlaybackError::Output(e)
    }
}

/// Interval a chunk was placed at on the audio clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSpan {
    pub start: f64,
    pub end: f64,
}

struct QueuedBuffer {
    voice: VoiceId,
    start: f64,
}

struct PlaybackCore {
    /// Next gapless start time
    next: f64,
    /// Buffers scheduled and not yet ended, by local key
    queued: BTreeMap<u64, QueuedBuffer>,
    next_key: u64,
    stopped: bool,
}

struct Shared {
    sink: Arc<dyn OutputSink>,
    clock: Arc<dyn AudioClock>,
    config: PlaybackConfig,
    core: Mutex<PlaybackCore>,
    speaking: Arc<watch::Sender<bool>>,
    stats: Arc<SessionStats>,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, PlaybackCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_speaking(&self, value: bool) {
        self.speaking.send_if_modified(|current| {
            if *current != value {
                *current = value;
                true
            } else {
                false
            }
        });
    }

    /// Runs from the output device when a buffer has played out.
    fn buffer_ended(&self, key: u64) {
        let mut core = self.core();
        if core.queued.remove(&key).is_none() {
            return;
        }
        self.stats.record_chunk_played();

        if !core.stopped && self.clock.now() >= core.next - self.config.speaking_slack {
            self.set_speaking(false);
        }
    }
}

/// Playback pipeline for one session
pub struct Playback {
    shared: Arc<Shared>,
}

impl Playback {
    pub fn new(
        sink: Arc<dyn OutputSink>,
        clock: Arc<dyn AudioClock>,
        config: PlaybackConfig,
        speaking: Arc<watch::Sender<bool>>,
        stats: Arc<SessionStats>,
    ) -> Self {
        let next = clock.now();
        Self {
            shared: Arc::new(Shared {
                sink,
                clock,
                config,
                core: Mutex::new(PlaybackCore {
                    next,
                    queued: BTreeMap::new(),
                    next_key: 0,
                    stopped: false,
                }),
                speaking,
                stats,
            }),
        }
    }

    /// Decode and schedule an incoming media chunk.
    pub fn enqueue_media(&self, media: &MediaChunk) -> Result<ScheduledSpan, PlaybackError> {
        match AudioChunk::from_media(media, self.shared.config.output_rate) {
            Ok(chunk) => self.enqueue(&chunk),
            Err(e) => Err(self.decode_failed(e)),
        }
    }

    /// Schedule a chunk right after everything already queued.
    ///
    /// A chunk that fails to decode is dropped and leaves `next` untouched.
    pub fn enqueue(&self, chunk: &AudioChunk) -> Result<ScheduledSpan, PlaybackError> {
        let samples = match chunk.decode_samples() {
            Ok(samples) => samples,
            Err(e) => return Err(self.decode_failed(e)),
        };

        let shared = &self.shared;
        let mut core = shared.core();
        if core.stopped {
            return Err(PlaybackError::Stopped);
        }

        let start = shared.clock.now().max(core.next);
        let buffer = ScheduledBuffer {
            samples,
            sample_rate: chunk.sample_rate,
            start_time: start,
        };
        let end = buffer.end_time();

        let key = core.next_key;
        let weak: Weak<Shared> = Arc::downgrade(shared);
        let voice = shared.sink.schedule(
            buffer,
            Some(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.buffer_ended(key);
                }
            })),
        )?;

        core.next_key += 1;
        core.next = end;
        core.queued.insert(key, QueuedBuffer { voice, start });
        shared.set_speaking(true);

        log::trace!("Playback: chunk {} at [{:.3}, {:.3})", key, start, end);
        Ok(ScheduledSpan { start, end })
    }

    fn decode_failed(&self, e: DecodeError) -> PlaybackError {
        self.shared.stats.record_decode_error();
        log::warn!("Playback: dropping chunk: {}", e);
        PlaybackError::Decode(e)
    }

    /// Drop queued speech: `next` becomes now, buffers that have not started
    /// are cancelled, buffers already audible finish. No-op once stopped.
    pub fn interrupt(&self) {
        let shared = &self.shared;
        let mut core = shared.core();
        if core.stopped {
            return;
        }
        let now = shared.clock.now();
        core.next = now;

        let not_started: Vec<u64> = core
            .queued
            .iter()
            .filter(|(_, queued)| queued.start > now)
            .map(|(key, _)| *key)
            .collect();
        for key in &not_started {
            if let Some(queued) = core.queued.remove(key) {
                shared.sink.cancel(queued.voice);
            }
        }

        shared.set_speaking(false);
        shared.stats.record_interruption();
        log::info!(
            "Playback: interrupted at {:.3}s, {} queued chunks discarded",
            now,
            not_started.len()
        );
    }

    /// Cancel everything, including buffers already playing. Idempotent.
    pub fn stop(&self) {
        let shared = &self.shared;
        let mut core = shared.core();
        if core.stopped {
            return;
        }
        core.stopped = true;

        for (_, queued) in std::mem::take(&mut core.queued) {
            shared.sink.cancel(queued.voice);
        }
        shared.set_speaking(false);
        log::debug!("Playback: stopped");
    }

    /// Start time the next chunk would get if the clock were still behind it
    pub fn next_start(&self) -> f64 {
        self.shared.core().next
    }

    /// Chunks scheduled and not yet finished
    pub fn queued(&self) -> usize {
        self.shared.core().queued.len()
    }

    pub fn is_speaking(&self) -> bool {
        *self.shared.speaking.borrow()
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.stop();
    }
}
