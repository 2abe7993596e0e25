//! Output bus: one mixer shared by every producer of sound
//!
//! Producers hand the bus fully rendered buffers with an absolute start time.
//! The device callback pulls frames through [`OutputBus::render`], which mixes
//! every buffer overlapping the block and advances the frame counter. That
//! counter is the monotonic audio clock for the whole crate.
//!
//! Buffers may use a different sample rate than the bus; they are read back
//! with nearest-sample lookup, which is enough for speech and simple tones.

use std::sync::{Mutex, MutexGuard, PoisonError};

use super::AudioError;
use crate::clock::AudioClock;

/// Identifier of a buffer scheduled on the bus
pub type VoiceId = u64;

/// Invoked once, outside the bus lock, when a buffer has played to its end
pub type EndedCallback = Box<dyn FnOnce() + Send + 'static>;

/// A mono buffer to be played starting at `start_time` (audio clock seconds)
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub start_time: f64,
}

impl ScheduledBuffer {
    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration()
    }
}

/// Anything that can accept scheduled buffers.
///
/// Both the tone generator and the playback pipeline write through this trait,
/// so tests can substitute a recording sink.
pub trait OutputSink: Send + Sync {
    fn schedule(
        &self,
        buffer: ScheduledBuffer,
        on_ended: Option<EndedCallback>,
    ) -> Result<VoiceId, AudioError>;

    /// Drop a buffer. Its `on_ended` callback never fires.
    fn cancel(&self, id: VoiceId);
}

struct Voice {
    id: VoiceId,
    samples: Vec<f32>,
    sample_rate: u64,
    /// First bus frame of the buffer
    start_frame: u64,
    /// One past the last bus frame of the buffer
    end_frame: u64,
    on_ended: Option<EndedCallback>,
}

struct BusState {
    frames_rendered: u64,
    voices: Vec<Voice>,
    next_id: VoiceId,
}

/// Mixing bus with a frame-accurate clock
pub struct OutputBus {
    sample_rate: u32,
    state: Mutex<BusState>,
}

impl OutputBus {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            state: Mutex::new(BusState {
                frames_rendered: 0,
                voices: Vec::with_capacity(64),
                next_id: 1,
            }),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of buffers that are scheduled or playing
    pub fn active_voices(&self) -> usize {
        self.lock().voices.len()
    }

    /// Mix the next `out.len() / channels` frames into `out` (interleaved).
    ///
    /// Finished buffers are removed and their callbacks run after the lock is
    /// released, so a callback may schedule more audio.
    pub fn render(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        let bus_rate = self.sample_rate as u64;

        let finished = {
            let mut state = self.lock();
            let first_frame = state.frames_rendered;

            for (i, frame) in out.chunks_mut(channels).take(frames).enumerate() {
                let position = first_frame + i as u64;
                let mut mix = 0.0f32;

                for voice in &state.voices {
                    if position < voice.start_frame || position >= voice.end_frame {
                        continue;
                    }
                    let offset = position - voice.start_frame;
                    let index = (offset * voice.sample_rate / bus_rate) as usize;
                    if let Some(sample) = voice.samples.get(index) {
                        mix += *sample;
                    }
                }

                frame.fill(mix);
            }

            state.frames_rendered += frames as u64;
            let rendered = state.frames_rendered;

            let mut finished = Vec::new();
            let mut i = 0;
            while i < state.voices.len() {
                if state.voices[i].end_frame <= rendered {
                    let voice = state.voices.swap_remove(i);
                    if let Some(callback) = voice.on_ended {
                        finished.push(callback);
                    }
                } else {
                    i += 1;
                }
            }
            finished
        };

        for callback in finished {
            callback();
        }
    }
}

impl AudioClock for OutputBus {
    fn now(&self) -> f64 {
        self.lock().frames_rendered as f64 / self.sample_rate as f64
    }
}

impl OutputSink for OutputBus {
    fn schedule(
        &self,
        buffer: ScheduledBuffer,
        on_ended: Option<EndedCallback>,
    ) -> Result<VoiceId, AudioError> {
        if buffer.sample_rate == 0 {
            return Err(AudioError::InvalidBuffer("sample rate is zero".to_string()));
        }
        if !buffer.start_time.is_finite() {
            return Err(AudioError::InvalidBuffer(format!(
                "start time {} is not finite",
                buffer.start_time
            )));
        }

        // Frame positions are rounded so that back-to-back buffers computed
        // in seconds land on adjacent frames.
        let bus_rate = self.sample_rate as f64;
        let start_frame = (buffer.start_time.max(0.0) * bus_rate).round() as u64;
        let end_frame = (buffer.end_time().max(0.0) * bus_rate).round() as u64;

        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;

        state.voices.push(Voice {
            id,
            samples: buffer.samples,
            sample_rate: buffer.sample_rate as u64,
            start_frame,
            end_frame,
            on_ended,
        });

        log::trace!(
            "OutputBus: scheduled voice {} frames [{}, {})",
            id,
            start_frame,
            end_frame
        );
        Ok(id)
    }

    fn cancel(&self, id: VoiceId) {
        let mut state = self.lock();
        state.voices.retain(|v| v.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn buffer(samples: Vec<f32>, sample_rate: u32, start_time: f64) -> ScheduledBuffer {
        ScheduledBuffer {
            samples,
            sample_rate,
            start_time,
        }
    }

    #[test]
    fn test_clock_follows_rendered_frames() {
        let bus = OutputBus::new(1000);
        assert_eq!(bus.now(), 0.0);

        let mut out = vec![0.0; 500];
        bus.render(&mut out, 1);
        assert!((bus.now() - 0.5).abs() < 1e-12);

        // Stereo: 500 samples is 250 frames
        bus.render(&mut out, 2);
        assert!((bus.now() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_buffer_starts_at_scheduled_time() {
        let bus = OutputBus::new(10);
        bus.schedule(buffer(vec![1.0; 5], 10, 0.3), None).unwrap();

        let mut out = vec![0.0; 10];
        bus.render(&mut out, 1);

        assert_eq!(out, vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_overlapping_buffers_are_mixed() {
        let bus = OutputBus::new(10);
        bus.schedule(buffer(vec![0.25; 4], 10, 0.0), None).unwrap();
        bus.schedule(buffer(vec![0.5; 2], 10, 0.1), None).unwrap();

        let mut out = vec![0.0; 4];
        bus.render(&mut out, 1);

        assert_eq!(out, vec![0.25, 0.75, 0.75, 0.25]);
    }

    #[test]
    fn test_lower_rate_buffer_is_stretched() {
        let bus = OutputBus::new(20);
        bus.schedule(buffer(vec![1.0, -1.0], 10, 0.0), None).unwrap();

        let mut out = vec![0.0; 4];
        bus.render(&mut out, 1);

        assert_eq!(out, vec![1.0, 1.0, -1.0, -1.0]);
    }

    #[test]
    fn test_ended_callback_fires_once_after_end() {
        let bus = OutputBus::new(10);
        let ended = Arc::new(AtomicUsize::new(0));
        let counter = ended.clone();

        bus.schedule(
            buffer(vec![1.0; 3], 10, 0.0),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        let mut out = vec![0.0; 2];
        bus.render(&mut out, 1);
        assert_eq!(ended.load(Ordering::SeqCst), 0);

        bus.render(&mut out, 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert_eq!(bus.active_voices(), 0);

        bus.render(&mut out, 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_buffer_is_silent() {
        let bus = OutputBus::new(10);
        let ended = Arc::new(AtomicUsize::new(0));
        let counter = ended.clone();

        let id = bus
            .schedule(
                buffer(vec![1.0; 3], 10, 0.0),
                Some(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        bus.cancel(id);

        let mut out = vec![0.0; 5];
        bus.render(&mut out, 1);

        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(ended.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rejects_invalid_buffers() {
        let bus = OutputBus::new(10);

        let err = bus.schedule(buffer(vec![1.0], 0, 0.0), None).unwrap_err();
        assert!(matches!(err, AudioError::InvalidBuffer(_)));

        let err = bus
            .schedule(buffer(vec![1.0], 10, f64::NAN), None)
            .unwrap_err();
        assert!(matches!(err, AudioError::InvalidBuffer(_)));
    }

    #[test]
    fn test_callback_may_schedule_more_audio() {
        let bus = Arc::new(OutputBus::new(10));
        let inner = bus.clone();

        bus.schedule(
            buffer(vec![1.0; 2], 10, 0.0),
            Some(Box::new(move || {
                inner
                    .schedule(buffer(vec![0.5; 2], 10, 0.2), None)
                    .unwrap();
            })),
        )
        .unwrap();

        let mut out = vec![0.0; 2];
        bus.render(&mut out, 1);
        assert_eq!(bus.active_voices(), 1);

        bus.render(&mut out, 1);
        assert_eq!(out, vec![0.5, 0.5]);
    }
}
