//! Step sequencer with lookahead scheduling
//!
//! A coarse timer (25ms) polls the [`LookaheadScheduler`], which emits every
//! note that falls inside the next lookahead window (100ms) with an exact
//! audio-clock timestamp. Timer jitter only changes *when* an event is
//! generated, never *where* it lands on the clock.
//!
//! ```text
//! tokio interval (25ms) ──▶ LookaheadScheduler::tick(now)
//!                                   │ ScheduledEvent { pitch, time }
//!                                   ▼
//!                            NoteSink (ToneGenerator) ──▶ OutputBus
//! ```

mod grid;
pub mod offline;
mod runner;
mod scheduler;
mod tone;

pub use grid::{StepGrid, Tempo, DEFAULT_PITCHES, MAX_BPM, MIN_BPM, STEPS_PER_BAR};
pub use runner::{Sequencer, SequencerConfig};
pub use scheduler::LookaheadScheduler;
pub use tone::{pitch_to_frequency, render_tone, ToneGenerator, ToneShape};

use crate::audio::AudioError;

/// One note to be played at an absolute audio-clock time (seconds)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledEvent {
    pub pitch: u8,
    pub time: f64,
    /// Grid column the event came from
    pub step: usize,
}

/// Receiver of scheduled notes.
pub trait NoteSink: Send + Sync {
    fn play(&self, pitch: u8, start: f64) -> Result<(), AudioError>;
}

/// Errors rejected at the sequencer's mutation boundary
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulingError {
    /// Tempo is zero, negative, or not a number
    InvalidTempo(f64),
    StepOutOfRange { step: usize, steps: usize },
    UnknownPitch(u8),
    /// `start` was called outside a tokio runtime
    RuntimeUnavailable,
}

impl std::fmt::Display for SchedulingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingError::InvalidTempo(bpm) => write!(f, "Invalid tempo: {} BPM", bpm),
            SchedulingError::StepOutOfRange { step, steps } => {
                write!(f, "Step {} out of range (grid has {} steps)", step, steps)
            }
            SchedulingError::UnknownPitch(pitch) => {
                write!(f, "Pitch {} is not part of the grid", pitch)
            }
            SchedulingError::RuntimeUnavailable => {
                write!(f, "Sequencer requires a running tokio runtime")
            }
        }
    }
}

impl std::error::Error for SchedulingError {}
