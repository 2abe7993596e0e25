//! Lookahead scheduling core
//!
//! Pure state machine: given the current audio time, return the events that
//! must be handed to the tone generator now. All timing lives here so it can
//! be driven by a tokio interval, an offline renderer or a test loop.
//!
//! Event times are derived from an anchor (`anchor_time + n * step_duration`)
//! rather than by adding the step duration over and over, so rounding error
//! does not accumulate. A tempo change re-anchors at the next event time.

use std::collections::VecDeque;

use super::grid::{StepGrid, Tempo};
use super::{ScheduledEvent, SchedulingError};

/// Default window scheduled ahead of the clock (seconds)
pub const DEFAULT_LOOKAHEAD: f64 = 0.1;

/// Scheduled step starts kept for playhead lookup
const PLAYHEAD_HISTORY: usize = 64;

#[derive(Debug, Clone)]
pub struct LookaheadScheduler {
    grid: StepGrid,
    tempo: Tempo,
    lookahead: f64,
    running: bool,
    /// Next column to schedule; `None` until first started
    current_step: Option<usize>,
    anchor_time: f64,
    steps_since_anchor: u64,
    /// (time, step) of scheduled columns, oldest first
    scheduled: VecDeque<(f64, usize)>,
}

impl LookaheadScheduler {
    pub fn new(grid: StepGrid, tempo: Tempo, lookahead: f64) -> Self {
        let lookahead = if lookahead.is_finite() && lookahead > 0.0 {
            lookahead
        } else {
            log::warn!(
                "Sequencer: invalid lookahead {}, using {}",
                lookahead,
                DEFAULT_LOOKAHEAD
            );
            DEFAULT_LOOKAHEAD
        };

        Self {
            grid,
            tempo,
            lookahead,
            running: false,
            current_step: None,
            anchor_time: 0.0,
            steps_since_anchor: 0,
            scheduled: VecDeque::with_capacity(PLAYHEAD_HISTORY),
        }
    }

    pub fn grid(&self) -> &StepGrid {
        &self.grid
    }

    pub fn tempo(&self) -> Tempo {
        self.tempo
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Column that will be scheduled next, `None` before the first start
    pub fn current_step(&self) -> Option<usize> {
        self.current_step
    }

    /// Audio time of the next column to be scheduled
    pub fn next_event_time(&self) -> f64 {
        self.anchor_time + self.steps_since_anchor as f64 * self.tempo.step_duration()
    }

    /// Begin scheduling at `now`, resuming from the current column.
    pub fn start(&mut self, now: f64) {
        if self.running {
            return;
        }
        let step = *self.current_step.get_or_insert(0);
        self.anchor_time = now;
        self.steps_since_anchor = 0;
        self.running = true;
        log::info!(
            "Sequencer: started at {:.3}s from step {} ({} BPM)",
            now,
            step,
            self.tempo.bpm()
        );
    }

    /// Halt scheduling. The grid and the current column are kept.
    pub fn stop(&mut self) {
        if self.running {
            self.running = false;
            log::info!("Sequencer: stopped");
        }
    }

    /// Stop, clear the grid and forget the playhead.
    pub fn reset(&mut self) {
        self.stop();
        self.grid.clear();
        self.current_step = None;
        self.scheduled.clear();
    }

    /// Change tempo for every step scheduled from now on. Returns the applied BPM.
    pub fn set_tempo(&mut self, bpm: f64) -> Result<f64, SchedulingError> {
        let tempo = Tempo::new(bpm).map_err(|e| {
            log::warn!("Sequencer: rejected tempo change: {}", e);
            e
        })?;

        // Already scheduled events keep their times; spacing changes after the
        // next pending column.
        self.anchor_time = self.next_event_time();
        self.steps_since_anchor = 0;
        self.tempo = tempo;

        log::debug!("Sequencer: tempo set to {} BPM", tempo.bpm());
        Ok(tempo.bpm())
    }

    pub fn toggle_step(&mut self, pitch: u8, step: usize) -> Result<bool, SchedulingError> {
        self.grid.toggle(pitch, step)
    }

    pub fn set_step(&mut self, pitch: u8, step: usize, active: bool) -> Result<(), SchedulingError> {
        self.grid.set(pitch, step, active)
    }

    /// Emit every event whose time falls before `now + lookahead`.
    ///
    /// The grid is read when a column is scheduled, so a flag toggled after
    /// this call does not retract events already returned.
    pub fn tick(&mut self, now: f64) -> Vec<ScheduledEvent> {
        let mut events = Vec::new();
        if !self.running {
            return events;
        }

        if self.next_event_time() < now {
            // Fell behind (stalled timer or suspended process): skip ahead
            // instead of firing a burst of late notes.
            log::debug!(
                "Sequencer: behind by {:.3}s, resynchronising",
                now - self.next_event_time()
            );
            self.anchor_time = now;
            self.steps_since_anchor = 0;
        }

        let steps = self.grid.steps();
        let horizon = now + self.lookahead;

        while self.next_event_time() < horizon {
            let time = self.next_event_time();
            let step = self.current_step.unwrap_or(0) % steps;

            for pitch in self.grid.active_at(step) {
                events.push(ScheduledEvent { pitch, time, step });
            }

            if self.scheduled.len() == PLAYHEAD_HISTORY {
                self.scheduled.pop_front();
            }
            self.scheduled.push_back((time, step));

            self.current_step = Some((step + 1) % steps);
            self.steps_since_anchor += 1;
        }

        events
    }

    /// Seconds scheduled ahead of the clock
    pub fn lookahead(&self) -> f64 {
        self.lookahead
    }

    /// Column audible at `now`: the latest scheduled column whose time has passed.
    pub fn playhead(&self, now: f64) -> Option<usize> {
        self.scheduled
            .iter()
            .rev()
            .find(|(time, _)| *time <= now)
            .map(|(_, step)| *step)
    }
}
