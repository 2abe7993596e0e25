//! Step grid and tempo

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use super::SchedulingError;

/// Steps in one bar (sixteenth notes in 4/4)
pub const STEPS_PER_BAR: usize = 16;

/// Two octaves starting at C3
pub const DEFAULT_PITCHES: RangeInclusive<u8> = 48..=71;

pub const MIN_BPM: f64 = 60.0;
pub const MAX_BPM: f64 = 240.0;

/// Tempo in beats per minute, always within `MIN_BPM..=MAX_BPM`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tempo(f64);

impl Tempo {
    /// Clamp a requested tempo into range.
    ///
    /// Non-positive and non-finite values are rejected rather than clamped.
    pub fn new(bpm: f64) -> Result<Self, SchedulingError> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(SchedulingError::InvalidTempo(bpm));
        }
        Ok(Self(bpm.clamp(MIN_BPM, MAX_BPM)))
    }

    pub fn bpm(&self) -> f64 {
        self.0
    }

    /// Seconds per sixteenth-note step
    pub fn step_duration(&self) -> f64 {
        60.0 / self.0 / 4.0
    }
}

impl Default for Tempo {
    fn default() -> Self {
        Self(120.0)
    }
}

/// Pitch × step matrix of active flags
#[derive(Debug, Clone, PartialEq)]
pub struct StepGrid {
    steps: usize,
    rows: BTreeMap<u8, Vec<bool>>,
}

impl Default for StepGrid {
    fn default() -> Self {
        Self::new(DEFAULT_PITCHES, STEPS_PER_BAR)
    }
}

impl StepGrid {
    /// Empty grid over `pitches` with `steps` columns (at least one).
    pub fn new(pitches: impl IntoIterator<Item = u8>, steps: usize) -> Self {
        let steps = steps.max(1);
        let rows = pitches
            .into_iter()
            .map(|pitch| (pitch, vec![false; steps]))
            .collect();
        Self { steps, rows }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Pitches in ascending order
    pub fn pitches(&self) -> impl Iterator<Item = u8> + '_ {
        self.rows.keys().copied()
    }

    fn row_mut(&mut self, pitch: u8, step: usize) -> Result<&mut Vec<bool>, SchedulingError> {
        if step >= self.steps {
            return Err(SchedulingError::StepOutOfRange {
                step,
                steps: self.steps,
            });
        }
        self.rows
            .get_mut(&pitch)
            .ok_or(SchedulingError::UnknownPitch(pitch))
    }

    /// Flip one flag, returning its new value.
    pub fn toggle(&mut self, pitch: u8, step: usize) -> Result<bool, SchedulingError> {
        let row = self.row_mut(pitch, step)?;
        row[step] = !row[step];
        Ok(row[step])
    }

    pub fn set(&mut self, pitch: u8, step: usize, active: bool) -> Result<(), SchedulingError> {
        let row = self.row_mut(pitch, step)?;
        row[step] = active;
        Ok(())
    }

    /// False for unknown pitches and out-of-range steps
    pub fn is_active(&self, pitch: u8, step: usize) -> bool {
        self.rows
            .get(&pitch)
            .and_then(|row| row.get(step))
            .copied()
            .unwrap_or(false)
    }

    /// Pitches active in one column, ascending
    pub fn active_at(&self, step: usize) -> Vec<u8> {
        self.rows
            .iter()
            .filter(|(_, row)| row.get(step).copied().unwrap_or(false))
            .map(|(pitch, _)| *pitch)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.rows
            .values()
            .map(|row| row.iter().filter(|a| **a).count())
            .sum()
    }

    pub fn clear(&mut self) {
        for row in self.rows.values_mut() {
            row.fill(false);
        }
    }

    /// Rows for display, highest pitch first (piano-roll order)
    pub fn snapshot(&self) -> Vec<(u8, Vec<bool>)> {
        self.rows
            .iter()
            .rev()
            .map(|(pitch, row)| (*pitch, row.clone()))
            .collect()
    }
}
