//! Offline pattern rendering
//!
//! Runs the same lookahead scheduler the live sequencer uses, but driven by
//! the render loop of an [`OutputBus`] instead of a timer, and writes the
//! result to a WAV file.

use std::path::Path;
use std::sync::Arc;

use super::grid::{StepGrid, Tempo};
use super::scheduler::{LookaheadScheduler, DEFAULT_LOOKAHEAD};
use super::tone::ToneGenerator;
use super::{NoteSink, ScheduledEvent};
use crate::audio::wav::{self, RENDER_BLOCK_FRAMES};
use crate::audio::{AudioError, OutputBus};

/// Render `seconds` of `grid` at `tempo` into a mono WAV file.
///
/// Returns the number of frames written.
pub fn render_pattern(
    grid: &StepGrid,
    tempo: Tempo,
    seconds: f64,
    sample_rate: u32,
    path: &Path,
) -> Result<u64, AudioError> {
    render_with(grid, tempo, seconds, sample_rate, path, |_| {})
}

/// Frames per render block. Each block is one scheduler tick, so a block
/// must stay shorter than the lookahead or steps fall between windows.
fn block_frames(sample_rate: u32, lookahead: f64) -> usize {
    let half_window = (lookahead * sample_rate as f64 / 2.0) as usize;
    RENDER_BLOCK_FRAMES.min(half_window).max(1)
}

fn render_with<F>(
    grid: &StepGrid,
    tempo: Tempo,
    seconds: f64,
    sample_rate: u32,
    path: &Path,
    mut on_event: F,
) -> Result<u64, AudioError>
where
    F: FnMut(&ScheduledEvent),
{
    let bus = Arc::new(OutputBus::new(sample_rate));
    let tones = ToneGenerator::new(bus.clone(), sample_rate);
    let mut scheduler = LookaheadScheduler::new(grid.clone(), tempo, DEFAULT_LOOKAHEAD);
    let block = block_frames(sample_rate, scheduler.lookahead());
    let mut notes = 0u64;

    log::info!(
        "Offline render: {} active steps at {} BPM for {:.1}s ({} frame blocks)",
        grid.active_count(),
        tempo.bpm(),
        seconds,
        block
    );

    scheduler.start(0.0);
    let frames = wav::render_to_wav(&bus, path, seconds, block, |now| {
        for event in scheduler.tick(now) {
            on_event(&event);
            match tones.play(event.pitch, event.time) {
                Ok(()) => notes += 1,
                Err(e) => log::warn!("Offline render: dropped note {}: {}", event.pitch, e),
            }
        }
    })?;

    log::info!("Offline render: {} notes", notes);
    Ok(frames)
}

/// A one-bar C major arpeggio with a root pulse, used by the CLI.
pub fn demo_pattern() -> StepGrid {
    let mut grid = StepGrid::default();
    // B3 stands in for the octave, which is outside the grid
    let arpeggio = [60u8, 64, 67, 71, 67, 64];
    for (step, pitch) in (0..grid.steps()).step_by(2).zip(arpeggio.iter().cycle()) {
        let _ = grid.set(*pitch, step, true);
    }
    for step in [0, 8] {
        let _ = grid.set(48, step, true);
    }
    grid
}
