//! Note synthesis
//!
//! Each note is rendered into its own buffer and scheduled on the output bus
//! at the event's exact start time. Notes share nothing but the bus, so any
//! number can overlap.

use std::f64::consts::TAU;
use std::sync::Arc;

use super::NoteSink;
use crate::audio::{AudioError, OutputSink, ScheduledBuffer};

/// Envelope of a single note
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneShape {
    /// Linear ramp from silence to `peak_gain` (seconds)
    pub attack: f64,
    /// Total note length; the exponential decay ends here (seconds)
    pub duration: f64,
    pub peak_gain: f64,
    /// Gain reached at the end of the decay
    pub floor_gain: f64,
}

impl Default for ToneShape {
    fn default() -> Self {
        Self {
            attack: 0.005,
            duration: 0.5,
            peak_gain: 0.3,
            floor_gain: 0.0001,
        }
    }
}

/// Equal-tempered frequency of a MIDI pitch (A4 = 69 = 440 Hz)
pub fn pitch_to_frequency(pitch: u8) -> f64 {
    440.0 * 2f64.powf((pitch as f64 - 69.0) / 12.0)
}

/// Render one sine note with the given envelope.
pub fn render_tone(frequency: f64, sample_rate: u32, shape: &ToneShape) -> Vec<f32> {
    let rate = sample_rate as f64;
    let total = (shape.duration * rate).round() as usize;
    let attack = shape.attack.max(0.0).min(shape.duration);
    let decay = (shape.duration - attack).max(f64::EPSILON);
    // Exponential ramp: gain(t) = peak * (floor / peak)^(t / decay)
    let ratio = (shape.floor_gain / shape.peak_gain).max(f64::MIN_POSITIVE);

    (0..total)
        .map(|i| {
            let t = i as f64 / rate;
            let gain = if t < attack {
                shape.peak_gain * t / attack
            } else {
                shape.peak_gain * ratio.powf((t - attack) / decay)
            };
            (gain * (TAU * frequency * t).sin()) as f32
        })
        .collect()
}

/// [`NoteSink`] that synthesizes tones onto an output bus
pub struct ToneGenerator {
    sink: Arc<dyn OutputSink>,
    sample_rate: u32,
    shape: ToneShape,
}

impl ToneGenerator {
    pub fn new(sink: Arc<dyn OutputSink>, sample_rate: u32) -> Self {
        Self::with_shape(sink, sample_rate, ToneShape::default())
    }

    pub fn with_shape(sink: Arc<dyn OutputSink>, sample_rate: u32, shape: ToneShape) -> Self {
        Self {
            sink,
            sample_rate,
            shape,
        }
    }
}

impl NoteSink for ToneGenerator {
    fn play(&self, pitch: u8, start: f64) -> Result<(), AudioError> {
        let samples = render_tone(pitch_to_frequency(pitch), self.sample_rate, &self.shape);
        self.sink.schedule(
            ScheduledBuffer {
                samples,
                sample_rate: self.sample_rate,
                start_time: start,
            },
            None,
        )?;
        log::trace!("ToneGenerator: pitch {} at {:.3}s", pitch, start);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::OutputBus;
    use crate::clock::AudioClock;

    #[test]
    fn test_pitch_to_frequency() {
        assert_eq!(pitch_to_frequency(69), 440.0);
        assert!((pitch_to_frequency(81) - 880.0).abs() < 1e-9);
        assert!((pitch_to_frequency(60) - 261.6256).abs() < 1e-3);
    }

    #[test]
    fn test_render_tone_envelope() {
        let shape = ToneShape::default();
        let samples = render_tone(440.0, 48000, &shape);
        assert_eq!(samples.len(), 24000);

        // Starts silent, never exceeds peak, decays to (almost) nothing
        assert_eq!(samples[0], 0.0);
        assert!(samples.iter().all(|s| s.abs() <= 0.3 + 1e-6));
        let peak = samples[..2000].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.25);
        let tail = samples[23900..].iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(tail < 0.001);
    }

    #[test]
    fn test_generator_schedules_on_bus() {
        let bus = Arc::new(OutputBus::new(8000));
        let tones = ToneGenerator::new(bus.clone(), 8000);

        tones.play(60, 0.25).unwrap();
        tones.play(64, 0.25).unwrap();
        tones.play(67, 0.30).unwrap();
        assert_eq!(bus.active_voices(), 3);

        // Nothing audible before the start time
        let mut out = vec![0.0f32; 2000];
        bus.render(&mut out, 1);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(bus.now(), 0.25);

        bus.render(&mut out, 1);
        assert!(out.iter().any(|s| *s != 0.0));
    }

    #[test]
    fn test_generator_propagates_bus_errors() {
        let bus = Arc::new(OutputBus::new(8000));
        let tones = ToneGenerator::new(bus, 8000);
        assert!(tones.play(60, f64::NAN).is_err());
    }
}
