//! Monotonic audio clock
//!
//! Every timestamp in the crate (note events, playback buffers) is expressed
//! in seconds on an [`AudioClock`]. The real clock is the frame counter of the
//! [`OutputBus`](crate::audio::OutputBus), so the sequencer and the playback
//! pipeline schedule against the same reference.

use std::sync::atomic::{AtomicU64, Ordering};

/// Source of the current audio time in seconds.
///
/// Implementations must be monotonic: successive calls never go backwards.
pub trait AudioClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Clock that only moves when told to.
///
/// Used for offline rendering and for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    /// Move the clock to `time`. Earlier times are ignored.
    pub fn set(&self, time: f64) {
        let current = self.now();
        if time > current {
            self.bits.store(time.to_bits(), Ordering::SeqCst);
        }
    }

    pub fn advance(&self, seconds: f64) {
        if seconds > 0.0 {
            self.set(self.now() + seconds);
        }
    }
}

impl AudioClock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(1.5);
        assert_eq!(clock.now(), 1.5);

        clock.advance(0.25);
        assert_eq!(clock.now(), 1.75);
    }

    #[test]
    fn test_manual_clock_never_goes_backwards() {
        let clock = ManualClock::new(2.0);
        clock.set(1.0);
        assert_eq!(clock.now(), 2.0);

        clock.advance(-1.0);
        assert_eq!(clock.now(), 2.0);
    }
}
