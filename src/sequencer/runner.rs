//! Tokio driver for the lookahead scheduler
//!
//! Owns the timer task. Every tick reads the audio clock, asks the
//! [`LookaheadScheduler`] for due events and hands them to the [`NoteSink`]
//! while still holding the scheduler lock, so once [`Sequencer::stop`]
//! returns no further note can be produced.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::grid::{StepGrid, Tempo, DEFAULT_PITCHES, STEPS_PER_BAR};
use super::scheduler::{LookaheadScheduler, DEFAULT_LOOKAHEAD};
use super::{NoteSink, SchedulingError};
use crate::clock::AudioClock;

/// Configuration for the sequencer
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Seconds scheduled ahead of the clock
    pub lookahead: f64,
    /// Timer period
    pub tick_interval: Duration,
    pub steps: usize,
    pub pitches: Vec<u8>,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            lookahead: DEFAULT_LOOKAHEAD,
            tick_interval: Duration::from_millis(25),
            steps: STEPS_PER_BAR,
            pitches: DEFAULT_PITCHES.collect(),
        }
    }
}

struct TickTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Step sequencer bound to an audio clock and a note sink
pub struct Sequencer {
    scheduler: Arc<Mutex<LookaheadScheduler>>,
    clock: Arc<dyn AudioClock>,
    sink: Arc<dyn NoteSink>,
    tick_interval: Duration,
    playhead_tx: Arc<watch::Sender<Option<usize>>>,
    task: Mutex<Option<TickTask>>,
}

impl Sequencer {
    pub fn new(
        config: SequencerConfig,
        tempo: Tempo,
        clock: Arc<dyn AudioClock>,
        sink: Arc<dyn NoteSink>,
    ) -> Self {
        let grid = StepGrid::new(config.pitches, config.steps);
        let scheduler = LookaheadScheduler::new(grid, tempo, config.lookahead);
        let (playhead_tx, _) = watch::channel(None);

        // A tick at or beyond the lookahead leaves gaps between windows
        let lookahead = Duration::from_secs_f64(scheduler.lookahead());
        let tick_interval = if config.tick_interval.is_zero() || config.tick_interval >= lookahead {
            let clamped = lookahead / 2;
            log::warn!(
                "Sequencer: tick interval {:?} must be shorter than the {:?} lookahead, using {:?}",
                config.tick_interval,
                lookahead,
                clamped
            );
            clamped
        } else {
            config.tick_interval
        };

        Self {
            scheduler: Arc::new(Mutex::new(scheduler)),
            clock,
            sink,
            tick_interval,
            playhead_tx: Arc::new(playhead_tx),
            task: Mutex::new(None),
        }
    }

    fn scheduler(&self) -> MutexGuard<'_, LookaheadScheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the tick loop on the current tokio runtime.
    ///
    /// Starting an already running sequencer is a no-op.
    pub fn start(&self) -> Result<(), SchedulingError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SchedulingError::RuntimeUnavailable)?;

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            log::debug!("Sequencer: start ignored, already running");
            return Ok(());
        }

        self.scheduler().start(self.clock.now());

        let cancel = CancellationToken::new();
        let handle = runtime.spawn(run_ticks(
            self.scheduler.clone(),
            self.clock.clone(),
            self.sink.clone(),
            self.playhead_tx.clone(),
            self.tick_interval,
            cancel.clone(),
        ));

        *task = Some(TickTask { cancel, handle });
        Ok(())
    }

    /// Halt scheduling. Notes already handed to the sink still play.
    pub fn stop(&self) {
        // Marking the scheduler stopped first means an in-flight tick that
        // acquires the lock afterwards emits nothing.
        self.scheduler().stop();

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel.cancel();
            task.handle.abort();
        }
    }

    /// Stop, clear the grid and forget the playhead.
    pub fn reset(&self) {
        self.stop();
        self.scheduler().reset();
        self.playhead_tx.send_replace(None);
        log::info!("Sequencer: reset");
    }

    pub fn is_running(&self) -> bool {
        self.scheduler().is_running()
    }

    pub fn set_tempo(&self, bpm: f64) -> Result<f64, SchedulingError> {
        self.scheduler().set_tempo(bpm)
    }

    pub fn tempo(&self) -> f64 {
        self.scheduler().tempo().bpm()
    }

    pub fn toggle_step(&self, pitch: u8, step: usize) -> Result<bool, SchedulingError> {
        self.scheduler().toggle_step(pitch, step)
    }

    pub fn set_step(&self, pitch: u8, step: usize, active: bool) -> Result<(), SchedulingError> {
        self.scheduler().set_step(pitch, step, active)
    }

    /// Grid rows for display, highest pitch first
    pub fn grid_snapshot(&self) -> Vec<(u8, Vec<bool>)> {
        self.scheduler().grid().snapshot()
    }

    /// Column currently audible, `None` before the first start or after reset
    pub fn playhead(&self) -> Option<usize> {
        *self.playhead_tx.borrow()
    }

    pub fn subscribe_playhead(&self) -> watch::Receiver<Option<usize>> {
        self.playhead_tx.subscribe()
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_ticks(
    scheduler: Arc<Mutex<LookaheadScheduler>>,
    clock: Arc<dyn AudioClock>,
    sink: Arc<dyn NoteSink>,
    playhead_tx: Arc<watch::Sender<Option<usize>>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut panics = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    tick_once(&scheduler, clock.as_ref(), sink.as_ref(), &playhead_tx)
                }));
                if result.is_err() {
                    panics += 1;
                    log::error!("Sequencer: tick panicked ({} so far), continuing", panics);
                }
            }
        }
    }

    log::debug!("Sequencer: tick loop exited");
}

fn tick_once(
    scheduler: &Mutex<LookaheadScheduler>,
    clock: &dyn AudioClock,
    sink: &dyn NoteSink,
    playhead_tx: &watch::Sender<Option<usize>>,
) {
    let mut scheduler = scheduler.lock().unwrap_or_else(PoisonError::into_inner);
    let now = clock.now();

    // The schedule has already advanced past these events, so a panicking
    // note must not take the rest of the batch with it.
    for event in scheduler.tick(now) {
        match catch_unwind(AssertUnwindSafe(|| sink.play(event.pitch, event.time))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!(
                "Sequencer: failed to play pitch {} at {:.3}s: {}",
                event.pitch,
                event.time,
                e
            ),
            Err(_) => log::error!(
                "Sequencer: note sink panicked on pitch {} at {:.3}s",
                event.pitch,
                event.time
            ),
        }
    }

    let playhead = scheduler.playhead(now);
    playhead_tx.send_if_modified(|current| {
        if *current != playhead {
            *current = playhead;
            true
        } else {
            false
        }
    });
}
