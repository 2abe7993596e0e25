//! Session statistics
//!
//! Lock-free counters updated from device threads and the session pump,
//! summarised once when a session is torn down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

/// Counters for one duplex session
#[derive(Debug)]
pub struct SessionStats {
    session_id: Uuid,
    started_at: Instant,
    chunks_sent: AtomicU64,
    frames_dropped: AtomicU64,
    chunks_played: AtomicU64,
    decode_errors: AtomicU64,
    interruptions: AtomicU64,
    turns: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub session_id: String,
    pub duration_ms: u64,
    pub chunks_sent: u64,
    pub frames_dropped: u64,
    pub chunks_played: u64,
    pub decode_errors: u64,
    pub interruptions: u64,
    pub turns: u64,
}

impl SessionStats {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            started_at: Instant::now(),
            chunks_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            chunks_played: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            interruptions: AtomicU64::new(0),
            turns: AtomicU64::new(0),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Returns the new total
    pub fn record_chunk_sent(&self) -> u64 {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the new total
    pub fn record_frame_dropped(&self) -> u64 {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_chunk_played(&self) {
        self.chunks_played.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interruption(&self) {
        self.interruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_turn(&self) {
        self.turns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            session_id: self.session_id.to_string(),
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_played: self.chunks_played.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            turns: self.turns.load(Ordering::Relaxed),
        }
    }

    /// Log a one-line summary
    pub fn log_summary(&self) {
        let s = self.snapshot();
        log::info!(
            "Session {} summary: {:.1}s, {} chunks sent, {} frames dropped, {} chunks played, {} decode errors, {} interruptions, {} turns",
            s.session_id,
            s.duration_ms as f64 / 1000.0,
            s.chunks_sent,
            s.frames_dropped,
            s.chunks_played,
            s.decode_errors,
            s.interruptions,
            s.turns
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = SessionStats::new(Uuid::new_v4());

        assert_eq!(stats.record_chunk_sent(), 1);
        assert_eq!(stats.record_chunk_sent(), 2);
        assert_eq!(stats.record_frame_dropped(), 1);
        stats.record_chunk_played();
        stats.record_decode_error();
        stats.record_interruption();
        stats.record_turn();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.chunks_sent, 2);
        assert_eq!(snapshot.frames_dropped, 1);
        assert_eq!(snapshot.chunks_played, 1);
        assert_eq!(snapshot.decode_errors, 1);
        assert_eq!(snapshot.interruptions, 1);
        assert_eq!(snapshot.turns, 1);
        assert_eq!(snapshot.session_id, stats.session_id().to_string());
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = SessionStats::new(Uuid::new_v4());
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["chunks_sent"], 0);
        assert!(json["session_id"].is_string());
    }
}
