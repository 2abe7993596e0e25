//! Per-turn transcript assembly
//!
//! The Live API streams transcription as small fragments for both speakers.
//! Fragments accumulate per direction and are only released when the turn
//! completes, so observers never see a half-finished line.
//!
//! # Flush Order
//!
//! - Local (input) text first, then remote (output) text
//! - Empty directions emit nothing
//! - Both buffers are cleared after a flush

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Who said it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The microphone side
    Local,
    /// The agent
    Remote,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Local => "local",
            Speaker::Remote => "remote",
        }
    }
}

/// One completed line of the transcript log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub source: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Accumulates fragments for the current turn
#[derive(Debug, Clone, Default)]
pub struct TranscriptBuffer {
    local: String,
    remote: String,
    /// Fragments received this turn
    fragments: u64,
}

impl TranscriptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment for one direction
    pub fn push(&mut self, source: Speaker, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        match source {
            Speaker::Local => self.local.push_str(fragment),
            Speaker::Remote => self.remote.push_str(fragment),
        }
        self.fragments += 1;

        if self.fragments % 20 == 0 {
            log::debug!(
                "TranscriptBuffer: {} fragments ({} local chars, {} remote chars)",
                self.fragments,
                self.local.len(),
                self.remote.len()
            );
        }
    }

    /// Close the turn: emit each non-empty direction once and clear both.
    pub fn complete_turn(&mut self) -> Vec<TranscriptEntry> {
        let at = Utc::now();
        let mut entries = Vec::with_capacity(2);

        for (source, text) in [
            (Speaker::Local, std::mem::take(&mut self.local)),
            (Speaker::Remote, std::mem::take(&mut self.remote)),
        ] {
            if !text.trim().is_empty() {
                entries.push(TranscriptEntry { source, text, at });
            }
        }

        if !entries.is_empty() {
            log::debug!(
                "TranscriptBuffer: turn complete after {} fragments",
                self.fragments
            );
        }
        self.fragments = 0;
        entries
    }

    /// Text accumulated so far for one direction
    pub fn pending(&self, source: Speaker) -> &str {
        match source {
            Speaker::Local => &self.local,
            Speaker::Remote => &self.remote,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty()
    }

    /// Drop any unfinished turn
    pub fn reset(&mut self) {
        self.local.clear();
        self.remote.clear();
        self.fragments = 0;
    }
}
