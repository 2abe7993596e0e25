//! Duplex audio session
//!
//! Wires the microphone, the transport and the output bus together for one
//! live conversation.
//!
//! # Architecture
//!
//! ```text
//! CaptureSource ──▶ CapturePipeline ──▶ MediaSender ──▶ Transport ──▶ remote
//!                                                          │
//!   OutputBus ◀── Playback ◀── Audio ◀── pump task ◀────────┘
//!                               Transcript / TurnComplete / Interrupted
//! ```
//!
//! All mutable state of a session sits behind one mutex in [`DuplexSession`];
//! teardown marks it torn down under that lock, so late device callbacks and
//! transport messages from a finished session have no effect.

mod capture;
mod duplex;
mod playback;
mod state;
mod stats;

pub use capture::{encode_frame, CapturePipeline};
pub use duplex::{DuplexSession, SessionConfig};
pub use playback::{Playback, PlaybackConfig, PlaybackError, ScheduledSpan};
pub use state::SessionState;
pub use stats::{SessionStats, StatsSnapshot};

use crate::audio::AudioError;
use crate::streaming::StreamingError;

/// Errors returned by session operations
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Capture device could not be acquired
    Device(AudioError),
    /// Transport could not be opened
    Transport(StreamingError),
    /// `disconnect()` was called while the connection was being established
    Cancelled,
    /// `connect()` called while a session is already starting or running
    AlreadyActive(SessionState),
    /// The operation needs a connected session
    NotConnected,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Device(e) => write!(f, "Audio device error: {}", e),
            SessionError::Transport(e) => write!(f, "Connection error: {}", e),
            SessionError::Cancelled => write!(f, "Connection cancelled"),
            SessionError::AlreadyActive(state) => {
                write!(f, "Session already active (state: {})", state)
            }
            SessionError::NotConnected => write!(f, "Session is not connected"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<AudioError> for SessionError {
    fn from(e: AudioError) -> Self {
        SessionError::Device(e)
    }
}

impl From<StreamingError> for SessionError {
    fn from(e: StreamingError) -> Self {
        SessionError::Transport(e)
    }
}
