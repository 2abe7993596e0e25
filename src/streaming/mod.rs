//! Duplex streaming to a remote conversational audio agent
//!
//! This module provides the wire side of a live session: PCM codecs, the
//! Gemini Live protocol messages, a transport abstraction and its WebSocket
//! implementation, and per-turn transcript assembly.
//!
//! # Architecture
//!
//! ```text
//! Capture (f32) ──▶ pcm::encode ──▶ MediaSender ──▶ LiveTransport (WebSocket)
//!                                                          │
//!                         TransportMessage ◀── ServerMessage┘
//!                     (audio / transcript / turnComplete / interrupted)
//! ```
//!
//! # Fallback Strategy
//!
//! - Initial connection retries 3 times with exponential backoff
//! - Mid-session disconnects tear the session down (no reconnection)

mod live_client;
pub mod pcm;
mod protocol;
mod transcript;
mod transport;

pub use live_client::{get_api_key, LiveClient, LiveTransport, API_KEY_ENV};
pub use pcm::{AudioChunk, DecodeError, Encoding};
pub use protocol::{ClientMessage, LiveSetup, ServerMessage, LIVE_API_URL};
pub use transcript::{Speaker, TranscriptBuffer, TranscriptEntry};
pub use transport::{MediaChunk, MediaSender, Transport, TransportConnector, TransportMessage};

/// Errors that can occur on the transport
#[derive(Debug, Clone, PartialEq)]
pub enum StreamingError {
    /// API key not configured
    MissingApiKey,
    /// Failed to establish WebSocket connection
    ConnectionFailed(String),
    /// The server rejected the session setup
    AuthenticationFailed(String),
    /// WebSocket protocol error
    ProtocolError(String),
    /// Connection was closed unexpectedly
    Disconnected(String),
    /// Failed to queue outgoing media
    SendFailed(String),
}

impl std::fmt::Display for StreamingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingError::MissingApiKey => {
                write!(
                    f,
                    "Live API key not configured. Set {} environment variable.",
                    API_KEY_ENV
                )
            }
            StreamingError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to Live API: {}", e)
            }
            StreamingError::AuthenticationFailed(e) => {
                write!(f, "Session setup rejected: {}", e)
            }
            StreamingError::ProtocolError(e) => {
                write!(f, "WebSocket protocol error: {}", e)
            }
            StreamingError::Disconnected(e) => {
                write!(f, "WebSocket disconnected: {}", e)
            }
            StreamingError::SendFailed(e) => {
                write!(f, "Failed to send media: {}", e)
            }
        }
    }
}

impl std::error::Error for StreamingError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_error_display() {
        let err = StreamingError::MissingApiKey;
        assert!(err.to_string().contains("GEMINI_API_KEY"));

        let err = StreamingError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = StreamingError::AuthenticationFailed("invalid key".to_string());
        assert!(err.to_string().contains("invalid key"));
    }
}
