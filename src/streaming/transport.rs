//! Transport abstraction between the session and a remote agent
//!
//! The session only sees [`MediaChunk`]s going out and
//! [`TransportMessage`]s coming in. [`LiveClient`](super::LiveClient) is the
//! WebSocket implementation; tests plug in scripted ones.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::protocol::LiveSetup;
use super::StreamingError;

/// One outgoing (or incoming) piece of media, base64 payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

/// Everything a transport can report to the session
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    /// Agent audio
    Audio(MediaChunk),
    /// Transcription fragment of the local speaker
    InputTranscript(String),
    /// Transcription fragment of the agent
    OutputTranscript(String),
    TurnComplete,
    /// The agent was interrupted; queued speech must be discarded
    Interrupted,
    /// Remote closed the connection, with an optional reason
    Closed(Option<String>),
    Error(String),
}

/// Non-blocking handle for queueing outgoing media.
///
/// Cloneable and usable from device threads.
#[derive(Debug, Clone)]
pub struct MediaSender {
    tx: mpsc::Sender<MediaChunk>,
}

impl MediaSender {
    pub fn new(tx: mpsc::Sender<MediaChunk>) -> Self {
        Self { tx }
    }

    /// Queue a chunk without waiting. A full queue is reported, never awaited.
    pub fn try_send(&self, chunk: MediaChunk) -> Result<(), StreamingError> {
        self.tx.try_send(chunk).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                StreamingError::SendFailed("outgoing queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                StreamingError::Disconnected("outgoing queue closed".to_string())
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An open bidirectional channel to the agent
pub trait Transport: Send {
    /// Handle for outgoing media
    fn sender(&self) -> MediaSender;

    /// Take the incoming message stream. Returns `None` once taken.
    fn take_incoming(&mut self) -> Option<mpsc::Receiver<TransportMessage>>;

    /// Close the connection. Must be idempotent.
    fn close(&mut self);
}

/// Factory that opens transports
pub trait TransportConnector: Send + Sync {
    type Transport: Transport + 'static;

    fn connect(
        &self,
        setup: &LiveSetup,
    ) -> impl Future<Output = Result<Self::Transport, StreamingError>> + Send;
}
