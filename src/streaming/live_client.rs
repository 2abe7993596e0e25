//! Gemini Live API WebSocket client
//!
//! Manages the WebSocket connection lifecycle of a live session.
//!
//! # Connection Flow
//!
//! 1. `connect()` - Establish WebSocket, send `setup`, wait for `setupComplete`
//! 2. `sender()` - Queue media chunks (non-blocking, drained by a writer task)
//! 3. `take_incoming()` - Receive decoded server events
//! 4. `close()` - Clean shutdown
//!
//! # Retry Strategy
//!
//! Initial connection retries 3 times with exponential backoff (1s, 2s).
//! Mid-session disconnects do NOT reconnect - the session is torn down.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
};
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientMessage, LiveSetup, ServerMessage, LIVE_API_URL};
use super::transport::{MediaChunk, MediaSender, Transport, TransportConnector, TransportMessage};
use super::StreamingError;

/// Environment variable holding the API key
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Connection timeout for initial WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for waiting for setupComplete
const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum attempts for initial connection
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Outgoing media queue; capture drops frames when it is full
const OUTGOING_QUEUE: usize = 64;

/// Incoming event queue
const INCOMING_QUEUE: usize = 100;

/// Connector for the Live API
#[derive(Debug, Clone)]
pub struct LiveClient {
    api_key: String,
    url: String,
}

impl LiveClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            url: LIVE_API_URL.to_string(),
        }
    }

    /// Build a client from `GEMINI_API_KEY`.
    pub fn from_env() -> Result<Self, StreamingError> {
        get_api_key()
            .map(Self::new)
            .ok_or(StreamingError::MissingApiKey)
    }

    /// Override the endpoint (e.g. a proxy)
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Single connection attempt (no retries)
    async fn try_connect(&self, setup: &LiveSetup) -> Result<LiveTransport, StreamingError> {
        let request = format!("{}?key={}", self.url, self.api_key)
            .into_client_request()
            .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        install_crypto_provider();
        log::info!("Connecting to Live API ({})...", setup.model);

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(
                request, None, true, // disable_nagle (we want low latency)
            ),
        )
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        log::info!("WebSocket connected, sending setup...");

        let (mut write, mut read) = ws_stream.split();

        let setup_json = serde_json::to_string(&ClientMessage::setup(setup))
            .map_err(|e| StreamingError::ProtocolError(e.to_string()))?;
        write
            .send(Message::Text(setup_json))
            .await
            .map_err(|e| StreamingError::SendFailed(e.to_string()))?;

        // Wait for setupComplete
        timeout(SESSION_TIMEOUT, async {
            while let Some(msg_result) = read.next().await {
                match msg_result.map(parse_frame) {
                    Ok(Frame::Server(msg)) if msg.is_setup_complete() => {
                        log::info!("Live session setup complete");
                        return Ok(());
                    }
                    Ok(Frame::Server(_)) => {
                        log::debug!("Ignoring message while waiting for setupComplete");
                    }
                    Ok(Frame::Closed(reason)) => {
                        return Err(StreamingError::AuthenticationFailed(
                            reason.unwrap_or_else(|| "closed during setup".to_string()),
                        ));
                    }
                    Ok(Frame::Skip) => {}
                    Err(e) => return Err(StreamingError::ProtocolError(e.to_string())),
                }
            }
            Err(StreamingError::Disconnected("Stream ended".to_string()))
        })
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Session setup timeout".to_string()))??;

        let cancel = CancellationToken::new();
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        let (media_tx, mut media_rx) = mpsc::channel::<MediaChunk>(OUTGOING_QUEUE);

        // Reader: WebSocket frames → transport messages
        let reader_cancel = cancel.clone();
        let reader_tx = incoming_tx.clone();
        let reader = tokio::spawn(async move {
            let mut received = 0u64;
            let last = loop {
                let msg_result = tokio::select! {
                    _ = reader_cancel.cancelled() => return,
                    next = read.next() => next,
                };
                match msg_result.map(|r| r.map(parse_frame)) {
                    Some(Ok(Frame::Server(msg))) => {
                        for event in msg.into_transport_messages() {
                            let closing = matches!(event, TransportMessage::Closed(_));
                            if reader_tx.send(event).await.is_err() {
                                log::debug!("Receiver channel closed");
                                return;
                            }
                            if closing {
                                return;
                            }
                        }
                        received += 1;
                        if received % 100 == 0 {
                            log::debug!("LiveTransport: {} server messages", received);
                        }
                    }
                    Some(Ok(Frame::Skip)) => {}
                    Some(Ok(Frame::Closed(reason))) => {
                        log::info!("WebSocket closed by server: {:?}", reason);
                        break TransportMessage::Closed(reason);
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error: {}", e);
                        break TransportMessage::Error(e.to_string());
                    }
                    None => break TransportMessage::Closed(None),
                }
            };
            let _ = reader_tx.send(last).await;
            log::debug!("Reader task exiting");
        });

        // Writer: queued media → WebSocket
        // Detached: on cancellation it sends a close frame and exits by itself.
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sent = 0u64;
            loop {
                let chunk = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    chunk = media_rx.recv() => match chunk {
                        Some(chunk) => chunk,
                        None => break,
                    },
                };

                let json = match serde_json::to_string(&ClientMessage::media(chunk)) {
                    Ok(json) => json,
                    Err(e) => {
                        log::warn!("Failed to serialize media: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    log::warn!("Failed to send media: {}", e);
                    let _ = incoming_tx
                        .send(TransportMessage::Error(format!("send failed: {}", e)))
                        .await;
                    break;
                }

                sent += 1;
                if sent % 50 == 0 {
                    log::debug!("LiveTransport: sent {} chunks", sent);
                }
            }

            if let Err(e) = write.close().await {
                log::debug!("Error closing WebSocket: {}", e);
            }
            log::debug!("Writer task exiting after {} chunks", sent);
        });

        Ok(LiveTransport {
            media_tx,
            incoming_rx: Some(incoming_rx),
            cancel,
            reader,
        })
    }
}

impl TransportConnector for LiveClient {
    type Transport = LiveTransport;

    async fn connect(&self, setup: &LiveSetup) -> Result<LiveTransport, StreamingError> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                log::info!(
                    "Retrying WebSocket connection in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    MAX_RETRIES
                );
                tokio::time::sleep(delay).await;
            }

            match self.try_connect(setup).await {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    log::warn!("Connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            StreamingError::ConnectionFailed("Max retries exceeded".to_string())
        }))
    }
}

/// Handle to an open Live API session
pub struct LiveTransport {
    media_tx: mpsc::Sender<MediaChunk>,
    incoming_rx: Option<mpsc::Receiver<TransportMessage>>,
    cancel: CancellationToken,
    reader: tokio::task::JoinHandle<()>,
}

impl Transport for LiveTransport {
    fn sender(&self) -> MediaSender {
        MediaSender::new(self.media_tx.clone())
    }

    fn take_incoming(&mut self) -> Option<mpsc::Receiver<TransportMessage>> {
        self.incoming_rx.take()
    }

    fn close(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        log::info!("Disconnecting from Live API...");
        self.cancel.cancel();
        self.reader.abort();
    }
}

impl Drop for LiveTransport {
    fn drop(&mut self) {
        // Ensure tasks stop if the transport is dropped without close()
        self.cancel.cancel();
        self.reader.abort();
    }
}

enum Frame {
    Server(ServerMessage),
    Closed(Option<String>),
    Skip,
}

/// Text and binary frames both carry JSON.
fn parse_frame(msg: Message) -> Frame {
    let parsed = match msg {
        Message::Text(text) => serde_json::from_str::<ServerMessage>(&text),
        Message::Binary(bytes) => serde_json::from_slice::<ServerMessage>(&bytes),
        Message::Close(frame) => {
            return Frame::Closed(
                frame
                    .map(|f| f.reason.to_string())
                    .filter(|reason| !reason.is_empty()),
            )
        }
        _ => return Frame::Skip, // Ignore ping/pong
    };

    match parsed {
        Ok(msg) => Frame::Server(msg),
        Err(e) => {
            log::warn!("Failed to parse message: {}", e);
            Frame::Skip
        }
    }
}

/// rustls refuses to pick a provider when more than one is compiled in.
fn install_crypto_provider() {
    // Err means a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Get the Live API key from environment
pub fn get_api_key() -> Option<String> {
    std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};

    #[test]
    fn test_from_env_without_key() {
        // Only test in this binary that touches the key
        std::env::set_var(API_KEY_ENV, "");
        assert_eq!(get_api_key(), None);
        assert!(matches!(
            LiveClient::from_env(),
            Err(StreamingError::MissingApiKey)
        ));

        std::env::remove_var(API_KEY_ENV);
        assert!(matches!(
            LiveClient::from_env(),
            Err(StreamingError::MissingApiKey)
        ));
    }

    #[test]
    fn test_parse_text_and_binary_frames() {
        let json = r#"{"serverContent":{"turnComplete":true}}"#;

        let text = parse_frame(Message::Text(json.to_string()));
        assert!(matches!(text, Frame::Server(ref m) if m.server_content.is_some()));

        let binary = parse_frame(Message::Binary(json.as_bytes().to_vec()));
        assert!(matches!(binary, Frame::Server(ref m) if m.server_content.is_some()));
    }

    #[test]
    fn test_parse_close_and_garbage() {
        let frame = parse_frame(Message::Close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: "API key not valid".into(),
        })));
        assert!(matches!(frame, Frame::Closed(Some(ref r)) if r.contains("API key")));

        assert!(matches!(parse_frame(Message::Close(None)), Frame::Closed(None)));
        assert!(matches!(
            parse_frame(Message::Text("not json".to_string())),
            Frame::Skip
        ));
        assert!(matches!(parse_frame(Message::Ping(vec![1])), Frame::Skip));
    }

    #[tokio::test]
    #[ignore] // Requires valid API key
    async fn test_live_connection() {
        let client = LiveClient::from_env().expect("GEMINI_API_KEY required");

        let mut transport = client.connect(&LiveSetup::default()).await.unwrap();
        assert!(transport.take_incoming().is_some());
        assert!(transport.take_incoming().is_none());

        // 100ms of silence at 16kHz
        let chunk = crate::streaming::AudioChunk::from_samples(&[0.0; 1600], 16000);
        transport.sender().try_send(chunk.to_media()).unwrap();

        transport.close();
    }
}
