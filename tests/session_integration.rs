//! Integration tests for the duplex session
//!
//! A scripted transport stands in for the live agent and a hand-driven
//! capture source for the microphone. The output bus is rendered by the test,
//! so the audio clock only moves when a test says so.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --test session_integration
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use jamlink::audio::{AudioError, CaptureFrame, CaptureSource, FrameCallback, OutputBus};
use jamlink::session::{DuplexSession, PlaybackConfig, SessionConfig, SessionError, SessionState};
use jamlink::streaming::{
    pcm, AudioChunk, LiveSetup, MediaChunk, MediaSender, Speaker, StreamingError, Transport,
    TransportConnector, TransportMessage,
};

const RATE: u32 = 1000;

// ============================================================================
// Scripted transport
// ============================================================================

struct ScriptedTransport {
    sender: MediaSender,
    incoming: Option<mpsc::Receiver<TransportMessage>>,
    closes: Arc<AtomicUsize>,
}

impl Transport for ScriptedTransport {
    fn sender(&self) -> MediaSender {
        self.sender.clone()
    }

    fn take_incoming(&mut self) -> Option<mpsc::Receiver<TransportMessage>> {
        self.incoming.take()
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// The agent's side of a scripted transport
struct Remote {
    to_session: mpsc::Sender<TransportMessage>,
    from_session: mpsc::Receiver<MediaChunk>,
    closes: Arc<AtomicUsize>,
}

impl Remote {
    async fn send(&self, message: TransportMessage) {
        self.to_session.send(message).await.unwrap();
    }

    async fn send_audio(&self, samples: &[f32]) {
        self.send(TransportMessage::Audio(
            AudioChunk::from_samples(samples, RATE).to_media(),
        ))
        .await;
    }
}

#[derive(Default)]
struct ScriptedConnector {
    transports: Mutex<VecDeque<ScriptedTransport>>,
    fail_with: Option<StreamingError>,
    /// Never resolve `connect`
    hold: bool,
    connects: AtomicUsize,
}

impl ScriptedConnector {
    /// Queue one transport for the next `connect`.
    fn push(&self) -> Remote {
        let (to_session, incoming) = mpsc::channel(64);
        let (media_tx, from_session) = mpsc::channel(64);
        let closes = Arc::new(AtomicUsize::new(0));

        self.transports.lock().unwrap().push_back(ScriptedTransport {
            sender: MediaSender::new(media_tx),
            incoming: Some(incoming),
            closes: closes.clone(),
        });

        Remote {
            to_session,
            from_session,
            closes,
        }
    }
}

impl TransportConnector for ScriptedConnector {
    type Transport = ScriptedTransport;

    async fn connect(&self, _setup: &LiveSetup) -> Result<ScriptedTransport, StreamingError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.hold {
            std::future::pending::<()>().await;
        }
        if let Some(e) = &self.fail_with {
            return Err(e.clone());
        }
        self.transports
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| StreamingError::ConnectionFailed("no transport scripted".to_string()))
    }
}

// ============================================================================
// Hand-driven microphone
// ============================================================================

#[derive(Clone, Default)]
struct TestCapture {
    callback: Arc<Mutex<Option<FrameCallback>>>,
    running: Arc<AtomicBool>,
    fail: bool,
}

impl TestCapture {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn emit(&self, samples: Vec<f32>) {
        if let Some(callback) = self.callback.lock().unwrap().as_mut() {
            callback(CaptureFrame {
                samples,
                sample_rate: 16000,
            });
        }
    }
}

impl CaptureSource for TestCapture {
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), AudioError> {
        if self.fail {
            return Err(AudioError::NoInputDevice);
        }
        *self.callback.lock().unwrap() = Some(on_frame);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.callback.lock().unwrap().take();
        self.running.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn config() -> SessionConfig {
    SessionConfig {
        setup: LiveSetup::default(),
        playback: PlaybackConfig {
            output_rate: RATE,
            speaking_slack: 0.1,
        },
    }
}

fn new_session(connector: ScriptedConnector) -> (DuplexSession<ScriptedConnector>, Arc<OutputBus>) {
    let bus = Arc::new(OutputBus::new(RATE));
    let session = DuplexSession::new(connector, bus.clone(), bus.clone(), config());
    (session, bus)
}

struct Harness {
    session: DuplexSession<ScriptedConnector>,
    bus: Arc<OutputBus>,
    remote: Remote,
    capture: TestCapture,
}

async fn connected() -> Harness {
    let connector = ScriptedConnector::default();
    let remote = connector.push();
    let (session, bus) = new_session(connector);
    let capture = TestCapture::default();

    session.connect(Box::new(capture.clone())).await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);

    Harness {
        session,
        bus,
        remote,
        capture,
    }
}

/// Poll until `condition` holds, failing the test after two seconds.
async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Render `frames` mono frames from the bus
fn render(bus: &OutputBus, frames: usize) -> Vec<f32> {
    let mut out = vec![0.0; frames];
    bus.render(&mut out, 1);
    out
}

fn assert_level(samples: &[f32], level: f32) {
    for (i, sample) in samples.iter().enumerate() {
        assert!(
            (sample - level).abs() < 1e-3,
            "frame {}: {} (expected {})",
            i,
            sample,
            level
        );
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test]
async fn test_connect_routes_microphone_to_transport() {
    let mut h = connected().await;
    assert!(h.capture.is_running());

    h.capture.emit(vec![0.25; 160]);

    let chunk = h.remote.from_session.try_recv().unwrap();
    assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
    assert_eq!(pcm::decode_base64(&chunk.data).unwrap().len(), 320);
    assert_eq!(h.session.stats().unwrap().chunks_sent, 1);
}

#[tokio::test]
async fn test_connect_while_connected_is_rejected() {
    let h = connected().await;

    let second = h.session.connect(Box::new(TestCapture::default())).await;
    assert_eq!(
        second,
        Err(SessionError::AlreadyActive(SessionState::Connected))
    );
    assert_eq!(h.session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let mut h = connected().await;
    h.capture.emit(vec![0.0; 16]);
    h.remote.send_audio(&[0.5; 100]).await;
    wait_until(|| h.bus.active_voices() == 1).await;

    h.session.disconnect();
    h.session.disconnect();

    assert_eq!(h.session.state(), SessionState::Disconnected);
    assert!(!h.capture.is_running());
    assert!(!h.session.is_speaking());
    assert_eq!(h.bus.active_voices(), 0);
    assert_eq!(h.remote.closes.load(Ordering::SeqCst), 1);
    assert!(h.session.last_error().is_none());

    // Counters survive teardown
    assert_eq!(h.session.stats().unwrap().chunks_sent, 1);

    // Late frames go nowhere
    let _ = h.remote.from_session.try_recv();
    h.capture.emit(vec![0.0; 16]);
    assert!(h.remote.from_session.try_recv().is_err());
}

#[tokio::test]
async fn test_disconnect_while_connecting_cancels() {
    let connector = ScriptedConnector {
        hold: true,
        ..ScriptedConnector::default()
    };
    let (session, _bus) = new_session(connector);
    let capture = TestCapture::default();

    let (result, ()) = tokio::join!(session.connect(Box::new(capture.clone())), async {
        while session.state() != SessionState::Connecting {
            tokio::task::yield_now().await;
        }
        session.disconnect();
    });

    assert_eq!(result, Err(SessionError::Cancelled));
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!capture.is_running());
}

#[tokio::test]
async fn test_dropped_connect_releases_session() {
    let connector = ScriptedConnector {
        hold: true,
        ..ScriptedConnector::default()
    };
    let (session, _bus) = new_session(connector);
    let capture = TestCapture::default();

    let timed_out = tokio::time::timeout(
        Duration::from_millis(20),
        session.connect(Box::new(capture.clone())),
    )
    .await;
    assert!(timed_out.is_err());
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!capture.is_running());
    assert_eq!(session.last_error(), None);

    // Not stuck in Connecting: the next attempt gets as far as the network
    let retry = TestCapture::default();
    let timed_out = tokio::time::timeout(
        Duration::from_millis(20),
        session.connect(Box::new(retry.clone())),
    )
    .await;
    assert!(timed_out.is_err());
    assert!(!retry.is_running());
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let connector = ScriptedConnector::default();
    let first = connector.push();
    let second = connector.push();
    let (session, _bus) = new_session(connector);

    session.connect(Box::new(TestCapture::default())).await.unwrap();
    session.disconnect();
    assert_eq!(first.closes.load(Ordering::SeqCst), 1);

    session.connect(Box::new(TestCapture::default())).await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(second.closes.load(Ordering::SeqCst), 0);

    // Messages on the first transport no longer reach the session
    let _ = first.to_session.send(TransportMessage::Closed(None)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.state(), SessionState::Connected);
}

#[tokio::test]
async fn test_connect_failure_leaves_disconnected() {
    let connector = ScriptedConnector {
        fail_with: Some(StreamingError::ConnectionFailed("refused".to_string())),
        ..ScriptedConnector::default()
    };
    let (session, _bus) = new_session(connector);
    let capture = TestCapture::default();

    let result = session.connect(Box::new(capture.clone())).await;

    assert_eq!(
        result,
        Err(SessionError::Transport(StreamingError::ConnectionFailed(
            "refused".to_string()
        )))
    );
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!capture.is_running());
    assert!(session.last_error().unwrap().contains("refused"));
}

#[tokio::test]
async fn test_missing_microphone_fails_before_network() {
    let connector = ScriptedConnector::default();
    connector.push();
    let (session, _bus) = new_session(connector);

    let result = session.connect(Box::new(TestCapture::failing())).await;

    assert_eq!(result, Err(SessionError::Device(AudioError::NoInputDevice)));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_remote_close_tears_down() {
    let h = connected().await;

    h.remote
        .send(TransportMessage::Closed(Some("going away".to_string())))
        .await;
    wait_until(|| h.session.state() == SessionState::Disconnected).await;

    assert!(!h.capture.is_running());
    assert_eq!(h.remote.closes.load(Ordering::SeqCst), 1);
    assert!(h.session.last_error().is_none());
}

#[tokio::test]
async fn test_transport_error_is_recorded() {
    let h = connected().await;

    h.remote
        .send(TransportMessage::Error("socket reset".to_string()))
        .await;
    wait_until(|| h.session.state() == SessionState::Disconnected).await;

    assert_eq!(h.session.last_error().as_deref(), Some("socket reset"));
}

// ============================================================================
// Playback
// ============================================================================

#[tokio::test]
async fn test_agent_audio_plays_back_to_back() {
    let h = connected().await;

    for _ in 0..3 {
        h.remote.send_audio(&[0.5; 100]).await;
    }
    wait_until(|| h.bus.active_voices() == 3).await;
    assert!(h.session.is_speaking());

    // 300ms of continuous audio: no gap, no overlap
    let mut played = Vec::new();
    for _ in 0..3 {
        played.extend(render(&h.bus, 50));
    }
    // Two chunks still queued
    assert!(h.session.is_speaking());
    for _ in 0..3 {
        played.extend(render(&h.bus, 50));
    }
    assert_level(&played, 0.5);
    assert_level(&render(&h.bus, 20), 0.0);

    assert!(!h.session.is_speaking());
    assert_eq!(h.session.stats().unwrap().chunks_played, 3);
}

#[tokio::test]
async fn test_interrupt_discards_queued_speech() {
    let h = connected().await;

    for _ in 0..3 {
        h.remote.send_audio(&[0.5; 100]).await;
    }
    wait_until(|| h.bus.active_voices() == 3).await;
    assert_level(&render(&h.bus, 50), 0.5);

    h.remote.send(TransportMessage::Interrupted).await;
    wait_until(|| h.bus.active_voices() == 1).await;
    assert!(!h.session.is_speaking());

    // The chunk already audible finishes, the rest is gone
    assert_level(&render(&h.bus, 50), 0.5);
    assert_level(&render(&h.bus, 200), 0.0);
    assert_eq!(h.session.stats().unwrap().interruptions, 1);

    // New speech starts at the current clock
    h.remote.send_audio(&[0.5; 100]).await;
    wait_until(|| h.bus.active_voices() == 1).await;
    assert!(h.session.is_speaking());
    assert_level(&render(&h.bus, 100), 0.5);
}

#[tokio::test]
async fn test_undecodable_chunk_is_dropped() {
    let h = connected().await;

    h.remote
        .send(TransportMessage::Audio(MediaChunk {
            mime_type: "audio/pcm;rate=1000".to_string(),
            data: "%%% not base64 %%%".to_string(),
        }))
        .await;
    h.remote.send_audio(&[0.5; 100]).await;
    wait_until(|| h.bus.active_voices() == 1).await;

    assert_eq!(h.session.stats().unwrap().decode_errors, 1);
    // The bad chunk did not push the queue forward
    assert_level(&render(&h.bus, 100), 0.5);
    assert_eq!(h.session.state(), SessionState::Connected);
}

// ============================================================================
// Transcripts and images
// ============================================================================

#[tokio::test]
async fn test_transcript_flushed_on_turn_complete() {
    let h = connected().await;
    let mut transcript_rx = h.session.subscribe_transcript();

    h.remote
        .send(TransportMessage::OutputTranscript("Sure, ".to_string()))
        .await;
    h.remote
        .send(TransportMessage::InputTranscript("Play a ".to_string()))
        .await;
    h.remote
        .send(TransportMessage::OutputTranscript("here it is".to_string()))
        .await;
    h.remote
        .send(TransportMessage::InputTranscript("C chord".to_string()))
        .await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.session.transcript().is_empty());

    h.remote.send(TransportMessage::TurnComplete).await;
    tokio::time::timeout(Duration::from_secs(2), transcript_rx.changed())
        .await
        .unwrap()
        .unwrap();

    let transcript = h.session.transcript();
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].source, Speaker::Local);
    assert_eq!(transcript[0].text, "Play a C chord");
    assert_eq!(transcript[1].source, Speaker::Remote);
    assert_eq!(transcript[1].text, "Sure, here it is");
    assert_eq!(h.session.stats().unwrap().turns, 1);
}

#[tokio::test]
async fn test_send_image_requires_connection() {
    let connector = ScriptedConnector::default();
    let mut remote = connector.push();
    let (session, _bus) = new_session(connector);

    assert_eq!(session.send_image(&[0xFF, 0xD8]), Err(SessionError::NotConnected));

    session.connect(Box::new(TestCapture::default())).await.unwrap();
    session.send_image(&[0xFF, 0xD8, 0xFF]).unwrap();

    let chunk = remote.from_session.try_recv().unwrap();
    assert_eq!(chunk.mime_type, "image/jpeg");
    assert_eq!(
        pcm::decode_base64(&chunk.data).unwrap(),
        vec![0xFF, 0xD8, 0xFF]
    );
}
