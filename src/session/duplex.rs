//! Connection lifecycle and message routing of a duplex session

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::capture::CapturePipeline;
use super::playback::{Playback, PlaybackConfig, PlaybackError};
use super::state::SessionState;
use super::stats::{SessionStats, StatsSnapshot};
use super::SessionError;
use crate::audio::{CaptureSource, OutputSink};
use crate::clock::AudioClock;
use crate::streaming::{
    pcm, LiveSetup, MediaChunk, MediaSender, Speaker, StreamingError, Transport,
    TransportConnector, TransportMessage, TranscriptBuffer, TranscriptEntry,
};

/// Configuration for a duplex session
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub setup: LiveSetup,
    pub playback: PlaybackConfig,
}

/// Everything owned by a connected session
struct ActiveSession {
    capture: CapturePipeline,
    transport: Box<dyn Transport>,
    sender: MediaSender,
    playback: Arc<Playback>,
    pump: CancellationToken,
    stats: Arc<SessionStats>,
}

/// Resources of a connect that has not resolved yet
struct PendingConnect {
    capture: Option<CapturePipeline>,
    cancel: CancellationToken,
}

struct SessionCore {
    state: SessionState,
    /// Id of the current connect attempt / session; messages for any other id are stale
    current: Option<Uuid>,
    pending: Option<PendingConnect>,
    active: Option<ActiveSession>,
    transcript: TranscriptBuffer,
    log: Vec<TranscriptEntry>,
    last_error: Option<String>,
    last_stats: Option<StatsSnapshot>,
}

struct Shared {
    core: Mutex<SessionCore>,
    state_tx: watch::Sender<SessionState>,
    speaking_tx: Arc<watch::Sender<bool>>,
    transcript_tx: watch::Sender<Vec<TranscriptEntry>>,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, core: &mut SessionCore, next: SessionState) {
        if core.state == next {
            return;
        }
        if !core.state.can_transition_to(next) {
            log::warn!(
                "Session: ignoring illegal transition {} -> {}",
                core.state,
                next
            );
            return;
        }
        log::info!("Session: {} -> {}", core.state, next);
        core.state = next;
        self.state_tx.send_replace(next);
    }

    /// Release everything owned by session `id` (or by whatever is current
    /// when `id` is `None`). Safe to call repeatedly and from any state.
    fn teardown(&self, id: Option<Uuid>, error: Option<String>) {
        let mut core = self.core();
        if id.is_some() && core.current != id {
            return;
        }
        if core.state == SessionState::Disconnected && core.current.is_none() {
            return;
        }

        self.set_state(&mut core, SessionState::Closing);
        core.current = None;

        if let Some(mut pending) = core.pending.take() {
            pending.cancel.cancel();
            if let Some(mut capture) = pending.capture.take() {
                capture.stop();
            }
        }

        if let Some(mut active) = core.active.take() {
            active.pump.cancel();
            active.capture.stop();
            active.transport.close();
            active.playback.stop();
            active.stats.log_summary();
            core.last_stats = Some(active.stats.snapshot());
        }

        core.transcript.reset();
        if let Some(error) = error {
            log::error!("Session: closed with error: {}", error);
            core.last_error = Some(error);
        }

        self.speaking_tx.send_replace(false);
        self.set_state(&mut core, SessionState::Disconnected);
    }

    /// Route one transport message. Returns false when the pump should exit.
    fn handle_message(&self, id: Uuid, playback: &Playback, message: TransportMessage) -> bool {
        match message {
            TransportMessage::Audio(media) => match playback.enqueue_media(&media) {
                Ok(_) | Err(PlaybackError::Decode(_)) => {}
                Err(PlaybackError::Stopped) => return false,
                Err(e) => log::warn!("Session: {}", e),
            },
            TransportMessage::InputTranscript(text) => {
                self.with_current(id, |core| core.transcript.push(Speaker::Local, &text));
            }
            TransportMessage::OutputTranscript(text) => {
                self.with_current(id, |core| core.transcript.push(Speaker::Remote, &text));
            }
            TransportMessage::TurnComplete => {
                self.with_current(id, |core| {
                    let entries = core.transcript.complete_turn();
                    if let Some(active) = &core.active {
                        active.stats.record_turn();
                    }
                    if !entries.is_empty() {
                        for entry in &entries {
                            log::info!("Transcript [{}]: {}", entry.source.as_str(), entry.text);
                        }
                        core.log.extend(entries);
                        self.transcript_tx.send_replace(core.log.clone());
                    }
                });
            }
            TransportMessage::Interrupted => self.with_current(id, |_| playback.interrupt()),
            TransportMessage::Closed(reason) => {
                log::info!(
                    "Session: remote closed ({})",
                    reason.as_deref().unwrap_or("no reason")
                );
                self.teardown(Some(id), None);
                return false;
            }
            TransportMessage::Error(e) => {
                self.teardown(Some(id), Some(e));
                return false;
            }
        }
        true
    }

    fn with_current<F: FnOnce(&mut SessionCore)>(&self, id: Uuid, f: F) {
        let mut core = self.core();
        if core.current == Some(id) {
            f(&mut core);
        }
    }
}

/// Tears down a connect attempt whose future is dropped before it resolves
struct ConnectGuard<'a> {
    shared: &'a Shared,
    id: Uuid,
    armed: bool,
}

impl ConnectGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            // No-op when the attempt already failed or was superseded
            self.shared.teardown(Some(self.id), None);
        }
    }
}

/// A live conversation with a remote audio agent
pub struct DuplexSession<C: TransportConnector> {
    connector: C,
    sink: Arc<dyn OutputSink>,
    clock: Arc<dyn AudioClock>,
    config: SessionConfig,
    shared: Arc<Shared>,
}

impl<C: TransportConnector> DuplexSession<C> {
    /// `sink` and `clock` are normally the same [`OutputBus`](crate::audio::OutputBus).
    pub fn new(
        connector: C,
        sink: Arc<dyn OutputSink>,
        clock: Arc<dyn AudioClock>,
        config: SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (speaking_tx, _) = watch::channel(false);
        let (transcript_tx, _) = watch::channel(Vec::new());

        Self {
            connector,
            sink,
            clock,
            config,
            shared: Arc::new(Shared {
                core: Mutex::new(SessionCore {
                    state: SessionState::Disconnected,
                    current: None,
                    pending: None,
                    active: None,
                    transcript: TranscriptBuffer::new(),
                    log: Vec::new(),
                    last_error: None,
                    last_stats: None,
                }),
                state_tx,
                speaking_tx: Arc::new(speaking_tx),
                transcript_tx,
            }),
        }
    }

    /// Acquire `capture`, open the transport and start routing audio.
    ///
    /// On failure the session is left `Disconnected`. If [`disconnect`]
    /// is called before this resolves, it fails with [`SessionError::Cancelled`].
    /// Dropping the future before it resolves (a lost `select!` branch, a
    /// timeout) tears the attempt down as well and releases the capture device.
    ///
    /// [`disconnect`]: Self::disconnect
    pub async fn connect(&self, capture: Box<dyn CaptureSource>) -> Result<(), SessionError> {
        let id = Uuid::new_v4();
        let stats = Arc::new(SessionStats::new(id));
        let cancel = CancellationToken::new();

        {
            let mut core = self.shared.core();
            if core.state != SessionState::Disconnected {
                return Err(SessionError::AlreadyActive(core.state));
            }
            core.current = Some(id);
            core.last_error = None;
            core.pending = Some(PendingConnect {
                capture: None,
                cancel: cancel.clone(),
            });
            self.shared.set_state(&mut core, SessionState::Connecting);
        }
        let guard = ConnectGuard {
            shared: &self.shared,
            id,
            armed: true,
        };

        // Device first: a missing microphone should fail fast, before any network.
        let mut capture = CapturePipeline::new(capture, stats.clone());
        if let Err(e) = capture.start() {
            self.shared.teardown(Some(id), Some(e.to_string()));
            return Err(SessionError::Device(e));
        }
        {
            let mut core = self.shared.core();
            let is_current = core.current == Some(id);
            match core.pending.as_mut() {
                Some(pending) if is_current => pending.capture = Some(capture),
                _ => {
                    capture.stop();
                    return Err(SessionError::Cancelled);
                }
            }
        }

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            result = self.connector.connect(&self.config.setup) => result,
        };

        let mut transport: Box<dyn Transport> = match connected {
            Ok(transport) => Box::new(transport),
            Err(e) => {
                self.shared.teardown(Some(id), Some(e.to_string()));
                return Err(SessionError::Transport(e));
            }
        };

        let mut core = self.shared.core();
        if core.current != Some(id) {
            // Disconnected while the transport was opening
            transport.close();
            return Err(SessionError::Cancelled);
        }

        let incoming = transport.take_incoming();
        let pending_capture = core.pending.take().and_then(|pending| pending.capture);
        let (Some(incoming), Some(capture)) = (incoming, pending_capture) else {
            drop(core);
            transport.close();
            let e = StreamingError::ProtocolError("transport has no incoming stream".to_string());
            self.shared.teardown(Some(id), Some(e.to_string()));
            return Err(SessionError::Transport(e));
        };

        let playback = Arc::new(Playback::new(
            self.sink.clone(),
            self.clock.clone(),
            self.config.playback.clone(),
            self.shared.speaking_tx.clone(),
            stats.clone(),
        ));

        let sender = transport.sender();
        capture.open(sender.clone());

        let pump = CancellationToken::new();
        tokio::spawn(run_pump(
            self.shared.clone(),
            id,
            playback.clone(),
            incoming,
            pump.clone(),
        ));

        core.active = Some(ActiveSession {
            capture,
            transport,
            sender,
            playback,
            pump,
            stats,
        });
        self.shared.set_state(&mut core, SessionState::Connected);
        drop(core);
        guard.disarm();
        log::info!("Session {}: connected", id);
        Ok(())
    }

    /// Close the transport, stop capture and playback and release devices.
    ///
    /// Idempotent and callable from any state, including while `connect` is pending.
    pub fn disconnect(&self) {
        self.shared.teardown(None, None);
    }

    /// Forward a still image (JPEG bytes) to the agent.
    pub fn send_image(&self, jpeg: &[u8]) -> Result<(), SessionError> {
        let core = self.shared.core();
        let active = match (&core.active, core.state) {
            (Some(active), SessionState::Connected) => active,
            _ => return Err(SessionError::NotConnected),
        };
        active
            .sender
            .try_send(MediaChunk {
                mime_type: "image/jpeg".to_string(),
                data: pcm::encode_base64(jpeg),
            })
            .map_err(SessionError::Transport)?;
        active.stats.record_chunk_sent();
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.shared.core().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_speaking(&self) -> bool {
        *self.shared.speaking_tx.borrow()
    }

    pub fn subscribe_speaking(&self) -> watch::Receiver<bool> {
        self.shared.speaking_tx.subscribe()
    }

    /// Completed transcript lines, oldest first
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.shared.core().log.clone()
    }

    pub fn subscribe_transcript(&self) -> watch::Receiver<Vec<TranscriptEntry>> {
        self.shared.transcript_tx.subscribe()
    }

    /// Error that ended (or prevented) the most recent session
    pub fn last_error(&self) -> Option<String> {
        self.shared.core().last_error.clone()
    }

    /// Counters of the running session, or of the last one after teardown
    pub fn stats(&self) -> Option<StatsSnapshot> {
        let core = self.shared.core();
        match &core.active {
            Some(active) => Some(active.stats.snapshot()),
            None => core.last_stats.clone(),
        }
    }
}

impl<C: TransportConnector> Drop for DuplexSession<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run_pump(
    shared: Arc<Shared>,
    id: Uuid,
    playback: Arc<Playback>,
    mut incoming: mpsc::Receiver<TransportMessage>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = incoming.recv() => message,
        };

        match message {
            Some(message) => {
                if !shared.handle_message(id, &playback, message) {
                    break;
                }
            }
            None => {
                shared.teardown(Some(id), Some("transport stream ended".to_string()));
                break;
            }
        }
    }
    log::debug!("Session {}: pump exited", id);
}
