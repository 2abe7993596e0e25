//! Gemini Live API protocol types
//!
//! This module defines the JSON message types for the BidiGenerateContent
//! WebSocket endpoint.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://generativelanguage.googleapis.com/ws/...BidiGenerateContent?key=...`
//! 2. Send `setup` (model, voice, system instruction, transcription)
//! 3. Receive `setupComplete`
//! 4. Stream media via `realtimeInput.mediaChunks`
//! 5. Receive `serverContent` (audio parts, transcriptions, turn boundaries)
//! 6. `goAway` announces that the server is about to close

use serde::{Deserialize, Serialize};

use super::transport::{MediaChunk, TransportMessage};

/// Gemini Live BidiGenerateContent endpoint (API key appended as `?key=`)
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Session parameters sent in the `setup` message
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSetup {
    pub model: String,
    /// Prebuilt voice name
    pub voice: String,
    pub system_instruction: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

impl Default for LiveSetup {
    fn default() -> Self {
        Self {
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice: "Zephyr".to_string(),
            system_instruction:
                "You are a creative music studio assistant. Be concise, energetic, and helpful."
                    .to_string(),
            input_transcription: true,
            output_transcription: true,
        }
    }
}

impl LiveSetup {
    /// Model name with the `models/` prefix the wire format expects
    pub fn model_path(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }
}

// ============================================================================
// Client Messages (sent TO the Live API)
// ============================================================================

/// Messages sent from client to the Live API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// Configure the session; must be the first message
    Setup(SetupPayload),
    /// Streamed media input
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<EmptyConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Output modalities - audio only for a voice agent
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Serialises as `{}`; enables a feature with default options
#[derive(Debug, Clone, Default, Serialize)]
pub struct EmptyConfig {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

impl ClientMessage {
    /// Create the setup message for `setup`
    pub fn setup(setup: &LiveSetup) -> Self {
        Self::Setup(SetupPayload {
            model: setup.model_path(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: setup.system_instruction.clone(),
                }],
            },
            input_audio_transcription: setup.input_transcription.then(EmptyConfig::default),
            output_audio_transcription: setup.output_transcription.then(EmptyConfig::default),
        })
    }

    /// Wrap one media chunk for streaming
    pub fn media(chunk: MediaChunk) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![chunk],
        })
    }
}

// ============================================================================
// Server Messages (received FROM the Live API)
// ============================================================================

/// Messages received from the Live API.
///
/// Every field is optional; fields we do not handle (tool calls, usage
/// metadata) are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<MediaChunk>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into transport messages.
    ///
    /// Order within one message: audio, local transcript, remote transcript,
    /// turn complete, interrupted, close.
    pub fn into_transport_messages(self) -> Vec<TransportMessage> {
        let mut out = Vec::new();

        if let Some(content) = self.server_content {
            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    if let Some(blob) = part.inline_data {
                        if blob.mime_type.starts_with("audio/") {
                            out.push(TransportMessage::Audio(blob));
                        } else {
                            log::debug!("Ignoring inline {} part", blob.mime_type);
                        }
                    }
                }
            }
            if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
                out.push(TransportMessage::InputTranscript(t.text));
            }
            if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
                out.push(TransportMessage::OutputTranscript(t.text));
            }
            if content.turn_complete {
                out.push(TransportMessage::TurnComplete);
            }
            if content.interrupted {
                out.push(TransportMessage::Interrupted);
            }
        }

        if let Some(go_away) = self.go_away {
            let reason = match go_away.time_left {
                Some(left) => format!("server going away in {}", left),
                None => "server going away".to_string(),
            };
            out.push(TransportMessage::Closed(Some(reason)));
        }

        out
    }
}
