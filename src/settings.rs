use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sequencer::{SequencerConfig, DEFAULT_PITCHES};
use crate::session::{PlaybackConfig, SessionConfig};
use crate::streaming::LiveSetup;

const SETTINGS_DIR_NAME: &str = "jamlink";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Sequencer tempo. Clamped to 60-240 BPM when applied.
    pub bpm: f64,

    /// Number of steps in one sequencer pattern.
    pub steps: usize,

    /// How far ahead of the audio clock notes are scheduled.
    pub lookahead_ms: u64,

    /// Period of the scheduling timer. Must be well below `lookahead_ms`.
    pub tick_interval_ms: u64,

    /// Rate microphone audio is sent at.
    pub capture_rate: u32,

    /// Samples per captured frame (4096 at 16kHz is ~256ms).
    pub capture_frame_size: usize,

    /// Rate assumed for agent audio without a `rate=` MIME parameter.
    pub output_rate: u32,

    /// "Speaking" clears when the last buffer ends within this margin of the queue end.
    pub speaking_slack_ms: u64,

    /// Live API model.
    pub live_model: String,

    /// Prebuilt voice of the agent.
    pub voice: String,

    /// System instruction sent at session setup.
    pub system_instruction: String,

    /// Ask the server to transcribe the microphone.
    pub input_transcription: bool,

    /// Ask the server to transcribe the agent.
    pub output_transcription: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        let setup = LiveSetup::default();
        Self {
            bpm: 120.0,
            steps: 16,
            lookahead_ms: 100,
            tick_interval_ms: 25,
            capture_rate: 16000,
            capture_frame_size: 4096,
            output_rate: 24000,
            speaking_slack_ms: 100,
            live_model: setup.model,
            voice: setup.voice,
            system_instruction: setup.system_instruction,
            input_transcription: true,
            output_transcription: true,
        }
    }
}

impl AppSettings {
    pub fn sequencer_config(&self) -> SequencerConfig {
        let mut tick_interval_ms = self.tick_interval_ms.max(1);
        if self.lookahead_ms > 0 && tick_interval_ms >= self.lookahead_ms {
            let clamped = (self.lookahead_ms / 2).max(1);
            log::warn!(
                "tick_interval_ms {} is not below lookahead_ms {}, using {}",
                tick_interval_ms,
                self.lookahead_ms,
                clamped
            );
            tick_interval_ms = clamped;
        }

        SequencerConfig {
            lookahead: self.lookahead_ms as f64 / 1000.0,
            tick_interval: Duration::from_millis(tick_interval_ms),
            steps: self.steps,
            pitches: DEFAULT_PITCHES.collect(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            setup: LiveSetup {
                model: self.live_model.clone(),
                voice: self.voice.clone(),
                system_instruction: self.system_instruction.clone(),
                input_transcription: self.input_transcription,
                output_transcription: self.output_transcription,
            },
            playback: PlaybackConfig {
                output_rate: self.output_rate,
                speaking_slack: self.speaking_slack_ms as f64 / 1000.0,
            },
        }
    }
}

/// `<config_dir>/jamlink/settings.json`, if the platform has a config directory
pub fn default_settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir()
        .ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write atomically: write to a temp file in the same directory, then rename.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // On Windows, rename fails if the destination exists, so remove it first.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
