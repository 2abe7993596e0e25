//! Audio device layer for jamlink
//!
//! The output side is a single mixing bus whose frame counter doubles as the
//! monotonic audio clock. The input side is a capture source that hands out
//! fixed-size mono frames. CPAL drives both on real hardware.

mod bus;
pub mod capture;
mod output;
pub mod wav;

pub use bus::{EndedCallback, OutputBus, OutputSink, ScheduledBuffer, VoiceId};
pub use capture::{CaptureFrame, CaptureSource, CpalCapture, FrameAssembler, FrameCallback};
pub use output::CpalOutput;

/// Errors raised by audio devices and the output bus.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    NoInputDevice,
    NoOutputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    /// The device thread exited before reporting whether the stream started
    DeviceThreadFailed(String),
    /// A buffer that cannot be scheduled (zero sample rate, non-finite start)
    InvalidBuffer(String),
    WriteFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoOutputDevice => write!(f, "No audio output device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::DeviceThreadFailed(e) => write!(f, "Audio device thread failed: {}", e),
            AudioError::InvalidBuffer(e) => write!(f, "Invalid audio buffer: {}", e),
            AudioError::WriteFailed(e) => write!(f, "Failed to write audio data: {}", e),
        }
    }
}

impl std::error::Error for AudioError {}
