//! Capture pipeline: microphone frames → PCM16 media chunks → transport
//!
//! The device callback encodes each frame and queues it without waiting. The
//! route to the transport only exists while the session is connected; frames
//! arriving before that (or after teardown) are dropped.

use std::sync::{Arc, Mutex, PoisonError};

use crate::audio::{AudioError, CaptureFrame, CaptureSource};
use crate::streaming::{AudioChunk, MediaChunk, MediaSender, StreamingError};

use super::stats::SessionStats;

/// Log every Nth dropped frame
const DROP_LOG_INTERVAL: u64 = 50;

/// Encode one captured frame as `audio/pcm;rate=<hz>` media.
pub fn encode_frame(frame: &CaptureFrame) -> MediaChunk {
    AudioChunk::from_samples(&frame.samples, frame.sample_rate).to_media()
}

pub struct CapturePipeline {
    source: Box<dyn CaptureSource>,
    route: Arc<Mutex<Option<MediaSender>>>,
    stats: Arc<SessionStats>,
    started: bool,
}

impl CapturePipeline {
    pub fn new(source: Box<dyn CaptureSource>, stats: Arc<SessionStats>) -> Self {
        Self {
            source,
            route: Arc::new(Mutex::new(None)),
            stats,
            started: false,
        }
    }

    /// Acquire the device. Frames are dropped until [`open`](Self::open).
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.started {
            return Ok(());
        }

        let route = self.route.clone();
        let stats = self.stats.clone();
        self.source.start(Box::new(move |frame| {
            let route = route.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(sender) = route.as_ref() else {
                return;
            };

            match sender.try_send(encode_frame(&frame)) {
                Ok(()) => {
                    let sent = stats.record_chunk_sent();
                    if sent % 100 == 0 {
                        log::debug!("Capture: sent {} chunks", sent);
                    }
                }
                Err(StreamingError::SendFailed(_)) => {
                    let dropped = stats.record_frame_dropped();
                    if dropped % DROP_LOG_INTERVAL == 1 {
                        log::warn!("Capture: transport queue full, {} frames dropped", dropped);
                    }
                }
                Err(e) => {
                    stats.record_frame_dropped();
                    log::trace!("Capture: frame dropped: {}", e);
                }
            }
        }))?;

        self.started = true;
        log::info!("Capture: device started");
        Ok(())
    }

    /// Start forwarding frames to `sender`.
    pub fn open(&self, sender: MediaSender) {
        *self.route.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    /// Stop forwarding and release the device. Idempotent.
    pub fn stop(&mut self) {
        self.route
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if self.started {
            self.source.stop();
            self.started = false;
            log::info!("Capture: device stopped");
        }
    }

    pub fn is_forwarding(&self) -> bool {
        self.route
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::FrameCallback;
    use crate::streaming::pcm;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    /// Capture source driven by hand from the test
    #[derive(Clone, Default)]
    struct ManualSource {
        callback: Arc<Mutex<Option<FrameCallback>>>,
    }

    impl ManualSource {
        fn emit(&self, samples: Vec<f32>) {
            if let Some(callback) = self.callback.lock().unwrap().as_mut() {
                callback(CaptureFrame {
                    samples,
                    sample_rate: 16000,
                });
            }
        }
    }

    impl CaptureSource for ManualSource {
        fn start(&mut self, on_frame: FrameCallback) -> Result<(), AudioError> {
            *self.callback.lock().unwrap() = Some(on_frame);
            Ok(())
        }

        fn stop(&mut self) {
            self.callback.lock().unwrap().take();
        }
    }

    struct FailingSource;

    impl CaptureSource for FailingSource {
        fn start(&mut self, _on_frame: FrameCallback) -> Result<(), AudioError> {
            Err(AudioError::NoInputDevice)
        }

        fn stop(&mut self) {}
    }

    fn pipeline(source: impl CaptureSource + 'static) -> (CapturePipeline, Arc<SessionStats>) {
        let stats = Arc::new(SessionStats::new(Uuid::new_v4()));
        (CapturePipeline::new(Box::new(source), stats.clone()), stats)
    }

    #[test]
    fn test_encode_frame_tags_rate() {
        let chunk = encode_frame(&CaptureFrame {
            samples: vec![1.0, -1.0],
            sample_rate: 16000,
        });
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        assert_eq!(
            pcm::decode_base64(&chunk.data).unwrap(),
            vec![0xFF, 0x7F, 0x00, 0x80]
        );
    }

    #[test]
    fn test_device_rate_fallback_is_tagged() {
        // 44.1kHz cannot be decimated to 16kHz, so frames keep the device rate
        let mut assembler = crate::audio::FrameAssembler::new(1, 44100, 16000, 4);
        let frames = assembler.push(&[0.0; 4]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sample_rate, 44100);
        assert_eq!(encode_frame(&frames[0]).mime_type, "audio/pcm;rate=44100");
    }

    #[test]
    fn test_frames_dropped_until_open() {
        let source = ManualSource::default();
        let (mut capture, stats) = pipeline(source.clone());
        let (tx, mut rx) = mpsc::channel(8);

        capture.start().unwrap();
        source.emit(vec![0.1; 4]);
        assert!(rx.try_recv().is_err());

        capture.open(MediaSender::new(tx));
        assert!(capture.is_forwarding());
        source.emit(vec![0.1; 4]);
        assert!(rx.try_recv().is_ok());
        assert_eq!(stats.snapshot().chunks_sent, 1);
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let source = ManualSource::default();
        let (mut capture, stats) = pipeline(source.clone());
        let (tx, _rx) = mpsc::channel(1);

        capture.start().unwrap();
        capture.open(MediaSender::new(tx));
        source.emit(vec![0.0; 4]);
        source.emit(vec![0.0; 4]);
        source.emit(vec![0.0; 4]);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.chunks_sent, 1);
        assert_eq!(snapshot.frames_dropped, 2);
    }

    #[test]
    fn test_stop_is_idempotent_and_closes_route() {
        let source = ManualSource::default();
        let (mut capture, _stats) = pipeline(source.clone());
        let (tx, mut rx) = mpsc::channel(8);

        capture.start().unwrap();
        capture.open(MediaSender::new(tx));
        capture.stop();
        capture.stop();

        assert!(!capture.is_forwarding());
        source.emit(vec![0.5; 4]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_start_failure_reported() {
        let (mut capture, _stats) = pipeline(FailingSource);
        assert_eq!(capture.start(), Err(AudioError::NoInputDevice));
        capture.stop();
    }
}
