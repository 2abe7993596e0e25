//! Microphone capture using CPAL
//!
//! A [`CaptureSource`] delivers fixed-size mono `f32` frames to a callback.
//! The CPAL implementation keeps its stream on a dedicated thread (streams are
//! not `Send` on every platform) and stops it synchronously: once
//! [`CaptureSource::stop`] returns, the callback will not run again.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};

use super::AudioError;

/// One block of mono samples from the capture device
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Receives frames on the device thread
pub type FrameCallback = Box<dyn FnMut(CaptureFrame) + Send + 'static>;

/// Capability interface for an input device.
pub trait CaptureSource: Send {
    /// Acquire the device and begin delivering frames to `on_frame`.
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), AudioError>;

    /// Release the device. Idempotent; no frame is delivered after return.
    fn stop(&mut self);
}

/// Turns interleaved device blocks into fixed-size mono frames at the target rate.
///
/// Channels are averaged into mono. When the device rate is an integer
/// multiple of the target rate, groups of samples are averaged down
/// (e.g. 48kHz → 16kHz). Other ratios pass through at the device rate.
#[derive(Debug)]
pub struct FrameAssembler {
    channels: usize,
    device_rate: u32,
    output_rate: u32,
    ratio: usize,
    frame_size: usize,
    /// Partial decimation group carried between device blocks
    group: Vec<f32>,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(channels: usize, device_rate: u32, target_rate: u32, frame_size: usize) -> Self {
        let channels = channels.max(1);
        let frame_size = frame_size.max(1);

        let (ratio, output_rate) = if target_rate == 0 || device_rate == 0 {
            log::warn!(
                "Invalid sample rate (device: {}, target: {}), passing through",
                device_rate,
                target_rate
            );
            (1, device_rate)
        } else if device_rate % target_rate != 0 {
            log::warn!(
                "Unsupported resample ratio {}:{}, capturing at device rate",
                device_rate,
                target_rate
            );
            (1, device_rate)
        } else {
            ((device_rate / target_rate) as usize, target_rate)
        };

        Self {
            channels,
            device_rate,
            output_rate,
            ratio,
            frame_size,
            group: Vec::with_capacity(ratio),
            pending: Vec::with_capacity(frame_size * 2),
        }
    }

    /// Rate of the frames this assembler produces
    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Feed one interleaved device block, returning every completed frame.
    pub fn push(&mut self, interleaved: &[f32]) -> Vec<CaptureFrame> {
        for frame in interleaved.chunks(self.channels) {
            let mono = frame.iter().sum::<f32>() / frame.len() as f32;
            self.group.push(mono);

            if self.group.len() == self.ratio {
                let value = self.group.iter().sum::<f32>() / self.ratio as f32;
                self.group.clear();
                self.pending.push(value);
            }
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let samples: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            frames.push(CaptureFrame {
                samples,
                sample_rate: self.output_rate,
            });
        }
        frames
    }
}

/// Handle to the thread that owns a running CPAL input stream
struct CaptureWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Capture source backed by the default CPAL input device.
pub struct CpalCapture {
    target_rate: u32,
    frame_size: usize,
    worker: Option<CaptureWorker>,
}

impl CpalCapture {
    /// `target_rate` is the rate frames are delivered at (16kHz for the live agent),
    /// `frame_size` the number of samples per frame.
    pub fn new(target_rate: u32, frame_size: usize) -> Self {
        Self {
            target_rate,
            frame_size,
            worker: None,
        }
    }

    fn open_stream(
        target_rate: u32,
        frame_size: usize,
        on_frame: FrameCallback,
    ) -> Result<cpal::Stream, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(AudioError::NoInputDevice)?;

        log::info!("Using audio input device: {:?}", device.name());

        let supported_config = device
            .default_input_config()
            .map_err(|_| AudioError::NoSupportedConfig)?;

        log::info!(
            "Audio input config: {} Hz, {} channels, {:?}",
            supported_config.sample_rate().0,
            supported_config.channels(),
            supported_config.sample_format()
        );

        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();
        let assembler = FrameAssembler::new(
            config.channels as usize,
            config.sample_rate.0,
            target_rate,
            frame_size,
        );

        let stream = match sample_format {
            SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, assembler, on_frame),
            SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, assembler, on_frame),
            SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, assembler, on_frame),
            _ => Err(AudioError::NoSupportedConfig),
        }?;

        stream.play().map_err(|e| {
            AudioError::StreamCreationFailed(format!("Failed to start stream: {}", e))
        })?;

        Ok(stream)
    }
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut assembler: FrameAssembler,
    mut on_frame: FrameCallback,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let err_fn = |err: cpal::StreamError| log::error!("Audio input stream error: {}", err);
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| <f32 as cpal::Sample>::from_sample(s)));
                for frame in assembler.push(&scratch) {
                    on_frame(frame);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

impl CaptureSource for CpalCapture {
    fn start(&mut self, on_frame: FrameCallback) -> Result<(), AudioError> {
        if self.worker.is_some() {
            log::warn!("CpalCapture: start called while already capturing");
            return Ok(());
        }

        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let target_rate = self.target_rate;
        let frame_size = self.frame_size;

        let thread = std::thread::Builder::new()
            .name("jamlink-capture".to_string())
            .spawn(move || {
                let stream = match Self::open_stream(target_rate, frame_size, on_frame) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Park until stop() (or the handle is dropped), then release the device
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("CpalCapture: stream released");
            })
            .map_err(|e| AudioError::DeviceThreadFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!("CpalCapture: capture started ({} Hz frames)", target_rate);
                self.worker = Some(CaptureWorker { stop_tx, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::DeviceThreadFailed(
                    "capture thread exited before reporting".to_string(),
                ))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if worker.thread.join().is_err() {
                log::warn!("CpalCapture: capture thread panicked");
            }
            log::info!("CpalCapture: capture stopped");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_emits_fixed_size_frames() {
        let mut assembler = FrameAssembler::new(1, 16000, 16000, 4);

        assert!(assembler.push(&[0.1, 0.2, 0.3]).is_empty());

        let frames = assembler.push(&[0.4, 0.5, 0.6]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(frames[0].sample_rate, 16000);

        let frames = assembler.push(&[0.7, 0.8]);
        assert_eq!(frames[0].samples, vec![0.5, 0.6, 0.7, 0.8]);
    }

    #[test]
    fn test_assembler_downmixes_stereo() {
        let mut assembler = FrameAssembler::new(2, 16000, 16000, 2);

        let frames = assembler.push(&[1.0, 0.0, -0.5, -0.5]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples, vec![0.5, -0.5]);
    }

    #[test]
    fn test_assembler_decimates_integer_ratio() {
        // 48kHz → 16kHz (3:1)
        let mut assembler = FrameAssembler::new(1, 48000, 16000, 2);
        assert_eq!(assembler.output_rate(), 16000);

        // Group boundary spans two device blocks
        assert!(assembler.push(&[0.3, 0.6, 0.9, 0.0]).is_empty());
        let frames = assembler.push(&[0.0, 0.3]);

        assert_eq!(frames.len(), 1);
        assert!((frames[0].samples[0] - 0.6).abs() < 1e-6);
        assert!((frames[0].samples[1] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_assembler_passes_through_unsupported_ratio() {
        let assembler = FrameAssembler::new(1, 44100, 16000, 4);
        assert_eq!(assembler.output_rate(), 44100);

        let assembler = FrameAssembler::new(1, 48000, 0, 4);
        assert_eq!(assembler.output_rate(), 48000);
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let mut capture = CpalCapture::new(16000, 4096);
        capture.stop();
        capture.stop();
    }
}
