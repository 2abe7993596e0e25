//! CPAL output driver for the [`OutputBus`]
//!
//! Opens the default output device, creates a bus at the device rate and pulls
//! it from the output callback. Like capture, the stream lives on its own
//! thread and is released synchronously by [`CpalOutput::stop`].

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};

use super::{AudioError, OutputBus};

/// Running output stream feeding the default device from a bus
pub struct CpalOutput {
    bus: Arc<OutputBus>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device and start pulling a fresh bus.
    pub fn start() -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<Arc<OutputBus>, AudioError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("jamlink-output".to_string())
            .spawn(move || {
                let (stream, bus) = match open_stream() {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(bus));

                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("CpalOutput: stream released");
            })
            .map_err(|e| AudioError::DeviceThreadFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(bus)) => {
                log::info!("CpalOutput: output started at {} Hz", bus.sample_rate());
                Ok(Self {
                    bus,
                    stop_tx: Some(stop_tx),
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::DeviceThreadFailed(
                    "output thread exited before reporting".to_string(),
                ))
            }
        }
    }

    /// The bus mixed into the device; also the audio clock.
    pub fn bus(&self) -> Arc<OutputBus> {
        self.bus.clone()
    }

    /// Stop the device. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("CpalOutput: output thread panicked");
            }
            log::info!("CpalOutput: output stopped");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_stream() -> Result<(cpal::Stream, Arc<OutputBus>), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    let supported_config = device
        .default_output_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    log::info!(
        "Audio output config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let bus = Arc::new(OutputBus::new(config.sample_rate.0));

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, bus.clone()),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, bus.clone()),
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, bus.clone()),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream
        .play()
        .map_err(|e| AudioError::StreamCreationFailed(format!("Failed to start stream: {}", e)))?;

    Ok((stream, bus))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    bus: Arc<OutputBus>,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let err_fn = |err: cpal::StreamError| log::error!("Audio output stream error: {}", err);
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                bus.render(&mut scratch, channels);
                for (out, sample) in data.iter_mut().zip(&scratch) {
                    *out = <T as cpal::Sample>::from_sample(sample.clamp(-1.0, 1.0));
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}
