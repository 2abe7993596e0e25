//! Offline rendering of the output bus to a 16-bit WAV file

use std::path::Path;

use hound::{WavSpec, WavWriter};

use super::{AudioError, OutputBus};

/// Default frames rendered per block when pulling the bus offline
pub const RENDER_BLOCK_FRAMES: usize = 256;

/// Pull `seconds` of audio from `bus` into a mono WAV file at `path`.
///
/// The bus is rendered in blocks of at most `block_frames`. `before_block`
/// runs before every block with the bus time at the start of that block,
/// which is where offline drivers (the sequencer) schedule their next
/// events. Returns the number of frames written.
pub fn render_to_wav<F>(
    bus: &OutputBus,
    path: &Path,
    seconds: f64,
    block_frames: usize,
    mut before_block: F,
) -> Result<u64, AudioError>
where
    F: FnMut(f64),
{
    let spec = WavSpec {
        channels: 1,
        sample_rate: bus.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer =
        WavWriter::create(path, spec).map_err(|e| AudioError::WriteFailed(e.to_string()))?;

    let total_frames = (seconds.max(0.0) * bus.sample_rate() as f64).round() as u64;
    let block_frames = block_frames.max(1);
    let mut block = vec![0.0f32; block_frames];
    let mut written = 0u64;

    while written < total_frames {
        let frames = (total_frames - written).min(block_frames as u64) as usize;
        let block = &mut block[..frames];

        before_block(written as f64 / bus.sample_rate() as f64);
        bus.render(block, 1);

        for &sample in block.iter() {
            writer
                .write_sample(sample_to_i16(sample))
                .map_err(|e| AudioError::WriteFailed(e.to_string()))?;
        }
        written += frames as u64;
    }

    writer
        .finalize()
        .map_err(|e| AudioError::WriteFailed(e.to_string()))?;

    log::info!(
        "Rendered {} frames ({:.2}s) to {:?}",
        written,
        written as f64 / bus.sample_rate() as f64,
        path
    );
    Ok(written)
}

/// Convert a float sample to i16 for WAV writing.
fn sample_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}
