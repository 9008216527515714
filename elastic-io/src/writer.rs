//! 32-bit float WAV output

use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("Channel {0} has {1} samples, expected {2}")]
    UnevenChannels(usize, usize, usize),
    #[error("Nothing to write")]
    NoChannels,
}

/// Write per-channel buffers as an interleaved float WAV file
pub fn write_wav(path: &Path, channels: &[Vec<f32>], sample_rate: u32) -> Result<(), WriteError> {
    let frames = channels.first().ok_or(WriteError::NoChannels)?.len();
    for (c, ch) in channels.iter().enumerate() {
        if ch.len() != frames {
            return Err(WriteError::UnevenChannels(c, ch.len(), frames));
        }
    }

    let spec = WavSpec {
        channels: channels.len() as u16,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };

    let mut writer = WavWriter::create(path, spec)?;
    for i in 0..frames {
        for ch in channels {
            writer.write_sample(ch[i])?;
        }
    }
    writer.finalize()?;

    tracing::info!(
        "Wrote {} frames x {} channels to {}",
        frames,
        channels.len(),
        path.display()
    );
    Ok(())
}
