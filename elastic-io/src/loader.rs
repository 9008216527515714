//! Audio file decoding

use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No audio track found in file")]
    NoAudioTrack,
    #[error("Unknown sample rate")]
    UnknownSampleRate,
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Decoded audio, one buffer per channel
#[derive(Debug, Clone, Default)]
pub struct AudioData {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl AudioData {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Length in sample frames
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, |c| c.len())
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Split interleaved samples into per-channel buffers
    pub fn from_interleaved(samples: &[f32], channels: usize, sample_rate: u32) -> Self {
        let channels = channels.max(1);
        let frames = samples.len() / channels;
        let mut out = vec![Vec::with_capacity(frames); channels];
        for frame in samples.chunks_exact(channels) {
            for (buf, &s) in out.iter_mut().zip(frame) {
                buf.push(s);
            }
        }
        Self {
            channels: out,
            sample_rate,
        }
    }
}

/// Load and decode any format symphonia can probe
pub fn load(path: &Path) -> Result<AudioData, LoadError> {
    let file = std::fs::File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| LoadError::Decode(e.to_string()))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(LoadError::NoAudioTrack)?;

    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params
        .sample_rate
        .ok_or(LoadError::UnknownSampleRate)?;
    let mut channels = codec_params.channels.map(|c| c.count()).unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| LoadError::Decode(e.to_string()))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut skipped = 0usize;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(LoadError::Decode(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(_)) => {
                skipped += 1;
                continue;
            }
            Err(e) => return Err(LoadError::Decode(e.to_string())),
        };

        let spec = *decoded.spec();
        if channels == 0 {
            channels = spec.channels.count();
        }
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sample_buf.samples());
    }

    if skipped > 0 {
        tracing::warn!("Skipped {} undecodable packets in {}", skipped, path.display());
    }

    let data = AudioData::from_interleaved(&samples, channels, sample_rate);
    tracing::info!(
        "Loaded {}: {} channels, {} Hz, {} frames",
        path.display(),
        data.channel_count(),
        sample_rate,
        data.frames()
    );
    Ok(data)
}
