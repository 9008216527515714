//! Stretcher errors

use elastic_analysis::FftError;
use thiserror::Error;

/// Errors that can occur while building or running a stretcher
#[derive(Error, Debug)]
pub enum StretchError {
    #[error("A stretcher needs at least one channel")]
    NoChannels,
    #[error("Invalid transform size: {0}")]
    InvalidSize(#[from] FftError),
    #[error("Implementation unavailable: {0}")]
    ImplementationUnavailable(String),
    #[error("Resampler error: {0}")]
    Resample(#[from] rubato::ResampleError),
    #[error("Failed to start worker thread: {0}")]
    Thread(#[from] std::io::Error),
}

impl From<rubato::ResamplerConstructionError> for StretchError {
    fn from(e: rubato::ResamplerConstructionError) -> Self {
        StretchError::ImplementationUnavailable(e.to_string())
    }
}
