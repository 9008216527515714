//! Spectral analysis building blocks for Elastic
//!
//! Provides the analysis window tables, a real-signal FFT front end
//! over rustfft, and the family of per-frame detection curves the
//! stretcher uses to find transients, silence and spectral change.

mod curves;
mod fft;
mod window;

pub use curves::{
    AudioCurve, CurveKind, PercussiveCurve, SilentCurve, SpectralDifferenceCurve,
};
pub use fft::{Fft, FftError};
pub use window::{Window, WindowType};
