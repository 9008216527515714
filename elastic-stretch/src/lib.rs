//! Elastic stretch engine
//!
//! Phase-vocoder time stretching and pitch shifting:
//! - Offline stretch calculation that spends stretch where the audio is steady
//! - Realtime per-chunk increments with transient detection
//! - Phase reset on transients and silence, laminar phase propagation
//! - Pitch shifting by resampling before or after the stretch
//! - Optional per-channel worker threads

mod calculator;
mod channel;
mod error;
mod math;
mod options;
mod resampler;
mod ring;
mod stretcher;

pub use calculator::{
    Peak, Region, StretchCalculator, TransientThresholds, DEFAULT_MAX_ADJUST_ITERATIONS,
};
pub use error::StretchError;
pub use options::{
    FormantMode, Options, PhaseMode, PitchMode, ProcessMode, StretchMode, ThreadingMode,
    TransientsMode, WindowMode,
};
pub use resampler::Resampler;
pub use stretcher::Stretcher;
