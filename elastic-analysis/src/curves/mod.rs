//! Per-frame detection curves
//!
//! Each curve reduces one frame of magnitudes to a single value. The
//! stretcher picks its curves once at configuration time:
//! - **Percussive**: fraction of bins with a sharp rise, drives phase resets
//! - **Silent**: 1.0 for frames with no content above the floor
//! - **SpectralDifference**: overall spectral change, shapes stretch allocation
//! - **Constant**: flat curve for uniform stretching

mod percussive;
mod silent;
mod spectral;

pub use percussive::PercussiveCurve;
pub use silent::SilentCurve;
pub use spectral::SpectralDifferenceCurve;

/// Curve variants, used to request a curve without building it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveKind {
    Percussive,
    Silent,
    SpectralDifference,
    Constant,
}

/// A detection curve over successive magnitude frames
#[derive(Debug, Clone)]
pub enum AudioCurve {
    Percussive(PercussiveCurve),
    Silent(SilentCurve),
    SpectralDifference(SpectralDifferenceCurve),
    Constant,
}

impl AudioCurve {
    pub fn new(kind: CurveKind, window_size: usize) -> Self {
        tracing::trace!("Creating {:?} curve for window size {}", kind, window_size);
        match kind {
            CurveKind::Percussive => AudioCurve::Percussive(PercussiveCurve::new(window_size)),
            CurveKind::Silent => AudioCurve::Silent(SilentCurve::new(window_size)),
            CurveKind::SpectralDifference => {
                AudioCurve::SpectralDifference(SpectralDifferenceCurve::new(window_size))
            }
            CurveKind::Constant => AudioCurve::Constant,
        }
    }

    pub fn kind(&self) -> CurveKind {
        match self {
            AudioCurve::Percussive(_) => CurveKind::Percussive,
            AudioCurve::Silent(_) => CurveKind::Silent,
            AudioCurve::SpectralDifference(_) => CurveKind::SpectralDifference,
            AudioCurve::Constant => CurveKind::Constant,
        }
    }

    /// Value for one frame of `window_size / 2 + 1` magnitudes.
    ///
    /// `increment` is the analysis hop that separates this frame from
    /// the previous one. None of the current curves depend on it.
    pub fn process(&mut self, mag: &[f32], _increment: usize) -> f32 {
        match self {
            AudioCurve::Percussive(c) => c.process(mag),
            AudioCurve::Silent(c) => c.process(mag),
            AudioCurve::SpectralDifference(c) => c.process(mag),
            AudioCurve::Constant => 1.0,
        }
    }

    /// Forget the previous frame
    pub fn reset(&mut self) {
        match self {
            AudioCurve::Percussive(c) => c.reset(),
            AudioCurve::SpectralDifference(c) => c.reset(),
            AudioCurve::Silent(_) | AudioCurve::Constant => {}
        }
    }

    pub fn set_window_size(&mut self, window_size: usize) {
        match self {
            AudioCurve::Percussive(c) => c.set_window_size(window_size),
            AudioCurve::Silent(c) => c.set_window_size(window_size),
            AudioCurve::SpectralDifference(c) => c.set_window_size(window_size),
            AudioCurve::Constant => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_curve() {
        let mut curve = AudioCurve::new(CurveKind::Constant, 1024);
        assert_eq!(curve.process(&[0.0; 513], 256), 1.0);
        assert_eq!(curve.process(&[5.0; 513], 256), 1.0);
    }

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            CurveKind::Percussive,
            CurveKind::Silent,
            CurveKind::SpectralDifference,
            CurveKind::Constant,
        ] {
            assert_eq!(AudioCurve::new(kind, 256).kind(), kind);
        }
    }

    #[test]
    fn test_window_size_change_resizes_history() {
        let mut curve = AudioCurve::new(CurveKind::Percussive, 16);
        curve.process(&[1.0; 9], 4);
        curve.set_window_size(32);
        // History was cleared, so every bin reads as a fresh onset
        assert_eq!(curve.process(&[1.0; 17], 8), 1.0);
    }
}
