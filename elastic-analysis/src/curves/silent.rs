//! Frame silence detector

/// Bins at or below this magnitude are silent
const SILENCE_THRESHOLD: f32 = 1e-6;

#[derive(Debug, Clone)]
pub struct SilentCurve {
    window_size: usize,
}

impl SilentCurve {
    pub fn new(window_size: usize) -> Self {
        Self { window_size }
    }

    pub fn set_window_size(&mut self, window_size: usize) {
        self.window_size = window_size;
    }

    /// 1.0 if every bin of the half spectrum is silent, else 0.0
    pub fn process(&mut self, mag: &[f32]) -> f32 {
        let bins = (self.window_size / 2 + 1).min(mag.len());
        if mag[..bins].iter().all(|&m| m <= SILENCE_THRESHOLD) {
            1.0
        } else {
            0.0
        }
    }
}
