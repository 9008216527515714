//! Onset curve counting bins with a sharp magnitude rise

/// Ratio a bin must rise by against the previous frame (3 dB in power)
const RISE_THRESHOLD: f64 = 1.4125375446227544; // 10^0.15
/// Magnitudes at or below this are treated as empty bins
const ZERO_THRESHOLD: f64 = 1e-8;

/// Fraction of non-empty bins whose magnitude rose by at least
/// [`RISE_THRESHOLD`] since the previous frame
#[derive(Debug, Clone)]
pub struct PercussiveCurve {
    window_size: usize,
    prev_mag: Vec<f64>,
}

impl PercussiveCurve {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            prev_mag: vec![0.0; window_size / 2 + 1],
        }
    }

    pub fn set_window_size(&mut self, window_size: usize) {
        self.window_size = window_size;
        self.prev_mag = vec![0.0; window_size / 2 + 1];
    }

    pub fn reset(&mut self) {
        self.prev_mag.fill(0.0);
    }

    pub fn process(&mut self, mag: &[f32]) -> f32 {
        let top = (self.window_size / 2).min(mag.len().saturating_sub(1));
        let mut count = 0usize;
        let mut non_zero = 0usize;

        for n in 1..=top {
            let m = mag[n] as f64;
            let prev = self.prev_mag[n];
            let above = if prev > 0.0 {
                m / prev >= RISE_THRESHOLD
            } else {
                m > ZERO_THRESHOLD
            };
            if above {
                count += 1;
            }
            if m > ZERO_THRESHOLD {
                non_zero += 1;
            }
            self.prev_mag[n] = m;
        }

        if non_zero == 0 {
            0.0
        } else {
            count as f32 / non_zero as f32
        }
    }
}
