//! Spectral difference curve

#[derive(Debug, Clone)]
pub struct SpectralDifferenceCurve {
    window_size: usize,
    prev_mag: Vec<f64>,
}

impl SpectralDifferenceCurve {
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

    /// Sum over bins of `sqrt(|mag² - prev²|)`
    pub fn process(&mut self, mag: &[f32]) -> f32 {
        let bins = (self.window_size / 2 + 1).min(mag.len());
        let mut result = 0.0f64;
        for n in 0..bins {
            let m = mag[n] as f64;
            let prev = self.prev_mag[n];
            result += (m * m - prev * prev).abs().sqrt();
            self.prev_mag[n] = m;
        }
        result as f32
    }
}
