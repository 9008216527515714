//! Precomputed analysis and synthesis windows

use std::f64::consts::PI;

/// Window shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    Rectangular,
    Hann,
    Hamming,
    Blackman,
}

impl Default for WindowType {
    fn default() -> Self {
        WindowType::Hann
    }
}

/// A window function stored as a per-sample multiplier table
#[derive(Debug, Clone)]
pub struct Window {
    kind: WindowType,
    table: Vec<f32>,
    /// Mean of the table
    area: f32,
}

impl Window {
    pub fn new(kind: WindowType, size: usize) -> Self {
        let n = size as f64;
        let table: Vec<f32> = (0..size)
            .map(|i| {
                let x = 2.0 * PI * i as f64 / n;
                let v = match kind {
                    WindowType::Rectangular => 1.0,
                    WindowType::Hann => 0.5 - 0.5 * x.cos(),
                    WindowType::Hamming => 0.54 - 0.46 * x.cos(),
                    WindowType::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
                };
                v as f32
            })
            .collect();

        let area = if size > 0 {
            (table.iter().map(|&v| v as f64).sum::<f64>() / n) as f32
        } else {
            0.0
        };

        Self { kind, table, area }
    }

    #[inline]
    pub fn kind(&self) -> WindowType {
        self.kind
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.table.len()
    }

    /// Multiplier at sample `i`
    #[inline]
    pub fn value(&self, i: usize) -> f32 {
        self.table[i]
    }

    /// Mean multiplier, used to normalize overlap-add gain
    #[inline]
    pub fn area(&self) -> f32 {
        self.area
    }

    /// Apply the window to a frame in place
    pub fn cut(&self, frame: &mut [f32]) {
        for (s, &w) in frame.iter_mut().zip(self.table.iter()) {
            *s *= w;
        }
    }

    /// Apply the window to a double-precision frame in place
    pub fn cut_f64(&self, frame: &mut [f64]) {
        for (s, &w) in frame.iter_mut().zip(self.table.iter()) {
            *s *= w as f64;
        }
    }

    /// Accumulate `scale` times the window into `dst`
    pub fn add(&self, dst: &mut [f32], scale: f32) {
        for (d, &w) in dst.iter_mut().zip(self.table.iter()) {
            *d += w * scale;
        }
    }
}
