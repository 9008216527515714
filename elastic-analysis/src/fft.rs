//! Real-signal FFT front end over rustfft
//!
//! The stretcher only ever works with real input frames, so this wraps a
//! complex rustfft plan and exposes the non-redundant half spectrum
//! (`size / 2 + 1` bins) as separate real/imaginary or magnitude/phase
//! slices. The inverse transforms are unscaled: a forward then inverse
//! pass multiplies the signal by `size`.

use rustfft::{num_complex::Complex, FftPlanner};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur when planning a transform
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FftError {
    #[error("FFT size {0} is not a power of two of at least 2")]
    InvalidSize(usize),
}

/// Forward and inverse real transforms of one fixed size
pub struct Fft {
    size: usize,
    forward: Arc<dyn rustfft::Fft<f64>>,
    inverse: Arc<dyn rustfft::Fft<f64>>,
    /// Pre-allocated transform buffer, reused by every call
    buffer: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl std::fmt::Debug for Fft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fft").field("size", &self.size).finish()
    }
}

impl Fft {
    /// Plan a transform of `size` points
    pub fn new(size: usize) -> Result<Self, FftError> {
        if size < 2 || !size.is_power_of_two() {
            return Err(FftError::InvalidSize(size));
        }

        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        Ok(Self {
            size,
            forward,
            inverse,
            buffer: vec![Complex::new(0.0, 0.0); size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
        })
    }

    /// Transform length in samples
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of bins in the half spectrum
    #[inline]
    pub fn bins(&self) -> usize {
        self.size / 2 + 1
    }

    fn run_forward<T: Copy + Into<f64>>(&mut self, input: &[T]) {
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let x = input.get(i).map(|&v| v.into()).unwrap_or(0.0);
            *slot = Complex::new(x, 0.0);
        }
        self.forward
            .process_with_scratch(&mut self.buffer, &mut self.scratch);
    }

    fn run_inverse(&mut self, out: &mut [f64]) {
        self.inverse
            .process_with_scratch(&mut self.buffer, &mut self.scratch);
        for (o, c) in out.iter_mut().zip(self.buffer.iter()) {
            *o = c.re;
        }
    }

    /// Rebuild the full Hermitian spectrum from a half spectrum
    fn load_half_spectrum(&mut self, re: &[f64], im: &[f64]) {
        let half = self.size / 2;
        for k in 0..=half {
            self.buffer[k] = Complex::new(re[k], im[k]);
        }
        for k in 1..half {
            self.buffer[self.size - k] = Complex::new(re[k], -im[k]);
        }
    }

    /// Forward transform to real and imaginary parts
    pub fn forward(&mut self, input: &[f64], re: &mut [f64], im: &mut [f64]) {
        self.run_forward(input);
        for k in 0..self.bins() {
            re[k] = self.buffer[k].re;
            im[k] = self.buffer[k].im;
        }
    }

    /// Forward transform to magnitude and phase
    pub fn forward_polar(&mut self, input: &[f64], mag: &mut [f64], phase: &mut [f64]) {
        self.run_forward(input);
        for k in 0..self.bins() {
            let c = self.buffer[k];
            mag[k] = c.norm();
            phase[k] = c.im.atan2(c.re);
        }
    }

    /// Forward transform keeping only magnitudes
    pub fn forward_magnitude(&mut self, input: &[f32], mag: &mut [f32]) {
        self.run_forward(input);
        for k in 0..self.bins() {
            mag[k] = self.buffer[k].norm() as f32;
        }
    }

    /// Unscaled inverse transform from real and imaginary parts
    pub fn inverse(&mut self, re: &[f64], im: &[f64], out: &mut [f64]) {
        self.load_half_spectrum(re, im);
        self.run_inverse(out);
    }

    /// Unscaled inverse transform from magnitude and phase
    pub fn inverse_polar(&mut self, mag: &[f64], phase: &[f64], out: &mut [f64]) {
        let half = self.size / 2;
        for k in 0..=half {
            self.buffer[k] = Complex::from_polar(mag[k], phase[k]);
        }
        for k in 1..half {
            self.buffer[self.size - k] = self.buffer[k].conj();
        }
        self.run_inverse(out);
    }

    /// Unscaled real cepstrum of a magnitude spectrum
    pub fn inverse_cepstral(&mut self, mag: &[f64], cepstrum: &mut [f64]) {
        let half = self.size / 2;
        for k in 0..=half {
            self.buffer[k] = Complex::new((mag[k] + 0.000001).ln(), 0.0);
        }
        for k in 1..half {
            self.buffer[self.size - k] = self.buffer[k];
        }
        self.run_inverse(cepstrum);
    }
}
