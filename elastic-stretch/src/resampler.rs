//! Streaming single-channel resampler used for pitch shifting
//!
//! Wraps rubato's fixed-input polynomial resampler. Input is queued
//! until a full chunk is available, the engine's own output delay is
//! discarded so output stays time-aligned with input, and the final
//! call flushes the engine tail up to the exact expected length.

use crate::StretchError;
use rubato::{FastFixedIn, PolynomialDegree, Resampler as _};

/// Frames fed to the engine per call
const CHUNK_SIZE: usize = 256;
/// Headroom for ratio changes without rebuilding the engine
const MAX_RELATIVE_RATIO: f64 = 10.0;

pub struct Resampler {
    engine: FastFixedIn<f32>,
    ratio: f64,
    /// Input waiting for a full chunk
    pending: Vec<f32>,
    /// Engine delay still to be dropped from the output
    skip: usize,
    /// Output length the input seen so far should produce
    expected: f64,
    produced: usize,
}

impl std::fmt::Debug for Resampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resampler")
            .field("ratio", &self.ratio)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Resampler {
    /// Create a resampler starting at output/input `ratio`
    pub fn new(ratio: f64) -> Result<Self, StretchError> {
        let engine = Self::build(ratio)?;
        let skip = engine.output_delay();
        Ok(Self {
            engine,
            ratio,
            pending: Vec::with_capacity(CHUNK_SIZE * 2),
            skip,
            expected: 0.0,
            produced: 0,
        })
    }

    fn build(ratio: f64) -> Result<FastFixedIn<f32>, StretchError> {
        Ok(FastFixedIn::<f32>::new(
            ratio,
            MAX_RELATIVE_RATIO,
            PolynomialDegree::Linear,
            CHUNK_SIZE,
            1,
        )?)
    }

    #[inline]
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Upper bound on what a call with `input` samples at `ratio` can append
    pub fn max_output(&self, input: usize, ratio: f64) -> usize {
        ((self.pending.len() + input) as f64 * ratio).ceil() as usize
            + self.engine.output_delay()
            + 2
    }

    /// Largest input whose output is guaranteed to fit in `space` samples
    pub fn max_input(&self, space: usize, ratio: f64) -> usize {
        let room = space.saturating_sub(self.engine.output_delay() + 2) as f64;
        ((room / ratio).floor() as usize).saturating_sub(self.pending.len())
    }

    fn set_ratio(&mut self, ratio: f64) -> Result<(), StretchError> {
        if ratio == self.ratio {
            return Ok(());
        }
        if let Err(e) = self.engine.set_resample_ratio(ratio, false) {
            tracing::warn!(
                "Resampler ratio {} out of range ({}), rebuilding",
                ratio,
                e
            );
            self.engine = Self::build(ratio)?;
            self.skip = self.engine.output_delay();
        }
        self.ratio = ratio;
        Ok(())
    }

    fn emit(&mut self, samples: &[f32], cap: Option<usize>, out: &mut Vec<f32>) -> usize {
        let dropped = self.skip.min(samples.len());
        self.skip -= dropped;
        let mut samples = &samples[dropped..];
        if let Some(cap) = cap {
            let room = cap.saturating_sub(self.produced);
            samples = &samples[..samples.len().min(room)];
        }
        out.extend_from_slice(samples);
        self.produced += samples.len();
        samples.len()
    }

    /// Resample `input` at `ratio`, appending to `out`.
    ///
    /// Returns the number of samples appended. With `last` set, all
    /// queued input is flushed and the stream is left reset.
    pub fn resample(
        &mut self,
        input: &[f32],
        ratio: f64,
        last: bool,
        out: &mut Vec<f32>,
    ) -> Result<usize, StretchError> {
        self.set_ratio(ratio)?;
        self.pending.extend_from_slice(input);
        self.expected += input.len() as f64 * ratio;

        let mut written = 0;
        while self.pending.len() >= self.engine.input_frames_next() {
            let n = self.engine.input_frames_next();
            let wave: [&[f32]; 1] = [&self.pending[..n]];
            let chunk = self.engine.process(&wave[..], None)?;
            self.pending.drain(..n);
            written += self.emit(&chunk[0], None, out);
        }

        if last {
            let target = self.expected.round() as usize;
            if !self.pending.is_empty() {
                let wave: [&[f32]; 1] = [&self.pending[..]];
                let chunk = self.engine.process_partial(Some(&wave[..]), None)?;
                self.pending.clear();
                written += self.emit(&chunk[0], Some(target), out);
            }
            // Each empty call pushes one chunk of silence through the engine
            let max_flushes = self.skip / CHUNK_SIZE.max(1) + 4;
            let mut flushes = 0;
            while self.produced < target && flushes < max_flushes {
                let chunk = self.engine.process_partial(None::<&[Vec<f32>]>, None)?;
                written += self.emit(&chunk[0], Some(target), out);
                flushes += 1;
            }
            self.reset();
        }

        Ok(written)
    }

    /// Clear all queued input and engine state
    pub fn reset(&mut self) {
        self.engine.reset();
        self.pending.clear();
        self.skip = self.engine.output_delay();
        self.expected = 0.0;
        self.produced = 0;
    }
}
