//! Per-channel stretching state
//!
//! Each channel is split in two halves so the threaded path needs no
//! lock around its sample FIFOs:
//! - [`ChannelInput`]: the caller's side, writes input and reads output
//! - [`ChannelData`]: the processing side, reads input, runs the phase
//!   vocoder and writes output
//!
//! Flags both sides need to see live in [`ChannelShared`].

mod chunk;

pub use chunk::Increments;

use crate::options::Options;
use crate::resampler::Resampler;
use crate::ring::{push_zeros, sample_ring, SampleCons, SampleProd};
use crate::StretchError;
use elastic_analysis::{Fft, Window};
use ringbuf::traits::{Consumer, Observer, Producer};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Sentinel for an input size that is not yet known
const UNKNOWN_SIZE: usize = usize::MAX;

/// Flags shared between the caller and the processing side
#[derive(Debug)]
pub struct ChannelShared {
    input_size: AtomicUsize,
    draining: AtomicBool,
    output_complete: AtomicBool,
}

impl Default for ChannelShared {
    fn default() -> Self {
        Self {
            input_size: AtomicUsize::new(UNKNOWN_SIZE),
            draining: AtomicBool::new(false),
            output_complete: AtomicBool::new(false),
        }
    }
}

impl ChannelShared {
    /// Total input samples, once the final block has been consumed
    pub fn input_size(&self) -> Option<usize> {
        match self.input_size.load(Ordering::Acquire) {
            UNKNOWN_SIZE => None,
            n => Some(n),
        }
    }

    pub fn set_input_size(&self, size: usize) {
        self.input_size.store(size, Ordering::Release);
    }

    #[inline]
    pub fn draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::Release);
    }

    #[inline]
    pub fn output_complete(&self) -> bool {
        self.output_complete.load(Ordering::Acquire)
    }

    pub fn set_output_complete(&self, complete: bool) {
        self.output_complete.store(complete, Ordering::Release);
    }

    fn reset(&self) {
        self.input_size.store(UNKNOWN_SIZE, Ordering::Release);
        self.draining.store(false, Ordering::Release);
        self.output_complete.store(false, Ordering::Release);
    }
}

/// Everything chunk processing needs to know about the current configuration
#[derive(Debug, Clone)]
pub struct ChunkParams {
    pub sample_rate: usize,
    pub window_size: usize,
    pub increment: usize,
    pub time_ratio: f64,
    pub pitch_scale: f64,
    pub realtime: bool,
    pub threaded: bool,
    /// Input is resampled before stretching instead of after
    pub resample_before: bool,
    pub options: Options,
    /// Laminar phase frequency cutoffs in Hz
    pub cutoffs: [f32; 3],
    pub window: Arc<Window>,
    /// Offline output increments; empty in realtime
    pub increments: Arc<Vec<i32>>,
}

impl ChunkParams {
    #[inline]
    pub fn effective_ratio(&self) -> f64 {
        self.time_ratio * self.pitch_scale
    }
}

/// Caller-side half of a channel
pub struct ChannelInput {
    pub(crate) inbuf: SampleProd,
    pub(crate) outbuf: SampleCons,
    pub(crate) shared: Arc<ChannelShared>,
    /// Pitch resampler applied to input when resampling before stretching
    pub(crate) resampler: Option<Resampler>,
    resample_buf: Vec<f32>,
    /// Source samples consumed so far
    pub(crate) in_count: usize,
}

/// Processing-side half of a channel
pub struct ChannelData {
    pub(crate) inbuf: SampleCons,
    pub(crate) outbuf: SampleProd,
    pub(crate) shared: Arc<ChannelShared>,
    /// Output that did not fit in `outbuf`, written ahead of anything newer.
    /// Holds at most one ring's worth.
    overflow: Vec<f32>,

    pub(crate) mag: Vec<f64>,
    pub(crate) phase: Vec<f64>,
    pub(crate) prev_phase: Vec<f64>,
    pub(crate) prev_error: Vec<f64>,
    pub(crate) unwrapped_phase: Vec<f64>,
    envelope: Vec<f64>,
    spare: Vec<f64>,

    pub(crate) accumulator: Vec<f32>,
    pub(crate) window_accumulator: Vec<f32>,
    pub(crate) fltbuf: Vec<f32>,
    dblbuf: Vec<f64>,

    /// One transform per window size in use
    ffts: BTreeMap<usize, Fft>,
    /// Pitch resampler applied to output when resampling after stretching
    pub(crate) resampler: Option<Resampler>,
    resample_buf: Vec<f32>,

    pub(crate) prev_increment: usize,
    pub(crate) chunk_count: usize,
    pub(crate) out_count: usize,
    pub(crate) accumulator_fill: usize,
}

/// Build both halves of a channel.
///
/// Buffers are sized for the largest of `window_sizes`, so the window
/// size can later change among them without reallocating.
pub fn new_channel(
    window_sizes: &[usize],
    initial_window_size: usize,
    outbuf_size: usize,
) -> Result<(ChannelInput, ChannelData), StretchError> {
    let max_size = window_sizes
        .iter()
        .copied()
        .chain(std::iter::once(initial_window_size))
        .max()
        .unwrap_or(initial_window_size);
    let real_size = max_size / 2 + 1;
    let outbuf_size = outbuf_size.max(max_size);

    let mut ffts = BTreeMap::new();
    for &size in window_sizes.iter().chain(std::iter::once(&initial_window_size)) {
        if !ffts.contains_key(&size) {
            ffts.insert(size, Fft::new(size)?);
        }
    }

    let (in_prod, in_cons) = sample_ring(max_size);
    let (out_prod, out_cons) = sample_ring(outbuf_size);
    let shared = Arc::new(ChannelShared::default());

    let input = ChannelInput {
        inbuf: in_prod,
        outbuf: out_cons,
        shared: Arc::clone(&shared),
        resampler: None,
        resample_buf: Vec::new(),
        in_count: 0,
    };

    let data = ChannelData {
        inbuf: in_cons,
        outbuf: out_prod,
        shared,
        overflow: Vec::with_capacity(outbuf_size),
        mag: vec![0.0; real_size],
        phase: vec![0.0; real_size],
        prev_phase: vec![0.0; real_size],
        prev_error: vec![0.0; real_size],
        unwrapped_phase: vec![0.0; real_size],
        envelope: vec![0.0; real_size],
        spare: vec![0.0; real_size],
        accumulator: vec![0.0; max_size],
        window_accumulator: vec![0.0; max_size],
        fltbuf: vec![0.0; max_size],
        dblbuf: vec![0.0; max_size],
        ffts,
        resampler: None,
        resample_buf: Vec::new(),
        prev_increment: 0,
        chunk_count: 0,
        out_count: 0,
        accumulator_fill: 0,
    };

    Ok((input, data))
}

impl ChannelInput {
    /// Samples that can be written without overrunning the input ring
    #[inline]
    pub fn writable(&self) -> usize {
        self.inbuf.vacant_len()
    }

    /// Samples waiting to be retrieved
    #[inline]
    pub fn readable(&self) -> usize {
        self.outbuf.occupied_len()
    }

    /// Take as much of `input` as fits, resampling first if this channel
    /// resamples before stretching. Returns the number of source samples taken.
    pub fn consume(
        &mut self,
        input: &[f32],
        pitch_scale: f64,
        resample_before: bool,
        is_final: bool,
    ) -> usize {
        if resample_before {
            if let Some(resampler) = self.resampler.as_mut() {
                // Resampled input held back last time goes in first
                if !self.resample_buf.is_empty() {
                    let n = self.inbuf.push_slice(&self.resample_buf);
                    self.resample_buf.drain(..n);
                    if !self.resample_buf.is_empty() {
                        return 0;
                    }
                }

                let writable = self.inbuf.vacant_len();
                let ratio = 1.0 / pitch_scale;
                let mut samples = input.len();
                if resampler.max_output(samples, ratio) > writable {
                    samples = resampler.max_input(writable, ratio).max(1).min(samples);
                }

                let last = is_final && samples == input.len();
                if let Err(e) = resampler.resample(
                    &input[..samples],
                    ratio,
                    last,
                    &mut self.resample_buf,
                ) {
                    tracing::error!("Input resampling failed: {}", e);
                    self.resample_buf.clear();
                }
                let n = self.inbuf.push_slice(&self.resample_buf);
                self.resample_buf.drain(..n);
                self.in_count += samples;
                return samples;
            }
        }

        let samples = input.len().min(self.inbuf.vacant_len());
        self.inbuf.push_slice(&input[..samples]);
        self.in_count += samples;
        samples
    }

    /// Resampled input still waiting for room in the input ring
    #[inline]
    pub fn pending_input(&self) -> usize {
        self.resample_buf.len()
    }

    /// Read up to `out.len()` processed samples
    pub fn retrieve(&mut self, out: &mut [f32]) -> usize {
        self.outbuf.pop_slice(out)
    }

    /// Pad the input ring with `count` zeros
    pub(crate) fn prefill(&mut self, count: usize) {
        let pushed = push_zeros(&mut self.inbuf, count);
        if pushed < count {
            tracing::warn!("Input buffer too small for {} samples of padding", count);
        }
    }

    pub fn reset(&mut self) {
        if let Some(r) = self.resampler.as_mut() {
            r.reset();
        }
        self.resample_buf.clear();
        self.in_count = 0;
        self.outbuf.clear();
    }
}

impl ChannelData {
    #[inline]
    pub fn shared(&self) -> &ChannelShared {
        &self.shared
    }

    /// Largest window size this channel has buffers for
    #[inline]
    pub fn capacity(&self) -> usize {
        self.accumulator.len()
    }

    /// Switch to a window size, allocating its transform if needed
    pub fn set_window_size(&mut self, window_size: usize) -> Result<(), StretchError> {
        if !self.ffts.contains_key(&window_size) {
            tracing::warn!("Allocating transform for unexpected window size {}", window_size);
            self.ffts.insert(window_size, Fft::new(window_size)?);
        }
        if window_size > self.capacity() {
            let real_size = window_size / 2 + 1;
            for buf in [
                &mut self.mag,
                &mut self.phase,
                &mut self.prev_phase,
                &mut self.prev_error,
                &mut self.unwrapped_phase,
                &mut self.envelope,
                &mut self.spare,
            ] {
                buf.resize(real_size, 0.0);
            }
            self.accumulator.resize(window_size, 0.0);
            self.window_accumulator.resize(window_size, 0.0);
            self.fltbuf.resize(window_size, 0.0);
            self.dblbuf.resize(window_size, 0.0);
        }
        self.clear_spectra();
        Ok(())
    }

    fn clear_spectra(&mut self) {
        for buf in [
            &mut self.mag,
            &mut self.phase,
            &mut self.prev_phase,
            &mut self.prev_error,
            &mut self.unwrapped_phase,
        ] {
            buf.fill(0.0);
        }
        self.accumulator.fill(0.0);
        self.window_accumulator.fill(0.0);
        self.accumulator_fill = 0;
    }

    /// Return to the just-constructed state, keeping allocations
    pub fn reset(&mut self) {
        self.clear_spectra();
        self.inbuf.clear();
        self.overflow.clear();
        if let Some(r) = self.resampler.as_mut() {
            r.reset();
        }
        self.prev_increment = 0;
        self.chunk_count = 0;
        self.out_count = 0;
        self.shared.reset();
    }

    /// Move held-back output into the ring as space allows
    pub fn flush_overflow(&mut self) {
        if self.overflow.is_empty() {
            return;
        }
        let n = self.outbuf.push_slice(&self.overflow);
        self.overflow.drain(..n);
    }

    /// Output held back because the ring was full
    #[inline]
    pub fn pending_overflow(&self) -> usize {
        self.overflow.len()
    }

    /// Largest backlog held outside the ring
    #[inline]
    pub fn overflow_limit(&self) -> usize {
        self.outbuf.capacity().get()
    }

    /// Write output to the ring, holding back what does not fit up to
    /// [`ChannelData::overflow_limit`] and dropping the rest
    pub(crate) fn push_output(&mut self, data: &[f32]) {
        self.flush_overflow();
        let n = if self.overflow.is_empty() {
            self.outbuf.push_slice(data)
        } else {
            0
        };
        if n == data.len() {
            return;
        }

        let rest = &data[n..];
        let room = self.overflow_limit().saturating_sub(self.overflow.len());
        let kept = rest.len().min(room);
        self.overflow.extend_from_slice(&rest[..kept]);
        if kept < rest.len() {
            tracing::warn!(
                "Output buffer overrun, dropping {} of {} samples",
                rest.len() - kept,
                data.len()
            );
        } else if n > 0 {
            tracing::debug!("Output buffer full, holding back {} samples", kept);
        }
    }
}

/// Replace the output ring of a channel with one of `size` samples,
/// carrying over anything not yet retrieved
pub fn resize_outbuf(input: &mut ChannelInput, data: &mut ChannelData, size: usize) {
    let (mut prod, cons) = sample_ring(size.max(data.capacity()));
    crate::ring::migrate(&mut input.outbuf, &mut prod);
    data.outbuf = prod;
    input.outbuf = cons;
    data.flush_overflow();
}
