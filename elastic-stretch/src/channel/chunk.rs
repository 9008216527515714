//! Phase vocoder processing of one channel, one analysis chunk at a time
//!
//! A chunk goes through:
//! 1. analyse: window, centre on the frame middle, forward polar FFT
//! 2. modify: advance phases by the output increment
//! 3. synthesise: inverse FFT, window, overlap-add into the accumulator
//! 4. write: normalise and shift the finished samples out to the output ring

use super::{ChannelData, ChunkParams};
use crate::math::{lrint, princarg};
use crate::options::{FormantMode, PhaseMode, TransientsMode};
use crate::ring::PeekExt;
use ringbuf::traits::{Consumer, Observer};
use std::f64::consts::PI;

/// Phase advance decision for one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Increments {
    /// Output advance used for the phase update
    pub phase: usize,
    /// Output advance used to shift the accumulator
    pub shift: usize,
    pub phase_reset: bool,
}

/// Outcome of running as many chunks as the input allows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkProgress {
    /// At least one chunk was processed
    pub any: bool,
    /// The final chunk of the stream was written
    pub last: bool,
}

impl ChannelData {
    /// Process every chunk the buffered input allows
    pub fn process_chunks(&mut self, p: &ChunkParams) -> ChunkProgress {
        let mut progress = ChunkProgress::default();

        while !progress.last {
            if !self.test_inbuf_read_space(p) {
                break;
            }
            progress.any = true;

            if !self.shared.draining() {
                self.read_frame(p);
                self.analyse(p);
            }

            let incs = self.get_increments(p).0;
            progress.last = self.process_chunk_for_channel(p, incs);
            self.chunk_count += 1;
        }

        progress
    }

    /// Copy the next frame into the time-domain buffer and advance the input
    pub(crate) fn read_frame(&mut self, p: &ChunkParams) {
        let ws = p.window_size;
        self.inbuf.peek_into(&mut self.fltbuf[..ws]);
        let skip = p.increment.min(self.inbuf.occupied_len());
        self.inbuf.skip(skip);
    }

    /// Whether a chunk can be processed now, switching to draining when
    /// only the tail of a finished input is left
    pub fn test_inbuf_read_space(&mut self, p: &ChunkParams) -> bool {
        if self.shared.output_complete() {
            return false;
        }
        let rs = self.inbuf.occupied_len();
        let ws = p.window_size;

        if rs < ws && !self.shared.draining() {
            if self.shared.input_size().is_none() {
                tracing::trace!("Read space {} below window size {}, waiting", rs, ws);
                return false;
            }
            if rs < ws / 2 {
                tracing::debug!("Draining with read space {}", rs);
                self.shared.set_draining(true);
            }
        }

        true
    }

    /// Look up the offline increments for the current chunk.
    /// The flag is false when no precomputed increment was available.
    pub fn get_increments(&mut self, p: &ChunkParams) -> (Increments, bool) {
        let incs = &p.increments;
        if incs.is_empty() {
            return (
                Increments {
                    phase: p.increment,
                    shift: p.increment,
                    phase_reset: false,
                },
                false,
            );
        }

        let mut got_data = true;
        if self.chunk_count >= incs.len() {
            self.chunk_count = incs.len() - 1;
            got_data = false;
        }

        let phase_inc = incs[self.chunk_count];
        let shift_inc = incs.get(self.chunk_count + 1).copied().unwrap_or(phase_inc);

        let phase_reset = phase_inc < 0 || self.chunk_count == 0;
        let phase = phase_inc.unsigned_abs() as usize;
        let mut shift = shift_inc.unsigned_abs() as usize;

        if shift >= p.window_size {
            if shift > p.window_size {
                tracing::warn!(
                    "Shift increment {} exceeds window size {}, clamping",
                    shift,
                    p.window_size
                );
            }
            shift = p.window_size;
        }
        (
            Increments {
                phase,
                shift,
                phase_reset,
            },
            got_data,
        )
    }

    /// Window, centre and transform the frame in `fltbuf`
    pub fn analyse(&mut self, p: &ChunkParams) {
        let ws = p.window_size;
        let hs = ws / 2;

        p.window.cut(&mut self.fltbuf[..ws]);

        // Centre the frame on sample zero so phases refer to its middle
        for i in 0..hs {
            self.dblbuf[i] = self.fltbuf[i + hs] as f64;
            self.dblbuf[i + hs] = self.fltbuf[i] as f64;
        }

        let Some(fft) = self.ffts.get_mut(&ws) else {
            tracing::error!("No transform for window size {}", ws);
            return;
        };
        fft.forward_polar(&self.dblbuf[..ws], &mut self.mag[..=hs], &mut self.phase[..=hs]);
    }

    /// Advance bin phases for an output step of `output_increment` samples
    pub fn modify(&mut self, p: &ChunkParams, output_increment: usize, phase_reset: bool) {
        let ws = p.window_size;
        let sr = p.sample_rate as f64;
        let inc = p.increment as f64;
        let ratio = p.effective_ratio();
        let count = ws / 2;

        let laminar = p.options.phase == PhaseMode::Laminar;
        let bandlimited = p.options.transients == TransientsMode::Mixed;
        let bin = |freq: f64| lrint(freq * ws as f64 / sr).max(0) as usize;
        let band_low = bin(150.0);
        let band_high = bin(1000.0);

        let mut freq0 = p.cutoffs[0] as f64;
        let mut freq1 = p.cutoffs[1] as f64;
        let mut freq2 = p.cutoffs[2] as f64;
        if laminar && ratio > 1.0 {
            let raised = 600.0 + 1200.0 * (ratio - 1.0).powi(3);
            let f1ratio = if freq0 > 0.0 { freq1 / freq0 } else { 1.0 };
            let f2ratio = if freq0 > 0.0 { freq2 / freq0 } else { 1.0 };
            freq0 = freq0.max(raised);
            freq1 = freq0 * f1ratio;
            freq2 = freq0 * f2ratio;
        }

        let limit0 = bin(freq0);
        let limit1 = bin(freq1).max(limit0);
        let limit2 = bin(freq2).max(limit1);

        const MAX_DISTANCE: f64 = 8.0;
        let mut distance = 0.0f64;
        let mut prev_instability = 0.0f64;
        let mut prev_direction = false;

        for i in (0..=count).rev() {
            let reset_bin = phase_reset && !(bandlimited && i > band_low && i < band_high);

            let p_in = self.phase[i];
            let mut perr = 0.0;
            let out_phase;

            let max_for_bin = if i <= limit0 {
                0.0
            } else if i <= limit1 {
                1.0
            } else if i <= limit2 {
                3.0
            } else {
                MAX_DISTANCE
            };

            if reset_bin {
                distance = 0.0;
                out_phase = p_in;
            } else {
                let omega = 2.0 * PI * inc * i as f64 / ws as f64;
                let expected = self.prev_phase[i] + omega;
                perr = princarg(p_in - expected);

                let instability = (perr - self.prev_error[i]).abs();
                let direction = perr > self.prev_error[i];

                let inherit = laminar
                    && distance < max_for_bin
                    && i != count
                    && !(bandlimited && (i == band_high || i == band_low))
                    && instability > prev_instability
                    && direction == prev_direction;

                let mut advance = output_increment as f64 * ((omega + perr) / inc);

                if inherit {
                    let inherited = self.unwrapped_phase[i + 1] - self.prev_phase[i + 1];
                    advance = (advance * distance + inherited * (MAX_DISTANCE - distance))
                        / MAX_DISTANCE;
                    out_phase = p_in + advance;
                    distance += 1.0;
                } else {
                    out_phase = self.unwrapped_phase[i] + advance;
                    distance = 0.0;
                }

                prev_instability = instability;
                prev_direction = direction;
            }

            self.prev_error[i] = perr;
            self.prev_phase[i] = p_in;
            self.phase[i] = out_phase;
            self.unwrapped_phase[i] = out_phase;
        }
    }

    /// Keep the spectral envelope in place while the pitch moves
    pub fn formant_shift(&mut self, p: &ChunkParams) {
        let ws = p.window_size;
        let hs = ws / 2;
        let pitch = p.pitch_scale;

        let Some(fft) = self.ffts.get_mut(&ws) else {
            return;
        };

        let cepstrum = &mut self.dblbuf[..ws];
        fft.inverse_cepstral(&self.mag[..=hs], cepstrum);

        let cutoff = (p.sample_rate / 700).clamp(1, ws);
        cepstrum[0] /= 2.0;
        cepstrum[cutoff - 1] /= 2.0;
        cepstrum[cutoff..].fill(0.0);
        // One-sided cepstrum, so the mirrored half comes back as a factor of 2
        for c in &mut cepstrum[..cutoff] {
            *c /= hs as f64;
        }

        fft.forward(cepstrum, &mut self.envelope[..=hs], &mut self.spare[..=hs]);

        let envelope = &mut self.envelope[..=hs];
        for e in envelope.iter_mut() {
            *e = e.exp();
        }
        for (m, e) in self.mag[..=hs].iter_mut().zip(envelope.iter()) {
            *m /= *e;
        }

        if pitch > 1.0 {
            for target in 0..=hs {
                let source = lrint(target as f64 * pitch).max(0) as usize;
                envelope[target] = if source > hs { 0.0 } else { envelope[source] };
            }
        } else {
            for target in (0..hs).rev() {
                let source = (lrint(target as f64 * pitch).max(0) as usize).min(hs);
                envelope[target] = envelope[source];
            }
        }

        for (m, e) in self.mag[..=hs].iter_mut().zip(envelope.iter()) {
            *m *= *e;
        }
    }

    /// Inverse transform the current spectrum and overlap-add it
    pub fn synthesise(&mut self, p: &ChunkParams) {
        let ws = p.window_size;
        let hs = ws / 2;

        if p.options.formant == FormantMode::Preserved && p.pitch_scale != 1.0 {
            self.formant_shift(p);
        }

        let Some(fft) = self.ffts.get_mut(&ws) else {
            tracing::error!("No transform for window size {}", ws);
            return;
        };
        fft.inverse_polar(&self.mag[..=hs], &self.phase[..=hs], &mut self.dblbuf[..ws]);

        let scale = 1.0 / ws as f64;
        for i in 0..hs {
            self.fltbuf[i] = (self.dblbuf[i + hs] * scale) as f32;
            self.fltbuf[i + hs] = (self.dblbuf[i] * scale) as f32;
        }

        p.window.cut(&mut self.fltbuf[..ws]);
        for (a, &s) in self.accumulator[..ws].iter_mut().zip(self.fltbuf[..ws].iter()) {
            *a += s;
        }
        self.accumulator_fill = ws;

        let area = p.window.area();
        p.window.add(&mut self.window_accumulator[..ws], area * 1.5);
    }

    /// Run one chunk through modification, synthesis and output.
    /// Returns true when the last chunk of a drained stream was written.
    pub fn process_chunk_for_channel(&mut self, p: &ChunkParams, incs: Increments) -> bool {
        let draining = self.shared.draining();

        if !draining {
            self.modify(p, incs.phase, incs.phase_reset);
            self.synthesise(p);
        }

        let mut last = false;
        let mut shift = incs.shift;

        if draining {
            if shift == 0 {
                tracing::warn!("Zero shift while draining, using {}", p.increment);
                shift = p.increment;
            }
            if self.accumulator_fill <= shift {
                tracing::debug!("Final chunk, accumulator fill {}", self.accumulator_fill);
                last = true;
                shift = self.accumulator_fill;
            }
        }

        if p.threaded {
            let mut required = shift;
            if p.pitch_scale != 1.0 {
                required = (required as f64 / p.pitch_scale) as usize + 1;
            }
            let space = self.outbuf.vacant_len();
            if space < required {
                tracing::warn!(
                    "Output ring short by {} samples, holding back the excess",
                    required - space
                );
            }
        }

        self.write_chunk(p, shift, last);
        last
    }

    /// Normalise `shift` finished samples, emit them and shift the accumulators
    pub fn write_chunk(&mut self, p: &ChunkParams, shift: usize, last: bool) {
        let ws = p.window_size;
        let shift = shift.min(ws);

        for (a, &w) in self.accumulator[..shift]
            .iter_mut()
            .zip(self.window_accumulator[..shift].iter())
        {
            if w > 0.0 {
                *a /= w;
            }
        }

        let theoretical_out = self
            .shared
            .input_size()
            .map(|n| lrint(n as f64 * p.time_ratio).max(0) as usize);

        let mut resampled = false;
        if p.pitch_scale != 1.0 && !p.resample_before {
            if let Some(resampler) = self.resampler.as_mut() {
                self.resample_buf.clear();
                if let Err(e) = resampler.resample(
                    &self.accumulator[..shift],
                    1.0 / p.pitch_scale,
                    last,
                    &mut self.resample_buf,
                ) {
                    tracing::error!("Output resampling failed: {}", e);
                    self.resample_buf.clear();
                }
                let buf = std::mem::take(&mut self.resample_buf);
                self.write_output(p, &buf, theoretical_out);
                self.resample_buf = buf;
                resampled = true;
            }
        }
        if !resampled {
            let acc = std::mem::take(&mut self.accumulator);
            self.write_output(p, &acc[..shift], theoretical_out);
            self.accumulator = acc;
        }

        self.accumulator.copy_within(shift..ws, 0);
        self.accumulator[ws - shift..ws].fill(0.0);
        self.window_accumulator.copy_within(shift..ws, 0);
        self.window_accumulator[ws - shift..ws].fill(0.0);

        if self.accumulator_fill > shift {
            self.accumulator_fill -= shift;
        } else {
            self.accumulator_fill = 0;
            if self.shared.draining() {
                tracing::debug!("Output complete");
                self.shared.set_output_complete(true);
            }
        }
    }

    /// Emit output, dropping the offline start-up padding and anything
    /// beyond the expected output length
    pub fn write_output(&mut self, p: &ChunkParams, data: &[f32], theoretical_out: Option<usize>) {
        let qty = data.len();
        let start_skip = if p.realtime {
            0
        } else {
            lrint((p.window_size / 2) as f64 / p.pitch_scale).max(0) as usize
        };

        let truncate = |written: usize, want: usize| match theoretical_out {
            Some(limit) => want.min(limit.saturating_sub(written)),
            None => want,
        };

        if self.out_count > start_skip {
            let n = truncate(self.out_count - start_skip, qty);
            if n < qty {
                tracing::trace!("Truncating {} samples past the expected length", qty - n);
            }
            self.push_output(&data[..n]);
            self.out_count += n;
            return;
        }

        if self.out_count + qty <= start_skip {
            self.out_count += qty;
            return;
        }

        let off = start_skip - self.out_count;
        let n = truncate(0, qty - off);
        self.push_output(&data[off..off + n]);
        self.out_count += qty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::new_channel;
    use crate::options::Options;
    use crate::ring::push_zeros;
    use elastic_analysis::{Window, WindowType};
    use ringbuf::traits::Producer;
    use std::sync::Arc;

    fn params(ws: usize, inc: usize, increments: Vec<i32>) -> ChunkParams {
        ChunkParams {
            sample_rate: 44100,
            window_size: ws,
            increment: inc,
            time_ratio: 1.0,
            pitch_scale: 1.0,
            realtime: false,
            threaded: false,
            resample_before: false,
            options: Options::default(),
            cutoffs: [600.0, 1200.0, 12000.0],
            window: Arc::new(Window::new(WindowType::Hann, ws)),
            increments: Arc::new(increments),
        }
    }

    #[test]
    fn test_read_space_waits_for_unknown_input() {
        let p = params(512, 128, vec![]);
        let (mut input, mut data) = new_channel(&[], 512, 4096).unwrap();
        input.inbuf.push_slice(&[0.1; 100]);
        assert!(!data.test_inbuf_read_space(&p));

        data.shared().set_input_size(100);
        assert!(data.test_inbuf_read_space(&p));
        assert!(data.shared().draining());
    }

    #[test]
    fn test_read_space_tail_without_draining() {
        let p = params(512, 128, vec![]);
        let (mut input, mut data) = new_channel(&[], 512, 4096).unwrap();
        input.inbuf.push_slice(&[0.1; 300]);
        data.shared().set_input_size(300);
        assert!(data.test_inbuf_read_space(&p));
        assert!(!data.shared().draining());
    }

    #[test]
    fn test_read_space_drains_empty_tail() {
        let p = params(512, 128, vec![]);
        let (_input, mut data) = new_channel(&[], 512, 4096).unwrap();
        data.shared().set_input_size(0);
        assert!(data.test_inbuf_read_space(&p));
        assert!(data.shared().draining());

        let progress = data.process_chunks(&p);
        assert!(progress.last);
        assert!(data.shared().output_complete());
        assert!(!data.test_inbuf_read_space(&p));
    }

    #[test]
    fn test_get_increments_past_end_and_reset() {
        let p = params(512, 128, vec![128, -256, 300, 5000]);
        let (_input, mut data) = new_channel(&[], 512, 4096).unwrap();

        let (incs, got) = data.get_increments(&p);
        assert!(got);
        assert!(incs.phase_reset, "first chunk always resets");
        assert_eq!(incs.shift, 256);

        data.chunk_count = 1;
        let (incs, _) = data.get_increments(&p);
        assert!(incs.phase_reset);
        assert_eq!(incs.phase, 256);

        data.chunk_count = 2;
        let (incs, _) = data.get_increments(&p);
        assert_eq!(incs.shift, 512, "shift clamped to window size");

        data.chunk_count = 10;
        let (incs, got) = data.get_increments(&p);
        assert!(!got);
        assert_eq!(data.chunk_count, 3);
        assert_eq!(incs.phase, 5000);
        assert_eq!(incs.shift, 512);
    }

    #[test]
    fn test_get_increments_without_sequence() {
        let p = params(512, 128, vec![]);
        let (_input, mut data) = new_channel(&[], 512, 4096).unwrap();
        let (incs, got) = data.get_increments(&p);
        assert!(!got);
        assert_eq!(incs.phase, 128);
        assert!(!incs.phase_reset);
    }

    #[test]
    fn test_mixed_transients_spare_mid_band() {
        let ws = 1024;
        let mut p = params(ws, 256, vec![]);
        p.options.phase = PhaseMode::Independent;
        p.options.transients = TransientsMode::Mixed;
        let (_input, mut data) = new_channel(&[], ws, 4096).unwrap();
        data.phase[..=ws / 2].fill(1.0);

        data.modify(&p, 512, true);

        // 150 Hz and 1 kHz fall on bins 3 and 23 at this size
        for i in 0..=ws / 2 {
            let in_band = i > 3 && i < 23;
            if in_band {
                assert!(
                    (data.phase[i] - 1.0).abs() > 0.5,
                    "bin {} was reset to {}",
                    i,
                    data.phase[i]
                );
            } else {
                assert_eq!(data.phase[i], 1.0, "bin {} not reset", i);
            }
        }
    }

    #[test]
    fn test_crisp_transients_reset_every_bin() {
        let ws = 1024;
        let mut p = params(ws, 256, vec![]);
        p.options.transients = TransientsMode::Crisp;
        let (_input, mut data) = new_channel(&[], ws, 4096).unwrap();
        data.phase[..=ws / 2].fill(1.0);

        data.modify(&p, 512, true);
        assert!(data.phase[..=ws / 2].iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_formant_shift_keeps_envelope() {
        let ws = 1024;
        let hs = ws / 2;
        for pitch in [2.0, 0.5] {
            let mut p = params(ws, 256, vec![]);
            p.pitch_scale = pitch;
            let (_input, mut data) = new_channel(&[], ws, 4096).unwrap();
            for (i, m) in data.mag[..=hs].iter_mut().enumerate() {
                *m = (-(i as f64) / 100.0).exp();
            }

            data.formant_shift(&p);

            // Resampling by 1/pitch later maps bin t to t * pitch, so the
            // envelope must already sit at its scaled position
            for t in 40..=200 {
                let expected = (-(t as f64) * pitch / 100.0).exp();
                let got = data.mag[t];
                assert!(got.is_finite());
                assert!(
                    (got / expected - 1.0).abs() < 0.05,
                    "pitch {} bin {}: {} vs {}",
                    pitch,
                    t,
                    got,
                    expected
                );
            }
        }
    }

    #[test]
    fn test_identity_chunks_reconstruct_input() {
        // Unit increments everywhere: the vocoder should pass a signal through
        let ws = 512;
        let inc = 128;
        let n = 8192;
        let mut p = params(ws, inc, vec![inc as i32; n / inc + 8]);
        p.options.phase = PhaseMode::Independent;
        let (mut input, mut data) = new_channel(&[], ws, n * 2).unwrap();

        let signal: Vec<f32> = (0..n)
            .map(|i| 0.5 * (2.0 * PI * 440.0 * i as f64 / 44100.0).sin() as f32)
            .collect();

        push_zeros(&mut input.inbuf, ws / 2);
        let mut fed = 0;
        let mut out = Vec::new();
        let mut buf = vec![0.0f32; 4096];
        while fed < n {
            let take = input.consume(&signal[fed..], 1.0, false, false);
            fed += take;
            if fed == n {
                data.shared().set_input_size(n);
            }
            data.process_chunks(&p);
            let got = input.retrieve(&mut buf);
            out.extend_from_slice(&buf[..got]);
        }
        while !data.shared().output_complete() {
            if !data.process_chunks(&p).any {
                break;
            }
        }
        loop {
            let got = input.retrieve(&mut buf);
            if got == 0 {
                break;
            }
            out.extend_from_slice(&buf[..got]);
        }

        assert_eq!(out.len(), n);
        for i in ws..n - ws {
            assert!(
                (out[i] - signal[i]).abs() < 1e-3,
                "sample {} differs: {} vs {}",
                i,
                out[i],
                signal[i]
            );
        }
    }

    #[test]
    fn test_write_output_skips_and_truncates() {
        let p = params(8, 2, vec![]);
        let (mut input, mut data) = new_channel(&[], 8, 64).unwrap();
        // Offline start skip is 4 samples
        data.write_output(&p, &[1.0, 2.0, 3.0], Some(5));
        data.write_output(&p, &[4.0, 5.0, 6.0], Some(5));
        data.write_output(&p, &[7.0, 8.0, 9.0], Some(5));
        data.write_output(&p, &[10.0, 11.0], Some(5));

        let mut out = [0.0f32; 16];
        let got = input.retrieve(&mut out);
        assert_eq!(&out[..got], &[5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_empty_input_writes_nothing() {
        let p = params(8, 2, vec![]);
        let (mut input, mut data) = new_channel(&[], 8, 64).unwrap();
        data.write_output(&p, &[1.0; 10], Some(0));
        let mut out = [0.0f32; 16];
        assert_eq!(input.retrieve(&mut out), 0);
    }
}
