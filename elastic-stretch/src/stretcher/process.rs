//! Feeding input through the channels, offline and realtime

use super::study::Analysis;
use super::worker::Worker;
use super::{push_history, Mode, Stretcher};
use crate::channel::{ChannelData, ChunkParams, Increments};
use crate::StretchError;
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::time::Duration;

/// How long the caller waits for a worker to free input space
const SPACE_WAIT: Duration = Duration::from_millis(500);

impl Stretcher {
    /// Feed one block per channel. Pass `is_final` with the last block;
    /// nothing more can be processed after it until [`Stretcher::reset`].
    pub fn process(&mut self, input: &[&[f32]], is_final: bool) -> Result<(), StretchError> {
        if self.mode == Mode::Finished {
            tracing::warn!("Cannot process again after the final block");
            return Ok(());
        }
        if input.len() < self.channels {
            tracing::warn!(
                "Process given {} channels, expected {}",
                input.len(),
                self.channels
            );
            return Ok(());
        }

        if matches!(self.mode, Mode::JustCreated | Mode::Studying) {
            self.start_processing()?;
        }

        let samples = input[..self.channels]
            .iter()
            .map(|c| c.len())
            .min()
            .unwrap_or(0);
        let params = self.chunk_params();
        let mut consumed = vec![0usize; self.channels];

        loop {
            let mut all_consumed = true;
            let mut progressed = false;

            for c in 0..self.channels {
                let ch = &mut self.inputs[c];
                let taken = ch.consume(
                    &input[c][consumed[c]..samples],
                    params.pitch_scale,
                    params.resample_before,
                    is_final,
                );
                consumed[c] += taken;
                progressed |= taken > 0;

                if consumed[c] < samples || ch.pending_input() > 0 {
                    all_consumed = false;
                } else if is_final {
                    ch.shared.set_input_size(ch.in_count);
                }

                if !self.threaded && !self.realtime {
                    progressed |= self.data[c].lock().process_chunks(&params).any;
                }
            }

            if self.realtime {
                while let Some(last) = self.process_one_chunk(&params) {
                    progressed = true;
                    if last {
                        break;
                    }
                }
            }

            if self.threaded {
                for w in &self.workers {
                    w.signal_data_available();
                }
                if !all_consumed {
                    let _ = self.space_rx.recv_timeout(SPACE_WAIT);
                }
            } else if !all_consumed && !progressed {
                tracing::warn!(
                    "No room for input and nothing to process, dropping {} samples",
                    samples - consumed.iter().copied().min().unwrap_or(0)
                );
                break;
            }

            if all_consumed {
                break;
            }
        }

        if is_final {
            self.mode = Mode::Finished;
        }
        Ok(())
    }

    /// Move from studying to processing: fix the increments, pad the
    /// channels and start the workers
    fn start_processing(&mut self) -> Result<(), StretchError> {
        if self.mode == Mode::Studying {
            self.calculate_stretch();
        }

        self.reset_and_prefill();

        if self.threaded {
            let params = Arc::new(self.chunk_params());
            for (c, data) in self.data.iter().enumerate() {
                let worker = Worker::spawn(
                    c,
                    Arc::clone(data),
                    Arc::clone(&params),
                    self.space_tx.clone(),
                )?;
                self.workers.push(worker);
            }
            tracing::info!("{} workers started", self.workers.len());
        }

        self.mode = Mode::Processing;
        Ok(())
    }

    /// Process one chunk on every channel in step.
    ///
    /// Returns `None` if any channel is not ready, otherwise whether this
    /// was the final chunk.
    fn process_one_chunk(&mut self, params: &ChunkParams) -> Option<bool> {
        let mut guards: Vec<MutexGuard<'_, ChannelData>> =
            self.data.iter().map(|d| d.lock()).collect();

        for g in guards.iter_mut() {
            if !g.test_inbuf_read_space(params) {
                return None;
            }
        }
        for g in guards.iter_mut() {
            if !g.shared().draining() {
                g.read_frame(params);
                g.analyse(params);
            }
        }

        let (mut incs, got) = guards[0].get_increments(params);
        if !got {
            incs = self
                .analysis
                .calculate_increments(&mut guards, params, params.effective_ratio());
        }

        let mut last = false;
        for g in guards.iter_mut() {
            last = g.process_chunk_for_channel(params, incs);
            g.chunk_count += 1;
        }
        Some(last)
    }
}

impl Analysis {
    /// Decide the next realtime increments from the channels' current
    /// spectra, which must all be at the same chunk
    pub(crate) fn calculate_increments(
        &mut self,
        channels: &mut [MutexGuard<'_, ChannelData>],
        params: &ChunkParams,
        ratio: f64,
    ) -> Increments {
        let inc = params.increment;
        let fallback = Increments {
            phase: inc,
            shift: inc,
            phase_reset: false,
        };
        let Some(first) = channels.first() else {
            return fallback;
        };

        let count = first.chunk_count;
        if channels.iter().any(|c| c.chunk_count != count) {
            tracing::error!("Channels are not in sync, using default increments");
            return fallback;
        }

        // Summed magnitudes are a good enough onset signal without a
        // separate mixdown transform
        let bins = params.window_size / 2 + 1;
        self.summed.clear();
        self.summed.resize(bins, 0.0);
        for c in channels.iter() {
            for (s, &m) in self.summed.iter_mut().zip(c.mag[..bins].iter()) {
                *s += m as f32;
            }
        }

        let df = self.phase_reset_curve.process(&self.summed, inc);
        let incr = self.calculator.calculate_single_at(ratio, df, inc);

        push_history(&mut self.df_history, df);
        push_history(&mut self.increment_history, incr);

        let shift = incr.unsigned_abs() as usize;
        let first = &mut channels[0];
        let phase = if first.prev_increment == 0 {
            shift
        } else {
            first.prev_increment
        };
        first.prev_increment = shift;

        Increments {
            phase,
            shift,
            phase_reset: incr < 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;

    fn sine(n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 44100.0).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_process_after_final_is_noop() {
        let mut s = Stretcher::new(44100, 1, Options::default(), 1.0, 1.0).unwrap();
        let block = sine(4096);
        s.process(&[block.as_slice()], true).unwrap();
        let before = s.available();
        s.process(&[block.as_slice()], true).unwrap();
        assert_eq!(s.available(), before);
    }

    #[test]
    fn test_realtime_records_history() {
        let mut s = Stretcher::new(44100, 2, Options::realtime(), 1.0, 1.0).unwrap();
        let block = sine(4096);
        s.process(&[block.as_slice(), block.as_slice()], false).unwrap();
        let incs = s.output_increments();
        assert!(!incs.is_empty());
        assert!(incs.len() <= 16);
        assert!(s.output_increments().is_empty(), "history drains on read");
        assert_eq!(s.phase_reset_curve().len(), incs.len());
    }

    #[test]
    fn test_offline_increments_shared_with_params() {
        let mut s = Stretcher::new(44100, 1, Options::default(), 1.5, 1.0).unwrap();
        let block = sine(20_000);
        s.study(&[block.as_slice()], true);
        s.process(&[block.as_slice()], true).unwrap();
        assert!(!s.output_increments().is_empty());
        assert_eq!(s.chunk_params().increments.len(), s.output_increments().len());
    }

    #[test]
    fn test_realtime_backlog_bounded_without_retrieve() {
        let mut s = Stretcher::new(44100, 1, Options::realtime(), 1.5, 1.0).unwrap();
        let block = sine(1024);
        for _ in 0..300 {
            s.process(&[block.as_slice()], false).unwrap();
        }
        let limit = s.data[0].lock().overflow_limit();
        assert!(s.data[0].lock().pending_overflow() <= limit);

        let mut out = vec![0.0f32; 4096];
        let mut total = 0;
        while let Some(n) = s.available() {
            if n == 0 {
                break;
            }
            let want = n.min(out.len());
            total += s.retrieve(&mut [&mut out[..want]]);
        }
        assert!(total > 0);
        assert!(total <= 2 * limit, "retrieved {} with limit {}", total, limit);
    }
}
