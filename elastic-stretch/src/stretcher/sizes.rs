//! Window and increment sizing, and (re)configuration of the stretcher
//! around them

use super::study::Study;
use super::{Stretcher, DEFAULT_INCREMENT};
use crate::channel::resize_outbuf;
use crate::math::{lrint, round_up};
use crate::options::{PitchMode, StretchMode, TransientsMode};
use crate::StretchError;
use elastic_analysis::{AudioCurve, CurveKind, Window, WindowType};
use std::sync::Arc;

/// Sizes derived from the ratios and options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Sizes {
    pub window_size: usize,
    pub increment: usize,
    pub max_process_size: usize,
    pub outbuf_size: usize,
}

impl Stretcher {
    /// Derive window size, increment and buffer sizes from the current
    /// ratios, clamping invalid ratios to 1
    pub(crate) fn calculate_sizes(&mut self) {
        if !(self.pitch_scale > 0.0) {
            tracing::warn!(
                "Pitch scale must be greater than zero, resetting {} to 1.0",
                self.pitch_scale
            );
            self.pitch_scale = 1.0;
        }
        if !(self.time_ratio > 0.0) {
            tracing::warn!(
                "Time ratio must be greater than zero, resetting {} to 1.0",
                self.time_ratio
            );
            self.time_ratio = 1.0;
        }

        let sizes = self.sizes_for(self.effective_ratio());

        self.window_size = sizes.window_size;
        self.increment = sizes.increment;
        self.max_process_size = sizes.max_process_size;
        self.outbuf_size = sizes.outbuf_size;

        tracing::info!(
            "Effective ratio {}, window size {}, increment {} (output increment about {}), outbuf {}",
            self.effective_ratio(),
            self.window_size,
            self.increment,
            lrint(self.increment as f64 * self.effective_ratio()),
            self.outbuf_size
        );
    }

    fn sizes_for(&self, r: f64) -> Sizes {
        let mut input_increment = DEFAULT_INCREMENT;
        let mut window_size = self.base_window_size;

        if self.realtime {
            if r < 1.0 {
                let rsb = self.pitch_scale < 1.0 && !self.resample_before_stretching();
                let ratio = window_increment_ratio(r, rsb);

                input_increment = (window_size as f64 / ratio) as usize;
                let mut output_increment = (input_increment as f64 * r).floor() as usize;

                // Very long stretch or very low pitch shift
                if output_increment < DEFAULT_INCREMENT / 4 {
                    output_increment = output_increment.max(1);
                    while output_increment < DEFAULT_INCREMENT / 4
                        && window_size < self.base_window_size * 4
                    {
                        output_increment *= 2;
                        input_increment = (output_increment as f64 / r).ceil() as usize;
                        window_size = round_up((input_increment as f64 * ratio).ceil() as usize);
                    }
                }
            } else {
                let rsb = self.pitch_scale > 1.0 && self.resample_before_stretching();
                let ratio = window_increment_ratio(r, rsb);

                let mut output_increment = (window_size as f64 / ratio) as usize;
                input_increment = (output_increment as f64 / r) as usize;
                while output_increment as f64 > 1024.0 * self.rate_multiple && input_increment > 1 {
                    output_increment /= 2;
                    input_increment = (output_increment as f64 / r) as usize;
                }
                let min_window = round_up(lrint(output_increment as f64 * ratio).max(1) as usize);
                window_size = window_size.max(min_window);

                if rsb {
                    let resampled =
                        round_up(lrint(window_size as f64 / self.pitch_scale).max(1) as usize)
                            .max(512);
                    let div = window_size / resampled;
                    if div > 1 && input_increment > div && output_increment > div {
                        input_increment /= div;
                        window_size /= div;
                    }
                }
            }
        } else if r < 1.0 {
            input_increment = window_size / 4;
            while input_increment >= 512 {
                input_increment /= 2;
            }
            let output_increment = (input_increment as f64 * r).floor() as usize;
            if output_increment < 1 {
                input_increment = round_up((1.0 / r).ceil() as usize);
                window_size = input_increment * 4;
            }
        } else {
            let mut output_increment = window_size / 6;
            input_increment = (output_increment as f64 / r) as usize;
            while output_increment > 1024 && input_increment > 1 {
                output_increment /= 2;
                input_increment = (output_increment as f64 / r) as usize;
            }
            window_size = window_size.max(round_up(output_increment * 6));
            if r > 5.0 {
                while window_size < 8192 {
                    window_size *= 2;
                }
            }
        }

        if self.expected_input_duration > 0 {
            while input_increment * 4 > self.expected_input_duration && input_increment > 1 {
                input_increment /= 2;
            }
        }

        if input_increment == 0 {
            tracing::warn!("Ratio {} leaves no input increment, using 1", r);
            input_increment = 1;
        }

        let max_process_size = self.max_process_size.max(window_size);

        let mut outbuf_size = (max_process_size as f64 / self.pitch_scale)
            .max(window_size as f64 * 2.0 * self.time_ratio.max(1.0))
            .ceil() as usize;
        if self.realtime || self.threaded {
            // Headroom for pitch changes, or for workers running ahead of retrieval
            outbuf_size *= 16;
        }

        Sizes {
            window_size,
            increment: input_increment,
            max_process_size,
            outbuf_size,
        }
    }

    fn window_for(&mut self, size: usize) -> Arc<Window> {
        Arc::clone(
            self.windows
                .entry(size)
                .or_insert_with(|| Arc::new(Window::new(WindowType::Hann, size))),
        )
    }

    /// Build everything that depends on the sizes.
    ///
    /// Channels are rebuilt only when the window or output buffer size
    /// changed. Offline, channels are left reset and padded for a new run.
    pub(crate) fn configure(&mut self) -> Result<(), StretchError> {
        let first = self.windows.is_empty();
        let prev_window_size = if first { 0 } else { self.window_size };
        let prev_outbuf_size = if first { 0 } else { self.outbuf_size };

        self.calculate_sizes();

        let window_changed = prev_window_size != self.window_size;
        let outbuf_changed = prev_outbuf_size != self.outbuf_size;
        let hot = self.hot_window_sizes();

        if window_changed {
            for &size in &hot {
                self.window_for(size);
            }
            self.window = self.window_for(self.window_size);
            tracing::debug!("Window area {}", self.window.area());
        }

        if window_changed || outbuf_changed {
            self.build_channels(&hot)?;
        }

        if !self.realtime && window_changed {
            self.study = Some(Study::new(self.window_size)?);
        }

        if self.pitch_scale != 1.0
            || self.options.pitch == PitchMode::HighConsistency
            || self.realtime
        {
            self.ensure_resamplers()?;
        }

        let ws = self.window_size;
        let analysis = &mut self.analysis;
        analysis.phase_reset_curve = AudioCurve::new(CurveKind::Percussive, ws);
        analysis.silent_curve = AudioCurve::new(CurveKind::Silent, ws);
        if !self.realtime {
            let kind = match self.options.stretch {
                StretchMode::Elastic => CurveKind::SpectralDifference,
                StretchMode::Precise => CurveKind::Constant,
            };
            analysis.stretch_curve = Some(AudioCurve::new(kind, ws));
        }
        analysis.rebuild_calculator(
            self.sample_rate,
            self.increment,
            self.options.transients != TransientsMode::Smooth,
        );
        analysis.input_duration = 0;

        if !self.realtime {
            self.reset_and_prefill();
            if let Some(study) = self.study.as_mut() {
                study.reset(ws);
            }
        }

        Ok(())
    }

    /// Apply changed ratios or options.
    ///
    /// Offline this reconfigures from scratch, first keeping the stretch
    /// calculated from whatever has been studied. Realtime it switches
    /// between preallocated sizes where it can.
    pub(crate) fn reconfigure(&mut self) -> Result<(), StretchError> {
        if !self.realtime {
            if self.mode == super::Mode::Studying {
                self.calculate_stretch();
                self.analysis.clear_curves();
            }
            return self.configure();
        }

        let prev_window_size = self.window_size;
        let prev_outbuf_size = self.outbuf_size;

        self.calculate_sizes();

        if self.window_size != prev_window_size {
            if !self.windows.contains_key(&self.window_size) {
                tracing::warn!(
                    "Window of size {} had to be allocated in realtime mode",
                    self.window_size
                );
            }
            self.window = self.window_for(self.window_size);

            for data in &self.data {
                data.lock().set_window_size(self.window_size)?;
            }
        }

        if self.outbuf_size != prev_outbuf_size {
            tracing::warn!(
                "Output buffer resized from {} to {} in realtime mode",
                prev_outbuf_size,
                self.outbuf_size
            );
            for (input, data) in self.inputs.iter_mut().zip(self.data.iter()) {
                resize_outbuf(input, &mut data.lock(), self.outbuf_size);
            }
        }

        if self.pitch_scale != 1.0 && self.ensure_resamplers()? {
            tracing::warn!("Resampler had to be constructed in realtime mode");
        }

        if self.window_size != prev_window_size {
            self.analysis
                .phase_reset_curve
                .set_window_size(self.window_size);
        }

        Ok(())
    }
}

/// Ratio of window size to the larger of the two increments
fn window_increment_ratio(r: f64, resampling: bool) -> f64 {
    if r == 1.0 {
        4.0
    } else if resampling {
        4.5
    } else {
        6.0
    }
}
