//! Offline study pass: detection curves over a mono mixdown, then the
//! stretch calculation from them

use super::{Mode, Stretcher};
use crate::calculator::StretchCalculator;
use crate::ring::{push_zeros, sample_ring, PeekExt, SampleCons, SampleProd};
use crate::StretchError;
use elastic_analysis::{AudioCurve, CurveKind, Fft};
use ringbuf::traits::{Consumer, Observer, Producer};
use std::collections::VecDeque;
use std::sync::Arc;

/// Buffers for the study pass
pub(crate) struct Study {
    fft: Fft,
    prod: SampleProd,
    cons: SampleCons,
    frame: Vec<f32>,
    mag: Vec<f32>,
    mixdown: Vec<f32>,
}

impl Study {
    pub fn new(window_size: usize) -> Result<Self, StretchError> {
        let (prod, cons) = sample_ring(window_size);
        Ok(Self {
            fft: Fft::new(window_size)?,
            prod,
            cons,
            frame: vec![0.0; window_size],
            mag: vec![0.0; window_size / 2 + 1],
            mixdown: Vec::new(),
        })
    }

    /// Empty the buffer and pad it so the first frame centres on sample 0
    pub fn reset(&mut self, window_size: usize) {
        self.cons.clear();
        push_zeros(&mut self.prod, window_size / 2);
    }

    /// Average all channels into the mixdown buffer
    fn mix(&mut self, input: &[&[f32]], samples: usize) {
        self.mixdown.clear();
        self.mixdown.extend_from_slice(&input[0][..samples]);
        for channel in &input[1..] {
            for (m, &s) in self.mixdown.iter_mut().zip(channel[..samples].iter()) {
                *m += s;
            }
        }
        if input.len() > 1 {
            let scale = 1.0 / input.len() as f32;
            for m in &mut self.mixdown {
                *m *= scale;
            }
        }
    }
}

/// Detection curves, the calculator and what they have produced
pub(crate) struct Analysis {
    pub calculator: StretchCalculator,
    pub phase_reset_curve: AudioCurve,
    pub silent_curve: AudioCurve,
    /// Offline only
    pub stretch_curve: Option<AudioCurve>,

    pub phase_reset_df: Vec<f32>,
    pub stretch_df: Vec<f32>,
    pub silence: Vec<bool>,
    /// Studied input length in samples
    pub input_duration: usize,
    /// Offline output increments, shared read-only with the workers
    pub increments: Arc<Vec<i32>>,

    pub increment_history: VecDeque<i32>,
    pub df_history: VecDeque<f32>,
    /// Magnitudes summed over channels for realtime detection
    pub summed: Vec<f32>,
}

impl Analysis {
    pub fn new(
        sample_rate: usize,
        increment: usize,
        window_size: usize,
        use_hard_peaks: bool,
    ) -> Self {
        Self {
            calculator: StretchCalculator::new(sample_rate, increment, use_hard_peaks),
            phase_reset_curve: AudioCurve::new(CurveKind::Percussive, window_size),
            silent_curve: AudioCurve::new(CurveKind::Silent, window_size),
            stretch_curve: None,
            phase_reset_df: Vec::new(),
            stretch_df: Vec::new(),
            silence: Vec::new(),
            input_duration: 0,
            increments: Arc::new(Vec::new()),
            increment_history: VecDeque::with_capacity(super::HISTORY_LEN),
            df_history: VecDeque::with_capacity(super::HISTORY_LEN),
            summed: Vec::new(),
        }
    }

    /// Replace the calculator for a new increment, keeping its tuning
    pub fn rebuild_calculator(&mut self, sample_rate: usize, increment: usize, use_hard_peaks: bool) {
        let thresholds = self.calculator.thresholds();
        self.calculator = StretchCalculator::new(sample_rate, increment, use_hard_peaks);
        self.calculator.set_thresholds(thresholds);
    }

    /// Drop studied curves after they have been turned into increments
    pub fn clear_curves(&mut self) {
        self.phase_reset_df.clear();
        self.stretch_df.clear();
        self.silence.clear();
        self.input_duration = 0;
    }

    pub fn reset(&mut self) {
        self.phase_reset_curve.reset();
        self.silent_curve.reset();
        if let Some(curve) = self.stretch_curve.as_mut() {
            curve.reset();
        }
        self.calculator.reset();
        self.clear_curves();
        self.increments = Arc::new(Vec::new());
        self.increment_history.clear();
        self.df_history.clear();
    }
}

impl Stretcher {
    /// Analyse a block of input ahead of processing. Offline only.
    ///
    /// All channels are averaged. Pass `is_final` with the last block.
    pub fn study(&mut self, input: &[&[f32]], is_final: bool) {
        if self.realtime {
            tracing::debug!("Study is not meaningful in realtime mode");
            return;
        }
        if matches!(self.mode, Mode::Processing | Mode::Finished) {
            tracing::warn!("Cannot study after processing");
            return;
        }
        if input.len() < self.channels {
            tracing::warn!(
                "Study given {} channels, expected {}",
                input.len(),
                self.channels
            );
            return;
        }
        self.mode = Mode::Studying;

        let Some(study) = self.study.as_mut() else {
            tracing::error!("No study buffers configured");
            return;
        };

        let input = &input[..self.channels];
        let samples = input.iter().map(|c| c.len()).min().unwrap_or(0);
        study.mix(input, samples);

        let ws = self.window_size;
        let inc = self.increment;
        let analysis = &mut self.analysis;
        let window = &self.window;

        let mut consumed = 0;
        loop {
            if consumed < samples {
                consumed += study.prod.push_slice(&study.mixdown[consumed..samples]);
            }
            let all_written = consumed == samples;

            // The tail shorter than a window is only analysed once the
            // last of the input is in
            loop {
                let rs = study.cons.occupied_len();
                if rs < ws && !(is_final && all_written && rs >= ws / 2) {
                    break;
                }

                study.cons.peek_into(&mut study.frame[..ws]);
                window.cut(&mut study.frame[..ws]);
                study
                    .fft
                    .forward_magnitude(&study.frame[..ws], &mut study.mag[..=ws / 2]);

                let mag = &study.mag[..=ws / 2];
                analysis
                    .phase_reset_df
                    .push(analysis.phase_reset_curve.process(mag, inc));
                let stretch_df = match analysis.stretch_curve.as_mut() {
                    Some(curve) => curve.process(mag, inc),
                    None => 1.0,
                };
                analysis.stretch_df.push(stretch_df);

                let silent = analysis.silent_curve.process(mag, inc) > 0.0;
                if silent {
                    tracing::debug!("Silence found at {}", analysis.input_duration);
                }
                analysis.silence.push(silent);

                analysis.input_duration += inc;
                study.cons.skip(inc.min(rs));
            }

            if all_written {
                break;
            }
        }

        if is_final {
            let rs = study.cons.occupied_len();
            analysis.input_duration += rs;
            // Take back the padding that centred the first frame
            if analysis.input_duration > ws / 2 {
                analysis.input_duration -= ws / 2;
            }
            tracing::info!(
                "Studied {} chunks, input duration {}",
                analysis.phase_reset_df.len(),
                analysis.input_duration
            );
        }
    }

    /// Turn the studied curves into output increments and append them
    pub(crate) fn calculate_stretch(&mut self) {
        let mut input_duration = self.analysis.input_duration;
        if !self.realtime
            && self.expected_input_duration > 0
            && self.expected_input_duration != input_duration
        {
            tracing::warn!(
                "Studied duration {} differs from expected duration {}, using the latter",
                input_duration,
                self.expected_input_duration
            );
            input_duration = self.expected_input_duration;
        }

        let ratio = self.effective_ratio();
        let analysis = &mut self.analysis;
        let mut increments = analysis.calculator.calculate(
            ratio,
            input_duration,
            &analysis.phase_reset_df,
            &analysis.stretch_df,
        );

        // A window's worth of silence resets phases from there on
        let silent_run = (self.window_size / self.increment).max(1);
        let mut history = 0;
        for (inc, &silent) in increments.iter_mut().zip(analysis.silence.iter()) {
            if silent {
                history += 1;
            } else {
                history = 0;
            }
            if history >= silent_run && *inc >= 0 {
                *inc = -*inc;
                tracing::trace!("Phase reset on silence (history {})", history);
            }
        }

        Arc::make_mut(&mut analysis.increments).extend(increments);
    }
}
