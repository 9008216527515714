//! Multi-channel time-stretcher and pitch-shifter
//!
//! Offline use: [`Stretcher::study`] the whole input, then
//! [`Stretcher::process`] it, pulling output with [`Stretcher::available`]
//! and [`Stretcher::retrieve`] along the way. Realtime use skips the study
//! pass and decides each chunk's increment as it arrives.

mod process;
mod sizes;
mod study;
mod worker;

use crate::calculator::StretchCalculator;
use crate::channel::{new_channel, ChannelData, ChannelInput, ChunkParams};
use crate::options::{
    FormantMode, Options, PhaseMode, PitchMode, ProcessMode, StretchMode, ThreadingMode,
    TransientsMode, WindowMode,
};
use crate::resampler::Resampler;
use crate::StretchError;
use elastic_analysis::{Window, WindowType};
use parking_lot::Mutex;
use ringbuf::traits::Observer;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use study::{Analysis, Study};
use worker::Worker;

/// Input hop before any ratio-dependent adjustment
pub(crate) const DEFAULT_INCREMENT: usize = 256;
/// Window size at 48kHz before any ratio-dependent adjustment
pub(crate) const DEFAULT_WINDOW_SIZE: usize = 2048;
/// Entries kept in the realtime diagnostic histories
const HISTORY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    JustCreated,
    Studying,
    Processing,
    Finished,
}

pub struct Stretcher {
    sample_rate: usize,
    channels: usize,
    options: Options,
    time_ratio: f64,
    pitch_scale: f64,

    window_size: usize,
    increment: usize,
    outbuf_size: usize,
    max_process_size: usize,
    expected_input_duration: usize,
    base_window_size: usize,
    rate_multiple: f64,
    threaded: bool,
    realtime: bool,
    mode: Mode,
    /// Laminar phase cutoffs in Hz
    cutoffs: [f32; 3],

    windows: BTreeMap<usize, Arc<Window>>,
    window: Arc<Window>,
    inputs: Vec<ChannelInput>,
    data: Vec<Arc<Mutex<ChannelData>>>,
    have_resamplers: bool,

    study: Option<Study>,
    analysis: Analysis,

    workers: Vec<Worker>,
    space_tx: crossbeam_channel::Sender<()>,
    space_rx: crossbeam_channel::Receiver<()>,
}

impl std::fmt::Debug for Stretcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stretcher")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("time_ratio", &self.time_ratio)
            .field("pitch_scale", &self.pitch_scale)
            .field("window_size", &self.window_size)
            .field("increment", &self.increment)
            .field("threaded", &self.threaded)
            .field("mode", &self.mode)
            .finish()
    }
}

impl Stretcher {
    /// Create a stretcher for `channels` channels of audio at `sample_rate`
    pub fn new(
        sample_rate: usize,
        channels: usize,
        options: Options,
        time_ratio: f64,
        pitch_scale: f64,
    ) -> Result<Self, StretchError> {
        if channels == 0 {
            return Err(StretchError::NoChannels);
        }

        let mut options = options;
        let rate_multiple = (sample_rate as f64 / 48000.0).max(1.0);
        let mut base_window_size =
            crate::math::round_up((DEFAULT_WINDOW_SIZE as f64 * rate_multiple) as usize);
        match options.window {
            WindowMode::Standard => {}
            WindowMode::Short => base_window_size /= 2,
            WindowMode::Long => base_window_size *= 2,
        }

        let realtime = options.process == ProcessMode::RealTime;
        if realtime {
            options.stretch = StretchMode::Precise;
        }

        let threaded = channels > 1
            && !realtime
            && match options.threading {
                ThreadingMode::Never => false,
                ThreadingMode::Always => true,
                ThreadingMode::Auto => std::thread::available_parallelism()
                    .map(|n| n.get() > 1)
                    .unwrap_or(false),
            };

        tracing::info!(
            "Stretcher: rate {} channels {} options {:?} threaded {}",
            sample_rate,
            channels,
            options,
            threaded
        );

        let (space_tx, space_rx) = crossbeam_channel::bounded(1);
        let window = Arc::new(Window::new(WindowType::Hann, base_window_size));

        let mut stretcher = Self {
            sample_rate,
            channels,
            options,
            time_ratio,
            pitch_scale,
            window_size: base_window_size,
            increment: DEFAULT_INCREMENT,
            outbuf_size: base_window_size * 2,
            max_process_size: base_window_size,
            expected_input_duration: 0,
            base_window_size,
            rate_multiple,
            threaded,
            realtime,
            mode: Mode::JustCreated,
            cutoffs: [600.0, 1200.0, 12000.0],
            windows: BTreeMap::new(),
            window,
            inputs: Vec::with_capacity(channels),
            data: Vec::with_capacity(channels),
            have_resamplers: false,
            study: None,
            analysis: Analysis::new(
                sample_rate,
                DEFAULT_INCREMENT,
                base_window_size,
                options.transients != TransientsMode::Smooth,
            ),
            workers: Vec::new(),
            space_tx,
            space_rx,
        };

        stretcher.configure()?;
        Ok(stretcher)
    }

    /// Return to the just-constructed state with the current settings
    pub fn reset(&mut self) -> Result<(), StretchError> {
        self.stop_workers();

        for (input, data) in self.inputs.iter_mut().zip(self.data.iter()) {
            input.reset();
            data.lock().reset();
        }

        self.mode = Mode::JustCreated;
        self.analysis.reset();

        self.reconfigure()
    }

    /// Change the time ratio. Refused while studying or processing offline.
    pub fn set_time_ratio(&mut self, ratio: f64) -> Result<(), StretchError> {
        if !self.realtime && matches!(self.mode, Mode::Studying | Mode::Processing) {
            tracing::warn!("Cannot set time ratio while studying or processing offline");
            return Ok(());
        }
        if ratio == self.time_ratio {
            return Ok(());
        }
        self.time_ratio = ratio;
        self.reconfigure()
    }

    /// Change the pitch scale. Refused while studying or processing offline.
    pub fn set_pitch_scale(&mut self, scale: f64) -> Result<(), StretchError> {
        if !self.realtime && matches!(self.mode, Mode::Studying | Mode::Processing) {
            tracing::warn!("Cannot set pitch scale while studying or processing offline");
            return Ok(());
        }
        if scale == self.pitch_scale {
            return Ok(());
        }

        let was_unity = self.pitch_scale == 1.0;
        let resampled_before = self.resample_before_stretching();

        self.pitch_scale = scale;
        self.reconfigure()?;

        // Switching resampling side leaves stale state in the resamplers
        if self.options.pitch != PitchMode::HighConsistency
            && (was_unity || self.resample_before_stretching() != resampled_before)
            && self.pitch_scale != 1.0
        {
            for (input, data) in self.inputs.iter_mut().zip(self.data.iter()) {
                if let Some(r) = input.resampler.as_mut() {
                    r.reset();
                }
                if let Some(r) = data.lock().resampler.as_mut() {
                    r.reset();
                }
            }
        }
        Ok(())
    }

    #[inline]
    pub fn time_ratio(&self) -> f64 {
        self.time_ratio
    }

    #[inline]
    pub fn pitch_scale(&self) -> f64 {
        self.pitch_scale
    }

    /// Hint the total input length so short inputs get a finer increment
    pub fn set_expected_input_duration(&mut self, samples: usize) -> Result<(), StretchError> {
        if samples == self.expected_input_duration {
            return Ok(());
        }
        self.expected_input_duration = samples;
        self.reconfigure()
    }

    /// Raise the largest block size `process` will be given
    pub fn set_max_process_size(&mut self, samples: usize) -> Result<(), StretchError> {
        if samples <= self.max_process_size {
            return Ok(());
        }
        self.max_process_size = samples;
        self.reconfigure()
    }

    /// Laminar phase cutoff `n` (0..=2) in Hz, or 0 for any other index
    pub fn frequency_cutoff(&self, n: usize) -> f32 {
        self.cutoffs.get(n).copied().unwrap_or(0.0)
    }

    pub fn set_frequency_cutoff(&mut self, n: usize, hz: f32) {
        match self.cutoffs.get_mut(n) {
            Some(cutoff) => *cutoff = hz,
            None => tracing::warn!("No frequency cutoff {}", n),
        }
    }

    /// Change transient handling. Only meaningful in realtime mode.
    pub fn set_transients_option(&mut self, transients: TransientsMode) {
        if !self.realtime {
            tracing::warn!("Transients option can only be changed in realtime mode");
            return;
        }
        self.options.transients = transients;
        self.analysis
            .calculator
            .set_use_hard_peaks(transients != TransientsMode::Smooth);
    }

    pub fn set_phase_option(&mut self, phase: PhaseMode) {
        self.options.phase = phase;
    }

    pub fn set_formant_option(&mut self, formant: FormantMode) {
        self.options.formant = formant;
    }

    /// Change the resampler trade-off. Only meaningful in realtime mode.
    pub fn set_pitch_option(&mut self, pitch: PitchMode) -> Result<(), StretchError> {
        if !self.realtime {
            tracing::warn!("Pitch option is not used in offline mode");
            return Ok(());
        }
        let prior = self.options.pitch;
        self.options.pitch = pitch;
        if prior != pitch {
            self.reconfigure()?;
        }
        Ok(())
    }

    #[inline]
    pub fn options(&self) -> Options {
        self.options
    }

    /// Delay between input and corresponding output, in samples
    pub fn latency(&self) -> usize {
        if !self.realtime {
            return 0;
        }
        ((self.window_size / 2) as f64 / self.pitch_scale + 1.0) as usize
    }

    /// Current analysis hop in input samples
    #[inline]
    pub fn input_increment(&self) -> usize {
        self.increment
    }

    #[inline]
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn is_threaded(&self) -> bool {
        self.threaded
    }

    /// Output increments: the offline sequence, or in realtime the
    /// increments chosen since the last call
    pub fn output_increments(&mut self) -> Vec<i32> {
        if !self.realtime {
            return self.analysis.increments.as_ref().clone();
        }
        self.analysis.increment_history.drain(..).collect()
    }

    /// Phase reset curve: the studied curve offline, or in realtime the
    /// values seen since the last call
    pub fn phase_reset_curve(&mut self) -> Vec<f32> {
        if !self.realtime {
            return self.analysis.phase_reset_df.clone();
        }
        self.analysis.df_history.drain(..).collect()
    }

    /// Chunks at which the last offline calculation found peaks
    pub fn exact_time_points(&self) -> Vec<usize> {
        if self.realtime {
            return Vec::new();
        }
        self.analysis
            .calculator
            .last_calculated_peaks()
            .iter()
            .map(|p| p.chunk)
            .collect()
    }

    /// Direct access to the stretch calculator, for inspection and tuning
    pub fn calculator(&self) -> &StretchCalculator {
        &self.analysis.calculator
    }

    pub fn calculator_mut(&mut self) -> &mut StretchCalculator {
        &mut self.analysis.calculator
    }

    /// Input samples needed before the next chunk can be processed
    pub fn samples_required(&self) -> usize {
        let ws = self.window_size;
        self.inputs
            .iter()
            .map(|input| {
                let rs = input.inbuf.occupied_len();
                if rs >= ws || input.shared.draining() {
                    0
                } else if input.shared.input_size().is_none() {
                    ws - rs
                } else if rs == 0 {
                    ws
                } else {
                    0
                }
            })
            .max()
            .unwrap_or(0)
    }

    /// Processed samples ready for [`Stretcher::retrieve`].
    ///
    /// `None` marks the end of the stream: every channel has finished
    /// and all output has been retrieved.
    pub fn available(&mut self) -> Option<usize> {
        let run_pending = !self.threaded && !self.realtime;
        let params = self.chunk_params();

        let mut min = usize::MAX;
        let mut complete = true;

        for (input, data) in self.inputs.iter().zip(self.data.iter()) {
            match data.try_lock() {
                Some(mut d) => {
                    if run_pending
                        && d.shared().input_size().is_some()
                        && d.inbuf.occupied_len() > 0
                    {
                        d.process_chunks(&params);
                    }
                    d.flush_overflow();
                    if !d.shared().output_complete() || d.pending_overflow() > 0 {
                        complete = false;
                    }
                }
                None => complete = false,
            }
            tracing::trace!(
                "Available {} (waiting {})",
                input.readable(),
                input.inbuf.occupied_len()
            );
            min = min.min(input.readable());
        }

        let min = if min == usize::MAX { 0 } else { min };
        if min == 0 && complete {
            return None;
        }
        if self.pitch_scale == 1.0 || self.have_resamplers {
            return Some(min);
        }
        Some((min as f64 / self.pitch_scale).floor() as usize)
    }

    /// Read up to the shortest output slice's length from every channel.
    /// Returns the number of samples written to each.
    pub fn retrieve(&mut self, output: &mut [&mut [f32]]) -> usize {
        let mut got = output
            .iter()
            .take(self.channels)
            .map(|o| o.len())
            .min()
            .unwrap_or(0);
        if output.len() < self.channels {
            tracing::warn!(
                "Retrieve given {} output channels, expected {}",
                output.len(),
                self.channels
            );
            got = 0;
        }

        for (c, (input, out)) in self.inputs.iter_mut().zip(output.iter_mut()).enumerate() {
            let here = input.retrieve(&mut out[..got]);
            if here < got {
                if c > 0 {
                    tracing::warn!("Channel imbalance detected on retrieve");
                }
                got = here;
            }
        }

        for data in &self.data {
            if let Some(mut d) = data.try_lock() {
                d.flush_overflow();
            }
        }

        got
    }

    /// Ratio the phase vocoder itself has to achieve
    #[inline]
    fn effective_ratio(&self) -> f64 {
        self.time_ratio * self.pitch_scale
    }

    /// Pitch shift by resampling input rather than output.
    /// Only done in realtime, where no stretch curve depends on it.
    fn resample_before_stretching(&self) -> bool {
        if !self.realtime {
            return false;
        }
        match self.options.pitch {
            PitchMode::HighQuality => self.pitch_scale < 1.0,
            PitchMode::HighSpeed | PitchMode::HighConsistency => self.pitch_scale > 1.0,
        }
    }

    fn chunk_params(&self) -> ChunkParams {
        ChunkParams {
            sample_rate: self.sample_rate,
            window_size: self.window_size,
            increment: self.increment,
            time_ratio: self.time_ratio,
            pitch_scale: self.pitch_scale,
            realtime: self.realtime,
            threaded: self.threaded,
            resample_before: self.resample_before_stretching(),
            options: self.options,
            cutoffs: self.cutoffs,
            window: Arc::clone(&self.window),
            increments: Arc::clone(&self.analysis.increments),
        }
    }

    /// Window sizes a channel must be ready to switch to without allocating
    fn hot_window_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![self.window_size];
        if self.realtime {
            sizes.extend([
                self.base_window_size,
                self.base_window_size / 2,
                self.base_window_size * 2,
            ]);
        }
        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }

    fn build_channels(&mut self, hot: &[usize]) -> Result<(), StretchError> {
        self.inputs.clear();
        self.data.clear();
        self.have_resamplers = false;
        for _ in 0..self.channels {
            let (input, data) = new_channel(hot, self.window_size, self.outbuf_size)?;
            self.inputs.push(input);
            self.data.push(Arc::new(Mutex::new(data)));
        }
        Ok(())
    }

    /// Give every channel both resamplers if it lacks them
    fn ensure_resamplers(&mut self) -> Result<bool, StretchError> {
        let ratio = 1.0 / self.pitch_scale;
        let mut created = false;
        for (input, data) in self.inputs.iter_mut().zip(self.data.iter()) {
            if input.resampler.is_none() {
                input.resampler = Some(Resampler::new(ratio)?);
                created = true;
            }
            let mut d = data.lock();
            if d.resampler.is_none() {
                d.resampler = Some(Resampler::new(ratio)?);
                created = true;
            }
        }
        self.have_resamplers = true;
        Ok(created)
    }

    /// Reset every channel and pad its input with half a window of silence
    fn reset_and_prefill(&mut self) {
        let pad = self.window_size / 2;
        for (input, data) in self.inputs.iter_mut().zip(self.data.iter()) {
            input.reset();
            data.lock().reset();
            input.prefill(pad);
        }
    }

    fn stop_workers(&mut self) {
        for w in &self.workers {
            w.abandon();
        }
        for w in self.workers.drain(..) {
            w.join();
        }
    }
}

impl Drop for Stretcher {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

/// Append to a bounded history, dropping the oldest entry when full
fn push_history<T>(history: &mut VecDeque<T>, value: T) {
    if history.len() == HISTORY_LEN {
        history.pop_front();
    }
    history.push_back(value);
}
