//! Stretcher configuration
//!
//! One enum per option family. Everything is fixed at construction
//! except the options with explicit setters on the stretcher
//! (transients, phase, formant and pitch).

/// Offline (study, then process) or streaming operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    /// Whole input studied first, then processed
    Offline,
    /// Input processed as it arrives with bounded latency
    RealTime,
}

/// How stretch is distributed over time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StretchMode {
    /// Shaped by spectral change, more stretch in steady passages
    Elastic,
    /// Uniform stretch everywhere
    Precise,
}

/// Transient handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientsMode {
    /// Reset phases on every detected transient
    Crisp,
    /// Reset phases only outside the 150-1000 Hz band
    Mixed,
    /// Never reset phases on transients
    Smooth,
}

/// Phase propagation across bins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseMode {
    /// Bins may inherit a neighbour's phase advance
    Laminar,
    /// Each bin advances on its own
    Independent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadingMode {
    /// One worker per channel when more than one CPU is available
    Auto,
    Never,
    Always,
}

/// Analysis window length relative to the default
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    Standard,
    Short,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormantMode {
    /// Spectral envelope moves with the pitch
    Shifted,
    /// Spectral envelope stays in place when pitch shifting
    Preserved,
}

/// Trade-off for the pitch-shifting resampler in realtime mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PitchMode {
    HighSpeed,
    HighQuality,
    HighConsistency,
}

/// Full stretcher configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub process: ProcessMode,
    pub stretch: StretchMode,
    pub transients: TransientsMode,
    pub phase: PhaseMode,
    pub threading: ThreadingMode,
    pub window: WindowMode,
    pub formant: FormantMode,
    pub pitch: PitchMode,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            process: ProcessMode::Offline,
            stretch: StretchMode::Elastic,
            transients: TransientsMode::Crisp,
            phase: PhaseMode::Laminar,
            threading: ThreadingMode::Auto,
            window: WindowMode::Standard,
            formant: FormantMode::Shifted,
            pitch: PitchMode::HighSpeed,
        }
    }
}

impl Options {
    /// Preset for percussive material: short window, independent phases
    pub fn percussive() -> Self {
        Self {
            window: WindowMode::Short,
            phase: PhaseMode::Independent,
            ..Self::default()
        }
    }

    /// Default options in realtime mode
    pub fn realtime() -> Self {
        Self {
            process: ProcessMode::RealTime,
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_realtime(&self) -> bool {
        self.process == ProcessMode::RealTime
    }
}
