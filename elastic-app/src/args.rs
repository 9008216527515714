//! Command-line parsing for the elastic tool

use elastic_io::Config;
use elastic_stretch::{
    FormantMode, Options, PhaseMode, PitchMode, ProcessMode, StretchMode, ThreadingMode,
    TransientsMode, WindowMode,
};
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_CRISPNESS: u8 = 5;

#[derive(Error, Debug, PartialEq)]
pub enum ArgsError {
    #[error("Option {0} needs a value")]
    MissingValue(String),
    #[error("Invalid value {1:?} for {0}")]
    InvalidValue(String, String),
    #[error("Unknown option {0}")]
    UnknownOption(String),
    #[error("Expected an input and an output file")]
    MissingFiles,
    #[error("Unexpected argument {0}")]
    UnexpectedArgument(String),
}

/// What the command line asks for
#[derive(Debug, PartialEq)]
pub enum Command {
    Run(Args),
    Help,
    Version,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Args {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Product of every -t and -T given
    pub time_ratio: f64,
    /// Target duration in seconds, resolved once the input length is known
    pub duration: Option<f64>,
    /// Product of every -p and -f given
    pub pitch_scale: f64,
    pub crispness: Option<u8>,
    pub formant: bool,
    pub realtime: bool,
    pub precise: bool,
    pub threads: Option<bool>,
    pub no_transients: bool,
    pub bl_transients: bool,
    pub no_lamination: bool,
    pub window_long: bool,
    pub window_short: bool,
    pub pitch_hq: bool,
    pub debug: Option<u8>,
    pub quiet: bool,
}

impl Args {
    fn new(input: PathBuf, output: PathBuf) -> Self {
        Self {
            input,
            output,
            time_ratio: 1.0,
            duration: None,
            pitch_scale: 1.0,
            crispness: None,
            formant: false,
            realtime: false,
            precise: false,
            threads: None,
            no_transients: false,
            bl_transients: false,
            no_lamination: false,
            window_long: false,
            window_short: false,
            pitch_hq: false,
            debug: None,
            quiet: false,
        }
    }

    /// Time ratio for an input of `frames` samples at `sample_rate`
    pub fn resolve_time_ratio(&self, frames: usize, sample_rate: u32) -> f64 {
        match self.duration {
            Some(secs) if frames > 0 && sample_rate > 0 => {
                secs * sample_rate as f64 / frames as f64
            }
            _ => self.time_ratio,
        }
    }

    /// Stretcher options from the flags, with saved defaults underneath
    pub fn options(&self, config: &Config) -> Options {
        let crispness = self
            .crispness
            .or(config.crispness)
            .unwrap_or(DEFAULT_CRISPNESS);
        let mut opts = crispness_options(crispness);

        if self.realtime {
            opts.process = ProcessMode::RealTime;
        }
        if self.precise {
            opts.stretch = StretchMode::Precise;
        }
        if self.no_transients {
            opts.transients = TransientsMode::Smooth;
        }
        if self.bl_transients {
            opts.transients = TransientsMode::Mixed;
        }
        if self.no_lamination {
            opts.phase = PhaseMode::Independent;
        }
        if self.window_long {
            opts.window = WindowMode::Long;
        }
        if self.window_short {
            opts.window = WindowMode::Short;
        }

        opts.threading = match self.threads {
            Some(true) => ThreadingMode::Always,
            Some(false) => ThreadingMode::Never,
            None => config.threading.unwrap_or(ThreadingMode::Auto),
        };
        opts.formant = if self.formant {
            FormantMode::Preserved
        } else {
            config.formant.unwrap_or(FormantMode::Shifted)
        };
        opts.pitch = if self.pitch_hq {
            PitchMode::HighQuality
        } else {
            config.pitch.unwrap_or(PitchMode::HighSpeed)
        };
        opts
    }

    /// Verbosity from the flags, falling back to saved defaults
    pub fn debug_level(&self, config: &Config) -> u8 {
        self.debug.or(config.debug).unwrap_or(0)
    }
}

/// Transient, phase and window settings for a crispness level.
/// Levels above 5 are treated as 5.
pub fn crispness_options(level: u8) -> Options {
    let (transients, phase, window) = match level {
        0 => (TransientsMode::Smooth, PhaseMode::Independent, WindowMode::Long),
        1 => (TransientsMode::Smooth, PhaseMode::Independent, WindowMode::Standard),
        2 => (TransientsMode::Smooth, PhaseMode::Laminar, WindowMode::Standard),
        3 => (TransientsMode::Mixed, PhaseMode::Laminar, WindowMode::Standard),
        4 => (TransientsMode::Crisp, PhaseMode::Laminar, WindowMode::Standard),
        _ => (TransientsMode::Crisp, PhaseMode::Independent, WindowMode::Standard),
    };
    Options {
        transients,
        phase,
        window,
        ..Options::default()
    }
}

pub fn parse<I, S>(args: I) -> Result<Command, ArgsError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut iter = args.into_iter().map(Into::into);
    let mut files: Vec<String> = Vec::new();
    let mut time_ratio = 1.0;
    let mut pitch_scale = 1.0;
    let mut template = Args::new(PathBuf::new(), PathBuf::new());

    while let Some(arg) = iter.next() {
        if !arg.starts_with('-') || arg == "-" {
            files.push(arg);
            continue;
        }
        let mut value = |flag: &str| iter.next().ok_or_else(|| ArgsError::MissingValue(flag.into()));

        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-V" | "--version" => return Ok(Command::Version),
            "-t" | "--time" => {
                let v = value(&arg)?;
                time_ratio *= positive(&arg, &v)?;
            }
            "-T" | "--tempo" => {
                let v = value(&arg)?;
                time_ratio /= tempo(&arg, &v)?;
            }
            "-D" | "--duration" => {
                let v = value(&arg)?;
                template.duration = Some(positive(&arg, &v)?);
            }
            "-p" | "--pitch" => {
                let v = value(&arg)?;
                let semitones: f64 = number(&arg, &v)?;
                pitch_scale *= 2f64.powf(semitones / 12.0);
            }
            "-f" | "--frequency" => {
                let v = value(&arg)?;
                pitch_scale *= positive(&arg, &v)?;
            }
            "-c" | "--crisp" => {
                let v = value(&arg)?;
                match v.parse::<u8>() {
                    Ok(n) if n <= 5 => template.crispness = Some(n),
                    _ => return Err(ArgsError::InvalidValue(arg, v)),
                }
            }
            "-d" | "--debug" => {
                let v = value(&arg)?;
                match v.parse::<u8>() {
                    Ok(n) if n <= 3 => template.debug = Some(n),
                    _ => return Err(ArgsError::InvalidValue(arg, v)),
                }
            }
            "-F" | "--formant" => template.formant = true,
            "-R" | "--realtime" => template.realtime = true,
            "-P" | "--precise" => template.precise = true,
            "-q" | "--quiet" => template.quiet = true,
            "--threads" => template.threads = Some(true),
            "--no-threads" => template.threads = Some(false),
            "--no-transients" => template.no_transients = true,
            "--bl-transients" => template.bl_transients = true,
            "--no-lamination" => template.no_lamination = true,
            "--window-long" => template.window_long = true,
            "--window-short" => template.window_short = true,
            "--pitch-hq" => template.pitch_hq = true,
            _ => return Err(ArgsError::UnknownOption(arg)),
        }
    }

    let mut files = files.into_iter();
    let (Some(input), Some(output)) = (files.next(), files.next()) else {
        return Err(ArgsError::MissingFiles);
    };
    if let Some(extra) = files.next() {
        return Err(ArgsError::UnexpectedArgument(extra));
    }

    Ok(Command::Run(Args {
        input: PathBuf::from(input),
        output: PathBuf::from(output),
        time_ratio,
        pitch_scale,
        ..template
    }))
}

fn number(flag: &str, value: &str) -> Result<f64, ArgsError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ArgsError::InvalidValue(flag.into(), value.into()))
}

fn positive(flag: &str, value: &str) -> Result<f64, ArgsError> {
    let v = number(flag, value)?;
    if v > 0.0 {
        Ok(v)
    } else {
        Err(ArgsError::InvalidValue(flag.into(), value.into()))
    }
}

/// A tempo multiplier, either `X` or `X:Y` for a change from X to Y
fn tempo(flag: &str, value: &str) -> Result<f64, ArgsError> {
    match value.split_once(':') {
        Some((from, to)) => Ok(positive(flag, to)? / positive(flag, from)?),
        None => positive(flag, value),
    }
}

pub fn print_usage() {
    eprintln!(
        "elastic {}

Usage: elastic [options] <infile> <outfile>

Time and pitch:
  -t, --time <X>         Stretch to X times the original duration
  -T, --tempo <X>        Change tempo by multiple X (same as --time 1/X)
  -T, --tempo <X:Y>      Change tempo from X to Y (same as --time X/Y)
  -D, --duration <S>     Stretch or squash to make output S seconds long
  -p, --pitch <N>        Raise pitch by N semitones (N may be negative)
  -f, --frequency <X>    Change frequency by multiple X

Processing:
  -c, --crisp <N>        Crispness, 0 to 5 (default {})
  -F, --formant          Preserve formants when pitch shifting
  -R, --realtime         Use realtime mode
  -P, --precise          Stretch uniformly rather than elastically
      --threads          Always use a thread per channel
      --no-threads       Never use worker threads
      --no-transients    Never reset phase on transients
      --bl-transients    Reset phase only outside the mid band
      --no-lamination    Advance each bin's phase independently
      --window-long      Use a longer analysis window
      --window-short     Use a shorter analysis window
      --pitch-hq         Favour quality when pitch shifting in realtime

Other:
  -d, --debug <N>        Log verbosity, 0 to 3
  -q, --quiet            Only log errors
  -h, --help             Show this help
  -V, --version          Show the version

Defaults for crispness, threading, formant, pitch and debug are read
from {}",
        env!("CARGO_PKG_VERSION"),
        DEFAULT_CRISPNESS,
        Config::config_path().display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(args: &[&str]) -> Args {
        match parse(args.iter().copied()) {
            Ok(Command::Run(a)) => a,
            other => panic!("unexpected parse result {:?}", other),
        }
    }

    #[test]
    fn test_files_and_defaults() {
        let a = run(&["in.wav", "out.wav"]);
        assert_eq!(a.input, PathBuf::from("in.wav"));
        assert_eq!(a.output, PathBuf::from("out.wav"));
        assert_eq!(a.time_ratio, 1.0);
        assert_eq!(a.pitch_scale, 1.0);
        let opts = a.options(&Config::default());
        assert_eq!(opts.transients, TransientsMode::Crisp);
        assert_eq!(opts.phase, PhaseMode::Independent);
        assert_eq!(opts.threading, ThreadingMode::Auto);
    }

    #[test]
    fn test_time_and_tempo_multiply() {
        let a = run(&["-t", "2", "--tempo", "4", "in.wav", "out.wav"]);
        assert!((a.time_ratio - 0.5).abs() < 1e-12);

        let a = run(&["-T", "120:60", "in.wav", "out.wav"]);
        assert!((a.time_ratio - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_pitch_semitones_and_frequency() {
        let a = run(&["-p", "12", "in.wav", "out.wav"]);
        assert!((a.pitch_scale - 2.0).abs() < 1e-12);

        let a = run(&["-p", "-12", "-f", "1.5", "in.wav", "out.wav"]);
        assert!((a.pitch_scale - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_duration_resolves_against_input() {
        let a = run(&["-D", "2", "in.wav", "out.wav"]);
        assert!((a.resolve_time_ratio(44100, 44100) - 2.0).abs() < 1e-12);
        let b = run(&["-t", "3", "in.wav", "out.wav"]);
        assert_eq!(b.resolve_time_ratio(44100, 44100), 3.0);
    }

    #[test]
    fn test_crispness_mapping() {
        let expected = [
            (TransientsMode::Smooth, PhaseMode::Independent, WindowMode::Long),
            (TransientsMode::Smooth, PhaseMode::Independent, WindowMode::Standard),
            (TransientsMode::Smooth, PhaseMode::Laminar, WindowMode::Standard),
            (TransientsMode::Mixed, PhaseMode::Laminar, WindowMode::Standard),
            (TransientsMode::Crisp, PhaseMode::Laminar, WindowMode::Standard),
            (TransientsMode::Crisp, PhaseMode::Independent, WindowMode::Standard),
        ];
        for (level, &(t, p, w)) in expected.iter().enumerate() {
            let opts = crispness_options(level as u8);
            assert_eq!(opts.transients, t, "level {}", level);
            assert_eq!(opts.phase, p, "level {}", level);
            assert_eq!(opts.window, w, "level {}", level);
        }
    }

    #[test]
    fn test_flags_override_crispness_and_config() {
        let config = Config {
            crispness: Some(0),
            threading: Some(ThreadingMode::Never),
            ..Config::default()
        };
        let a = run(&["-c", "4", "--threads", "--no-transients", "-F", "-R", "a", "b"]);
        let opts = a.options(&config);
        assert_eq!(opts.transients, TransientsMode::Smooth);
        assert_eq!(opts.phase, PhaseMode::Laminar);
        assert_eq!(opts.threading, ThreadingMode::Always);
        assert_eq!(opts.formant, FormantMode::Preserved);
        assert_eq!(opts.process, ProcessMode::RealTime);
    }

    #[test]
    fn test_config_fills_gaps() {
        let config = Config {
            crispness: Some(2),
            pitch: Some(PitchMode::HighConsistency),
            debug: Some(2),
            ..Config::default()
        };
        let a = run(&["a", "b"]);
        let opts = a.options(&config);
        assert_eq!(opts.transients, TransientsMode::Smooth);
        assert_eq!(opts.phase, PhaseMode::Laminar);
        assert_eq!(opts.pitch, PitchMode::HighConsistency);
        assert_eq!(a.debug_level(&config), 2);
    }

    #[test]
    fn test_help_and_version() {
        assert_eq!(parse(["-h"]), Ok(Command::Help));
        assert_eq!(parse(["--version", "a", "b"]), Ok(Command::Version));
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            parse(["-t"]),
            Err(ArgsError::MissingValue("-t".into()))
        );
        assert_eq!(
            parse(["-t", "0", "a", "b"]),
            Err(ArgsError::InvalidValue("-t".into(), "0".into()))
        );
        assert_eq!(
            parse(["-c", "6", "a", "b"]),
            Err(ArgsError::InvalidValue("-c".into(), "6".into()))
        );
        assert_eq!(
            parse(["--bogus", "a", "b"]),
            Err(ArgsError::UnknownOption("--bogus".into()))
        );
        assert_eq!(parse(["a"]), Err(ArgsError::MissingFiles));
        assert_eq!(
            parse(["a", "b", "c"]),
            Err(ArgsError::UnexpectedArgument("c".into()))
        );
    }
}
