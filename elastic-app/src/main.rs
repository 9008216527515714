//! elastic - audio time-stretcher and pitch-shifter
//!
//! Reads any format symphonia can decode and writes a 32-bit float WAV.

mod args;

use std::path::Path;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use elastic_io::{AudioData, Config};
use elastic_stretch::Stretcher;
use tracing_subscriber::EnvFilter;

use args::{Args, Command};

/// Frames handed to the stretcher per call
const BLOCK_SIZE: usize = 1024;

/// Longest the tool waits on a stretcher that reports nothing available
const STALL_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> ExitCode {
    let config = Config::load();

    let args = match args::parse(std::env::args().skip(1)) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            args::print_usage();
            return ExitCode::SUCCESS;
        }
        Ok(Command::Version) => {
            println!("elastic {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("elastic: {}\n", e);
            args::print_usage();
            return ExitCode::from(2);
        }
    };

    init_logging(&args, &config);

    match run(&args, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("elastic: {:#}", e);
            ExitCode::from(1)
        }
    }
}

/// RUST_LOG wins; otherwise the debug level picks the filter
fn init_logging(args: &Args, config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if args.quiet {
            "error"
        } else {
            match args.debug_level(config) {
                0 => "warn",
                1 => "info",
                2 => "debug",
                _ => "trace",
            }
        };
        EnvFilter::new(level)
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: &Args, config: &Config) -> anyhow::Result<()> {
    let input = elastic_io::load(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;

    let time_ratio = args.resolve_time_ratio(input.frames(), input.sample_rate);
    let options = args.options(config);

    let mut stretcher = Stretcher::new(
        input.sample_rate as usize,
        input.channel_count(),
        options,
        time_ratio,
        args.pitch_scale,
    )
    .context("Failed to create stretcher")?;

    tracing::info!(
        "Stretching {} by {:.4}, pitch {:.4}, {} channels, window {}, increment {}, {}",
        args.input.display(),
        time_ratio,
        args.pitch_scale,
        input.channel_count(),
        stretcher.window_size(),
        stretcher.input_increment(),
        if stretcher.is_threaded() { "threaded" } else { "single-threaded" }
    );

    let start = Instant::now();
    let output = if options.is_realtime() {
        stretch_realtime(&mut stretcher, &input)?
    } else {
        stretch_offline(&mut stretcher, &input)?
    };

    let out_frames = output.first().map_or(0, |c| c.len());
    tracing::info!(
        "In: {} frames, out: {} frames, ratio {:.4}, took {:.2?}",
        input.frames(),
        out_frames,
        if input.frames() > 0 {
            out_frames as f64 / input.frames() as f64
        } else {
            0.0
        },
        start.elapsed()
    );

    write_output(&args.output, &output, input.sample_rate)
}

fn stretch_offline(stretcher: &mut Stretcher, input: &AudioData) -> anyhow::Result<Vec<Vec<f32>>> {
    let frames = input.frames();
    stretcher
        .set_expected_input_duration(frames)
        .context("Failed to configure for input length")?;

    for (start, end, last) in blocks(frames) {
        let slices = block_slices(input, start, end);
        stretcher.study(&slices, last);
    }

    let mut output = vec![Vec::new(); input.channel_count()];
    for (start, end, last) in blocks(frames) {
        let slices = block_slices(input, start, end);
        stretcher.process(&slices, last).context("Processing failed")?;
        retrieve_available(stretcher, &mut output);
    }
    finish(stretcher, &mut output);
    Ok(output)
}

fn stretch_realtime(stretcher: &mut Stretcher, input: &AudioData) -> anyhow::Result<Vec<Vec<f32>>> {
    let mut output = vec![Vec::new(); input.channel_count()];
    for (start, end, last) in blocks(input.frames()) {
        let slices = block_slices(input, start, end);
        stretcher.process(&slices, last).context("Processing failed")?;
        retrieve_available(stretcher, &mut output);
    }
    finish(stretcher, &mut output);
    Ok(output)
}

/// Block boundaries, always at least one block so the final flag is sent
fn blocks(frames: usize) -> Vec<(usize, usize, bool)> {
    if frames == 0 {
        return vec![(0, 0, true)];
    }
    (0..frames)
        .step_by(BLOCK_SIZE)
        .map(|start| {
            let end = (start + BLOCK_SIZE).min(frames);
            (start, end, end == frames)
        })
        .collect()
}

fn block_slices(input: &AudioData, start: usize, end: usize) -> Vec<&[f32]> {
    input.channels.iter().map(|c| &c[start..end]).collect()
}

/// Append everything currently available. Returns false at end of stream.
fn retrieve_available(stretcher: &mut Stretcher, output: &mut [Vec<f32>]) -> bool {
    let mut scratch = vec![vec![0.0f32; BLOCK_SIZE * 4]; output.len()];
    loop {
        let avail = match stretcher.available() {
            None => return false,
            Some(0) => return true,
            Some(n) => n.min(BLOCK_SIZE * 4),
        };
        let mut slices: Vec<&mut [f32]> = scratch.iter_mut().map(|s| &mut s[..avail]).collect();
        let got = stretcher.retrieve(&mut slices);
        if got == 0 {
            return true;
        }
        for (out, buf) in output.iter_mut().zip(scratch.iter()) {
            out.extend_from_slice(&buf[..got]);
        }
    }
}

/// Collect the remaining output after the final block
fn finish(stretcher: &mut Stretcher, output: &mut [Vec<f32>]) {
    let mut last_progress = Instant::now();
    let mut have = output.first().map_or(0, |c| c.len());

    while retrieve_available(stretcher, output) {
        let now = output.first().map_or(0, |c| c.len());
        if now > have {
            have = now;
            last_progress = Instant::now();
        } else if last_progress.elapsed() > STALL_TIMEOUT {
            tracing::warn!("Stretcher stalled, writing {} frames", have);
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn write_output(path: &Path, output: &[Vec<f32>], sample_rate: u32) -> anyhow::Result<()> {
    elastic_io::write_wav(path, output, sample_rate)
        .with_context(|| format!("Failed to write {}", path.display()))
}
