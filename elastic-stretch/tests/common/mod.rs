#![allow(dead_code)]

use elastic_stretch::Stretcher;
use std::f32::consts::PI;

pub const SAMPLE_RATE: usize = 44100;

pub fn gen_sine(freq_hz: f32, sr: usize, n: usize, amp: f32) -> Vec<f32> {
    (0..n)
        .map(|i| amp * (2.0 * PI * freq_hz * i as f32 / sr as f32).sin())
        .collect()
}

/// Sine with a short click every `period` samples
pub fn gen_clicks(sr: usize, n: usize, period: usize) -> Vec<f32> {
    let mut out = gen_sine(220.0, sr, n, 0.2);
    for p in (period..n).step_by(period) {
        out[p] += 0.9;
        if p + 1 < n {
            out[p + 1] -= 0.6;
        }
    }
    out
}

pub fn rms(signal: &[f32]) -> f64 {
    if signal.is_empty() {
        return 0.0;
    }
    let sum: f64 = signal.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / signal.len() as f64).sqrt()
}

/// Frequency estimate from rising zero crossings
pub fn zero_crossing_freq(signal: &[f32], sr: usize) -> f64 {
    if signal.len() < 2 {
        return 0.0;
    }
    let crossings = signal
        .windows(2)
        .filter(|w| w[0] <= 0.0 && w[1] > 0.0)
        .count();
    crossings as f64 * sr as f64 / signal.len() as f64
}

/// Magnitude of a single DFT probe at `freq`
pub fn energy_at_freq(signal: &[f32], sr: usize, freq: f32) -> f64 {
    if signal.is_empty() {
        return 0.0;
    }
    let mut re = 0.0f64;
    let mut im = 0.0f64;
    for (i, &s) in signal.iter().enumerate() {
        let angle = 2.0 * std::f64::consts::PI * freq as f64 * i as f64 / sr as f64;
        re += s as f64 * angle.cos();
        im += s as f64 * angle.sin();
    }
    ((re * re + im * im) / signal.len() as f64).sqrt()
}

/// Pull everything currently available from a stretcher
pub fn drain(stretcher: &mut Stretcher, out: &mut [Vec<f32>]) -> bool {
    let mut scratch: Vec<Vec<f32>> = vec![vec![0.0; 4096]; out.len()];
    loop {
        let avail = match stretcher.available() {
            None => return true,
            Some(0) => return false,
            Some(n) => n.min(4096),
        };
        let mut slices: Vec<&mut [f32]> =
            scratch.iter_mut().map(|s| &mut s[..avail]).collect();
        let got = stretcher.retrieve(&mut slices);
        if got == 0 {
            return false;
        }
        for (o, s) in out.iter_mut().zip(scratch.iter()) {
            o.extend_from_slice(&s[..got]);
        }
    }
}

/// Study then process `input` in blocks, returning the whole output
pub fn run_offline(stretcher: &mut Stretcher, input: &[Vec<f32>], block: usize) -> Vec<Vec<f32>> {
    let n = input[0].len();
    let mut pos = 0;
    loop {
        let end = (pos + block).min(n);
        let slices: Vec<&[f32]> = input.iter().map(|c| &c[pos..end]).collect();
        stretcher.study(&slices, end == n);
        pos = end;
        if pos == n {
            break;
        }
    }

    let mut out = vec![Vec::new(); input.len()];
    let mut pos = 0;
    loop {
        let end = (pos + block).min(n);
        let slices: Vec<&[f32]> = input.iter().map(|c| &c[pos..end]).collect();
        stretcher.process(&slices, end == n).unwrap();
        drain(stretcher, &mut out);
        pos = end;
        if pos == n {
            break;
        }
    }
    while !drain(stretcher, &mut out) {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    out
}
