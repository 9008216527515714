mod common;

use approx::assert_abs_diff_eq;
use common::*;
use elastic_stretch::{FormantMode, Options, PhaseMode, StretchMode, Stretcher, ThreadingMode};

fn offline(stretch: StretchMode, threading: ThreadingMode) -> Options {
    Options {
        stretch,
        threading,
        ..Options::default()
    }
}

#[test]
fn test_silence_doubles_exactly() {
    let opts = offline(StretchMode::Precise, ThreadingMode::Never);
    let mut s = Stretcher::new(SAMPLE_RATE, 1, opts, 2.0, 1.0).unwrap();
    let input = vec![vec![0.0f32; SAMPLE_RATE]];
    let out = run_offline(&mut s, &input, 1024);

    let len = out[0].len();
    assert!(len.abs_diff(88_200) <= 1, "output length {}", len);
    assert!(out[0].iter().all(|s| s.abs() < 1e-6));

    // Everything past the initial amnesty resets phase
    let amnesty = s.window_size() / s.input_increment();
    let incs = s.output_increments();
    assert!(incs.len() > amnesty);
    assert!(
        incs[amnesty..].iter().all(|&i| i < 0),
        "non-reset increment after chunk {}",
        amnesty
    );
}

#[test]
fn test_output_length_follows_ratio() {
    let input = vec![gen_clicks(SAMPLE_RATE, SAMPLE_RATE, 4410)];
    for &ratio in &[0.5, 0.8, 1.25, 2.0] {
        let opts = offline(StretchMode::Elastic, ThreadingMode::Never);
        let mut s = Stretcher::new(SAMPLE_RATE, 1, opts, ratio, 1.0).unwrap();
        let out = run_offline(&mut s, &input, 1024);
        let expected = (SAMPLE_RATE as f64 * ratio).round() as usize;
        let len = out[0].len();
        assert!(
            len.abs_diff(expected) <= 1,
            "ratio {}: expected {}, got {}",
            ratio,
            expected,
            len
        );
    }
}

#[test]
fn test_unity_ratio_preserves_tone() {
    let opts = Options {
        phase: PhaseMode::Independent,
        ..offline(StretchMode::Precise, ThreadingMode::Never)
    };
    let mut s = Stretcher::new(SAMPLE_RATE, 1, opts, 1.0, 1.0).unwrap();
    let input = vec![gen_sine(440.0, SAMPLE_RATE, SAMPLE_RATE, 0.5)];
    let out = run_offline(&mut s, &input, 1024);

    assert_eq!(out[0].len(), SAMPLE_RATE);
    let mid = &out[0][8192..SAMPLE_RATE - 8192];
    let reference = &input[0][8192..SAMPLE_RATE - 8192];
    assert_abs_diff_eq!(rms(mid), rms(reference), epsilon = 0.02);
    assert_abs_diff_eq!(zero_crossing_freq(mid, SAMPLE_RATE), 440.0, epsilon = 5.0);
}

#[test]
fn test_octave_up_keeps_length() {
    let opts = offline(StretchMode::Precise, ThreadingMode::Never);
    let mut s = Stretcher::new(SAMPLE_RATE, 1, opts, 1.0, 2.0).unwrap();
    let n = SAMPLE_RATE * 2;
    let input = vec![gen_sine(440.0, SAMPLE_RATE, n, 0.5)];
    let out = run_offline(&mut s, &input, 1024);

    let len = out[0].len();
    assert!(len.abs_diff(n) <= 1, "output length {}", len);

    let mid = &out[0][len / 4..len * 3 / 4];
    let at_880 = energy_at_freq(mid, SAMPLE_RATE, 880.0);
    let at_440 = energy_at_freq(mid, SAMPLE_RATE, 440.0);
    assert!(at_880 > at_440 * 4.0, "880 Hz {} vs 440 Hz {}", at_880, at_440);
}

#[test]
fn test_threaded_matches_length() {
    let opts = offline(StretchMode::Elastic, ThreadingMode::Always);
    let mut s = Stretcher::new(SAMPLE_RATE, 2, opts, 1.5, 1.0).unwrap();
    assert!(s.is_threaded());

    let left = gen_sine(330.0, SAMPLE_RATE, SAMPLE_RATE, 0.4);
    let right = gen_clicks(SAMPLE_RATE, SAMPLE_RATE, 8820);
    let out = run_offline(&mut s, &[left, right], 1024);

    let expected = (SAMPLE_RATE as f64 * 1.5).round() as usize;
    assert_eq!(out[0].len(), out[1].len());
    assert!(out[0].len().abs_diff(expected) <= 1, "got {}", out[0].len());
    assert!(rms(&out[0]) > 0.1);
}

#[test]
fn test_exact_time_points_follow_clicks() {
    let opts = offline(StretchMode::Elastic, ThreadingMode::Never);
    let mut s = Stretcher::new(SAMPLE_RATE, 1, opts, 2.0, 1.0).unwrap();
    let input = vec![gen_clicks(SAMPLE_RATE, SAMPLE_RATE, 11025)];
    run_offline(&mut s, &input, 1024);

    let points = s.exact_time_points();
    assert!(!points.is_empty());
    assert!(points.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_reset_allows_second_run() {
    let opts = offline(StretchMode::Precise, ThreadingMode::Never);
    let mut s = Stretcher::new(SAMPLE_RATE, 1, opts, 1.5, 1.0).unwrap();
    let input = vec![gen_sine(220.0, SAMPLE_RATE, 22050, 0.3)];

    let first = run_offline(&mut s, &input, 1024);
    s.reset().unwrap();
    let second = run_offline(&mut s, &input, 1024);
    assert_eq!(first[0].len(), second[0].len());
}

#[test]
fn test_formant_preserving_pitch_shift() {
    let opts = Options {
        formant: FormantMode::Preserved,
        ..offline(StretchMode::Precise, ThreadingMode::Never)
    };
    let mut s = Stretcher::new(SAMPLE_RATE, 1, opts, 1.0, 1.5).unwrap();
    let n = SAMPLE_RATE;
    let input: Vec<f32> = (0..n)
        .map(|i| {
            (1..=8)
                .map(|h| {
                    let phase = 2.0 * std::f32::consts::PI * 220.0 * h as f32 * i as f32;
                    0.3 / h as f32 * (phase / SAMPLE_RATE as f32).sin()
                })
                .sum()
        })
        .collect();
    let out = run_offline(&mut s, &[input.clone()], 1024);

    let len = out[0].len();
    assert!(len.abs_diff(n) <= 1, "output length {}", len);
    assert!(out[0].iter().all(|v| v.is_finite()));

    let mid = &out[0][len / 4..len * 3 / 4];
    let ratio = rms(mid) / rms(&input[n / 4..n * 3 / 4]);
    assert!(ratio > 0.5 && ratio < 2.0, "level ratio {}", ratio);
    // Fundamental moves from 220 Hz to 330 Hz
    let at_330 = energy_at_freq(mid, SAMPLE_RATE, 330.0);
    let at_220 = energy_at_freq(mid, SAMPLE_RATE, 220.0);
    assert!(at_330 > at_220 * 2.0, "330 Hz {} vs 220 Hz {}", at_330, at_220);
}
