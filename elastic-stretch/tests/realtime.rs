mod common;

use common::*;
use elastic_stretch::{Options, Stretcher};

#[test]
fn test_realtime_output_stays_bounded() {
    let mut s = Stretcher::new(SAMPLE_RATE, 1, Options::realtime(), 1.5, 1.0).unwrap();
    let input = gen_sine(440.0, SAMPLE_RATE, 1024 * 10, 0.5);
    let ws = s.window_size();

    let mut fed = 0usize;
    let mut retrieved = 0usize;
    let mut scratch = vec![0.0f32; 1 << 16];

    for block in input.chunks(1024) {
        s.process(&[block], false).unwrap();
        fed += block.len();

        while let Some(avail) = s.available() {
            if avail == 0 {
                break;
            }
            assert!(avail <= scratch.len(), "available {} too large", avail);
            let got = s.retrieve(&mut [&mut scratch[..avail]]);
            assert_eq!(got, avail);
            retrieved += got;
        }
        assert!(
            retrieved as f64 <= fed as f64 * 1.5 + ws as f64,
            "retrieved {} after feeding {}",
            retrieved,
            fed
        );
    }
    assert!(retrieved > 0);
}

#[test]
fn test_realtime_latency_and_requirements() {
    let mut s = Stretcher::new(SAMPLE_RATE, 2, Options::realtime(), 1.0, 1.0).unwrap();
    let ws = s.window_size();
    assert_eq!(s.latency(), ws / 2 + 1);
    assert_eq!(s.samples_required(), ws);

    let block = gen_sine(440.0, SAMPLE_RATE, ws / 4, 0.5);
    s.process(&[block.as_slice(), block.as_slice()], false).unwrap();
    assert!(s.samples_required() < ws);
}

#[test]
fn test_realtime_ratio_change_midstream() {
    let mut s = Stretcher::new(SAMPLE_RATE, 1, Options::realtime(), 1.0, 1.0).unwrap();
    let input = gen_sine(440.0, SAMPLE_RATE, 1024 * 20, 0.5);
    let mut out = vec![Vec::new()];

    for (i, block) in input.chunks(1024).enumerate() {
        if i == 10 {
            s.set_time_ratio(2.0).unwrap();
        }
        s.process(&[block], i == 19).unwrap();
        drain(&mut s, &mut out);
    }
    assert_eq!(s.time_ratio(), 2.0);
    // First half near unity, second half doubled
    assert!(out[0].len() > 1024 * 20, "got {}", out[0].len());
}

#[test]
fn test_realtime_pitch_shift_moves_tone() {
    let mut s = Stretcher::new(SAMPLE_RATE, 1, Options::realtime(), 1.0, 2.0).unwrap();
    let input = gen_sine(440.0, SAMPLE_RATE, SAMPLE_RATE, 0.5);
    let mut out = vec![Vec::new()];
    for block in input.chunks(1024) {
        s.process(&[block], false).unwrap();
        drain(&mut s, &mut out);
    }

    let len = out[0].len();
    assert!(len > SAMPLE_RATE / 2, "got {}", len);
    let mid = &out[0][len / 4..len * 3 / 4];
    let at_880 = energy_at_freq(mid, SAMPLE_RATE, 880.0);
    let at_440 = energy_at_freq(mid, SAMPLE_RATE, 440.0);
    assert!(at_880 > at_440 * 4.0, "880 Hz {} vs 440 Hz {}", at_880, at_440);
}
