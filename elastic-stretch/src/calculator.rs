//! Stretch calculation: how far to advance the output for each analysis chunk
//!
//! Offline, the whole phase-reset curve is known in advance. Peaks in it
//! split the input into regions whose output positions are pinned, so a
//! transient always lands exactly where uniform stretching would put it.
//! Inside a region the stretch is shared out according to the stretch
//! curve: chunks with little spectral change take most of the stretch.
//!
//! Realtime, one increment is computed per chunk. A transient emits an
//! unstretched, phase-reset increment and the resulting timing error is
//! paid back over the following tenth of a second.

use crate::math::lrint;
use std::collections::{BTreeSet, VecDeque};

/// Per-chunk displacements for one adjustment of a region
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Displacements {
    pub max_df: f64,
    pub total: f64,
    pub min: f64,
    pub max: f64,
}

/// A detected transient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peak {
    /// Analysis chunk index
    pub chunk: usize,
    /// Hard peaks trigger a phase reset, soft ones only pin timing
    pub hard: bool,
}

/// One region of the last offline calculation, kept for inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub start_chunk: usize,
    pub end_chunk: usize,
    /// Output samples allotted to the region
    pub duration: i64,
    /// Region starts at a hard peak
    pub phase_reset: bool,
    /// Unsigned output increments, one per chunk
    pub increments: Vec<i32>,
}

/// Empirical thresholds for realtime transient detection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransientThresholds {
    /// Minimum curve value when the effective ratio is at most 1
    pub compressing: f32,
    /// Minimum curve value when the effective ratio is above 1
    pub expanding: f32,
    /// Minimum rise over the previous curve value
    pub rise: f32,
}

impl Default for TransientThresholds {
    fn default() -> Self {
        Self {
            compressing: 0.35,
            expanding: 0.25,
            rise: 1.1,
        }
    }
}

/// Default cap on the squash-range adjustment loop
pub const DEFAULT_MAX_ADJUST_ITERATIONS: usize = 1000;

#[derive(Debug, Clone)]
pub struct StretchCalculator {
    sample_rate: usize,
    increment: usize,
    use_hard_peaks: bool,
    thresholds: TransientThresholds,
    max_adjust_iterations: usize,

    // Realtime state
    prev_df: f32,
    prev_ratio: f64,
    divergence: f64,
    recovery: f64,
    transient_amnesty: i32,

    last_peaks: Vec<Peak>,
    last_regions: Vec<Region>,
}

impl StretchCalculator {
    pub fn new(sample_rate: usize, increment: usize, use_hard_peaks: bool) -> Self {
        Self {
            sample_rate,
            increment,
            use_hard_peaks,
            thresholds: TransientThresholds::default(),
            max_adjust_iterations: DEFAULT_MAX_ADJUST_ITERATIONS,
            prev_df: 0.0,
            prev_ratio: 1.0,
            divergence: 0.0,
            recovery: 0.0,
            transient_amnesty: 0,
            last_peaks: Vec::new(),
            last_regions: Vec::new(),
        }
    }

    #[inline]
    pub fn increment(&self) -> usize {
        self.increment
    }

    #[inline]
    pub fn set_use_hard_peaks(&mut self, use_hard_peaks: bool) {
        self.use_hard_peaks = use_hard_peaks;
    }

    #[inline]
    pub fn use_hard_peaks(&self) -> bool {
        self.use_hard_peaks
    }

    pub fn set_thresholds(&mut self, thresholds: TransientThresholds) {
        self.thresholds = thresholds;
    }

    pub fn thresholds(&self) -> TransientThresholds {
        self.thresholds
    }

    pub fn set_max_adjust_iterations(&mut self, iterations: usize) {
        self.max_adjust_iterations = iterations.max(1);
    }

    /// Accumulated realtime timing error in samples
    #[inline]
    pub fn divergence(&self) -> f64 {
        self.divergence
    }

    pub fn last_calculated_peaks(&self) -> &[Peak] {
        &self.last_peaks
    }

    pub fn last_regions(&self) -> &[Region] {
        &self.last_regions
    }

    /// Clear realtime state
    pub fn reset(&mut self) {
        self.prev_df = 0.0;
        self.divergence = 0.0;
        self.recovery = 0.0;
        self.transient_amnesty = 0;
    }

    /// Chunks to ignore after a peak
    fn amnesty_chunks(&self, increment: usize) -> usize {
        (self.sample_rate as f64 / (20.0 * increment as f64)).ceil() as usize
    }

    /// Compute the whole output increment sequence for an offline run.
    ///
    /// Both curves hold one value per analysis chunk. The result has one
    /// entry per chunk; negative entries request a phase reset.
    pub fn calculate(
        &mut self,
        ratio: f64,
        input_duration: usize,
        phase_reset_df: &[f32],
        stretch_df: &[f32],
    ) -> Vec<i32> {
        if phase_reset_df.len() != stretch_df.len() {
            tracing::warn!(
                "Curve lengths differ ({} vs {}), using the shorter",
                phase_reset_df.len(),
                stretch_df.len()
            );
        }
        let total_count = phase_reset_df.len().min(stretch_df.len());
        let phase_reset_df = &phase_reset_df[..total_count];
        let stretch_df = &stretch_df[..total_count];

        let peaks = self.find_peaks(phase_reset_df);

        tracing::debug!(
            "Input duration {} gives nominal output {}",
            input_duration,
            lrint(input_duration as f64 * ratio)
        );
        let output_duration = lrint((total_count * self.increment) as f64 * ratio);

        let fixed: Vec<i64> = peaks
            .iter()
            .map(|p| {
                if total_count == 0 {
                    0
                } else {
                    lrint(p.chunk as f64 * output_duration as f64 / total_count as f64)
                }
            })
            .collect();

        let mut increments = Vec::with_capacity(total_count);
        let mut regions = Vec::with_capacity(peaks.len() + 1);

        for i in 0..=peaks.len() {
            let (start_chunk, start, phase_reset) = if i == 0 {
                (0, 0, false)
            } else {
                (peaks[i - 1].chunk, fixed[i - 1], peaks[i - 1].hard)
            };
            let (end_chunk, end) = if i == peaks.len() {
                (total_count, output_duration)
            } else {
                (peaks[i].chunk, fixed[i])
            };

            let duration = end - start;
            let region_df = Self::smooth_df(&stretch_df[start_chunk..end_chunk]);
            let region_incs = self.distribute_region(&region_df, duration, ratio, phase_reset);

            let total: i64 = region_incs.iter().map(|&v| v as i64).sum();
            if total != duration {
                tracing::warn!(
                    "Region {}..{} allotted {} of {} output samples",
                    start_chunk,
                    end_chunk,
                    total,
                    duration
                );
            }

            for (j, &inc) in region_incs.iter().enumerate() {
                if j == 0 && phase_reset {
                    increments.push(-inc);
                } else {
                    increments.push(inc);
                }
            }

            tracing::debug!(
                "Region {}..{} duration {} phase reset {}",
                start_chunk,
                end_chunk,
                duration,
                phase_reset
            );
            regions.push(Region {
                start_chunk,
                end_chunk,
                duration,
                phase_reset,
                increments: region_incs,
            });
        }

        self.last_peaks = peaks;
        self.last_regions = regions;
        increments
    }

    /// Realtime increment for one chunk using the configured increment
    pub fn calculate_single(&mut self, ratio: f64, df: f32) -> i32 {
        self.calculate_single_at(ratio, df, self.increment)
    }

    /// Realtime increment for one chunk analysed at `increment`
    pub fn calculate_single_at(&mut self, ratio: f64, df: f32, increment: usize) -> i32 {
        let increment = if increment == 0 { self.increment } else { increment };
        let inc = increment as f64;

        let threshold = if ratio > 1.0 {
            self.thresholds.expanding
        } else {
            self.thresholds.compressing
        };
        let is_transient = self.use_hard_peaks
            && df > self.prev_df * self.thresholds.rise
            && df > threshold;
        self.prev_df = df;

        let ratio_changed = ratio != self.prev_ratio;
        self.prev_ratio = ratio;

        let recovery_chunks = (self.sample_rate as f64 / 10.0) / inc;

        if is_transient && self.transient_amnesty == 0 {
            tracing::trace!("Transient at df {}, divergence {}", df, self.divergence);
            self.divergence += inc - inc * ratio;
            self.transient_amnesty = self.amnesty_chunks(increment) as i32;
            self.recovery = self.divergence / recovery_chunks;
            return -(increment as i32);
        }

        if ratio_changed {
            self.recovery = self.divergence / recovery_chunks;
        }
        if self.transient_amnesty > 0 {
            self.transient_amnesty -= 1;
        }

        let mut incr = lrint(inc * ratio - self.recovery);
        let lo = lrint(inc * ratio / 2.0);
        let hi = lrint(inc * ratio * 2.0);
        if incr < lo {
            incr = lo;
        } else if incr > hi {
            incr = hi;
        }

        let divdiff = inc * ratio - incr as f64;
        let prev_divergence = self.divergence;
        self.divergence -= divdiff;
        // Landing exactly on zero counts as a crossing, or recovery never stops
        if (prev_divergence < 0.0 && self.divergence >= 0.0)
            || (prev_divergence > 0.0 && self.divergence <= 0.0)
        {
            self.recovery = self.divergence / recovery_chunks;
        }

        incr as i32
    }

    /// Three-point moving average, with two-point averages at the edges
    pub fn smooth_df(df: &[f32]) -> Vec<f32> {
        (0..df.len())
            .map(|i| {
                let mut total = df[i];
                let mut count = 1.0f32;
                if i > 0 {
                    total += df[i - 1];
                    count += 1.0;
                }
                if i + 1 < df.len() {
                    total += df[i + 1];
                    count += 1.0;
                }
                total / count
            })
            .collect()
    }

    /// Locate hard and soft peaks in a phase-reset curve
    pub fn find_peaks(&self, raw_df: &[f32]) -> Vec<Peak> {
        let df = Self::smooth_df(raw_df);
        let n = df.len();
        let amnesty = self.amnesty_chunks(self.increment);

        let mut hard_candidates = BTreeSet::new();
        let mut soft_candidates = BTreeSet::new();

        if self.use_hard_peaks {
            let mut prev_hard_peak = 0usize;
            for i in 1..n.saturating_sub(1) {
                if df[i] < 0.1 || df[i] <= df[i - 1] * 1.1 || df[i] < 0.22 {
                    continue;
                }
                if !hard_candidates.is_empty() && i < prev_hard_peak + amnesty {
                    continue;
                }

                let hard = df[i] > 0.4
                    || df[i] > df[i - 1] * 1.4
                    || (i > 1 && df[i] > df[i - 1] * 1.2 && df[i - 1] > df[i - 2] * 1.2)
                    || (i > 2
                        && df[i] > 0.3
                        && df[i - 1] > df[i - 2] * 1.1
                        && df[i - 2] > df[i - 3] * 1.1);
                if !hard {
                    continue;
                }

                let mut location = i;
                if i + 1 < raw_df.len() && raw_df[i + 1] > raw_df[i] * 1.4 {
                    location += 1;
                }
                tracing::debug!("Hard peak at chunk {} (df {})", location, df[i]);
                hard_candidates.insert(location);
                prev_hard_peak = location;
            }
        }

        let median_max = ((self.sample_rate as f64 / self.increment as f64).ceil() as usize).max(7);
        let mut window: VecDeque<f32> = VecDeque::with_capacity(median_max + 1);
        let mut sorted: Vec<f32> = Vec::with_capacity(median_max);
        window.extend(std::iter::repeat(0.0).take(median_max / 2));
        window.extend(df.iter().take(median_max / 2).copied());

        let mut soft_amnesty = 0usize;
        let mut last_soft_peak = 0usize;

        for i in 0..n {
            let median_size = median_max.min(window.len());
            let middle = (median_max / 2).min(median_size.saturating_sub(1));
            let next_df = i + median_size - middle;

            if median_size >= 2 {
                sorted.clear();
                sorted.extend(window.iter().take(median_size).copied());
                sorted.sort_by(|a, b| a.total_cmp(b));

                let mut index = (sorted.len() * 90 / 100).min(sorted.len() - 1);
                if index == sorted.len() - 1 && index > 0 {
                    index -= 1;
                }
                let thresh = sorted[index];

                let centre = window[middle];
                let left = window.get(middle.wrapping_sub(1)).copied().unwrap_or(0.0);
                let right = window.get(middle + 1).copied().unwrap_or(0.0);

                if centre > thresh && centre > left && centre > right && soft_amnesty == 0 {
                    let mut max_index = middle;
                    let mut max_value = centre;
                    for j in middle + 1..median_size {
                        if window[j] > max_value {
                            max_value = window[j];
                            max_index = j;
                        } else if window[j] < centre {
                            break;
                        }
                    }

                    let peak = i + max_index - middle;
                    if soft_candidates.is_empty() || last_soft_peak != peak {
                        if peak < n {
                            tracing::trace!("Soft peak at chunk {}", peak);
                            soft_candidates.insert(peak);
                        }
                        last_soft_peak = peak;
                    }
                    soft_amnesty = amnesty + max_index - middle;
                } else if soft_amnesty > 0 {
                    soft_amnesty -= 1;
                }
            }

            if median_size >= median_max {
                window.pop_front();
            }
            window.push_back(df.get(next_df).copied().unwrap_or(0.0));
        }

        let mut peaks: Vec<Peak> = Vec::new();
        loop {
            let hard = hard_candidates.first().copied();
            let soft = soft_candidates.first().copied();

            let take_hard = match (hard, soft) {
                (None, None) => break,
                (Some(h), Some(s)) => h <= s,
                (Some(_), None) => true,
                (None, Some(_)) => false,
            };

            let (peak, ignore) = match (take_hard, hard, soft) {
                (true, Some(h), _) => {
                    hard_candidates.remove(&h);
                    (Peak { chunk: h, hard: true }, false)
                }
                (_, _, Some(s)) => {
                    let ignore = peaks
                        .last()
                        .map_or(false, |last| last.hard && last.chunk + 3 >= s);
                    (Peak { chunk: s, hard: false }, ignore)
                }
                _ => break,
            };

            if soft == Some(peak.chunk) {
                soft_candidates.remove(&peak.chunk);
            }
            if !ignore {
                peaks.push(peak);
            }
        }

        peaks
    }

    /// Displacements of each chunk below the curve maximum, widened by `adj`
    pub fn calculate_displacements(df: &[f32], adj: f64) -> Displacements {
        let max_df = df.iter().fold(f32::MIN, |m, &v| m.max(v)) as f64;
        let mut out = Displacements {
            max_df,
            total: 0.0,
            min: 0.0,
            max: 0.0,
        };
        for (i, &v) in df.iter().enumerate() {
            let mut displacement = max_df - v as f64;
            if displacement < 0.0 {
                displacement -= adj;
            } else {
                displacement += adj;
            }
            out.total += displacement;
            if i == 0 || displacement > out.max {
                out.max = displacement;
            }
            if i == 0 || displacement < out.min {
                out.min = displacement;
            }
        }
        out
    }

    /// Range an increment must stay within for `ratio`
    pub fn increment_bounds(&self, ratio: f64) -> (f64, f64) {
        let nominal = self.increment as f64 * ratio;
        if ratio < 1.0 {
            (nominal.ceil() / 2.0, nominal.ceil())
        } else {
            (nominal.floor(), nominal * 2.0)
        }
    }

    /// Share `duration` output samples over the chunks of one region
    pub fn distribute_region(
        &self,
        df_in: &[f32],
        duration: i64,
        ratio: f64,
        phase_reset: bool,
    ) -> Vec<i32> {
        if df_in.is_empty() {
            return Vec::new();
        }
        let inc = self.increment as f64;
        let mut df = df_in.to_vec();
        let len = df.len();

        // A stretch-curve peak trailing the region start would pull the
        // stretch toward the transient, so hold the curve flat until it falls
        for i in 1..len / 2 {
            if df[i] < df[i - 1] {
                let hold = df[i - 1];
                df[..i - 1].fill(hold);
                break;
            }
        }

        // Taper the last tenth of a second back toward the maximum
        let max_df = df.iter().fold(f32::MIN, |m, &v| m.max(v));
        let reduced = (lrint(0.1 * self.sample_rate as f64 / inc).max(0) as usize).min(len / 5);
        for i in 0..reduced {
            let index = len - reduced + i;
            df[index] += (max_df - df[index]) * i as f32 / reduced as f32;
        }

        let mut to_allot = duration - (self.increment * len) as i64;

        let (lo, hi) = self.increment_bounds(ratio);
        let mut adj = 0.0f64;
        let mut step = 0.0f64;
        let mut iterations = 0;
        let settled = loop {
            let d = Self::calculate_displacements(&df, adj);

            if d.total == 0.0 && adj == 0.0 {
                adj = 1.0;
                continue;
            }
            if d.total == 0.0 {
                break None;
            }

            // Unrounded extremes, kept a sample clear of the bounds so the
            // rounded allotments land inside them
            let spread = to_allot as f64 * (d.max - d.min) / d.total;
            let at_max = inc + to_allot as f64 * d.max / d.total;
            let at_min = inc + to_allot as f64 * d.min / d.total;
            let (smallest, largest) = if at_max < at_min {
                (at_max, at_min)
            } else {
                (at_min, at_max)
            };
            if smallest >= lo + 1.0 && largest <= hi - 1.0 {
                break Some((d.total, d.max_df));
            }

            // Within half a sample of flat there is nothing left to adjust
            if spread.abs() < 0.5 {
                break None;
            }

            iterations += 1;
            if iterations >= self.max_adjust_iterations {
                tracing::warn!(
                    "Increments {:.1}..{:.1} still outside {:.1}..{:.1} after {} adjustments",
                    smallest,
                    largest,
                    lo,
                    hi,
                    iterations
                );
                break None;
            }

            if step == 0.0 {
                step = if d.max_df > 0.0 { d.max_df / 10.0 } else { 1.0 };
            } else if iterations > 10 {
                step *= 2.0;
            }
            adj += step;
        };

        // Flat curve when the shape cannot be kept within bounds
        let (mut total_displacement, max_df_adj) = match settled {
            Some(found) => found,
            None => {
                tracing::debug!("Distributing {} chunks evenly", len);
                let flat = df.iter().fold(f32::MIN, |m, &v| m.max(v));
                df.fill(flat);
                adj = 1.0;
                (len as f64, flat as f64)
            }
        };

        let mut increments = Vec::with_capacity(len);
        for (i, &v) in df.iter().enumerate() {
            let mut displacement = max_df_adj - v as f64;
            if displacement < 0.0 {
                displacement -= adj;
            } else {
                displacement += adj;
            }

            if i == 0 && phase_reset {
                if len == 1 {
                    increments.push(duration as i32);
                    to_allot = 0;
                } else {
                    increments.push(self.increment as i32);
                }
                total_displacement -= displacement;
                continue;
            }

            let mut allotment = if total_displacement != 0.0 {
                lrint(to_allot as f64 * displacement / total_displacement)
            } else {
                0
            };
            if i + 1 == len {
                allotment = to_allot;
            }

            let mut increment = self.increment as i64 + allotment;
            if increment <= 0 {
                tracing::warn!("Non-positive increment {} clamped to zero", increment);
                increment = 0;
                allotment = -(self.increment as i64);
            }

            increments.push(increment as i32);
            to_allot -= allotment;
            total_displacement -= displacement;
        }

        increments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: usize = 44100;
    const INC: usize = 256;

    fn wobbly_df(n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| 0.5 + 0.4 * ((i as f32) * 0.3).sin())
            .collect()
    }

    #[test]
    fn test_smooth_df() {
        let s = StretchCalculator::smooth_df(&[0.0, 3.0, 0.0, 6.0]);
        assert_eq!(s, vec![1.5, 1.0, 3.0, 3.0]);
        assert!(StretchCalculator::smooth_df(&[]).is_empty());
    }

    #[test]
    fn test_total_matches_output_duration() {
        for ratio in [0.5, 0.8, 1.0, 1.5, 2.0, 3.7] {
            let mut calc = StretchCalculator::new(SR, INC, true);
            let n = 400;
            let df = wobbly_df(n);
            let incs = calc.calculate(ratio, n * INC, &vec![0.0; n], &df);
            assert_eq!(incs.len(), n);
            let total: i64 = incs.iter().map(|&v| v.unsigned_abs() as i64).sum();
            assert_eq!(total, lrint((n * INC) as f64 * ratio));
        }
    }

    #[test]
    fn test_region_sums_match_durations() {
        let mut calc = StretchCalculator::new(SR, INC, true);
        let n = 600;
        let mut reset_df = vec![0.0f32; n];
        reset_df[100] = 0.9;
        reset_df[350] = 0.9;
        let stretch_df = wobbly_df(n);
        calc.calculate(1.6, n * INC, &reset_df, &stretch_df);

        let regions = calc.last_regions();
        assert_eq!(regions.len(), calc.last_calculated_peaks().len() + 1);
        for region in regions {
            let sum: i64 = region.increments.iter().map(|&v| v as i64).sum();
            assert_eq!(sum, region.duration, "region {:?}", region.start_chunk);
        }
    }

    #[test]
    fn test_hard_peak_found_and_reset() {
        let mut calc = StretchCalculator::new(SR, INC, true);
        let n = 100;
        let mut reset_df = vec![0.0f32; n];
        reset_df[50] = 0.9;
        let incs = calc.calculate(1.5, n * INC, &reset_df, &vec![0.0; n]);

        assert_eq!(calc.last_calculated_peaks(), &[Peak { chunk: 50, hard: true }]);
        assert!(incs[50] < 0);
        assert_eq!(incs.iter().filter(|&&v| v < 0).count(), 1);
    }

    #[test]
    fn test_no_hard_peaks_when_disabled() {
        let mut calc = StretchCalculator::new(SR, INC, false);
        let n = 100;
        let mut reset_df = vec![0.0f32; n];
        reset_df[50] = 0.9;
        let incs = calc.calculate(1.5, n * INC, &reset_df, &vec![0.0; n]);
        assert!(incs.iter().all(|&v| v >= 0));
        assert!(calc.last_calculated_peaks().iter().all(|p| !p.hard));
    }

    #[test]
    fn test_increments_within_bounds() {
        for ratio in [0.6, 1.0, 1.4, 2.5] {
            let calc = StretchCalculator::new(SR, INC, true);
            let df = wobbly_df(300);
            let duration = lrint(300.0 * INC as f64 * ratio);
            let incs = calc.distribute_region(&df, duration, ratio, false);
            let (lo, hi) = calc.increment_bounds(ratio);
            for &v in &incs {
                assert!(
                    v as f64 >= lo && v as f64 <= hi,
                    "ratio {} increment {} outside {}..{}",
                    ratio,
                    v,
                    lo,
                    hi
                );
            }
            assert_eq!(incs.iter().map(|&v| v as i64).sum::<i64>(), duration);
        }
    }

    #[test]
    fn test_curve_peak_chunk_not_starved_when_expanding() {
        let calc = StretchCalculator::new(SR, INC, true);
        let mut df = vec![0.1f32; 200];
        df[60] = 0.9;
        let ratio = 2.5;
        let duration = lrint(200.0 * INC as f64 * ratio);
        let incs = calc.distribute_region(&df, duration, ratio, false);
        assert!(incs[60] >= 640, "increment {} at the curve peak", incs[60]);
        assert_eq!(incs.iter().map(|&v| v as i64).sum::<i64>(), duration);
    }

    #[test]
    fn test_fractional_nominal_increment_in_bounds() {
        let calc = StretchCalculator::new(SR, INC, true);
        let df = wobbly_df(300);
        let ratio = 1.7;
        let duration = lrint(300.0 * INC as f64 * ratio);
        let incs = calc.distribute_region(&df, duration, ratio, false);
        let (lo, hi) = calc.increment_bounds(ratio);
        assert!(incs.iter().all(|&v| v as f64 >= lo && v as f64 <= hi));
        assert_eq!(incs.iter().map(|&v| v as i64).sum::<i64>(), duration);
    }

    #[test]
    fn test_bounds_per_direction() {
        let calc = StretchCalculator::new(SR, INC, true);
        assert_eq!(calc.increment_bounds(0.6), (77.0, 154.0));
        assert_eq!(calc.increment_bounds(2.0), (512.0, 1024.0));
    }

    #[test]
    fn test_flat_curve_distributes_evenly() {
        let calc = StretchCalculator::new(SR, INC, true);
        let incs = calc.distribute_region(&vec![0.0; 50], 50 * 512, 2.0, false);
        assert!(incs.iter().all(|&v| v == 512));
    }

    #[test]
    fn test_single_chunk_phase_reset_region() {
        let calc = StretchCalculator::new(SR, INC, true);
        assert_eq!(calc.distribute_region(&[0.3], 700, 2.0, true), vec![700]);
        let incs = calc.distribute_region(&[0.3, 0.3, 0.3], 1536, 2.0, true);
        assert_eq!(incs[0], INC as i32);
        assert_eq!(incs.iter().sum::<i32>(), 1536);
    }

    #[test]
    fn test_adversarial_curves_terminate() {
        let calc = StretchCalculator::new(SR, INC, true);
        let zero = calc.distribute_region(&vec![0.0; 10], 10 * 100, 0.4, false);
        assert_eq!(zero.iter().sum::<i32>(), 1000);

        let mut spike = vec![0.0f32; 40];
        spike[20] = 100.0;
        let incs = calc.distribute_region(&spike, 40 * 2000, 7.8, false);
        assert_eq!(incs.iter().map(|&v| v as i64).sum::<i64>(), 80_000);

        let mut capped = StretchCalculator::new(SR, INC, true);
        capped.set_max_adjust_iterations(3);
        let incs = capped.distribute_region(&spike, 40 * 10, 0.04, false);
        assert_eq!(incs.len(), 40);
    }

    #[test]
    fn test_empty_input() {
        let mut calc = StretchCalculator::new(SR, INC, true);
        assert!(calc.calculate(2.0, 0, &[], &[]).is_empty());
        assert!(calc.distribute_region(&[], 0, 2.0, false).is_empty());
    }

    #[test]
    fn test_single_transient_resets_and_recovers() {
        let mut calc = StretchCalculator::new(SR, INC, true);
        assert_eq!(calc.calculate_single(2.0, 0.0), 512);
        assert_eq!(calc.calculate_single(2.0, 0.9), -(INC as i32));
        assert!(calc.divergence() < 0.0);

        // Following increments run long until the deficit is repaid
        let next = calc.calculate_single(2.0, 0.0);
        assert!(next > 512);
        for _ in 0..200 {
            calc.calculate_single(2.0, 0.0);
        }
        assert!(calc.divergence().abs() < 2.0);
    }

    #[test]
    fn test_divergence_stays_bounded() {
        let mut calc = StretchCalculator::new(SR, INC, true);
        let ratio = 1.5;
        let mut produced = 0i64;
        let steps = 5000;
        for i in 0..steps {
            let df = if i % 7 == 0 { 0.9 } else { 0.05 };
            produced += calc.calculate_single(ratio, df).unsigned_abs() as i64;
            assert!(calc.divergence().abs() < 10.0 * INC as f64 * ratio);
        }
        let nominal = (steps * INC) as f64 * ratio;
        assert!((produced as f64 - nominal).abs() < 10.0 * INC as f64 * ratio);
    }

    #[test]
    fn test_transients_ignored_without_hard_peaks() {
        let mut calc = StretchCalculator::new(SR, INC, false);
        calc.calculate_single(1.0, 0.0);
        assert_eq!(calc.calculate_single(1.0, 0.9), INC as i32);
        assert_eq!(calc.divergence(), 0.0);
    }

    #[test]
    fn test_reset_clears_divergence() {
        let mut calc = StretchCalculator::new(SR, INC, true);
        calc.calculate_single(2.0, 0.0);
        calc.calculate_single(2.0, 0.9);
        calc.reset();
        assert_eq!(calc.divergence(), 0.0);
    }
}
