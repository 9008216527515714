//! Rounding and phase helpers shared by the stretch pipeline

use std::f64::consts::PI;

/// Round to nearest, ties to even
#[inline]
pub fn lrint(x: f64) -> i64 {
    x.round_ties_even() as i64
}

/// Wrap a phase into (-pi, pi]
#[inline]
pub fn princarg(a: f64) -> f64 {
    let wrapped = (a + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped == -PI {
        PI
    } else {
        wrapped
    }
}

/// Smallest power of two at or above `n` (1 for 0)
#[inline]
pub fn round_up(n: usize) -> usize {
    n.max(1).next_power_of_two()
}
