//! Symmetric moving-window averages over solved sequences.
//!
//! A window of period `p > 1` spans `p / 2` samples on each side of the
//! sample being smoothed. Past either end of the sequence the edge sample is
//! repeated, so the window always holds `2 * (p / 2) + 1` values.

use pintrack_core::Point;

/// Half-width of the window for `period`, zero when smoothing is off.
pub fn half_window(period: i32) -> usize {
    if period > 1 {
        (period / 2) as usize
    } else {
        0
    }
}

/// Window mean of every element of `values`.
pub fn smooth_values<T>(values: &[T], period: i32) -> Vec<T>
where
    T: Copy + std::ops::Add<Output = T> + std::ops::Mul<f64, Output = T>,
{
    let half = half_window(period);
    if half == 0 || values.is_empty() {
        return values.to_vec();
    }
    let last = values.len() - 1;
    let weight = 1.0 / (2 * half + 1) as f64;
    (0..values.len())
        .map(|i| {
            let mut sum = values[i];
            for k in 1..=half {
                sum = sum + values[i.saturating_sub(k)] + values[(i + k).min(last)];
            }
            sum * weight
        })
        .collect()
}

pub fn smooth_scalars(values: &[f64], period: i32) -> Vec<f64> {
    smooth_values(values, period)
}

pub fn smooth_points(values: &[Point], period: i32) -> Vec<Point> {
    smooth_values(values, period)
}
