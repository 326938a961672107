//! Correspondence extraction from marker trajectories.

use crate::marker::Marker;
use crate::smoothing::half_window;
use pintrack_core::{FrameTime, Point};
use serde::{Deserialize, Serialize};

/// What to do with the high-frequency part of each trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JitterMode {
    /// Replace each position by its window mean.
    #[default]
    Remove,
    /// Push each position further from its window mean, doubling the
    /// high-frequency residual.
    Add,
}

/// One marker seen at the reference time and at the target time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub reference: Point,
    pub target: Point,
    /// Tracking error of the marker at the target time.
    pub error: f64,
}

/// Split correspondences into reference and target point lists.
pub fn split(points: &[Correspondence]) -> (Vec<Point>, Vec<Point>) {
    points.iter().map(|c| (c.reference, c.target)).unzip()
}

/// Centre position of `marker` around `time` under the jitter window.
fn windowed_center(marker: &Marker, time: FrameTime, half: usize, mode: JitterMode) -> Point {
    let at_time = marker.center_at(time);
    if half == 0 {
        return at_time;
    }
    let half = half as FrameTime;
    let (sum, count) = (time - half..=time + half)
        .filter(|t| marker.center.has_key(*t))
        .fold((Point::ZERO, 0usize), |(sum, n), t| {
            (sum + marker.center_at(t), n + 1)
        });
    // No sample inside the window: nothing to average against.
    if count == 0 {
        return at_time;
    }
    let average = sum / count as f64;
    match mode {
        JitterMode::Remove => average,
        JitterMode::Add => at_time + (at_time - average),
    }
}

/// Correspondences between `reference_time` and `time` for every marker
/// that has a sample at `time`, most confident first.
///
/// A jitter `period` of 1 or less uses raw positions.
pub fn extract_sorted_points<'a, I>(
    markers: I,
    reference_time: FrameTime,
    time: FrameTime,
    period: i32,
    mode: JitterMode,
) -> Vec<Correspondence>
where
    I: IntoIterator<Item = &'a Marker>,
{
    let half = half_window(period);
    let mut points: Vec<Correspondence> = markers
        .into_iter()
        .filter(|m| m.center.has_key(time))
        .map(|m| Correspondence {
            reference: windowed_center(m, reference_time, half, mode),
            target: windowed_center(m, time, half, mode),
            error: m.error_at(time),
        })
        .collect();
    points.sort_by(|a, b| a.error.total_cmp(&b.error));
    points
}
