//! User-facing track markers.
//!
//! Marker geometry is stored in top-down pixel coordinates. The pattern quad
//! and the search window are relative to `center + offset`.

use crate::region::MotionModel;
use crate::registry::SampleSource;
use parking_lot::RwLock;
use pintrack_core::{ChannelMask, Curve, FrameTime, Interpolation, Point, PointCurve, Quad, RectD};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Markers shared between the caller and tracking workers.
pub type MarkerHandle = Arc<RwLock<Marker>>;

/// How a marker picks the frame it is aligned against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReferencePolicy {
    /// The frame one step back along the direction of travel.
    #[default]
    PreviousFrame,
    /// The closest user keyframe behind the tracked frame.
    NearestKeyframe,
    Fixed(FrameTime),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub name: String,
    pub reference_policy: ReferencePolicy,
    pub motion_model: MotionModel,
    pub channels: ChannelMask,
    pub center: PointCurve,
    pub offset: PointCurve,
    /// Top-left of the search window.
    pub search_min: PointCurve,
    /// Bottom-right of the search window.
    pub search_max: PointCurve,
    /// Top-left, top-right, bottom-right, bottom-left.
    pub pattern: [PointCurve; 4],
    /// `1 - correlation` of each tracked sample.
    pub error: Curve,
    pub enabled: Curve,
    user_keyframes: BTreeSet<FrameTime>,
}

impl Marker {
    pub const DEFAULT_PATTERN_HALF_SIZE: f64 = 15.0;
    pub const DEFAULT_SEARCH_HALF_SIZE: f64 = 25.0;

    /// A marker centered on `center` with default pattern and search sizes.
    pub fn new(name: impl Into<String>, center: Point) -> Self {
        let pattern_half = Self::DEFAULT_PATTERN_HALF_SIZE;
        let search_half = Self::DEFAULT_SEARCH_HALF_SIZE;
        Self {
            name: name.into(),
            reference_policy: ReferencePolicy::default(),
            motion_model: MotionModel::default(),
            channels: ChannelMask::ALL,
            center: PointCurve::with_default(center.x, center.y),
            offset: PointCurve::default(),
            search_min: PointCurve::with_default(-search_half, -search_half),
            search_max: PointCurve::with_default(search_half, search_half),
            pattern: square_pattern(pattern_half),
            error: Curve::new(),
            enabled: Curve::with_default(1.0),
            user_keyframes: BTreeSet::new(),
        }
    }

    pub fn with_pattern_half_size(mut self, half: f64) -> Self {
        self.pattern = square_pattern(half);
        self
    }

    pub fn with_search_half_size(mut self, half: f64) -> Self {
        self.search_min = PointCurve::with_default(-half, -half);
        self.search_max = PointCurve::with_default(half, half);
        self
    }

    pub fn with_motion_model(mut self, model: MotionModel) -> Self {
        self.motion_model = model;
        self
    }

    pub fn with_reference_policy(mut self, policy: ReferencePolicy) -> Self {
        self.reference_policy = policy;
        self
    }

    pub fn with_channels(mut self, channels: ChannelMask) -> Self {
        self.channels = channels;
        self
    }

    /// Wrap into a shared handle.
    pub fn into_handle(self) -> MarkerHandle {
        Arc::new(RwLock::new(self))
    }

    // ── Keyframes ──────────────────────────────────────────────

    /// Author a user keyframe placing the center at `position`.
    pub fn set_user_keyframe(&mut self, time: FrameTime, position: Point) {
        self.center.set(time, position);
        self.user_keyframes.insert(time);
    }

    /// Demote a user keyframe. The center key is kept as a tracked sample.
    pub fn remove_user_keyframe(&mut self, time: FrameTime) -> bool {
        self.user_keyframes.remove(&time)
    }

    pub fn is_user_keyframe(&self, time: FrameTime) -> bool {
        self.user_keyframes.contains(&time)
    }

    pub fn user_keyframes(&self) -> impl Iterator<Item = FrameTime> + '_ {
        self.user_keyframes.iter().copied()
    }

    /// Frames with a center sample that the user did not author.
    pub fn tracked_times(&self) -> Vec<FrameTime> {
        self.center
            .x
            .key_times()
            .filter(|t| self.center.y.has_key(*t) && !self.is_user_keyframe(*t))
            .collect()
    }

    /// Classification of the sample at `time`, if there is one.
    pub fn sample_source(&self, time: FrameTime) -> Option<SampleSource> {
        if self.is_user_keyframe(time) {
            Some(SampleSource::Manual)
        } else if self.center.has_key(time) {
            Some(SampleSource::Tracked)
        } else {
            None
        }
    }

    // ── Evaluation ─────────────────────────────────────────────

    pub fn center_at(&self, time: FrameTime) -> Point {
        self.center.evaluate(time)
    }

    pub fn offset_at(&self, time: FrameTime) -> Point {
        self.offset.evaluate(time)
    }

    /// Pattern corners relative to `center + offset`.
    pub fn pattern_at(&self, time: FrameTime) -> Quad {
        Quad::new([
            self.pattern[0].evaluate(time),
            self.pattern[1].evaluate(time),
            self.pattern[2].evaluate(time),
            self.pattern[3].evaluate(time),
        ])
    }

    /// Search window relative to `center + offset`.
    pub fn search_window_at(&self, time: FrameTime) -> RectD {
        RectD::from_corners(self.search_min.evaluate(time), self.search_max.evaluate(time))
    }

    pub fn error_at(&self, time: FrameTime) -> f64 {
        self.error.evaluate(time)
    }

    pub fn is_enabled(&self, time: FrameTime) -> bool {
        self.enabled.evaluate(time) > 0.5
    }

    /// Enable or disable the marker from `time` on.
    pub fn set_enabled(&mut self, time: FrameTime, enabled: bool) {
        self.enabled
            .set_with(time, if enabled { 1.0 } else { 0.0 }, Interpolation::Hold);
    }

    // ── Write-back ─────────────────────────────────────────────

    /// Store a tracked pose at `time`. Pattern and search window are given
    /// relative to `center + offset`.
    pub fn set_pose(
        &mut self,
        time: FrameTime,
        center: Point,
        pattern: &Quad,
        search_window: RectD,
        error: f64,
    ) {
        self.center.set(time, center);
        for (curve, corner) in self.pattern.iter_mut().zip(pattern.corners()) {
            curve.set(time, *corner);
        }
        self.search_min.set(time, search_window.min());
        self.search_max.set(time, search_window.max());
        self.error.set(time, error);
    }

    /// Frame this marker aligns against when tracking to `time` with `step`.
    pub fn reference_frame(&self, time: FrameTime, step: i32) -> FrameTime {
        match self.reference_policy {
            ReferencePolicy::PreviousFrame => time - step,
            ReferencePolicy::Fixed(frame) => frame,
            ReferencePolicy::NearestKeyframe => {
                let forward = step >= 0;
                let behind = if forward {
                    self.user_keyframes.range(..time).next_back()
                } else {
                    self.user_keyframes.range(time + 1..).next()
                };
                let ahead = if forward {
                    self.user_keyframes.range(time + 1..).next()
                } else {
                    self.user_keyframes.range(..time).next_back()
                };
                behind.or(ahead).copied().unwrap_or(time - step)
            }
        }
    }
}

fn square_pattern(half: f64) -> [PointCurve; 4] {
    [
        PointCurve::with_default(-half, -half),
        PointCurve::with_default(half, -half),
        PointCurve::with_default(half, half),
        PointCurve::with_default(-half, half),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let marker = Marker::new("a", Point::new(50.0, 60.0));
        assert_eq!(marker.center_at(7), Point::new(50.0, 60.0));
        assert_eq!(
            marker.search_window_at(0),
            RectD::new(-25.0, -25.0, 25.0, 25.0)
        );
        assert_eq!(marker.pattern_at(0).0[0], Point::new(-15.0, -15.0));
        assert!(marker.is_enabled(100));
        assert_eq!(marker.sample_source(0), None);
    }

    #[test]
    fn test_keyframe_classification() {
        let mut marker = Marker::new("a", Point::ZERO);
        marker.set_user_keyframe(0, Point::new(1.0, 1.0));
        let pattern = marker.pattern_at(0);
        let search = marker.search_window_at(0);
        marker.set_pose(1, Point::new(2.0, 1.0), &pattern, search, 0.05);
        assert_eq!(marker.sample_source(0), Some(SampleSource::Manual));
        assert_eq!(marker.sample_source(1), Some(SampleSource::Tracked));
        assert_eq!(marker.tracked_times(), vec![1]);
        assert!((marker.error_at(1) - 0.05).abs() < 1e-12);

        assert!(marker.remove_user_keyframe(0));
        assert_eq!(marker.sample_source(0), Some(SampleSource::Tracked));
    }

    #[test]
    fn test_enabled_holds() {
        let mut marker = Marker::new("a", Point::ZERO);
        marker.set_enabled(0, true);
        marker.set_enabled(10, false);
        assert!(marker.is_enabled(9));
        assert!(!marker.is_enabled(10));
        assert!(!marker.is_enabled(50));
    }

    #[test]
    fn test_reference_policies() {
        let mut marker = Marker::new("a", Point::ZERO);
        assert_eq!(marker.reference_frame(5, 1), 4);
        assert_eq!(marker.reference_frame(5, -2), 7);

        marker.reference_policy = ReferencePolicy::Fixed(3);
        assert_eq!(marker.reference_frame(9, 1), 3);

        marker.reference_policy = ReferencePolicy::NearestKeyframe;
        assert_eq!(marker.reference_frame(5, 1), 4);
        marker.set_user_keyframe(2, Point::ZERO);
        marker.set_user_keyframe(8, Point::ZERO);
        assert_eq!(marker.reference_frame(5, 1), 2);
        assert_eq!(marker.reference_frame(5, -1), 8);
        // Nothing behind: fall back to the keyframe ahead
        assert_eq!(marker.reference_frame(1, 1), 2);
        assert_eq!(marker.reference_frame(9, -1), 8);
    }
}
