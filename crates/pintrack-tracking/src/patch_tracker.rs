//! One marker, one frame: the unit of work of a tracking session.
//!
//! Markers live in top-down coordinates while the alignment engine works
//! bottom-up, so every conversion below flips `y` against the format height
//! on the way in and again on the way out.

use crate::accessor::FrameCache;
use crate::config::TrackerSettings;
use crate::marker::{Marker, MarkerHandle};
use crate::region::{release_thread_scratch, MotionModel, RegionOptions, Termination};
use crate::registry::{MarkerRegistry, RegionMarker, SampleSource};
use pintrack_core::{invert_y, FrameTime, Point, RectD};
use thiserror::Error;
use tracing::debug;

/// Shared state borrowed by every step of a session.
pub struct StepContext<'a> {
    pub registry: &'a MarkerRegistry,
    pub cache: &'a FrameCache,
    pub settings: &'a TrackerSettings,
    pub start_frame: FrameTime,
    pub step: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// User keyframe or session start; the pose was asserted as is.
    Keyframe,
    Tracked { correlation: f64 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FailureReason {
    #[error("alignment failed: {0:?}")]
    Alignment(Termination),

    #[error("no channel enabled for this marker")]
    NoChannels,

    #[error("{0}")]
    Engine(String),
}

/// A marker that could not be tracked to a frame.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("track {track} failed at frame {frame}: {reason}")]
pub struct TrackFailure {
    pub track: usize,
    pub frame: FrameTime,
    pub reason: FailureReason,
}

/// Alignment options for a marker under the session settings.
pub fn region_options(settings: &TrackerSettings, mode: MotionModel) -> RegionOptions {
    RegionOptions {
        mode,
        minimum_correlation: settings.minimum_correlation(),
        max_iterations: settings.max_iterations,
        use_brute_initialization: settings.brute_force_pre_track,
        use_normalized_intensities: settings.normalized_intensities,
        sigma: settings.pre_blur_sigma,
    }
}

#[inline]
fn flip(p: Point, height: f64) -> Point {
    Point::new(p.x, invert_y(p.y, height))
}

fn flip_rect(rect: RectD, height: f64) -> RectD {
    RectD::from_corners(flip(rect.min(), height), flip(rect.max(), height))
}

/// Engine view of `marker` at `time`.
///
/// Center, offset and pattern are read at `time`; the search window is read
/// at `search_time`.
pub fn to_region_marker(
    marker: &Marker,
    track: usize,
    time: FrameTime,
    search_time: FrameTime,
    reference_frame: FrameTime,
    source: SampleSource,
    height: f64,
) -> RegionMarker {
    let center = marker.center_at(time);
    let origin = center + marker.offset_at(time);
    let patch = marker
        .pattern_at(time)
        .translate(origin)
        .map(|p| flip(p, height));
    let search = marker.search_window_at(search_time).translate(origin);
    RegionMarker {
        track,
        frame: time,
        reference_frame,
        source,
        channels: marker.channels,
        center: flip(center, height),
        patch,
        search_region: flip_rect(search, height),
    }
}

/// Store an engine marker on `marker` at its frame.
pub fn write_back(marker: &mut Marker, engine: &RegionMarker, error: f64, height: f64) {
    let time = engine.frame;
    let center = flip(engine.center, height);
    let origin = center + marker.offset_at(time);
    let pattern = engine.patch.map(|p| flip(p, height) - origin);
    let search = flip_rect(engine.search_region, height).translate(-origin);
    marker.set_pose(time, center, &pattern, search, error);
}

/// Track marker `track` to `time`.
///
/// Thread-local alignment buffers are released before returning.
pub fn track_step(
    ctx: &StepContext<'_>,
    track: usize,
    handle: &MarkerHandle,
    time: FrameTime,
) -> Result<StepOutcome, TrackFailure> {
    let outcome = run_step(ctx, track, handle, time);
    release_thread_scratch();
    outcome
}

fn run_step(
    ctx: &StepContext<'_>,
    track: usize,
    handle: &MarkerHandle,
    time: FrameTime,
) -> Result<StepOutcome, TrackFailure> {
    let fail = |reason| TrackFailure {
        track,
        frame: time,
        reason,
    };
    let height = ctx.cache.height();

    let (tracked, reference, mode) = {
        let marker = handle.read();
        let channels = ctx.settings.channels.intersect(marker.channels);
        if channels.is_empty() {
            return Err(fail(FailureReason::NoChannels));
        }
        let reference_frame = marker.reference_frame(time, ctx.step);
        let manual = marker.is_user_keyframe(time) || time == ctx.start_frame;
        let (source, search_time) = if manual {
            (SampleSource::Manual, time)
        } else {
            (SampleSource::Tracked, reference_frame)
        };
        let mut tracked = to_region_marker(
            &marker,
            track,
            time,
            search_time,
            reference_frame,
            source,
            height,
        );
        tracked.channels = channels;

        let reference = (!manual).then(|| {
            let reference_source = if marker.is_user_keyframe(reference_frame) {
                SampleSource::Manual
            } else {
                SampleSource::Tracked
            };
            let mut reference = to_region_marker(
                &marker,
                track,
                reference_frame,
                reference_frame,
                marker.reference_frame(reference_frame, ctx.step),
                reference_source,
                height,
            );
            reference.channels = channels;
            reference
        });
        (tracked, reference, marker.motion_model)
    };

    ctx.registry.add_marker(tracked);

    let Some(reference) = reference else {
        write_back(&mut handle.write(), &tracked, 0.0, height);
        debug!(track, frame = time, "Keyframe asserted");
        return Ok(StepOutcome::Keyframe);
    };
    ctx.registry.add_marker(reference);

    let options = region_options(ctx.settings, mode);
    let (updated, result) = ctx
        .registry
        .track_marker(&tracked, &options, ctx.cache)
        .map_err(|e| fail(FailureReason::Engine(e.to_string())))?;
    if !result.is_usable() {
        debug!(
            track,
            frame = time,
            termination = ?result.termination,
            correlation = result.correlation,
            "Tracking failed"
        );
        return Err(fail(FailureReason::Alignment(result.termination)));
    }

    // A NaN correlation counts as a perfect match.
    let correlation = if result.correlation.is_nan() {
        1.0
    } else {
        result.correlation
    };
    ctx.registry.add_marker(updated);
    write_back(&mut handle.write(), &updated, 1.0 - correlation, height);
    debug!(
        track,
        frame = time,
        reference = tracked.reference_frame,
        correlation,
        iterations = result.iterations,
        "Tracked"
    );
    Ok(StepOutcome::Tracked { correlation })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::ImageSource;
    use crate::region::thread_scratch_bytes;
    use crate::synthetic::SyntheticSource;
    use std::sync::Arc;

    fn source() -> Arc<dyn ImageSource> {
        Arc::new(
            SyntheticSource::new(96, 80).with_blob(Point::new(40.0, 30.0), Point::new(2.0, 1.0), 3.0),
        )
    }

    fn marker_at(center: Point) -> MarkerHandle {
        let mut marker = Marker::new("m", center)
            .with_pattern_half_size(8.0)
            .with_search_half_size(20.0);
        marker.set_user_keyframe(0, center);
        marker.into_handle()
    }

    #[test]
    fn test_engine_conversion_flips_and_restores() {
        let mut marker = Marker::new("m", Point::new(10.0, 5.0)).with_pattern_half_size(2.0);
        marker.offset.set(0, Point::new(1.0, 0.0));
        let engine = to_region_marker(&marker, 3, 0, 0, -1, SampleSource::Manual, 20.0);
        assert_eq!(engine.center, Point::new(10.0, 14.0));
        // Top-left corner of the pattern becomes the lowest bottom-up corner
        assert_eq!(engine.patch.0[0], Point::new(9.0, 16.0));
        assert_eq!(engine.search_region.y1, invert_y(5.0 + 25.0, 20.0));

        let before = marker.clone();
        write_back(&mut marker, &engine, 0.0, 20.0);
        assert!(marker.center_at(0).distance(before.center_at(0)) < 1e-9);
        for (a, b) in marker.pattern_at(0).0.iter().zip(before.pattern_at(0).0.iter()) {
            assert!(a.distance(*b) < 1e-9);
        }
        let (sa, sb) = (marker.search_window_at(0), before.search_window_at(0));
        assert!((sa.x1 - sb.x1).abs() < 1e-9 && (sa.y2 - sb.y2).abs() < 1e-9);
    }

    #[test]
    fn test_tracks_forward_one_frame() {
        let cache = FrameCache::new(source());
        let registry = MarkerRegistry::new();
        let settings = TrackerSettings::default();
        let ctx = StepContext {
            registry: &registry,
            cache: &cache,
            settings: &settings,
            start_frame: 0,
            step: 1,
        };
        let handle = marker_at(Point::new(40.0, 30.0));

        assert_eq!(track_step(&ctx, 0, &handle, 0), Ok(StepOutcome::Keyframe));
        let outcome = track_step(&ctx, 0, &handle, 1).unwrap();
        assert!(matches!(outcome, StepOutcome::Tracked { correlation } if correlation > 0.95));

        let marker = handle.read();
        assert!(marker.center_at(1).distance(Point::new(42.0, 31.0)) < 0.1);
        assert_eq!(marker.sample_source(1), Some(SampleSource::Tracked));
        assert!(marker.error_at(1) < 0.05);
        assert_eq!(registry.get_marker(0, 1).map(|m| m.source), Some(SampleSource::Tracked));
    }

    #[test]
    fn test_flat_patch_counts_as_perfect_match() {
        let flat: Arc<dyn ImageSource> = Arc::new(SyntheticSource::new(96, 80));
        let cache = FrameCache::new(flat);
        let registry = MarkerRegistry::new();
        let settings = TrackerSettings::default();
        let ctx = StepContext {
            registry: &registry,
            cache: &cache,
            settings: &settings,
            start_frame: 0,
            step: 1,
        };
        let handle = marker_at(Point::new(40.0, 30.0));

        track_step(&ctx, 0, &handle, 0).unwrap();
        assert_eq!(
            track_step(&ctx, 0, &handle, 1),
            Ok(StepOutcome::Tracked { correlation: 1.0 })
        );
        let marker = handle.read();
        assert_eq!(marker.error_at(1), 0.0);
        // Every offset scores the same; the marker stays where it was.
        assert!(marker.center_at(1).distance(Point::new(40.0, 30.0)) < 1e-6);
    }

    #[test]
    fn test_user_keyframe_is_not_aligned() {
        let cache = FrameCache::new(source());
        let registry = MarkerRegistry::new();
        let settings = TrackerSettings::default();
        let ctx = StepContext {
            registry: &registry,
            cache: &cache,
            settings: &settings,
            start_frame: 0,
            step: 1,
        };
        let handle = marker_at(Point::new(40.0, 30.0));
        // Deliberately wrong position: a keyframe must be kept as authored.
        handle.write().set_user_keyframe(3, Point::new(55.0, 50.0));
        handle.write().error.set(3, 0.7);

        assert_eq!(track_step(&ctx, 0, &handle, 3), Ok(StepOutcome::Keyframe));
        let marker = handle.read();
        assert!(marker.center_at(3).distance(Point::new(55.0, 50.0)) < 1e-9);
        assert_eq!(marker.error_at(3), 0.0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_failure_carries_track_and_frame() {
        let cache = FrameCache::new(source());
        let registry = MarkerRegistry::new();
        let settings = TrackerSettings::default();
        let ctx = StepContext {
            registry: &registry,
            cache: &cache,
            settings: &settings,
            start_frame: 0,
            step: 1,
        };
        // Pattern hangs off the left edge of the frame.
        let handle = marker_at(Point::new(3.0, 30.0));
        track_step(&ctx, 7, &handle, 0).unwrap();
        let failure = track_step(&ctx, 7, &handle, 1).unwrap_err();
        assert_eq!(failure.track, 7);
        assert_eq!(failure.frame, 1);
        assert_eq!(
            failure.reason,
            FailureReason::Alignment(Termination::SourceOutOfBounds)
        );
        assert!(!handle.read().center.has_key(1));
    }

    #[test]
    fn test_step_releases_scratch() {
        let cache = FrameCache::new(source());
        let registry = MarkerRegistry::new();
        let settings = TrackerSettings::default();
        let ctx = StepContext {
            registry: &registry,
            cache: &cache,
            settings: &settings,
            start_frame: 0,
            step: 1,
        };
        let handle = marker_at(Point::new(40.0, 30.0));
        track_step(&ctx, 0, &handle, 0).unwrap();
        track_step(&ctx, 0, &handle, 1).unwrap();
        assert_eq!(thread_scratch_bytes(), 0);
    }
}
