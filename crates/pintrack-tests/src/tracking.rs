//! End-to-end tracking of synthetic footage.

use pintrack_core::{FrameTime, Point};
use pintrack_tracking::{
    ImageSource, Marker, MarkerHandle, SampleSource, SessionState, SyntheticSource,
    TrackScheduler, TrackerSettings,
};
use std::sync::Arc;

fn drifting_blob() -> Arc<dyn ImageSource> {
    Arc::new(SyntheticSource::new(200, 200).with_blob(
        Point::new(100.0, 100.0),
        Point::new(2.0, 0.0),
        3.0,
    ))
}

fn keyed_marker(center: Point, key: FrameTime) -> MarkerHandle {
    let mut marker = Marker::new("blob", center)
        .with_pattern_half_size(8.0)
        .with_search_half_size(20.0);
    marker.set_user_keyframe(key, center);
    marker.into_handle()
}

fn track(markers: &[MarkerHandle], start: FrameTime, end: FrameTime) -> SessionState {
    let scheduler = TrackScheduler::with_threads(drifting_blob(), TrackerSettings::default(), 2)
        .unwrap();
    scheduler
        .track_sequence(markers.to_vec(), start, end, 1)
        .unwrap()
        .wait()
        .unwrap()
        .state
}

#[test]
fn test_translating_feature_is_followed() {
    let marker = keyed_marker(Point::new(100.0, 100.0), 0);
    assert_eq!(track(&[marker.clone()], 0, 5), SessionState::Completed);

    let marker = marker.read();
    let end = marker.center_at(5);
    assert!(
        end.distance(Point::new(110.0, 100.0)) < 0.25,
        "center at frame 5 was {end}"
    );
    assert_eq!(marker.sample_source(0), Some(SampleSource::Manual));
    for t in 1..=5 {
        assert_eq!(marker.sample_source(t), Some(SampleSource::Tracked), "frame {t}");
        assert!(marker.error_at(t) < 0.2, "frame {t}");
    }
}

#[test]
fn test_user_keyframe_pose_is_kept() {
    let marker = keyed_marker(Point::new(100.0, 100.0), 0);
    let keyed_at_three = Point::new(106.5, 100.25);
    {
        let mut m = marker.write();
        m.set_user_keyframe(3, keyed_at_three);
        m.error.set(3, 0.4);
    }
    let pattern_before = marker.read().pattern_at(3);

    assert_eq!(track(&[marker.clone()], 0, 5), SessionState::Completed);
    let marker = marker.read();
    assert!(marker.center_at(3).distance(keyed_at_three) < 1e-9);
    for (after, before) in marker.pattern_at(3).0.iter().zip(pattern_before.0.iter()) {
        assert!(after.distance(*before) < 1e-6);
    }
    assert_eq!(marker.error_at(3), 0.0);
    assert_eq!(marker.sample_source(3), Some(SampleSource::Manual));
}

#[test]
fn test_tracking_is_deterministic() {
    let a = keyed_marker(Point::new(100.0, 100.0), 0);
    let b = keyed_marker(Point::new(100.0, 100.0), 0);
    track(&[a.clone()], 0, 4);
    track(&[b.clone()], 0, 4);
    let (a, b) = (a.read(), b.read());
    for t in 0..=4 {
        assert_eq!(a.center_at(t), b.center_at(t));
        assert_eq!(a.pattern_at(t), b.pattern_at(t));
    }
}

#[test]
fn test_resumed_session_continues_history() {
    let marker = keyed_marker(Point::new(100.0, 100.0), 0);
    track(&[marker.clone()], 0, 2);
    // Resume from a tracked sample; the start frame is asserted, not re-aligned.
    let at_two = marker.read().center_at(2);
    track(&[marker.clone()], 2, 4);
    let marker = marker.read();
    assert!(marker.center_at(2).distance(at_two) < 1e-9);
    assert!(marker.center_at(4).distance(Point::new(108.0, 100.0)) < 0.3);
}
