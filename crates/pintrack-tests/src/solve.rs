//! Curve solving from marker trajectories.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use pintrack_core::{apply_homography, DMat3, DVec2, FrameTime, Point};
use pintrack_tracking::kernels::translation_from_one_point;
use pintrack_tracking::{
    compute_corner_pin_at_time, CurveSolver, ImageSource, JitterMode, Marker, MarkerHandle,
    ParameterSink, ProgressSink, ProsacConfig, SolveOutcome, SolveRequest, SolvedCurves,
    SolverSettings, SyntheticSource,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Marker keyed at every frame of `0..=last`.
fn marker_along(path: impl Fn(FrameTime) -> Point, last: FrameTime) -> Marker {
    let mut marker = Marker::new("m", path(0));
    for t in 0..=last {
        let pattern = marker.pattern_at(t);
        let search = marker.search_window_at(t);
        marker.set_pose(t, path(t), &pattern, search, 0.0);
    }
    marker
}

fn static_markers(points: &[Point]) -> Vec<Marker> {
    points.iter().map(|p| marker_along(|_| *p, 0)).collect()
}

#[test]
fn test_unit_square_corner_pin_is_identity() {
    let markers = static_markers(&[
        Point::new(0.0, 0.0),
        Point::new(1.0, 0.0),
        Point::new(1.0, 1.0),
        Point::new(0.0, 1.0),
    ]);
    let sample =
        compute_corner_pin_at_time(&markers, 0, 0, 0, JitterMode::Remove, &ProsacConfig::default())
            .unwrap();
    assert_eq!(sample.enabled_points, 4);
    let h = sample.homography.to_cols_array();
    let identity = DMat3::IDENTITY.to_cols_array();
    for (a, b) in h.iter().zip(identity.iter()) {
        assert!((a - b).abs() < 1e-9);
    }
}

#[test]
fn test_single_marker_corner_pin_is_direct_translation() {
    let markers = vec![marker_along(|t| Point::new(40.0 + f64::from(t), 30.0), 6)];
    let sample =
        compute_corner_pin_at_time(&markers, 1, 6, 0, JitterMode::Remove, &ProsacConfig::default())
            .unwrap();
    assert_eq!(sample.enabled_points, 1);
    assert_eq!(
        sample.homography,
        translation_from_one_point(Point::new(41.0, 30.0), Point::new(46.0, 30.0))
    );
}

#[test]
fn test_three_markers_fit_exact_affine() {
    // x' = 1.1x + 0.2y + 3, y' = -0.1x + 0.9y - 2 per frame step from 0 to 1
    let affine = |p: Point| Point::new(1.1 * p.x + 0.2 * p.y + 3.0, -0.1 * p.x + 0.9 * p.y - 2.0);
    let origins = [
        Point::new(10.0, 20.0),
        Point::new(90.0, 15.0),
        Point::new(40.0, 80.0),
    ];
    let markers: Vec<Marker> = origins
        .iter()
        .map(|p| {
            let p = *p;
            marker_along(move |t| if t == 0 { p } else { affine(p) }, 1)
        })
        .collect();
    let sample =
        compute_corner_pin_at_time(&markers, 0, 1, 0, JitterMode::Remove, &ProsacConfig::default())
            .unwrap();
    assert_eq!(sample.enabled_points, 3);
    for p in origins {
        let mapped = apply_homography(&sample.homography, p).unwrap();
        assert!(mapped.distance(affine(p)) < 1e-9);
    }
}

/// Blocks the first `start` call until released.
struct FirstStartGate {
    gate: Mutex<Option<Receiver<()>>>,
}

impl ProgressSink for FirstStartGate {
    fn start(&self, _total: usize) {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
    }
}

#[test]
fn test_new_solve_supersedes_the_one_in_flight() {
    let (release, gate) = bounded(1);
    let progress: Arc<dyn ProgressSink> = Arc::new(FirstStartGate {
        gate: Mutex::new(Some(gate)),
    });
    let curves = Arc::new(SolvedCurves::new());
    let parameters: Arc<dyn ParameterSink> = curves.clone();
    let source: Arc<dyn ImageSource> = Arc::new(SyntheticSource::new(200, 100));
    let solver = CurveSolver::with_threads(source, parameters, SolverSettings::default(), 2)
        .unwrap()
        .with_progress(progress);

    let markers: Vec<MarkerHandle> = [Point::new(20.0, 20.0), Point::new(60.0, 40.0)]
        .iter()
        .map(|p| {
            let p = *p;
            marker_along(move |t| p + DVec2::new(2.0 * f64::from(t), 0.0), 4).into_handle()
        })
        .collect();

    let first = solver
        .solve_transform(&markers, SolveRequest::new(0, 0..=4))
        .unwrap();
    let second = solver
        .solve_transform(&markers, SolveRequest::new(2, 0..=4))
        .unwrap();
    release.send(()).unwrap();

    assert_eq!(first.wait().unwrap(), SolveOutcome::Superseded);
    assert_eq!(
        second.wait().unwrap(),
        SolveOutcome::Written {
            solved: 5,
            dropped: 0
        }
    );
    assert_eq!(curves.write_count(), 1);
    let transform = curves.transform().unwrap();
    // Relative to frame 2, not frame 0.
    assert!((transform.translate_x.evaluate(4) - 4.0).abs() < 1e-9);
    assert!((transform.translate_x.evaluate(0) + 4.0).abs() < 1e-9);
    assert!((transform.scale.evaluate(4) - 1.0).abs() < 1e-9);
    assert!(curves.controls_enabled());
}

/// Blocks the first `update` call, announcing it on `reached`, until
/// released. Counts `end` and `report_error` calls.
struct FirstUpdateGate {
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    ends: AtomicUsize,
    errors: AtomicUsize,
}

impl FirstUpdateGate {
    fn new() -> (Arc<Self>, Receiver<()>, Sender<()>) {
        let (reached_tx, reached_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        let sink = Arc::new(Self {
            gate: Mutex::new(Some((reached_tx, release_rx))),
            ends: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
        });
        (sink, reached_rx, release_tx)
    }
}

impl ProgressSink for FirstUpdateGate {
    fn update(&self, _fraction: f64) {
        let gate = self.gate.lock().take();
        if let Some((reached, release)) = gate {
            let _ = reached.send(());
            let _ = release.recv();
        }
    }

    fn end(&self) {
        self.ends.fetch_add(1, Ordering::AcqRel);
    }

    fn report_error(&self, _message: &str) {
        self.errors.fetch_add(1, Ordering::AcqRel);
    }
}

fn gated_solver(gate: &Arc<FirstUpdateGate>) -> (CurveSolver, Arc<SolvedCurves>) {
    let curves = Arc::new(SolvedCurves::new());
    let parameters: Arc<dyn ParameterSink> = curves.clone();
    let progress: Arc<dyn ProgressSink> = gate.clone();
    let source: Arc<dyn ImageSource> = Arc::new(SyntheticSource::new(200, 100));
    let solver = CurveSolver::with_threads(source, parameters, SolverSettings::default(), 2)
        .unwrap()
        .with_progress(progress);
    (solver, curves)
}

fn drifting_markers() -> Vec<MarkerHandle> {
    [Point::new(20.0, 20.0), Point::new(60.0, 40.0)]
        .iter()
        .map(|p| {
            let p = *p;
            marker_along(move |t| p + DVec2::new(2.0 * f64::from(t), 0.0), 4).into_handle()
        })
        .collect()
}

#[test]
fn test_superseded_solve_reports_nothing() {
    let (gate, reached, release) = FirstUpdateGate::new();
    let (solver, curves) = gated_solver(&gate);
    let markers = drifting_markers();

    // No marker has a sample at frame 9, so this keyframe fails to solve.
    let first = solver
        .solve_transform(&markers, SolveRequest::new(0, [9]))
        .unwrap();
    reached.recv().unwrap();
    let second = solver
        .solve_transform(&markers, SolveRequest::new(0, 0..=4))
        .unwrap();
    release.send(()).unwrap();

    assert_eq!(first.wait().unwrap(), SolveOutcome::Superseded);
    assert_eq!(
        second.wait().unwrap(),
        SolveOutcome::Written {
            solved: 5,
            dropped: 0
        }
    );
    assert_eq!(gate.errors.load(Ordering::Acquire), 0);
    // Only the newest solve closes the progress sink.
    assert_eq!(gate.ends.load(Ordering::Acquire), 1);
    assert_eq!(curves.write_count(), 1);
    assert!(curves.controls_enabled());
}

#[test]
fn test_cancelled_handle_writes_nothing() {
    let (gate, reached, release) = FirstUpdateGate::new();
    let (solver, curves) = gated_solver(&gate);
    let markers = drifting_markers();

    let handle = solver
        .solve_corner_pin(&markers, SolveRequest::new(0, [3]))
        .unwrap();
    reached.recv().unwrap();
    handle.cancel();
    release.send(()).unwrap();

    assert_eq!(handle.wait().unwrap(), SolveOutcome::Cancelled);
    assert_eq!(curves.write_count(), 0);
    assert!(curves.corner_pin().is_none());
    assert_eq!(gate.ends.load(Ordering::Acquire), 1);
    assert!(curves.controls_enabled());
}

#[test]
fn test_jitter_removal_smooths_trajectory() {
    let curves = Arc::new(SolvedCurves::new());
    let parameters: Arc<dyn ParameterSink> = curves.clone();
    let source: Arc<dyn ImageSource> = Arc::new(SyntheticSource::new(200, 100));
    let solver =
        CurveSolver::with_threads(source, parameters, SolverSettings::default(), 2).unwrap();

    // Straight motion with a one-frame kick at frame 3.
    let path = |t: FrameTime| {
        let kick = if t == 3 { 3.0 } else { 0.0 };
        Point::new(50.0 + f64::from(t) + kick, 50.0)
    };
    let markers = vec![marker_along(path, 6).into_handle()];
    let outcome = solver
        .solve_transform(
            &markers,
            SolveRequest::new(0, 1..=5).with_jitter(3, JitterMode::Remove),
        )
        .unwrap()
        .wait()
        .unwrap();
    assert!(matches!(outcome, SolveOutcome::Written { solved: 5, .. }));

    let transform = curves.transform().unwrap();
    // Window [2, 4] at frame 3: (52 + 56 + 54) / 3 = 54, minus the averaged
    // reference (50 + 51) / 2.
    assert!((transform.translate_x.evaluate(3) - 3.5).abs() < 1e-9);
}
