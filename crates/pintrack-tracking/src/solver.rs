//! Solving animation curves from tracked markers.
//!
//! A solve maps every requested keyframe to a model fitted between the
//! reference time and that keyframe, smooths the resulting sequence and
//! hands the curves to a [`ParameterSink`]. Transform and corner-pin solves
//! run in independent slots; a new request cancels the one in flight for the
//! same target.

use crate::accessor::ImageSource;
use crate::config::{ProsacConfig, SolverSettings};
use crate::extract::{extract_sorted_points, split, JitterMode};
use crate::kernels::{affine_from_three_points, similarity_from_two_points, translation_from_one_point};
use crate::marker::{Marker, MarkerHandle};
use crate::progress::{CancelToken, NullProgress, ProgressSink};
use crate::prosac::{prosac, ModelKind, RobustModel};
use crate::smoothing::{smooth_points, smooth_scalars};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use pintrack_core::{
    apply_homography, Curve, DMat3, DVec2, EstimateError, FrameTime, Point, RectD, Result,
    TrackError,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolveTarget {
    Transform,
    CornerPin,
}

// ── Per-keyframe models ────────────────────────────────────────

/// Transform solved at one keyframe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformSample {
    pub time: FrameTime,
    pub translation: DVec2,
    /// Degrees.
    pub rotation: f64,
    pub scale: f64,
    /// False when a single marker only constrained the translation.
    pub has_rotation_and_scale: bool,
}

/// Corner-pin homography solved at one keyframe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CornerPinSample {
    pub time: FrameTime,
    pub homography: DMat3,
    /// Markers that determined the homography, at most 4.
    pub enabled_points: usize,
}

fn enabled_at(markers: &[Marker], time: FrameTime) -> impl Iterator<Item = &Marker> {
    markers.iter().filter(move |m| m.is_enabled(time))
}

/// Translation, rotation and scale carrying the markers from
/// `reference_time` to `time`.
pub fn compute_transform_at_time(
    markers: &[Marker],
    reference_time: FrameTime,
    time: FrameTime,
    jitter_period: i32,
    jitter_mode: JitterMode,
    config: &ProsacConfig,
) -> std::result::Result<TransformSample, EstimateError> {
    let points = extract_sorted_points(
        enabled_at(markers, time),
        reference_time,
        time,
        jitter_period,
        jitter_mode,
    );
    if points.is_empty() {
        return Err(EstimateError::NotEnoughPoints {
            required: 1,
            got: 0,
        });
    }
    let identity = TransformSample {
        time,
        translation: DVec2::ZERO,
        rotation: 0.0,
        scale: 1.0,
        has_rotation_and_scale: points.len() > 1,
    };
    if reference_time == time {
        return Ok(identity);
    }

    if let [only] = points.as_slice() {
        return Ok(TransformSample {
            translation: only.target - only.reference,
            has_rotation_and_scale: false,
            ..identity
        });
    }
    let (x1, x2) = split(&points);
    match prosac(ModelKind::Similarity, &x1, &x2, config)?.model {
        RobustModel::Similarity(s) => Ok(TransformSample {
            translation: s.translation,
            rotation: s.rotation.to_degrees(),
            scale: s.scale,
            ..identity
        }),
        _ => Err(EstimateError::NoModelFound),
    }
}

/// Homography carrying the markers from `reference_time` to `time`.
///
/// One to three markers give the exact translation, similarity or affine map
/// they determine; four or more give a robust homography.
pub fn compute_corner_pin_at_time(
    markers: &[Marker],
    reference_time: FrameTime,
    time: FrameTime,
    jitter_period: i32,
    jitter_mode: JitterMode,
    config: &ProsacConfig,
) -> std::result::Result<CornerPinSample, EstimateError> {
    let points = extract_sorted_points(
        enabled_at(markers, time),
        reference_time,
        time,
        jitter_period,
        jitter_mode,
    );
    if points.is_empty() {
        return Err(EstimateError::NotEnoughPoints {
            required: 1,
            got: 0,
        });
    }
    if reference_time == time {
        return Ok(CornerPinSample {
            time,
            homography: DMat3::IDENTITY,
            enabled_points: 4,
        });
    }

    let (x1, x2) = split(&points);
    let (homography, enabled_points) = match x1.len() {
        1 => (translation_from_one_point(x1[0], x2[0]), 1),
        2 => {
            let s = similarity_from_two_points(x1[0], x1[1], x2[0], x2[1])
                .ok_or(EstimateError::Degenerate)?;
            (s.to_matrix(), 2)
        }
        3 => {
            let affine = affine_from_three_points(&[x1[0], x1[1], x1[2]], &[x2[0], x2[1], x2[2]])
                .ok_or(EstimateError::Degenerate)?;
            (affine, 3)
        }
        _ => match prosac(ModelKind::Homography, &x1, &x2, config)?.model {
            RobustModel::Homography(h) => (h, 4),
            _ => return Err(EstimateError::NoModelFound),
        },
    };
    Ok(CornerPinSample {
        time,
        homography,
        enabled_points,
    })
}

// ── Curves ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TransformCurves {
    pub translate_x: Curve,
    pub translate_y: Curve,
    /// Degrees.
    pub rotation: Curve,
    pub scale: Curve,
}

impl Default for TransformCurves {
    fn default() -> Self {
        Self {
            translate_x: Curve::new(),
            translate_y: Curve::new(),
            rotation: Curve::new(),
            scale: Curve::with_default(1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CornerPinCurves {
    /// Reference-time corners, in `(x1,y1), (x2,y1), (x2,y2), (x1,y2)` order.
    pub from: [Point; 4],
    pub to_x: [Curve; 4],
    pub to_y: [Curve; 4],
}

impl CornerPinCurves {
    pub fn to_at(&self, corner: usize, time: FrameTime) -> Point {
        Point::new(self.to_x[corner].evaluate(time), self.to_y[corner].evaluate(time))
    }
}

/// Fold transform samples, ordered by time, into smoothed curves.
///
/// `smoothing` holds the translation, rotation and scale windows.
pub fn transform_curves(samples: &[TransformSample], smoothing: [i32; 3]) -> TransformCurves {
    let mut curves = TransformCurves::default();

    let translations: Vec<DVec2> = samples.iter().map(|s| s.translation).collect();
    for (s, t) in samples.iter().zip(smooth_points(&translations, smoothing[0])) {
        curves.translate_x.set(s.time, t.x);
        curves.translate_y.set(s.time, t.y);
    }

    // Single-marker samples carry no rotation or scale.
    let oriented: Vec<&TransformSample> = samples
        .iter()
        .filter(|s| s.has_rotation_and_scale)
        .collect();
    let rotations: Vec<f64> = oriented.iter().map(|s| s.rotation).collect();
    for (s, r) in oriented.iter().zip(smooth_scalars(&rotations, smoothing[1])) {
        curves.rotation.set(s.time, r);
    }
    let scales: Vec<f64> = oriented.iter().map(|s| s.scale).collect();
    for (s, k) in oriented.iter().zip(smooth_scalars(&scales, smoothing[2])) {
        curves.scale.set(s.time, k);
    }
    curves
}

/// Map `from` through every sample and fold the destinations into curves.
pub fn corner_pin_curves(
    samples: &[CornerPinSample],
    from: [Point; 4],
    smoothing: i32,
) -> CornerPinCurves {
    let mapped: Vec<(FrameTime, [Point; 4])> = samples
        .iter()
        .filter_map(|s| {
            let mut to = [Point::ZERO; 4];
            for (dst, src) in to.iter_mut().zip(from) {
                *dst = apply_homography(&s.homography, src)?;
            }
            Some((s.time, to))
        })
        .collect();

    let mut curves = CornerPinCurves {
        from,
        to_x: Default::default(),
        to_y: Default::default(),
    };
    for corner in 0..4 {
        let track: Vec<Point> = mapped.iter().map(|(_, to)| to[corner]).collect();
        for ((time, _), p) in mapped.iter().zip(smooth_points(&track, smoothing)) {
            curves.to_x[corner].set(*time, p.x);
            curves.to_y[corner].set(*time, p.y);
        }
    }
    curves
}

// ── Output ─────────────────────────────────────────────────────

/// Receives solved curves.
pub trait ParameterSink: Send + Sync {
    /// Drop every key previously written for `target`.
    fn reset_animation(&self, target: SolveTarget);

    fn write_transform(&self, curves: TransformCurves);

    fn write_corner_pin(&self, curves: CornerPinCurves);

    /// Solver controls are disabled while a solve runs.
    fn set_solver_controls_enabled(&self, _enabled: bool) {}
}

/// In-memory [`ParameterSink`].
#[derive(Debug, Default)]
pub struct SolvedCurves {
    transform: Mutex<Option<TransformCurves>>,
    corner_pin: Mutex<Option<CornerPinCurves>>,
    writes: AtomicUsize,
    controls_disabled: AtomicBool,
}

impl SolvedCurves {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform(&self) -> Option<TransformCurves> {
        self.transform.lock().clone()
    }

    pub fn corner_pin(&self) -> Option<CornerPinCurves> {
        self.corner_pin.lock().clone()
    }

    /// Number of curve writes received so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    pub fn controls_enabled(&self) -> bool {
        !self.controls_disabled.load(Ordering::Acquire)
    }
}

impl ParameterSink for SolvedCurves {
    fn reset_animation(&self, target: SolveTarget) {
        match target {
            SolveTarget::Transform => *self.transform.lock() = None,
            SolveTarget::CornerPin => *self.corner_pin.lock() = None,
        }
    }

    fn write_transform(&self, curves: TransformCurves) {
        *self.transform.lock() = Some(curves);
        self.writes.fetch_add(1, Ordering::AcqRel);
    }

    fn write_corner_pin(&self, curves: CornerPinCurves) {
        *self.corner_pin.lock() = Some(curves);
        self.writes.fetch_add(1, Ordering::AcqRel);
    }

    fn set_solver_controls_enabled(&self, enabled: bool) {
        self.controls_disabled.store(!enabled, Ordering::Release);
    }
}

// ── Requests ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SolveRequest {
    pub reference_time: FrameTime,
    pub keyframes: BTreeSet<FrameTime>,
    pub jitter_period: i32,
    pub jitter_mode: JitterMode,
}

impl SolveRequest {
    pub fn new(reference_time: FrameTime, keyframes: impl IntoIterator<Item = FrameTime>) -> Self {
        Self {
            reference_time,
            keyframes: keyframes.into_iter().collect(),
            jitter_period: 0,
            jitter_mode: JitterMode::Remove,
        }
    }

    pub fn with_jitter(mut self, period: i32, mode: JitterMode) -> Self {
        self.jitter_period = period;
        self.jitter_mode = mode;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveOutcome {
    /// Curves were written from `solved` keyframes; `dropped` failed to fit.
    Written { solved: usize, dropped: usize },
    /// Every keyframe failed; nothing was written.
    Failed { dropped: usize },
    /// A newer request for the same target took over.
    Superseded,
    Cancelled,
}

/// Handle on an in-flight solve.
pub struct SolveHandle {
    target: SolveTarget,
    cancel: CancelToken,
    slot: Weak<Mutex<Slot>>,
    done: Receiver<SolveOutcome>,
    thread: Option<JoinHandle<()>>,
}

impl SolveHandle {
    pub fn target(&self) -> SolveTarget {
        self.target
    }

    /// Stop the solve. Nothing is written once this returns.
    pub fn cancel(&self) {
        // Curves are written under the slot lock.
        let slot = self.slot.upgrade();
        let _guard = slot.as_ref().map(|slot| slot.lock());
        self.cancel.cancel();
    }

    pub fn try_outcome(&self) -> Option<SolveOutcome> {
        self.done.try_recv().ok()
    }

    /// Block until the solve finishes.
    pub fn wait(mut self) -> Result<SolveOutcome> {
        let outcome = self.done.recv().map_err(|_| {
            TrackError::Internal(format!("{:?} solve ended without an outcome", self.target))
        });
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        outcome
    }
}

#[derive(Default)]
struct Slot {
    generation: u64,
    cancel: Option<CancelToken>,
}

/// Runs transform and corner-pin solves.
pub struct CurveSolver {
    source: Arc<dyn ImageSource>,
    parameters: Arc<dyn ParameterSink>,
    progress: Arc<dyn ProgressSink>,
    settings: SolverSettings,
    pool: Arc<rayon::ThreadPool>,
    // Indexed by `SolveTarget as usize`.
    slots: [Arc<Mutex<Slot>>; 2],
}

impl CurveSolver {
    pub fn new(
        source: Arc<dyn ImageSource>,
        parameters: Arc<dyn ParameterSink>,
        settings: SolverSettings,
    ) -> Result<Self> {
        Self::with_threads(source, parameters, settings, num_cpus::get())
    }

    pub fn with_threads(
        source: Arc<dyn ImageSource>,
        parameters: Arc<dyn ParameterSink>,
        settings: SolverSettings,
        threads: usize,
    ) -> Result<Self> {
        settings.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("pintrack-solver-{i}"))
            .build()
            .map_err(|e| TrackError::Internal(format!("solver pool: {e}")))?;
        Ok(Self {
            source,
            parameters,
            progress: Arc::new(NullProgress),
            settings,
            pool: Arc::new(pool),
            slots: Default::default(),
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: SolverSettings) -> Result<()> {
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    /// Cancel the solve in flight for `target`, if any.
    pub fn cancel(&self, target: SolveTarget) {
        if let Some(token) = self.slots[target as usize].lock().cancel.take() {
            token.cancel();
        }
    }

    pub fn solve_transform(
        &self,
        markers: &[MarkerHandle],
        request: SolveRequest,
    ) -> Result<SolveHandle> {
        self.launch(SolveTarget::Transform, markers, request)
    }

    pub fn solve_corner_pin(
        &self,
        markers: &[MarkerHandle],
        request: SolveRequest,
    ) -> Result<SolveHandle> {
        self.launch(SolveTarget::CornerPin, markers, request)
    }

    fn launch(
        &self,
        target: SolveTarget,
        markers: &[MarkerHandle],
        request: SolveRequest,
    ) -> Result<SolveHandle> {
        if markers.is_empty() {
            return Err(TrackError::NoMarkers);
        }
        if request.keyframes.is_empty() {
            return Err(TrackError::InvalidParameter("no keyframe to solve".into()));
        }
        let snapshot: Arc<[Marker]> = markers.iter().map(|m| m.read().clone()).collect();
        let reference_rect = self.source.region_of_definition(request.reference_time);

        let slot = &self.slots[target as usize];
        let mut guard = slot.lock();
        if let Some(previous) = guard.cancel.take() {
            debug!(kind = ?target, generation = guard.generation, "Superseding solve");
            previous.cancel();
        }
        guard.generation += 1;
        let cancel = CancelToken::new();
        guard.cancel = Some(cancel.clone());

        let (tx, rx) = bounded(1);
        let job = SolveJob {
            target,
            generation: guard.generation,
            slot: Arc::downgrade(slot),
            cancel: cancel.clone(),
            markers: snapshot,
            request,
            reference_rect,
            settings: self.settings.clone(),
            parameters: Arc::clone(&self.parameters),
            progress: Arc::clone(&self.progress),
            pool: Arc::clone(&self.pool),
        };

        self.parameters.set_solver_controls_enabled(false);
        let thread = std::thread::Builder::new()
            .name(format!("pintrack-solve-{target:?}"))
            .spawn(move || {
                let outcome = job.run();
                let _ = tx.send(outcome);
            })
            .map_err(|e| {
                self.parameters.set_solver_controls_enabled(true);
                TrackError::Internal(format!("solve thread: {e}"))
            })?;

        Ok(SolveHandle {
            target,
            cancel,
            slot: Arc::downgrade(slot),
            done: rx,
            thread: Some(thread),
        })
    }
}

struct SolveJob {
    target: SolveTarget,
    generation: u64,
    slot: Weak<Mutex<Slot>>,
    cancel: CancelToken,
    markers: Arc<[Marker]>,
    request: SolveRequest,
    reference_rect: RectD,
    settings: SolverSettings,
    parameters: Arc<dyn ParameterSink>,
    progress: Arc<dyn ProgressSink>,
    pool: Arc<rayon::ThreadPool>,
}

impl SolveJob {
    fn run(self) -> SolveOutcome {
        let _end = EndSolve {
            generation: self.generation,
            slot: self.slot.clone(),
            parameters: Arc::clone(&self.parameters),
            progress: Arc::clone(&self.progress),
        };
        let request = &self.request;
        let config = &self.settings.prosac;
        info!(
            kind = ?self.target,
            reference = request.reference_time,
            keyframes = request.keyframes.len(),
            markers = self.markers.len(),
            "Solve started"
        );
        self.progress.start(request.keyframes.len());

        let outcome = match self.target {
            SolveTarget::Transform => {
                let solved = self.solve_keyframes(|time| {
                    compute_transform_at_time(
                        &self.markers,
                        request.reference_time,
                        time,
                        request.jitter_period,
                        request.jitter_mode,
                        config,
                    )
                });
                self.commit(solved, |samples| {
                    let curves = transform_curves(samples, self.settings.smooth_transform);
                    self.parameters.write_transform(curves);
                })
            }
            SolveTarget::CornerPin => {
                let solved = self.solve_keyframes(|time| {
                    compute_corner_pin_at_time(
                        &self.markers,
                        request.reference_time,
                        time,
                        request.jitter_period,
                        request.jitter_mode,
                        config,
                    )
                });
                let from = self.reference_rect.corners();
                self.commit(solved, |samples| {
                    let curves = corner_pin_curves(samples, from, self.settings.smooth_corner_pin);
                    self.parameters.write_corner_pin(curves);
                })
            }
        };
        info!(kind = ?self.target, outcome = ?outcome, "Solve finished");
        outcome
    }

    /// Fit every keyframe in parallel. `None` when cancelled midway; failed
    /// keyframes are dropped and counted.
    fn solve_keyframes<S, F>(&self, fit: F) -> Option<(Vec<S>, usize)>
    where
        S: Send,
        F: Fn(FrameTime) -> std::result::Result<S, EstimateError> + Sync,
    {
        let keyframes: Vec<FrameTime> = self.request.keyframes.iter().copied().collect();
        let total = keyframes.len();
        let done = AtomicUsize::new(0);
        let results: Vec<Option<std::result::Result<S, EstimateError>>> = self.pool.install(|| {
            keyframes
                .par_iter()
                .map(|&time| {
                    if self.cancel.is_cancelled() {
                        return None;
                    }
                    let result = fit(time);
                    let finished = done.fetch_add(1, Ordering::AcqRel) + 1;
                    self.progress.update(finished as f64 / total as f64);
                    Some(result)
                })
                .collect()
        });

        let mut samples = Vec::with_capacity(total);
        let mut dropped = 0;
        for (time, result) in keyframes.into_iter().zip(results) {
            match result? {
                Ok(sample) => samples.push(sample),
                Err(error) => {
                    warn!(kind = ?self.target, time, %error, "Keyframe dropped");
                    dropped += 1;
                }
            }
        }
        Some((samples, dropped))
    }

    /// Write the curves if this job still owns its slot.
    fn commit<S>(&self, solved: Option<(Vec<S>, usize)>, write: impl FnOnce(&[S])) -> SolveOutcome {
        let Some((samples, dropped)) = solved else {
            return self.interrupted();
        };

        let Some(slot) = self.slot.upgrade() else {
            return SolveOutcome::Cancelled;
        };
        let slot = slot.lock();
        if slot.generation != self.generation {
            return SolveOutcome::Superseded;
        }
        if self.cancel.is_cancelled() {
            return SolveOutcome::Cancelled;
        }
        if samples.is_empty() {
            drop(slot);
            let message = format!(
                "{:?} solve failed: no keyframe could be solved ({dropped} dropped)",
                self.target
            );
            warn!("{message}");
            self.progress.report_error(&message);
            return SolveOutcome::Failed { dropped };
        }
        self.parameters.reset_animation(self.target);
        write(&samples);
        SolveOutcome::Written {
            solved: samples.len(),
            dropped,
        }
    }

    fn interrupted(&self) -> SolveOutcome {
        match self.slot.upgrade() {
            Some(slot) if slot.lock().generation != self.generation => SolveOutcome::Superseded,
            _ => SolveOutcome::Cancelled,
        }
    }
}

/// Completion step of a solve, run however the job exits. Controls, progress
/// and the in-flight slot are only released by the newest request of the
/// target.
struct EndSolve {
    generation: u64,
    slot: Weak<Mutex<Slot>>,
    parameters: Arc<dyn ParameterSink>,
    progress: Arc<dyn ProgressSink>,
}

impl Drop for EndSolve {
    fn drop(&mut self) {
        let current = match self.slot.upgrade() {
            Some(slot) => {
                let mut slot = slot.lock();
                let current = slot.generation == self.generation;
                if current {
                    slot.cancel = None;
                }
                current
            }
            None => true,
        };
        if current {
            self.parameters.set_solver_controls_enabled(true);
            self.progress.end();
        }
    }
}
