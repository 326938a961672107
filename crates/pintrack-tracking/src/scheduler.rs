//! Sequence tracking sessions.
//!
//! A session walks the requested frame range one generation at a time. Within
//! a generation every marker is stepped in parallel on the worker pool, and
//! the next generation starts only once all of them are done.

use crate::accessor::{FrameCache, ImageSource};
use crate::config::TrackerSettings;
use crate::marker::MarkerHandle;
use crate::patch_tracker::{to_region_marker, track_step, StepContext, StepOutcome, TrackFailure};
use crate::progress::{CancelToken, NullProgress, ProgressSink};
use crate::registry::{MarkerRegistry, SampleSource};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use pintrack_core::{FrameTime, Result, TrackError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Identity of one tracking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Terminal state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running(SessionId),
    Completed(SessionId),
    Cancelled(SessionId),
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub id: SessionId,
    pub state: SessionState,
    /// Frame generations fully processed.
    pub frames_processed: usize,
    pub keyframes: usize,
    pub tracked: usize,
    pub failures: Vec<TrackFailure>,
}

/// Handle on a running session.
pub struct TrackHandle {
    id: SessionId,
    cancel: CancelToken,
    done: Receiver<SessionReport>,
    thread: Option<JoinHandle<()>>,
}

impl TrackHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Ask the session to stop. Samples already written are kept.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The report, if the session has already finished.
    pub fn try_report(&self) -> Option<SessionReport> {
        self.done.try_recv().ok()
    }

    /// Block until the session finishes.
    pub fn wait(mut self) -> Result<SessionReport> {
        let report = self.done.recv().map_err(|_| {
            TrackError::Internal(format!("tracking session {} ended without a report", self.id))
        });
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        report
    }
}

struct Session {
    id: SessionId,
    cancel: CancelToken,
}

struct Inner {
    state: SchedulerState,
    active: Option<Arc<Session>>,
}

/// Runs tracking sessions, one at a time.
pub struct TrackScheduler {
    source: Arc<dyn ImageSource>,
    settings: TrackerSettings,
    progress: Arc<dyn ProgressSink>,
    pool: Arc<rayon::ThreadPool>,
    inner: Arc<Mutex<Inner>>,
}

impl TrackScheduler {
    /// Create a scheduler with a worker pool sized to the machine.
    pub fn new(source: Arc<dyn ImageSource>, settings: TrackerSettings) -> Result<Self> {
        Self::with_threads(source, settings, num_cpus::get())
    }

    pub fn with_threads(
        source: Arc<dyn ImageSource>,
        settings: TrackerSettings,
        threads: usize,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("pintrack-worker-{i}"))
            .build()
            .map_err(|e| TrackError::Internal(format!("worker pool: {e}")))?;
        Ok(Self {
            source,
            settings,
            progress: Arc::new(NullProgress),
            pool: Arc::new(pool),
            inner: Arc::new(Mutex::new(Inner {
                state: SchedulerState::Idle,
                active: None,
            })),
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: TrackerSettings) {
        self.settings = settings;
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), SchedulerState::Running(_))
    }

    /// Cancel the running session, if any.
    pub fn cancel_active(&self) {
        if let Some(session) = &self.inner.lock().active {
            session.cancel.cancel();
        }
    }

    /// Track `markers` from `start` to `end` (inclusive when reachable) by
    /// `step` frames.
    ///
    /// Returns immediately. Fails with [`TrackError::SessionBusy`] while
    /// another session runs.
    pub fn track_sequence(
        &self,
        markers: Vec<MarkerHandle>,
        start: FrameTime,
        end: FrameTime,
        step: i32,
    ) -> Result<TrackHandle> {
        if markers.is_empty() {
            return Err(TrackError::NoMarkers);
        }
        if step == 0 {
            return Err(TrackError::InvalidParameter("frame step must not be zero".into()));
        }
        if (end - start).signum() * step.signum() < 0 {
            return Err(TrackError::InvalidParameter(format!(
                "step {step} does not lead from frame {start} to {end}"
            )));
        }
        self.settings.validate()?;

        let mut inner = self.inner.lock();
        if matches!(inner.state, SchedulerState::Running(_)) {
            return Err(TrackError::SessionBusy);
        }

        let session = Arc::new(Session {
            id: SessionId::new(),
            cancel: CancelToken::new(),
        });
        let (tx, rx) = bounded(1);
        let job = SessionJob {
            id: session.id,
            session: Arc::downgrade(&session),
            scheduler: Arc::downgrade(&self.inner),
            source: Arc::clone(&self.source),
            settings: self.settings.clone(),
            progress: Arc::clone(&self.progress),
            pool: Arc::clone(&self.pool),
            markers,
            start,
            end,
            step,
        };
        let thread = std::thread::Builder::new()
            .name(format!("pintrack-session-{}", session.id))
            .spawn(move || {
                let report = job.run();
                let _ = tx.send(report);
            })
            .map_err(|e| TrackError::Internal(format!("session thread: {e}")))?;

        inner.state = SchedulerState::Running(session.id);
        let handle = TrackHandle {
            id: session.id,
            cancel: session.cancel.clone(),
            done: rx,
            thread: Some(thread),
        };
        inner.active = Some(session);
        Ok(handle)
    }
}

/// Frames visited by a session, in order.
pub fn frame_sequence(start: FrameTime, end: FrameTime, step: i32) -> Vec<FrameTime> {
    if step == 0 {
        return vec![start];
    }
    let mut frames = Vec::new();
    let mut t = start;
    while (step > 0 && t <= end) || (step < 0 && t >= end) {
        frames.push(t);
        t += step;
    }
    frames
}

/// Everything a session worker owns. Back-references to the session and
/// scheduler are weak so a lagging worker cannot keep them alive.
struct SessionJob {
    id: SessionId,
    session: Weak<Session>,
    scheduler: Weak<Mutex<Inner>>,
    source: Arc<dyn ImageSource>,
    settings: TrackerSettings,
    progress: Arc<dyn ProgressSink>,
    pool: Arc<rayon::ThreadPool>,
    markers: Vec<MarkerHandle>,
    start: FrameTime,
    end: FrameTime,
    step: i32,
}

impl SessionJob {
    fn cancelled(&self) -> bool {
        self.session
            .upgrade()
            .map_or(true, |session| session.cancel.is_cancelled())
    }

    fn run(self) -> SessionReport {
        let cache = FrameCache::new(Arc::clone(&self.source));
        let mut finish = SessionFinish {
            id: self.id,
            scheduler: self.scheduler.clone(),
            progress: Arc::clone(&self.progress),
            cache: &cache,
            state: SessionState::Cancelled,
        };

        let report = self.track_all(&cache);
        finish.state = report.state;
        report
    }

    fn track_all(&self, cache: &FrameCache) -> SessionReport {
        let registry = MarkerRegistry::new();
        let frames = frame_sequence(self.start, self.end, self.step);
        let mut report = SessionReport {
            id: self.id,
            state: SessionState::Completed,
            frames_processed: 0,
            keyframes: 0,
            tracked: 0,
            failures: Vec::new(),
        };

        self.progress.start(self.markers.len());
        info!(
            session = %self.id,
            markers = self.markers.len(),
            start = self.start,
            end = self.end,
            step = self.step,
            "Tracking started"
        );

        self.seed_registry(&registry, cache.height());
        let ctx = StepContext {
            registry: &registry,
            cache,
            settings: &self.settings,
            start_frame: self.start,
            step: self.step,
        };

        for (generation, &time) in frames.iter().enumerate() {
            if self.cancelled() {
                report.state = SessionState::Cancelled;
                break;
            }
            let outcomes: Vec<Option<std::result::Result<StepOutcome, TrackFailure>>> =
                self.pool.install(|| {
                    self.markers
                        .par_iter()
                        .enumerate()
                        .map(|(track, handle)| {
                            if self.cancelled() {
                                return None;
                            }
                            Some(track_step(&ctx, track, handle, time))
                        })
                        .collect()
                });

            let mut interrupted = false;
            for outcome in outcomes {
                match outcome {
                    Some(Ok(StepOutcome::Keyframe)) => report.keyframes += 1,
                    Some(Ok(StepOutcome::Tracked { .. })) => report.tracked += 1,
                    Some(Err(failure)) => {
                        warn!(
                            session = %self.id,
                            track = failure.track,
                            frame = failure.frame,
                            reason = %failure.reason,
                            "Marker step failed"
                        );
                        self.progress.report_error(&failure.to_string());
                        report.failures.push(failure);
                    }
                    None => interrupted = true,
                }
            }
            if interrupted {
                report.state = SessionState::Cancelled;
                break;
            }
            report.frames_processed += 1;
            self.progress
                .update((generation + 1) as f64 / frames.len() as f64);
        }

        info!(
            session = %self.id,
            state = ?report.state,
            frames = report.frames_processed,
            tracked = report.tracked,
            failures = report.failures.len(),
            "Tracking finished"
        );
        report
    }

    /// Register prior user keyframes and tracked samples of every marker.
    /// The start frame is registered by its first step.
    fn seed_registry(&self, registry: &MarkerRegistry, height: f64) {
        for (track, handle) in self.markers.iter().enumerate() {
            let marker = handle.read();
            let channels = self.settings.channels.intersect(marker.channels);
            let mut times: Vec<(FrameTime, SampleSource)> = marker
                .user_keyframes()
                .map(|t| (t, SampleSource::Manual))
                .collect();
            times.extend(
                marker
                    .tracked_times()
                    .into_iter()
                    .map(|t| (t, SampleSource::Tracked)),
            );
            for (time, source) in times {
                if time == self.start {
                    continue;
                }
                let mut sample = to_region_marker(
                    &marker,
                    track,
                    time,
                    time,
                    marker.reference_frame(time, self.step),
                    source,
                    height,
                );
                sample.channels = channels;
                registry.add_marker(sample);
            }
        }
    }
}

/// Session cleanup that runs however the worker exits: releases cached
/// frames, ends progress and records the terminal state.
struct SessionFinish<'a> {
    id: SessionId,
    scheduler: Weak<Mutex<Inner>>,
    progress: Arc<dyn ProgressSink>,
    cache: &'a FrameCache,
    state: SessionState,
}

impl Drop for SessionFinish<'_> {
    fn drop(&mut self) {
        self.cache.clear();
        self.progress.end();
        if let Some(inner) = self.scheduler.upgrade() {
            let mut inner = inner.lock();
            if inner.state == SchedulerState::Running(self.id) {
                inner.state = match self.state {
                    SessionState::Completed => SchedulerState::Completed(self.id),
                    SessionState::Cancelled => SchedulerState::Cancelled(self.id),
                };
                inner.active = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::Marker;
    use crate::synthetic::SyntheticSource;
    use crossbeam_channel::Sender;
    use pintrack_core::Point;

    fn scheduler() -> TrackScheduler {
        let source = SyntheticSource::new(96, 80).with_blob(
            Point::new(30.0, 40.0),
            Point::new(2.0, 0.0),
            3.0,
        );
        TrackScheduler::with_threads(Arc::new(source), TrackerSettings::default(), 2).unwrap()
    }

    fn marker(center: Point, key: FrameTime) -> MarkerHandle {
        let mut marker = Marker::new("m", center)
            .with_pattern_half_size(8.0)
            .with_search_half_size(16.0);
        marker.set_user_keyframe(key, center);
        marker.into_handle()
    }

    /// Blocks in `start` until released.
    struct GateSink {
        gate: Receiver<()>,
    }

    impl ProgressSink for GateSink {
        fn start(&self, _total: usize) {
            let _ = self.gate.recv();
        }
    }

    fn gated() -> (TrackScheduler, Sender<()>) {
        let (tx, rx) = bounded(1);
        (scheduler().with_progress(Arc::new(GateSink { gate: rx })), tx)
    }

    #[test]
    fn test_frame_sequence() {
        assert_eq!(frame_sequence(0, 5, 2), vec![0, 2, 4]);
        assert_eq!(frame_sequence(3, 0, -1), vec![3, 2, 1, 0]);
        assert_eq!(frame_sequence(4, 4, 1), vec![4]);
    }

    #[test]
    fn test_rejects_bad_requests() {
        let scheduler = scheduler();
        assert!(matches!(
            scheduler.track_sequence(Vec::new(), 0, 3, 1),
            Err(TrackError::NoMarkers)
        ));
        let m = marker(Point::new(30.0, 40.0), 0);
        assert!(matches!(
            scheduler.track_sequence(vec![m.clone()], 0, 3, 0),
            Err(TrackError::InvalidParameter(_))
        ));
        assert!(matches!(
            scheduler.track_sequence(vec![m], 0, 3, -1),
            Err(TrackError::InvalidParameter(_))
        ));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_tracks_forward_sequence() {
        let scheduler = scheduler();
        let m = marker(Point::new(30.0, 40.0), 0);
        let handle = scheduler.track_sequence(vec![m.clone()], 0, 4, 1).unwrap();
        let id = handle.id();
        let report = handle.wait().unwrap();

        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.frames_processed, 5);
        assert_eq!(report.keyframes, 1);
        assert_eq!(report.tracked, 4);
        assert!(report.failures.is_empty());
        assert_eq!(scheduler.state(), SchedulerState::Completed(id));

        let marker = m.read();
        assert!(marker.center_at(4).distance(Point::new(38.0, 40.0)) < 0.2);
        assert_eq!(marker.sample_source(4), Some(SampleSource::Tracked));
    }

    #[test]
    fn test_tracks_backward_sequence() {
        let scheduler = scheduler();
        let m = marker(Point::new(40.0, 40.0), 5);
        let report = scheduler
            .track_sequence(vec![m.clone()], 5, 2, -1)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(report.tracked, 3);
        assert!(m.read().center_at(2).distance(Point::new(34.0, 40.0)) < 0.2);
    }

    #[test]
    fn test_second_session_is_rejected_while_running() {
        let (scheduler, release) = gated();
        let m = marker(Point::new(30.0, 40.0), 0);
        let handle = scheduler.track_sequence(vec![m.clone()], 0, 2, 1).unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(
            scheduler.track_sequence(vec![m.clone()], 0, 2, 1),
            Err(TrackError::SessionBusy)
        ));
        release.send(()).unwrap();
        handle.wait().unwrap();
        assert!(!scheduler.is_running());

        // A new session may start once the first one has finished.
        let again = scheduler.track_sequence(vec![m], 0, 1, 1).unwrap();
        release.send(()).unwrap();
        assert_eq!(again.wait().unwrap().state, SessionState::Completed);
    }

    #[test]
    fn test_cancel_stops_before_next_generation() {
        let (scheduler, release) = gated();
        let m = marker(Point::new(30.0, 40.0), 0);
        let handle = scheduler.track_sequence(vec![m.clone()], 0, 4, 1).unwrap();
        let id = handle.id();
        handle.cancel();
        release.send(()).unwrap();
        let report = handle.wait().unwrap();
        assert_eq!(report.state, SessionState::Cancelled);
        assert_eq!(report.frames_processed, 0);
        assert_eq!(scheduler.state(), SchedulerState::Cancelled(id));
        assert!(!m.read().center.has_key(1));
    }

    #[test]
    fn test_failed_marker_does_not_stop_others() {
        let scheduler = scheduler();
        let good = marker(Point::new(30.0, 40.0), 0);
        let off_frame = marker(Point::new(2.0, 40.0), 0);
        let report = scheduler
            .track_sequence(vec![good.clone(), off_frame], 0, 2, 1)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(report.state, SessionState::Completed);
        assert_eq!(report.tracked, 2);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|f| f.track == 1));
        assert!(good.read().center.has_key(2));
    }
}
