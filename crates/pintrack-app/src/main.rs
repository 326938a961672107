//! Pintrack - planar tracking demo.
//!
//! Tracks four markers across a synthetic sequence, then solves transform and
//! corner-pin curves from them.
//!
//! Usage: `pintrack [config.json]`

use anyhow::{bail, Context, Result};
use pintrack_core::{FrameTime, Point};
use pintrack_tracking::{
    CurveSolver, ImageSource, JitterMode, Marker, MarkerHandle, ParameterSink, PintrackConfig,
    ProgressSink,
    SessionState, SolveOutcome, SolveRequest, SolvedCurves, SyntheticSource, TrackScheduler,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const FIRST_FRAME: FrameTime = 0;
const LAST_FRAME: FrameTime = 12;

/// Logs progress milestones.
struct LogProgress;

impl ProgressSink for LogProgress {
    fn start(&self, total: usize) {
        info!(total, "Work started");
    }

    fn update(&self, fraction: f64) {
        tracing::debug!(percent = (fraction * 100.0).round(), "Progress");
    }

    fn report_error(&self, message: &str) {
        warn!("{message}");
    }
}

fn main() -> Result<()> {
    // Initialize logging
    let builder = FmtSubscriber::builder().with_max_level(Level::INFO);
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = builder.with_env_filter(EnvFilter::from_default_env()).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            PintrackConfig::from_json_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => PintrackConfig::default(),
    };
    info!("Pintrack starting");

    let velocity = Point::new(2.0, 1.0);
    let origins = [
        Point::new(80.0, 70.0),
        Point::new(220.0, 75.0),
        Point::new(215.0, 170.0),
        Point::new(85.0, 165.0),
    ];
    let source = origins
        .iter()
        .fold(SyntheticSource::new(320, 240), |s, o| s.with_blob(*o, velocity, 3.5));
    let source: Arc<dyn ImageSource> = Arc::new(source);

    let markers: Vec<MarkerHandle> = origins
        .iter()
        .enumerate()
        .map(|(i, origin)| {
            let mut marker = Marker::new(format!("track{}", i + 1), *origin)
                .with_pattern_half_size(10.0)
                .with_search_half_size(24.0);
            marker.set_user_keyframe(FIRST_FRAME, *origin);
            marker.into_handle()
        })
        .collect();

    let progress: Arc<dyn ProgressSink> = Arc::new(LogProgress);
    let scheduler = TrackScheduler::new(Arc::clone(&source), config.tracker.clone())?
        .with_progress(Arc::clone(&progress));
    let report = scheduler
        .track_sequence(markers.clone(), FIRST_FRAME, LAST_FRAME, 1)?
        .wait()?;
    if report.state != SessionState::Completed {
        bail!("tracking session {} was cancelled", report.id);
    }
    info!(
        tracked = report.tracked,
        failures = report.failures.len(),
        "Tracking done"
    );
    for failure in &report.failures {
        warn!("{failure}");
    }

    let curves = Arc::new(SolvedCurves::new());
    let parameters: Arc<dyn ParameterSink> = curves.clone();
    let solver = CurveSolver::new(source, parameters, config.solver.clone())?
        .with_progress(progress);
    let request = SolveRequest::new(FIRST_FRAME, FIRST_FRAME..=LAST_FRAME)
        .with_jitter(0, JitterMode::Remove);

    let transform = solver.solve_transform(&markers, request.clone())?.wait()?;
    let corner_pin = solver.solve_corner_pin(&markers, request)?.wait()?;
    for (name, outcome) in [("transform", transform), ("corner pin", corner_pin)] {
        match outcome {
            SolveOutcome::Written { solved, dropped } => {
                info!(solved, dropped, "{name} solved")
            }
            other => bail!("{name} solve did not complete: {other:?}"),
        }
    }

    if let Some(transform) = curves.transform() {
        for time in [FIRST_FRAME, LAST_FRAME / 2, LAST_FRAME] {
            println!(
                "frame {time:>3}: translate ({:8.3}, {:8.3})  rotate {:7.3}°  scale {:.4}",
                transform.translate_x.evaluate(time),
                transform.translate_y.evaluate(time),
                transform.rotation.evaluate(time),
                transform.scale.evaluate(time),
            );
        }
    }
    if let Some(pin) = curves.corner_pin() {
        for (corner, from) in pin.from.iter().enumerate() {
            let to = pin.to_at(corner, LAST_FRAME);
            println!(
                "corner {corner}: ({:7.2}, {:7.2}) -> ({:7.2}, {:7.2})",
                from.x, from.y, to.x, to.y
            );
        }
    }
    Ok(())
}
