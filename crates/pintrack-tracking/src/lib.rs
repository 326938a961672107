//! Pintrack tracking - patch tracking, robust motion estimation and curve
//! solving.
//!
//! Markers are tracked frame by frame with [`TrackScheduler`]; their
//! trajectories are then turned into transform or corner-pin curves by
//! [`CurveSolver`].

pub mod accessor;
pub mod config;
pub mod extract;
pub mod image;
pub mod kernels;
pub mod marker;
pub mod patch_tracker;
pub mod progress;
pub mod prosac;
pub mod region;
pub mod registry;
pub mod scheduler;
pub mod smoothing;
pub mod solver;
pub mod synthetic;

pub use accessor::{FrameCache, ImageSource};
pub use config::{PintrackConfig, ProsacConfig, SolverSettings, TrackerSettings};
pub use extract::{extract_sorted_points, Correspondence, JitterMode};
pub use image::{compute_gradients, rgb_to_gray, GrayImage};
pub use kernels::Similarity;
pub use marker::{Marker, MarkerHandle, ReferencePolicy};
pub use patch_tracker::{track_step, FailureReason, StepContext, StepOutcome, TrackFailure};
pub use progress::{CancelToken, NullProgress, ProgressSink};
pub use prosac::{prosac, ModelKind, ProsacFit, ProsacOutcome, RobustModel};
pub use region::{track_region, MotionModel, RegionOptions, RegionResult, Termination};
pub use registry::{MarkerRegistry, RegionMarker, SampleSource};
pub use scheduler::{
    SchedulerState, SessionId, SessionReport, SessionState, TrackHandle, TrackScheduler,
};
pub use solver::{
    compute_corner_pin_at_time, compute_transform_at_time, CornerPinCurves, CornerPinSample,
    CurveSolver, ParameterSink, SolveHandle, SolveOutcome, SolveRequest, SolveTarget,
    SolvedCurves, TransformCurves, TransformSample,
};
pub use synthetic::SyntheticSource;
