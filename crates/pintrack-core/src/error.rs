//! Error types for pintrack.

use thiserror::Error;

/// Failure of a robust model fit.
///
/// Each variant maps to one terminal state of the PROSAC loop that does not
/// yield a usable model. The two exhaustion reasons are kept apart so callers
/// can report them distinctly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EstimateError {
    #[error("Could not find a model for the given correspondences")]
    NoModelFound,

    #[error("This model requires a minimum of {required} correspondences, got {got}")]
    NotEnoughPoints { required: usize, got: usize },

    #[error("Maximum iterations computed from outliers proportion reached")]
    MaxIterationsFromProportionReached,

    #[error("Maximum solver iterations reached")]
    MaxIterationsParamReached,

    #[error("Correspondences are degenerate for this model")]
    Degenerate,
}

/// Main error type for pintrack operations.
#[derive(Error, Debug)]
pub enum TrackError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("No markers were given")]
    NoMarkers,

    #[error("Required component missing: {0}")]
    MissingComponent(String),

    #[error("A tracking session is already running")]
    SessionBusy,

    #[error("Frame {time} unavailable: {message}")]
    Frame { time: i32, message: String },

    #[error("No alignment marker for track {track} at frame {frame}")]
    MarkerNotFound { track: usize, frame: i32 },

    #[error("Estimation failed: {0}")]
    Estimation(#[from] EstimateError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for pintrack operations.
pub type Result<T> = std::result::Result<T, TrackError>;
