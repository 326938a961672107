//! Pintrack Core - Foundation types for planar tracking
//!
//! This crate provides the fundamental types used throughout pintrack:
//! - Error taxonomy for tracking and robust estimation
//! - Geometry (points, rectangles, quads, homogeneous transforms)
//! - Keyframed curves over integer frame times
//! - RGB frame buffers and channel masks

pub mod curve;
pub mod error;
pub mod frame;
pub mod geometry;

pub use curve::{Curve, FrameTime, Interpolation, Key, PointCurve};
pub use error::{EstimateError, Result, TrackError};
pub use frame::{ChannelMask, RgbFrame, SharedFrame};
pub use geometry::{
    apply_homography, invert_y, mat3_entry, mat3_from_rows, mat3_to_rows, normalize_homography,
    quad_to_quad, to_homogeneous, unit_square_to_quad, Point, Quad, RectD,
};

pub use glam::{DMat3, DVec2, DVec3};
