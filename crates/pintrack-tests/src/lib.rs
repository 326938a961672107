//! Integration test crate for pintrack.
//!
//! This crate exists solely to hold cross-crate integration tests: tracking
//! synthetic footage end to end and solving curves from the result.

#[cfg(test)]
mod tracking;

#[cfg(test)]
mod solve;
