//! Keyframed scalar curves over integer frame times.
//!
//! Marker poses and solved parameters are both stored as curves. Evaluation
//! between keys interpolates, and evaluation outside the keyed range holds the
//! nearest key, so a curve never extrapolates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer frame number.
pub type FrameTime = i32;

/// How to interpolate from a key to the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Interpolation {
    /// No interpolation — hold the value until the next key.
    Hold,
    /// Linear interpolation.
    #[default]
    Linear,
}

// ── Key ─────────────────────────────────────────────────────────

/// A single key at a frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Key {
    pub time: FrameTime,
    pub value: f64,
    /// Interpolation used when evaluating towards the next key.
    pub interpolation: Interpolation,
}

impl Key {
    pub fn new(time: FrameTime, value: f64) -> Self {
        Self {
            time,
            value,
            interpolation: Interpolation::Linear,
        }
    }
}

// ── Curve ───────────────────────────────────────────────────────

/// A sorted set of keys with a fallback value for the unkeyed case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Curve {
    keys: Vec<Key>,
    /// Value returned when the curve has no key at all.
    default_value: f64,
}

impl Default for Curve {
    fn default() -> Self {
        Self::new()
    }
}

impl Curve {
    /// Create an empty curve evaluating to zero.
    pub fn new() -> Self {
        Self::with_default(0.0)
    }

    /// Create an empty curve evaluating to `value` until keyed.
    pub fn with_default(value: f64) -> Self {
        Self {
            keys: Vec::new(),
            default_value: value,
        }
    }

    /// Insert or update a linear key. Maintains sorted order.
    pub fn set(&mut self, time: FrameTime, value: f64) {
        self.set_with(time, value, Interpolation::Linear);
    }

    /// Insert or update a key with an explicit interpolation.
    pub fn set_with(&mut self, time: FrameTime, value: f64, interpolation: Interpolation) {
        match self.keys.binary_search_by(|k| k.time.cmp(&time)) {
            Ok(pos) => {
                self.keys[pos].value = value;
                self.keys[pos].interpolation = interpolation;
            }
            Err(pos) => self.keys.insert(
                pos,
                Key {
                    time,
                    value,
                    interpolation,
                },
            ),
        }
    }

    /// Remove the key at the given time.
    pub fn remove(&mut self, time: FrameTime) -> bool {
        match self.keys.binary_search_by(|k| k.time.cmp(&time)) {
            Ok(pos) => {
                self.keys.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Remove every key. The default value is kept.
    pub fn clear(&mut self) {
        self.keys.clear();
    }

    /// Whether a key exists exactly at `time`.
    pub fn has_key(&self, time: FrameTime) -> bool {
        self.keys.binary_search_by(|k| k.time.cmp(&time)).is_ok()
    }

    /// Value of the key at `time`, if any.
    pub fn key_value(&self, time: FrameTime) -> Option<f64> {
        self.keys
            .binary_search_by(|k| k.time.cmp(&time))
            .ok()
            .map(|pos| self.keys[pos].value)
    }

    /// Evaluate the curve at an integer frame.
    pub fn evaluate(&self, time: FrameTime) -> f64 {
        self.evaluate_f64(f64::from(time))
    }

    /// Evaluate the curve at a fractional time.
    pub fn evaluate_f64(&self, time: f64) -> f64 {
        let (first, last) = match (self.keys.first(), self.keys.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return self.default_value,
        };
        if time <= f64::from(first.time) {
            return first.value;
        }
        if time >= f64::from(last.time) {
            return last.value;
        }
        let idx = self
            .keys
            .partition_point(|k| f64::from(k.time) <= time)
            .saturating_sub(1);
        Self::interpolate(&self.keys[idx], &self.keys[idx + 1], time)
    }

    fn interpolate(a: &Key, b: &Key, time: f64) -> f64 {
        let span = f64::from(b.time - a.time);
        if span <= 0.0 {
            return a.value;
        }
        let t = ((time - f64::from(a.time)) / span).clamp(0.0, 1.0);
        match a.interpolation {
            Interpolation::Hold => a.value,
            Interpolation::Linear => a.value + (b.value - a.value) * t,
        }
    }

    /// All keys (read-only).
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Frame times that carry a key, ascending.
    pub fn key_times(&self) -> impl Iterator<Item = FrameTime> + '_ {
        self.keys.iter().map(|k| k.time)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Whether the curve changes over time (more than one key).
    pub fn is_animated(&self) -> bool {
        self.keys.len() > 1
    }

    /// First and last keyed frame.
    pub fn time_range(&self) -> Option<(FrameTime, FrameTime)> {
        Some((self.keys.first()?.time, self.keys.last()?.time))
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Curve({} keys)", self.keys.len())
    }
}

/// A pair of curves animating a 2D point.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PointCurve {
    pub x: Curve,
    pub y: Curve,
}

impl PointCurve {
    /// Point curve evaluating to `(x, y)` until keyed.
    pub fn with_default(x: f64, y: f64) -> Self {
        Self {
            x: Curve::with_default(x),
            y: Curve::with_default(y),
        }
    }

    pub fn set(&mut self, time: FrameTime, p: crate::geometry::Point) {
        self.x.set(time, p.x);
        self.y.set(time, p.y);
    }

    pub fn evaluate(&self, time: FrameTime) -> crate::geometry::Point {
        crate::geometry::Point::new(self.x.evaluate(time), self.y.evaluate(time))
    }

    /// Whether both dimensions carry a key at `time`.
    pub fn has_key(&self, time: FrameTime) -> bool {
        self.x.has_key(time) && self.y.has_key(time)
    }

    pub fn clear(&mut self) {
        self.x.clear();
        self.y.clear();
    }
}

// ── Tests ───────────────────────────────────────────────────────
