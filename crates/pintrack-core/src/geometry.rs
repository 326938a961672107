//! Geometric primitives for planar tracking.
//!
//! Points are double precision. 3×3 transforms use homogeneous coordinates
//! and act on column vectors `(x, y, 1)`.

use glam::{DMat3, DVec2, DVec3};
use serde::{Deserialize, Serialize};

/// 2D point.
pub type Point = DVec2;

/// Axis-aligned rectangle given by its two extreme corners.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RectD {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl RectD {
    /// Create a new rectangle.
    #[inline]
    pub const fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Create a rectangle from two corners in any order.
    pub fn from_corners(a: Point, b: Point) -> Self {
        Self {
            x1: a.x.min(b.x),
            y1: a.y.min(b.y),
            x2: a.x.max(b.x),
            y2: a.y.max(b.y),
        }
    }

    #[inline]
    pub fn width(self) -> f64 {
        self.x2 - self.x1
    }

    #[inline]
    pub fn height(self) -> f64 {
        self.y2 - self.y1
    }

    #[inline]
    pub fn min(self) -> Point {
        Point::new(self.x1, self.y1)
    }

    #[inline]
    pub fn max(self) -> Point {
        Point::new(self.x2, self.y2)
    }

    /// Check if a point is inside the rectangle (edges included).
    #[inline]
    pub fn contains(self, p: Point) -> bool {
        p.x >= self.x1 && p.x <= self.x2 && p.y >= self.y1 && p.y <= self.y2
    }

    /// Whether `other` lies entirely inside this rectangle.
    pub fn contains_rect(self, other: Self) -> bool {
        other.x1 >= self.x1 && other.x2 <= self.x2 && other.y1 >= self.y1 && other.y2 <= self.y2
    }

    /// Compute intersection with another rectangle.
    pub fn intersection(self, other: Self) -> Option<Self> {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        if x1 <= x2 && y1 <= y2 {
            Some(Self::new(x1, y1, x2, y2))
        } else {
            None
        }
    }

    /// Compute union with another rectangle (bounding box).
    pub fn union(self, other: Self) -> Self {
        Self::new(
            self.x1.min(other.x1),
            self.y1.min(other.y1),
            self.x2.max(other.x2),
            self.y2.max(other.y2),
        )
    }

    /// Expand the rectangle by a margin on all sides.
    pub fn expand(self, margin: f64) -> Self {
        Self::new(
            self.x1 - margin,
            self.y1 - margin,
            self.x2 + margin,
            self.y2 + margin,
        )
    }

    /// Translate the rectangle.
    pub fn translate(self, delta: Point) -> Self {
        Self::new(
            self.x1 + delta.x,
            self.y1 + delta.y,
            self.x2 + delta.x,
            self.y2 + delta.y,
        )
    }

    /// The four corners in `(x1,y1), (x2,y1), (x2,y2), (x1,y2)` order.
    pub fn corners(self) -> [Point; 4] {
        [
            Point::new(self.x1, self.y1),
            Point::new(self.x2, self.y1),
            Point::new(self.x2, self.y2),
            Point::new(self.x1, self.y2),
        ]
    }
}

/// Four-point quad. Corner order is top-left, top-right, bottom-right,
/// bottom-left in whichever vertical convention the owner uses.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Quad(pub [Point; 4]);

impl Quad {
    pub const fn new(corners: [Point; 4]) -> Self {
        Self(corners)
    }

    /// Axis-aligned quad spanning `rect`.
    pub fn from_rect(rect: RectD) -> Self {
        Self(rect.corners())
    }

    #[inline]
    pub fn corners(&self) -> &[Point; 4] {
        &self.0
    }

    /// Mean of the four corners.
    pub fn centroid(&self) -> Point {
        (self.0[0] + self.0[1] + self.0[2] + self.0[3]) * 0.25
    }

    pub fn translate(&self, delta: Point) -> Self {
        Self(self.0.map(|p| p + delta))
    }

    /// Apply `f` to every corner.
    pub fn map(&self, f: impl Fn(Point) -> Point) -> Self {
        Self(self.0.map(f))
    }

    pub fn bounding_box(&self) -> RectD {
        let mut rect = RectD::from_corners(self.0[0], self.0[0]);
        for p in &self.0[1..] {
            rect = rect.union(RectD::from_corners(*p, *p));
        }
        rect
    }

    /// Length of the longest edge.
    pub fn max_edge(&self) -> f64 {
        (0..4)
            .map(|i| self.0[i].distance(self.0[(i + 1) % 4]))
            .fold(0.0, f64::max)
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|p| p.is_finite())
    }
}

/// Flip a vertical coordinate between top-down and bottom-up conventions.
///
/// The mapping is its own inverse.
#[inline]
pub fn invert_y(y: f64, height: f64) -> f64 {
    height - 1.0 - y
}

/// Lift a euclidean point to homogeneous coordinates.
#[inline]
pub fn to_homogeneous(p: Point) -> DVec3 {
    DVec3::new(p.x, p.y, 1.0)
}

/// Build a matrix from row-major entries.
pub fn mat3_from_rows(rows: [[f64; 3]; 3]) -> DMat3 {
    DMat3::from_cols_array_2d(&rows).transpose()
}

/// Row-major entries of a matrix.
pub fn mat3_to_rows(m: &DMat3) -> [[f64; 3]; 3] {
    m.transpose().to_cols_array_2d()
}

/// Entry at row `r`, column `c`.
#[inline]
pub fn mat3_entry(m: &DMat3, r: usize, c: usize) -> f64 {
    m.col(c)[r]
}

/// Map a point through a homography, dividing by the homogeneous weight.
///
/// Returns `None` when the point maps to infinity.
pub fn apply_homography(h: &DMat3, p: Point) -> Option<Point> {
    let r = *h * to_homogeneous(p);
    if r.z.abs() < 1e-12 {
        return None;
    }
    let out = Point::new(r.x / r.z, r.y / r.z);
    out.is_finite().then_some(out)
}

/// Divide a homography by its bottom-right entry when that entry is usable.
pub fn normalize_homography(h: DMat3) -> DMat3 {
    let s = mat3_entry(&h, 2, 2);
    if s.abs() > f64::EPSILON {
        h * (1.0 / s)
    } else {
        h
    }
}

/// Projective map sending the unit square corners
/// `(0,0), (1,0), (1,1), (0,1)` onto the quad corners in order.
pub fn unit_square_to_quad(quad: &Quad) -> Option<DMat3> {
    let [p0, p1, p2, p3] = quad.0;
    let sx = p0.x - p1.x + p2.x - p3.x;
    let sy = p0.y - p1.y + p2.y - p3.y;

    let (a, b, c, d, e, f, g, h);
    if sx.abs() < 1e-12 && sy.abs() < 1e-12 {
        a = p1.x - p0.x;
        b = p3.x - p0.x;
        c = p0.x;
        d = p1.y - p0.y;
        e = p3.y - p0.y;
        f = p0.y;
        g = 0.0;
        h = 0.0;
    } else {
        let dx1 = p1.x - p2.x;
        let dx2 = p3.x - p2.x;
        let dy1 = p1.y - p2.y;
        let dy2 = p3.y - p2.y;
        let det = dx1 * dy2 - dx2 * dy1;
        if det.abs() < 1e-12 {
            return None;
        }
        g = (sx * dy2 - dx2 * sy) / det;
        h = (dx1 * sy - sx * dy1) / det;
        a = p1.x - p0.x + g * p1.x;
        b = p3.x - p0.x + h * p3.x;
        c = p0.x;
        d = p1.y - p0.y + g * p1.y;
        e = p3.y - p0.y + h * p3.y;
        f = p0.y;
    }

    let m = mat3_from_rows([[a, b, c], [d, e, f], [g, h, 1.0]]);
    (m.determinant().abs() > 1e-12).then_some(m)
}

/// Homography sending each corner of `from` onto the matching corner of `to`.
pub fn quad_to_quad(from: &Quad, to: &Quad) -> Option<DMat3> {
    let src = unit_square_to_quad(from)?;
    let dst = unit_square_to_quad(to)?;
    Some(normalize_homography(dst * src.inverse()))
}
