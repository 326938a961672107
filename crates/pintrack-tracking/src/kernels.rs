//! Closed-form and least-squares model kernels for point correspondences.
//!
//! Every model maps reference points `x1` onto target points `x2`.
//! Homogeneous 3×3 models act on column vectors, see
//! [`pintrack_core::apply_homography`].

use nalgebra::{DMatrix, Matrix3};
use pintrack_core::{
    apply_homography, mat3_from_rows, normalize_homography, to_homogeneous, DMat3, DVec2, Point,
};
use serde::{Deserialize, Serialize};

const EPSILON: f64 = 1e-12;

/// Translation, rotation and uniform scale: `x2 = s·R(θ)·x1 + t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Similarity {
    pub translation: DVec2,
    /// Radians, counter-clockwise in the coordinate frame of the points.
    pub rotation: f64,
    pub scale: f64,
}

impl Default for Similarity {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Similarity {
    pub const IDENTITY: Self = Self {
        translation: DVec2::ZERO,
        rotation: 0.0,
        scale: 1.0,
    };

    pub fn to_matrix(&self) -> DMat3 {
        DMat3::from_scale_angle_translation(
            DVec2::splat(self.scale),
            self.rotation,
            self.translation,
        )
    }

    pub fn apply(&self, p: Point) -> Point {
        let (sin, cos) = self.rotation.sin_cos();
        let r = Point::new(cos * p.x - sin * p.y, sin * p.x + cos * p.y);
        r * self.scale + self.translation
    }
}

// ── Minimal solvers ────────────────────────────────────────────

/// Pure translation carrying `x1` onto `x2`.
pub fn translation_from_one_point(x1: Point, x2: Point) -> DMat3 {
    DMat3::from_translation(x2 - x1)
}

/// The similarity carrying the segment `(a1, b1)` onto `(a2, b2)`.
pub fn similarity_from_two_points(a1: Point, b1: Point, a2: Point, b2: Point) -> Option<Similarity> {
    fit_similarity(&[a1, b1], &[a2, b2])
}

/// The affine map carrying three reference points onto three target points.
///
/// Returns `None` when the reference points are collinear.
pub fn affine_from_three_points(x1: &[Point; 3], x2: &[Point; 3]) -> Option<DMat3> {
    let src = DMat3::from_cols(
        to_homogeneous(x1[0]),
        to_homogeneous(x1[1]),
        to_homogeneous(x1[2]),
    );
    if src.determinant().abs() < EPSILON {
        return None;
    }
    let dst = DMat3::from_cols(
        to_homogeneous(x2[0]),
        to_homogeneous(x2[1]),
        to_homogeneous(x2[2]),
    );
    let affine = dst * src.inverse();
    affine.is_finite().then_some(affine)
}

// ── Least-squares fits ─────────────────────────────────────────

/// Mean displacement.
pub fn fit_translation(x1: &[Point], x2: &[Point]) -> Option<DVec2> {
    let n = x1.len().min(x2.len());
    if n == 0 {
        return None;
    }
    let sum = x1
        .iter()
        .zip(x2)
        .fold(DVec2::ZERO, |acc, (a, b)| acc + (*b - *a));
    Some(sum / n as f64)
}

/// Least-squares similarity (2D Umeyama). Exact for two distinct points.
pub fn fit_similarity(x1: &[Point], x2: &[Point]) -> Option<Similarity> {
    let n = x1.len().min(x2.len());
    if n < 2 {
        return None;
    }
    let mean1 = x1[..n].iter().copied().sum::<DVec2>() / n as f64;
    let mean2 = x2[..n].iter().copied().sum::<DVec2>() / n as f64;

    let (mut dot, mut cross, mut spread) = (0.0, 0.0, 0.0);
    for (a, b) in x1.iter().zip(x2).take(n) {
        let a = *a - mean1;
        let b = *b - mean2;
        dot += a.dot(b);
        cross += a.perp_dot(b);
        spread += a.length_squared();
    }
    if spread < EPSILON {
        return None;
    }

    let rotation = cross.atan2(dot);
    let scale = dot.hypot(cross) / spread;
    if scale < EPSILON {
        return None;
    }
    let rotated = Similarity {
        translation: DVec2::ZERO,
        rotation,
        scale,
    }
    .apply(mean1);
    Some(Similarity {
        translation: mean2 - rotated,
        rotation,
        scale,
    })
}

/// Similarity-normalising transform: centroid at the origin, mean distance
/// √2. `None` when all points coincide.
fn normalize_points(points: &[Point]) -> Option<(Vec<Point>, DMat3)> {
    let n = points.len() as f64;
    let centroid = points.iter().copied().sum::<DVec2>() / n;
    let mean_dist = points.iter().map(|p| p.distance(centroid)).sum::<f64>() / n;
    if mean_dist < EPSILON {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    let transform = mat3_from_rows([
        [s, 0.0, -s * centroid.x],
        [0.0, s, -s * centroid.y],
        [0.0, 0.0, 1.0],
    ]);
    let normalized = points.iter().map(|p| (*p - centroid) * s).collect();
    Some((normalized, transform))
}

/// Right singular vector of the smallest singular value, padding `a` with
/// zero rows when it is wide.
fn null_vector(a: DMatrix<f64>) -> Option<[f64; 9]> {
    let a = if a.nrows() < a.ncols() {
        let mut padded = DMatrix::<f64>::zeros(a.ncols(), a.ncols());
        padded.view_mut((0, 0), (a.nrows(), a.ncols())).copy_from(&a);
        padded
    } else {
        a
    };
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_index, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let row = v_t.row(min_index);
    let mut out = [0.0; 9];
    for (o, v) in out.iter_mut().zip(row.iter()) {
        *o = *v;
    }
    Some(out)
}

fn rows_of(h: &[f64; 9]) -> [[f64; 3]; 3] {
    [[h[0], h[1], h[2]], [h[3], h[4], h[5]], [h[6], h[7], h[8]]]
}

/// Homography by the normalised direct linear transform.
///
/// Needs at least four correspondences, no three of them collinear.
pub fn fit_homography(x1: &[Point], x2: &[Point]) -> Option<DMat3> {
    let n = x1.len().min(x2.len());
    if n < 4 {
        return None;
    }
    let (n1, t1) = normalize_points(&x1[..n])?;
    let (n2, t2) = normalize_points(&x2[..n])?;

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (p, q)) in n1.iter().zip(&n2).enumerate() {
        let (x, y, u, v) = (p.x, p.y, q.x, q.y);
        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    let hn = mat3_from_rows(rows_of(&null_vector(a)?));
    if t2.determinant().abs() < EPSILON {
        return None;
    }
    let h = normalize_homography(t2.inverse() * hn * t1);
    (h.is_finite() && h.determinant().abs() > EPSILON).then_some(h)
}

/// Fundamental matrix by the normalised eight-point algorithm, with the
/// rank-2 constraint enforced. Scaled to unit Frobenius norm.
pub fn fit_fundamental(x1: &[Point], x2: &[Point]) -> Option<DMat3> {
    let n = x1.len().min(x2.len());
    if n < 8 {
        return None;
    }
    let (n1, t1) = normalize_points(&x1[..n])?;
    let (n2, t2) = normalize_points(&x2[..n])?;

    // x2ᵀ F x1 = 0
    let mut a = DMatrix::<f64>::zeros(n, 9);
    for (row, (p, q)) in n1.iter().zip(&n2).enumerate() {
        a[(row, 0)] = q.x * p.x;
        a[(row, 1)] = q.x * p.y;
        a[(row, 2)] = q.x;
        a[(row, 3)] = q.y * p.x;
        a[(row, 4)] = q.y * p.y;
        a[(row, 5)] = q.y;
        a[(row, 6)] = p.x;
        a[(row, 7)] = p.y;
        a[(row, 8)] = 1.0;
    }

    let f = null_vector(a)?;
    let fn_rank2 = enforce_rank2(Matrix3::from_row_slice(&f))?;
    let rows = [
        [fn_rank2[(0, 0)], fn_rank2[(0, 1)], fn_rank2[(0, 2)]],
        [fn_rank2[(1, 0)], fn_rank2[(1, 1)], fn_rank2[(1, 2)]],
        [fn_rank2[(2, 0)], fn_rank2[(2, 1)], fn_rank2[(2, 2)]],
    ];
    let f = t2.transpose() * mat3_from_rows(rows) * t1;
    let norm = f.to_cols_array().iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm < EPSILON || !norm.is_finite() {
        return None;
    }
    Some(f * (1.0 / norm))
}

fn enforce_rank2(f: Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = f.svd(true, true);
    let mut singular = svd.singular_values;
    let (min_index, _) = singular
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    singular[min_index] = 0.0;
    Some(svd.u? * Matrix3::from_diagonal(&singular) * svd.v_t?)
}

// ── Residuals ──────────────────────────────────────────────────

/// Distance between `h·x1` and `x2`; infinite when `x1` maps to infinity.
pub fn transfer_error(h: &DMat3, x1: Point, x2: Point) -> f64 {
    apply_homography(h, x1).map_or(f64::INFINITY, |p| p.distance(x2))
}

/// First-order geometric distance of a correspondence to the epipolar
/// geometry of `f`, in pixels.
pub fn sampson_distance(f: &DMat3, x1: Point, x2: Point) -> f64 {
    let p1 = to_homogeneous(x1);
    let p2 = to_homogeneous(x2);
    let fx1 = *f * p1;
    let ftx2 = f.transpose() * p2;
    let denom = fx1.x * fx1.x + fx1.y * fx1.y + ftx2.x * ftx2.x + ftx2.y * ftx2.y;
    if denom < EPSILON {
        return f64::INFINITY;
    }
    let num = p2.dot(fx1);
    (num * num / denom).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pintrack_core::{mat3_entry, DVec3};
    use proptest::prelude::*;

    fn grid() -> Vec<Point> {
        vec![
            Point::new(10.0, 12.0),
            Point::new(120.0, 8.0),
            Point::new(115.0, 95.0),
            Point::new(14.0, 101.0),
            Point::new(60.0, 50.0),
            Point::new(33.0, 77.0),
        ]
    }

    #[test]
    fn test_translation_from_one_point() {
        let m = translation_from_one_point(Point::new(1.0, 2.0), Point::new(4.0, -1.0));
        let p = apply_homography(&m, Point::new(10.0, 10.0)).unwrap();
        assert_eq!(p, Point::new(13.0, 7.0));
    }

    #[test]
    fn test_similarity_from_two_points_is_exact() {
        let truth = Similarity {
            translation: DVec2::new(5.0, -3.0),
            rotation: 0.3,
            scale: 1.5,
        };
        let a = Point::new(2.0, 1.0);
        let b = Point::new(-4.0, 7.0);
        let s = similarity_from_two_points(a, b, truth.apply(a), truth.apply(b)).unwrap();
        assert!((s.rotation - 0.3).abs() < 1e-12);
        assert!((s.scale - 1.5).abs() < 1e-12);
        assert!(s.translation.distance(truth.translation) < 1e-9);
        assert!(similarity_from_two_points(a, a, a, b).is_none());
    }

    #[test]
    fn test_similarity_matrix_matches_apply() {
        let s = Similarity {
            translation: DVec2::new(1.0, 2.0),
            rotation: -0.7,
            scale: 0.8,
        };
        let p = Point::new(3.0, -5.0);
        let via_matrix = apply_homography(&s.to_matrix(), p).unwrap();
        assert!(via_matrix.distance(s.apply(p)) < 1e-12);
    }

    #[test]
    fn test_affine_from_collinear_points() {
        let line = [Point::ZERO, Point::new(1.0, 1.0), Point::new(2.0, 2.0)];
        assert!(affine_from_three_points(&line, &line).is_none());
    }

    #[test]
    fn test_homography_recovers_perspective() {
        let truth = mat3_from_rows([[1.1, 0.05, 7.0], [-0.03, 0.95, -4.0], [1e-4, 2e-4, 1.0]]);
        let x1 = grid();
        let x2: Vec<Point> = x1
            .iter()
            .map(|p| apply_homography(&truth, *p).unwrap())
            .collect();
        let h = fit_homography(&x1[..4], &x2[..4]).unwrap();
        for (a, b) in x1.iter().zip(&x2) {
            assert!(transfer_error(&h, *a, *b) < 1e-6);
        }
        assert!((mat3_entry(&h, 2, 2) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_homography_rejects_coincident_points() {
        let x1 = vec![Point::new(3.0, 3.0); 4];
        assert!(fit_homography(&x1, &grid()[..4]).is_none());
        assert!(fit_homography(&grid()[..3], &grid()[..3]).is_none());
    }

    #[test]
    fn test_fundamental_satisfies_epipolar_constraint() {
        // Two pinhole views of a 3D point cloud: P1 = K[I|0], P2 = K[R|t].
        let focal = 500.0;
        let principal = DVec2::new(320.0, 240.0);
        let (sin, cos) = 0.1_f64.sin_cos();
        let rotation = mat3_from_rows([[cos, 0.0, sin], [0.0, 1.0, 0.0], [-sin, 0.0, cos]]);
        let t = DVec3::new(0.5, 0.1, 0.05);
        let project = |p: DVec3| principal + DVec2::new(p.x, p.y) * (focal / p.z);

        let mut x1 = Vec::new();
        let mut x2 = Vec::new();
        for i in 0..12 {
            let fi = i as f64;
            let world = DVec3::new(
                (fi * 0.37).sin() * 2.0,
                (fi * 0.91).cos() * 1.5,
                5.0 + (fi * 0.53).sin() * 2.0,
            );
            x1.push(project(world));
            x2.push(project(rotation * world + t));
        }

        let f = fit_fundamental(&x1, &x2).unwrap();
        for (a, b) in x1.iter().zip(&x2) {
            assert!(sampson_distance(&f, *a, *b) < 1e-6);
        }
        assert!(f.determinant().abs() < 1e-9);
        assert!(fit_fundamental(&x1[..7], &x2[..7]).is_none());
    }

    proptest! {
        #[test]
        fn prop_similarity_round_trip(
            tx in -50.0f64..50.0,
            ty in -50.0f64..50.0,
            rotation in -3.0f64..3.0,
            scale in 0.2f64..4.0,
        ) {
            let truth = Similarity { translation: DVec2::new(tx, ty), rotation, scale };
            let x1 = grid();
            let x2: Vec<Point> = x1.iter().map(|p| truth.apply(*p)).collect();
            let fit = fit_similarity(&x1, &x2).unwrap();
            for (a, b) in x1.iter().zip(&x2) {
                prop_assert!(fit.apply(*a).distance(*b) < 1e-6);
            }
            prop_assert!((fit.scale - scale).abs() < 1e-9);
        }

        #[test]
        fn prop_affine_reproduces_targets(
            a in -2.0f64..2.0, b in -2.0f64..2.0, c in -40.0f64..40.0,
            d in -2.0f64..2.0, e in -2.0f64..2.0, f in -40.0f64..40.0,
        ) {
            let truth = mat3_from_rows([[a, b, c], [d, e, f], [0.0, 0.0, 1.0]]);
            let x1 = [Point::new(0.0, 0.0), Point::new(40.0, 3.0), Point::new(7.0, 35.0)];
            let x2 = x1.map(|p| apply_homography(&truth, p).unwrap());
            let fit = affine_from_three_points(&x1, &x2).unwrap();
            for (p, q) in x1.iter().zip(&x2) {
                prop_assert!(transfer_error(&fit, *p, *q) < 1e-9);
            }
        }

        #[test]
        fn prop_translation_is_mean_shift(dx in -100.0f64..100.0, dy in -100.0f64..100.0) {
            let x1 = grid();
            let x2: Vec<Point> = x1.iter().map(|p| *p + DVec2::new(dx, dy)).collect();
            let t = fit_translation(&x1, &x2).unwrap();
            prop_assert!(t.distance(DVec2::new(dx, dy)) < 1e-9);
        }
    }
}
