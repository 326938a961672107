//! Iterative region alignment.
//!
//! A patch described by a four-corner quad in the reference frame is located
//! in the target frame by Levenberg-Marquardt refinement of a parametric warp,
//! optionally seeded by an exhaustive integer-translation search. All
//! coordinates handled here are bottom-up.

use crate::image::{GrayImage, ImageWindow};
use nalgebra::{DMatrix, DVector};
use pintrack_core::{apply_homography, unit_square_to_quad, Point, Quad, RectD};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

const MIN_SAMPLES_PER_SIDE: usize = 5;
const MAX_SAMPLES_PER_SIDE: usize = 48;
/// Corner motion, in pixels, under which refinement stops.
const CONVERGENCE_PIXELS: f64 = 1e-3;
const FINITE_DIFFERENCE_STEP: f64 = 1e-4;
const MAX_DAMPING: f64 = 1e8;

/// Warp family the alignment optimizes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MotionModel {
    #[default]
    Translation,
    TranslationRotation,
    TranslationScale,
    TranslationRotationScale,
    Affine,
    Homography,
}

impl MotionModel {
    pub const ALL: [MotionModel; 6] = [
        MotionModel::Translation,
        MotionModel::TranslationRotation,
        MotionModel::TranslationScale,
        MotionModel::TranslationRotationScale,
        MotionModel::Affine,
        MotionModel::Homography,
    ];

    /// Number of warp parameters.
    pub fn degrees_of_freedom(self) -> usize {
        match self {
            MotionModel::Translation => 2,
            MotionModel::TranslationRotation | MotionModel::TranslationScale => 3,
            MotionModel::TranslationRotationScale => 4,
            MotionModel::Affine => 6,
            MotionModel::Homography => 8,
        }
    }

    /// Apply parameters `p` to `base`. Zero parameters give back `base`.
    fn warp(self, base: &Quad, center: Point, p: &[f64]) -> Quad {
        let t = Point::new(p[0], p[1]);
        match self {
            MotionModel::Translation => base.translate(t),
            MotionModel::TranslationRotation => {
                let (sin, cos) = p[2].sin_cos();
                base.map(|q| {
                    let d = q - center;
                    center + t + Point::new(cos * d.x - sin * d.y, sin * d.x + cos * d.y)
                })
            }
            MotionModel::TranslationScale => {
                let s = 1.0 + p[2];
                base.map(|q| center + t + (q - center) * s)
            }
            MotionModel::TranslationRotationScale => {
                let (a, b) = (1.0 + p[2], p[3]);
                base.map(|q| {
                    let d = q - center;
                    center + t + Point::new(a * d.x - b * d.y, b * d.x + a * d.y)
                })
            }
            MotionModel::Affine => base.map(|q| {
                let d = q - center;
                center
                    + t
                    + Point::new(
                        (1.0 + p[2]) * d.x + p[3] * d.y,
                        p[4] * d.x + (1.0 + p[5]) * d.y,
                    )
            }),
            MotionModel::Homography => {
                let mut corners = base.0;
                for (i, c) in corners.iter_mut().enumerate() {
                    *c += Point::new(p[2 * i], p[2 * i + 1]);
                }
                Quad::new(corners)
            }
        }
    }
}

/// Parameters of one alignment call.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionOptions {
    pub mode: MotionModel,
    pub minimum_correlation: f64,
    pub max_iterations: u32,
    pub use_brute_initialization: bool,
    pub use_normalized_intensities: bool,
    /// Pre-blur applied to both frames.
    pub sigma: f64,
}

impl Default for RegionOptions {
    fn default() -> Self {
        Self {
            mode: MotionModel::Translation,
            minimum_correlation: 0.8,
            max_iterations: 50,
            use_brute_initialization: true,
            use_normalized_intensities: false,
            sigma: 0.9,
        }
    }
}

/// Why alignment stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Termination {
    Converged,
    /// Ran out of iterations; the last estimate is still reported.
    NoConvergence,
    SourceOutOfBounds,
    DestinationOutOfBounds,
    Degenerate,
    InsufficientCorrelation,
}

impl Termination {
    /// Whether the engine considers the run a success.
    pub fn is_success(self) -> bool {
        matches!(self, Termination::Converged | Termination::NoConvergence)
    }
}

/// Outcome of [`track_region`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionResult {
    pub termination: Termination,
    /// Normalized cross-correlation of the final patch. May be NaN for
    /// textureless patches.
    pub correlation: f64,
    pub iterations: u32,
    /// Final patch quad in the target frame.
    pub quad: Quad,
}

impl RegionResult {
    /// Success reported by the engine and a numerically sound result.
    pub fn is_usable(&self) -> bool {
        self.termination.is_success() && self.quad.is_finite() && !self.correlation.is_infinite()
    }
}

#[derive(Debug, Default)]
struct Scratch {
    grid: Vec<Point>,
    template: Vec<f64>,
    positions: Vec<Point>,
    samples: Vec<f64>,
    trial_positions: Vec<Point>,
    trial_samples: Vec<f64>,
    gradients: Vec<Point>,
    warp_jacobian: Vec<Point>,
}

impl Scratch {
    fn bytes(&self) -> usize {
        let points = self.grid.capacity()
            + self.positions.capacity()
            + self.trial_positions.capacity()
            + self.gradients.capacity()
            + self.warp_jacobian.capacity();
        let scalars =
            self.template.capacity() + self.samples.capacity() + self.trial_samples.capacity();
        points * std::mem::size_of::<Point>() + scalars * std::mem::size_of::<f64>()
    }
}

thread_local! {
    static SCRATCH: RefCell<Scratch> = RefCell::new(Scratch::default());
}

/// Free the calling thread's alignment buffers.
pub fn release_thread_scratch() {
    SCRATCH.with(|cell| *cell.borrow_mut() = Scratch::default());
}

/// Bytes currently held by the calling thread's alignment buffers.
pub fn thread_scratch_bytes() -> usize {
    SCRATCH.with(|cell| cell.borrow().bytes())
}

/// Locate `reference_quad` of `reference` inside `target`.
///
/// `initial_quad` is the starting guess in the target frame. The brute-force
/// search keeps the guess inside `search_region`.
pub fn track_region(
    reference: &GrayImage,
    target: &GrayImage,
    reference_quad: &Quad,
    initial_quad: &Quad,
    search_region: RectD,
    options: &RegionOptions,
) -> RegionResult {
    SCRATCH.with(|cell| {
        let mut scratch = cell.borrow_mut();
        align(
            &mut scratch,
            reference,
            target,
            reference_quad,
            initial_quad,
            search_region,
            options,
        )
    })
}

fn align(
    scratch: &mut Scratch,
    reference: &GrayImage,
    target: &GrayImage,
    reference_quad: &Quad,
    initial_quad: &Quad,
    search_region: RectD,
    options: &RegionOptions,
) -> RegionResult {
    let fail = |termination, quad: Quad, iterations| RegionResult {
        termination,
        correlation: 0.0,
        iterations,
        quad,
    };
    if !reference_quad.is_finite() || !initial_quad.is_finite() {
        return fail(Termination::Degenerate, *initial_quad, 0);
    }
    let Some(reference_h) = unit_square_to_quad(reference_quad) else {
        return fail(Termination::Degenerate, *initial_quad, 0);
    };
    let normalized = options.use_normalized_intensities;
    let Scratch {
        grid,
        template,
        positions,
        samples,
        trial_positions,
        trial_samples,
        gradients,
        warp_jacobian,
    } = scratch;

    let side = (reference_quad.max_edge().ceil() as usize + 1)
        .clamp(MIN_SAMPLES_PER_SIDE, MAX_SAMPLES_PER_SIDE);
    let step = 1.0 / (side - 1) as f64;
    grid.clear();
    for j in 0..side {
        for i in 0..side {
            grid.push(Point::new(i as f64 * step, j as f64 * step));
        }
    }

    let reference_window =
        ImageWindow::build(reference, reference_quad.bounding_box(), options.sigma);
    template.clear();
    for uv in grid.iter() {
        let Some(p) = apply_homography(&reference_h, *uv) else {
            return fail(Termination::Degenerate, *initial_quad, 0);
        };
        if !reference_window.contains(p) {
            return fail(Termination::SourceOutOfBounds, *initial_quad, 0);
        }
        template.push(f64::from(reference_window.sample(p)));
    }
    if normalized {
        normalize(template);
    }

    let target_area = search_region
        .union(initial_quad.bounding_box())
        .expand(reference_quad.max_edge());
    let target_window = ImageWindow::build(target, target_area, options.sigma);

    let mut base = *initial_quad;
    if options.use_brute_initialization {
        if let Some(offset) = brute_force_translation(
            &target_window,
            &base,
            grid,
            template,
            positions,
            samples,
            search_region,
            normalized,
        ) {
            base = base.translate(offset);
        }
    }

    let mode = options.mode;
    let center = base.centroid();
    let mut params = vec![0.0; mode.degrees_of_freedom()];
    let mut quad = base;
    let mut intensity_scale =
        match sample_quad(&target_window, &quad, grid, positions, samples, normalized) {
            Ok(scale) => scale,
            Err(termination) => return fail(termination, quad, 0),
        };
    let mut cost = sum_squared_difference(samples, template);
    let mut damping = 1e-3;
    let mut termination = Termination::NoConvergence;
    let mut iterations = 0;
    let dof = params.len();

    while iterations < options.max_iterations {
        iterations += 1;

        gradients.clear();
        gradients.extend(positions.iter().map(|p| {
            let (gx, gy) = target_window.gradient(*p);
            Point::new(f64::from(gx), f64::from(gy)) * intensity_scale
        }));
        if compute_warp_jacobian(mode, &base, center, &params, grid, warp_jacobian).is_none() {
            termination = Termination::Degenerate;
            break;
        }

        let mut jtj = DMatrix::<f64>::zeros(dof, dof);
        let mut jtr = DVector::<f64>::zeros(dof);
        let mut row = vec![0.0; dof];
        for (k, (sample, t)) in samples.iter().zip(template.iter()).enumerate() {
            let residual = sample - t;
            let g = gradients[k];
            for (a, value) in row.iter_mut().enumerate() {
                *value = g.dot(warp_jacobian[k * dof + a]);
            }
            for a in 0..dof {
                jtr[a] += row[a] * residual;
                for b in 0..dof {
                    jtj[(a, b)] += row[a] * row[b];
                }
            }
        }

        let mut damped = jtj.clone();
        for a in 0..dof {
            damped[(a, a)] += damping * jtj[(a, a)].max(1e-9);
        }
        let Some(delta) = damped.lu().solve(&(-jtr)) else {
            termination = Termination::Degenerate;
            break;
        };

        let candidate: Vec<f64> = params.iter().zip(delta.iter()).map(|(p, d)| p + d).collect();
        let candidate_quad = mode.warp(&base, center, &candidate);
        match sample_quad(
            &target_window,
            &candidate_quad,
            grid,
            trial_positions,
            trial_samples,
            normalized,
        ) {
            Ok(scale) => {
                let candidate_cost = sum_squared_difference(trial_samples, template);
                if candidate_cost <= cost {
                    let moved = max_corner_motion(&quad, &candidate_quad);
                    std::mem::swap(positions, trial_positions);
                    std::mem::swap(samples, trial_samples);
                    params = candidate;
                    quad = candidate_quad;
                    cost = candidate_cost;
                    intensity_scale = scale;
                    damping = (damping * 0.1).max(1e-9);
                    if moved < CONVERGENCE_PIXELS {
                        termination = Termination::Converged;
                        break;
                    }
                } else {
                    damping *= 10.0;
                    if damping > MAX_DAMPING {
                        termination = Termination::Converged;
                        break;
                    }
                }
            }
            Err(reason) => {
                damping *= 10.0;
                if damping > MAX_DAMPING {
                    termination = reason;
                    break;
                }
            }
        }
    }

    if !termination.is_success() {
        return fail(termination, quad, iterations);
    }

    let correlation = normalized_cross_correlation(template, samples);
    // NaN compares false and is left to the caller.
    if correlation < options.minimum_correlation {
        return RegionResult {
            termination: Termination::InsufficientCorrelation,
            correlation,
            iterations,
            quad,
        };
    }
    RegionResult {
        termination,
        correlation,
        iterations,
        quad,
    }
}

/// Sample the target under `quad`, returning the intensity normalization
/// factor that was applied.
fn sample_quad(
    window: &ImageWindow,
    quad: &Quad,
    grid: &[Point],
    positions: &mut Vec<Point>,
    samples: &mut Vec<f64>,
    normalized: bool,
) -> Result<f64, Termination> {
    let h = unit_square_to_quad(quad).ok_or(Termination::Degenerate)?;
    positions.clear();
    samples.clear();
    for uv in grid {
        let p = apply_homography(&h, *uv).ok_or(Termination::Degenerate)?;
        if !window.contains(p) {
            return Err(Termination::DestinationOutOfBounds);
        }
        positions.push(p);
        samples.push(f64::from(window.sample(p)));
    }
    Ok(if normalized { normalize(samples) } else { 1.0 })
}

/// Derivatives of every sample position with respect to every warp
/// parameter, laid out sample-major.
fn compute_warp_jacobian(
    mode: MotionModel,
    base: &Quad,
    center: Point,
    params: &[f64],
    grid: &[Point],
    out: &mut Vec<Point>,
) -> Option<()> {
    let dof = params.len();
    out.clear();
    out.resize(grid.len() * dof, Point::ZERO);
    let mut shifted = params.to_vec();
    for j in 0..dof {
        shifted[j] = params[j] + FINITE_DIFFERENCE_STEP;
        let plus = unit_square_to_quad(&mode.warp(base, center, &shifted))?;
        shifted[j] = params[j] - FINITE_DIFFERENCE_STEP;
        let minus = unit_square_to_quad(&mode.warp(base, center, &shifted))?;
        shifted[j] = params[j];
        for (k, uv) in grid.iter().enumerate() {
            let a = apply_homography(&plus, *uv)?;
            let b = apply_homography(&minus, *uv)?;
            out[k * dof + j] = (a - b) / (2.0 * FINITE_DIFFERENCE_STEP);
        }
    }
    Some(())
}

/// Exhaustive integer-translation search minimizing the sum of absolute
/// differences. Offsets keep the quad's bounding box inside `search_region`.
#[allow(clippy::too_many_arguments)]
fn brute_force_translation(
    window: &ImageWindow,
    quad: &Quad,
    grid: &[Point],
    template: &[f64],
    positions: &mut Vec<Point>,
    samples: &mut Vec<f64>,
    search_region: RectD,
    normalized: bool,
) -> Option<Point> {
    let bbox = quad.bounding_box();
    let dx_min = (search_region.x1 - bbox.x1).ceil() as i32;
    let dx_max = (search_region.x2 - bbox.x2).floor() as i32;
    let dy_min = (search_region.y1 - bbox.y1).ceil() as i32;
    let dy_max = (search_region.y2 - bbox.y2).floor() as i32;
    if dx_min > dx_max || dy_min > dy_max {
        return None;
    }

    let h = unit_square_to_quad(quad)?;
    positions.clear();
    for uv in grid {
        positions.push(apply_homography(&h, *uv)?);
    }

    let mut best: Option<(f64, Point)> = None;
    for dy in dy_min..=dy_max {
        for dx in dx_min..=dx_max {
            let offset = Point::new(f64::from(dx), f64::from(dy));
            if !window.contains(bbox.min() + offset) || !window.contains(bbox.max() + offset) {
                continue;
            }
            samples.clear();
            samples.extend(positions.iter().map(|p| f64::from(window.sample(*p + offset))));
            if normalized {
                normalize(samples);
            }
            let sad: f64 = samples
                .iter()
                .zip(template)
                .map(|(a, b)| (a - b).abs())
                .sum();
            // Ties keep the smallest displacement.
            let better = best.map_or(true, |(score, kept): (f64, Point)| {
                sad < score
                    || (sad == score && offset.length_squared() < kept.length_squared())
            });
            if better {
                best = Some((sad, offset));
            }
        }
    }
    best.map(|(_, offset)| offset)
}

/// Divide by the mean; returns the factor applied.
fn normalize(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 1.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean.abs() < 1e-12 {
        return 1.0;
    }
    let scale = 1.0 / mean;
    for v in values.iter_mut() {
        *v *= scale;
    }
    scale
}

fn sum_squared_difference(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn max_corner_motion(a: &Quad, b: &Quad) -> f64 {
    a.0.iter()
        .zip(b.0.iter())
        .map(|(p, q)| p.distance(*q))
        .fold(0.0, f64::max)
}

/// Zero-mean normalized cross-correlation. NaN when either side is flat.
pub fn normalized_cross_correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return f64::NAN;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a[..n].iter().zip(&b[..n]) {
        let (da, db) = (x - mean_a, y - mean_b);
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    cov / (var_a * var_b).sqrt()
}
