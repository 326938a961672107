//! PROSAC robust estimation over ordered correspondences.
//!
//! Correspondences must be sorted most-confident first. Early iterations
//! sample only from the head of the list and the sampling pool grows
//! following the Chum–Matas schedule, so a clean head converges in a handful
//! of draws.

use crate::config::ProsacConfig;
use crate::kernels::{
    fit_fundamental, fit_homography, fit_similarity, fit_translation, sampson_distance,
    transfer_error, Similarity,
};
use pintrack_core::{DMat3, DVec2, EstimateError, Point};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Model families the estimator can fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    Translation,
    Similarity,
    Homography,
    Fundamental,
}

impl ModelKind {
    /// Fewest correspondences that determine a model.
    pub fn min_samples(self) -> usize {
        self.kernel().min_samples
    }

    fn kernel(self) -> &'static Kernel {
        &KERNELS[self as usize]
    }
}

/// A fitted model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RobustModel {
    Translation(DVec2),
    Similarity(Similarity),
    Homography(DMat3),
    Fundamental(DMat3),
}

impl RobustModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Translation(_) => ModelKind::Translation,
            Self::Similarity(_) => ModelKind::Similarity,
            Self::Homography(_) => ModelKind::Homography,
            Self::Fundamental(_) => ModelKind::Fundamental,
        }
    }

    /// Homogeneous matrix of the model. For a fundamental matrix this is `F`
    /// itself, which does not map points.
    pub fn matrix(&self) -> DMat3 {
        match self {
            Self::Translation(t) => DMat3::from_translation(*t),
            Self::Similarity(s) => s.to_matrix(),
            Self::Homography(h) | Self::Fundamental(h) => *h,
        }
    }

    /// Residual of one correspondence, in pixels.
    pub fn residual(&self, x1: Point, x2: Point) -> f64 {
        (self.kind().kernel().residual)(self, x1, x2)
    }
}

/// How a successful fit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProsacOutcome {
    FoundModel,
    /// Exactly the minimal sample was available and used.
    InliersIsMinSamples,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProsacFit {
    pub model: RobustModel,
    pub outcome: ProsacOutcome,
    /// Indices of the correspondences consistent with `model`.
    pub inliers: Vec<usize>,
    pub iterations: usize,
}

struct Kernel {
    min_samples: usize,
    fit: fn(&[Point], &[Point]) -> Option<RobustModel>,
    residual: fn(&RobustModel, Point, Point) -> f64,
}

fn fit_translation_model(x1: &[Point], x2: &[Point]) -> Option<RobustModel> {
    fit_translation(x1, x2).map(RobustModel::Translation)
}

fn fit_similarity_model(x1: &[Point], x2: &[Point]) -> Option<RobustModel> {
    fit_similarity(x1, x2).map(RobustModel::Similarity)
}

fn fit_homography_model(x1: &[Point], x2: &[Point]) -> Option<RobustModel> {
    fit_homography(x1, x2).map(RobustModel::Homography)
}

fn fit_fundamental_model(x1: &[Point], x2: &[Point]) -> Option<RobustModel> {
    fit_fundamental(x1, x2).map(RobustModel::Fundamental)
}

fn transfer_residual(model: &RobustModel, x1: Point, x2: Point) -> f64 {
    match model {
        RobustModel::Similarity(s) => s.apply(x1).distance(x2),
        other => transfer_error(&other.matrix(), x1, x2),
    }
}

fn epipolar_residual(model: &RobustModel, x1: Point, x2: Point) -> f64 {
    sampson_distance(&model.matrix(), x1, x2)
}

// Indexed by `ModelKind as usize`.
static KERNELS: [Kernel; 4] = [
    Kernel {
        min_samples: 1,
        fit: fit_translation_model,
        residual: transfer_residual,
    },
    Kernel {
        min_samples: 2,
        fit: fit_similarity_model,
        residual: transfer_residual,
    },
    Kernel {
        min_samples: 4,
        fit: fit_homography_model,
        residual: transfer_residual,
    },
    Kernel {
        min_samples: 8,
        fit: fit_fundamental_model,
        residual: epipolar_residual,
    },
];

/// Linear congruential generator; same constants and seed as the rest of
/// the tracker so runs are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next_index(&mut self, n: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1);
        (self.0 >> 33) as usize % n
    }
}

/// Draws needed to hit an all-inlier sample of size `m` with probability
/// `confidence`, given an inlier ratio.
fn required_iterations(inlier_ratio: f64, m: usize, confidence: f64) -> usize {
    let good_sample = inlier_ratio.clamp(0.0, 1.0).powi(m as i32);
    if good_sample >= 1.0 - f64::EPSILON {
        return 1;
    }
    if good_sample <= f64::EPSILON {
        return usize::MAX;
    }
    let k = (1.0 - confidence).ln() / (1.0 - good_sample).ln();
    if k.is_finite() {
        k.ceil().max(1.0) as usize
    } else {
        usize::MAX
    }
}

fn inliers_of(model: &RobustModel, x1: &[Point], x2: &[Point], threshold: f64) -> Vec<usize> {
    x1.iter()
        .zip(x2)
        .enumerate()
        .filter(|(_, (a, b))| model.residual(**a, **b) < threshold)
        .map(|(i, _)| i)
        .collect()
}

/// Fit `kind` robustly to the correspondences `x1[i] → x2[i]`.
pub fn prosac(
    kind: ModelKind,
    x1: &[Point],
    x2: &[Point],
    config: &ProsacConfig,
) -> Result<ProsacFit, EstimateError> {
    let kernel = kind.kernel();
    let m = kernel.min_samples;
    let n_total = x1.len().min(x2.len());
    let (x1, x2) = (&x1[..n_total], &x2[..n_total]);

    if n_total < m {
        return Err(EstimateError::NotEnoughPoints {
            required: m,
            got: n_total,
        });
    }
    if n_total == m {
        let model = (kernel.fit)(x1, x2).ok_or(EstimateError::NoModelFound)?;
        return Ok(ProsacFit {
            model,
            outcome: ProsacOutcome::InliersIsMinSamples,
            inliers: (0..m).collect(),
            iterations: 1,
        });
    }

    let threshold = config.inlier_threshold;
    let param_limit = config.max_iterations as usize;
    let proportion_limit = required_iterations(
        1.0 - config.max_outlier_proportion,
        m,
        config.confidence,
    );
    let limit = param_limit.min(proportion_limit);

    // Growth schedule: T_n expected draws from the top-n pool.
    let mut n = m;
    let mut t_n = param_limit as f64;
    for i in 0..m {
        t_n *= (n - i) as f64 / (n_total - i) as f64;
    }
    let mut t_prime = 1usize;

    let mut rng = Lcg(config.seed);
    let mut sample = Vec::with_capacity(m);
    let mut s1 = Vec::with_capacity(m);
    let mut s2 = Vec::with_capacity(m);
    let mut best: Option<(RobustModel, Vec<usize>)> = None;
    let mut needed = usize::MAX;
    let mut t = 0usize;

    while t < limit && t < needed {
        t += 1;
        if t == t_prime && n < n_total {
            let t_next = t_n * (n + 1) as f64 / (n + 1 - m) as f64;
            t_prime += (t_next - t_n).ceil().max(1.0) as usize;
            t_n = t_next;
            n += 1;
        }

        sample.clear();
        if t_prime < t {
            // Pool fully opened for this size: uniform over the top n.
            while sample.len() < m {
                let i = rng.next_index(n);
                if !sample.contains(&i) {
                    sample.push(i);
                }
            }
        } else {
            sample.push(n - 1);
            while sample.len() < m {
                let i = rng.next_index(n - 1);
                if !sample.contains(&i) {
                    sample.push(i);
                }
            }
        }

        s1.clear();
        s2.clear();
        s1.extend(sample.iter().map(|&i| x1[i]));
        s2.extend(sample.iter().map(|&i| x2[i]));
        let Some(model) = (kernel.fit)(&s1, &s2) else {
            continue;
        };

        let inliers = inliers_of(&model, x1, x2, threshold);
        if best.as_ref().map_or(true, |(_, b)| inliers.len() > b.len()) {
            let ratio = inliers.len() as f64 / n_total as f64;
            if 1.0 - ratio <= config.max_outlier_proportion {
                needed = required_iterations(ratio, m, config.confidence);
            }
            best = Some((model, inliers));
        }
    }

    // Every sample was degenerate.
    let Some((model, inliers)) = best else {
        return Err(EstimateError::NoModelFound);
    };

    let outlier_ratio = 1.0 - inliers.len() as f64 / n_total as f64;
    if inliers.len() < m || outlier_ratio > config.max_outlier_proportion {
        debug!(
            ?kind,
            iterations = t,
            inliers = inliers.len(),
            total = n_total,
            "No model with enough support"
        );
        return Err(if proportion_limit <= param_limit {
            EstimateError::MaxIterationsFromProportionReached
        } else {
            EstimateError::MaxIterationsParamReached
        });
    }

    // Polish on the full consensus set.
    let (model, inliers) = refit(kernel, model, inliers, x1, x2, threshold);
    debug!(
        ?kind,
        iterations = t,
        inliers = inliers.len(),
        total = n_total,
        "Model found"
    );
    let outcome = if inliers.len() == m {
        ProsacOutcome::InliersIsMinSamples
    } else {
        ProsacOutcome::FoundModel
    };
    Ok(ProsacFit {
        model,
        outcome,
        inliers,
        iterations: t,
    })
}

fn refit(
    kernel: &Kernel,
    model: RobustModel,
    inliers: Vec<usize>,
    x1: &[Point],
    x2: &[Point],
    threshold: f64,
) -> (RobustModel, Vec<usize>) {
    let s1: Vec<Point> = inliers.iter().map(|&i| x1[i]).collect();
    let s2: Vec<Point> = inliers.iter().map(|&i| x2[i]).collect();
    match (kernel.fit)(&s1, &s2) {
        Some(refined) => {
            let refined_inliers = inliers_of(&refined, x1, x2, threshold);
            if refined_inliers.len() >= inliers.len() {
                (refined, refined_inliers)
            } else {
                (model, inliers)
            }
        }
        None => (model, inliers),
    }
}
