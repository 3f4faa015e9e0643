//! # Regularization Path
//!
//! Lambdas are handled as fractions of `lambda_max`, the smallest penalty at which
//! every penalized coefficient is zero. Each point on the grid is warm-started
//! from the previous one, so a path costs little more than its hardest point.

use crate::estimate::EstimationError;
use crate::solver::{FitContext, FitOutcome, FittedPoint, Start};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Relative headroom added to `lambda_max` so the first grid point is zero
/// despite rounding in the bisection.
const LAMBDA_MAX_HEADROOM: f64 = 1e-8;
const LAMBDA_MAX_RELATIVE_TOLERANCE: f64 = 1e-12;
const LAMBDA_MAX_BISECTION_STEPS: usize = 200;
/// Doublings of the certificate bound allowed when rounding makes it fail the test.
const LAMBDA_MAX_WIDENINGS: usize = 8;

/// Coefficients along a strictly decreasing lambda grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathResult {
    pub lambda_max: f64,
    pub points: Vec<FittedPoint>,
    /// True when `max_active` stopped the path before the end of the grid.
    pub truncated: bool,
}

impl PathResult {
    pub fn lambdas(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.lambda).collect()
    }

    /// Coefficients stacked row-wise, one row per lambda.
    pub fn coefficients(&self) -> Array2<f64> {
        let d = self.points.first().map_or(0, |p| p.beta.len());
        Array2::from_shape_fn((self.points.len(), d), |(i, j)| self.points[i].beta[j])
    }

    pub fn support_sizes(&self) -> Vec<usize> {
        self.points.iter().map(|p| p.support().len()).collect()
    }

    pub fn non_converged(&self) -> impl Iterator<Item = &FittedPoint> {
        self.points.iter().filter(|p| !p.converged)
    }
}

/// `n_lam` fractions of `lambda_max` from 1 down to `lamin`.
pub fn relative_grid(n_lam: usize, lamin: f64, logscale: bool) -> Vec<f64> {
    if n_lam <= 1 {
        return vec![1.0; n_lam];
    }
    let last = (n_lam - 1) as f64;
    (0..n_lam)
        .map(|i| {
            let t = i as f64 / last;
            if logscale {
                lamin.powf(t)
            } else {
                1.0 - (1.0 - lamin) * t
            }
        })
        .collect()
}

/// An explicit grid must be non-empty, finite, non-negative and strictly decreasing.
pub(crate) fn validate_grid(grid: &[f64]) -> Result<(), String> {
    if grid.is_empty() {
        return Err("the grid is empty".to_string());
    }
    if let Some(bad) = grid.iter().find(|v| !(v.is_finite() && **v >= 0.0)) {
        return Err(format!("grid values must be finite and non-negative, found {bad}"));
    }
    if grid.windows(2).any(|w| w[1] >= w[0]) {
        return Err("grid values must be strictly decreasing".to_string());
    }
    Ok(())
}

pub(crate) fn grid_or_default(
    explicit: Option<&[f64]>,
    n_lam: usize,
    lamin: f64,
    logscale: bool,
) -> Vec<f64> {
    match explicit {
        Some(grid) => grid.to_vec(),
        None => relative_grid(n_lam, lamin, logscale),
    }
}

/// Smallest lambda at which the penalized coefficients vanish.
///
/// The exempt-only fit is optimal at `lambda` exactly when the constrained prox
/// of `-g` with thresholds `lambda * w` leaves every penalized coordinate at zero,
/// `g` being the data-fit gradient there. That test is monotone in `lambda`, so
/// the least-squares dual certificate gives an upper bracket and bisection
/// closes it.
pub(crate) fn lambda_max(context: &FitContext<'_>, null: &FitOutcome) -> Result<f64, EstimationError> {
    let gradient = context.gradient(null);
    let projector = context.projector();
    let weights = context.weights();
    let certificate = projector.dual_certificate(gradient.view(), &context.unpenalized())?;
    let bound = certificate
        .iter()
        .zip(weights.iter())
        .filter(|(_, w)| **w > 0.0 && w.is_finite())
        .map(|(g, w)| g.abs() / w)
        .fold(0.0_f64, f64::max);

    if !(bound > 0.0 && bound.is_finite()) {
        log::warn!(
            "lambda_max is {bound:e}: the exempt-only fit already explains the response; \
             using a tiny positive value instead."
        );
        return Ok(f64::EPSILON);
    }

    let descent = -&gradient;
    let vanishes = |lambda: f64| -> Result<bool, EstimationError> {
        let thresholds = weights.mapv(|w| if w == 0.0 { 0.0 } else { lambda * w });
        let step = projector.prox(descent.view(), thresholds.view())?;
        Ok(step
            .iter()
            .zip(weights.iter())
            .all(|(b, w)| *w == 0.0 || *b == 0.0))
    };

    let mut hi = bound;
    let mut widenings = 0;
    while !vanishes(hi)? && widenings < LAMBDA_MAX_WIDENINGS {
        hi *= 2.0;
        widenings += 1;
    }
    let mut lo = 0.0;
    for _ in 0..LAMBDA_MAX_BISECTION_STEPS {
        if hi - lo <= LAMBDA_MAX_RELATIVE_TOLERANCE * hi {
            break;
        }
        let mid = 0.5 * (lo + hi);
        if vanishes(mid)? {
            hi = mid;
        } else {
            lo = mid;
        }
    }

    log::debug!("lambda_max {hi:.6e} (certificate bound {bound:.6e})");
    Ok(hi * (1.0 + LAMBDA_MAX_HEADROOM))
}

/// Warm-started fits along absolute `lambdas`. With `max_active`, stops after
/// the first point whose penalized support exceeds it.
pub(crate) fn path_outcomes(
    context: &FitContext<'_>,
    lambdas: &[f64],
    start: Option<Start>,
    max_active: Option<usize>,
) -> Result<(Vec<FitOutcome>, bool), EstimationError> {
    let mut outcomes = Vec::with_capacity(lambdas.len());
    let mut start = start;
    for &lambda in lambdas {
        let outcome = context.fit(lambda, start.as_ref())?;
        start = Some(outcome.start());
        let active = context.penalized_support(outcome.beta.view()).len();
        outcomes.push(outcome);
        if max_active.is_some_and(|limit| active > limit) {
            return Ok((outcomes, true));
        }
    }
    Ok((outcomes, false))
}

/// Full path over the relative grid `relative`.
pub(crate) fn solve_path(
    context: &FitContext<'_>,
    lambda_max: f64,
    relative: &[f64],
    null: &FitOutcome,
    max_active: Option<usize>,
) -> Result<PathResult, EstimationError> {
    let lambdas: Vec<f64> = relative.iter().map(|r| r * lambda_max).collect();
    log::info!(
        "Solving path over {} lambdas from {:.4e} to {:.4e}",
        lambdas.len(),
        lambdas.first().copied().unwrap_or(0.0),
        lambdas.last().copied().unwrap_or(0.0)
    );
    let (outcomes, truncated) = path_outcomes(context, &lambdas, Some(null.start()), max_active)?;
    if truncated {
        log::info!(
            "Path stopped after {} of {} lambdas: active set exceeded the limit.",
            outcomes.len(),
            lambdas.len()
        );
    }
    let points = outcomes
        .iter()
        .zip(lambdas.iter().zip(relative))
        .map(|(outcome, (&lambda, &rel))| {
            log::debug!(
                "lambda {:.4e}: {} iterations, support {}",
                lambda,
                outcome.iterations,
                context.penalized_support(outcome.beta.view()).len()
            );
            context.report(outcome, lambda, rel)
        })
        .collect();
    Ok(PathResult {
        lambda_max,
        points,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::ConstraintProjector;
    use crate::formulation::Formulation;
    use crate::solver::{Design, SolverSettings};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, Array2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn sparse_problem(seed: u64) -> (Array2<f64>, Array1<f64>) {
        let (n, d) = (60, 15);
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array2::from_shape_fn((n, d), |_| rng.sample::<f64, _>(StandardNormal));
        let mut beta = Array1::zeros(d);
        beta[0] = 2.0;
        beta[3] = -1.0;
        beta[7] = -1.0;
        let noise = Array1::from_shape_fn(n, |_| 0.2 * rng.sample::<f64, _>(StandardNormal));
        let y = x.dot(&beta) + noise;
        (x, y)
    }

    #[test]
    fn geometric_grid_spans_one_to_lamin() {
        let grid = relative_grid(5, 1e-2, true);
        assert_eq!(grid.len(), 5);
        assert!((grid[0] - 1.0).abs() < 1e-15);
        assert!((grid[4] - 1e-2).abs() < 1e-15);
        assert!(grid.windows(2).all(|w| w[1] < w[0]));
        let linear = relative_grid(3, 0.5, false);
        assert_eq!(linear, vec![1.0, 0.75, 0.5]);
    }

    #[test]
    fn explicit_grid_must_decrease() {
        assert!(validate_grid(&[1.0, 0.5, 0.1]).is_ok());
        assert!(validate_grid(&[1.0, 1.0]).is_err());
        assert!(validate_grid(&[]).is_err());
        assert!(validate_grid(&[0.5, f64::NAN]).is_err());
    }

    #[test]
    fn path_starts_empty_and_stays_feasible() {
        let (x, y) = sparse_problem(7);
        let d = x.ncols();
        let projector = ConstraintProjector::new(Array2::<f64>::ones((1, d)).view()).unwrap();
        let context = FitContext::new(
            Design::new(x, y, Array1::ones(d)),
            &projector,
            Formulation::Basic,
            false,
            SolverSettings::default(),
        )
        .unwrap();
        let null = context.null_fit().unwrap();
        let lambda_max = lambda_max(&context, &null).unwrap();
        let grid = relative_grid(20, 1e-2, true);
        let path = solve_path(&context, lambda_max, &grid, &null, None).unwrap();

        assert_eq!(path.points.len(), 20);
        assert!(path.lambdas().windows(2).all(|w| w[1] < w[0]));
        assert!(path.points[0].beta.iter().all(|b| *b == 0.0));
        for point in &path.points {
            assert!(point.constraint_violation <= 1e-8);
        }
        let sizes = path.support_sizes();
        assert!(sizes[19] >= 3);
        assert_eq!(path.coefficients().dim(), (20, d));
    }

    #[test]
    fn just_below_lambda_max_something_enters() {
        let (x, y) = sparse_problem(8);
        let d = x.ncols();
        let projector = ConstraintProjector::new(Array2::<f64>::zeros((0, d)).view()).unwrap();
        let context = FitContext::new(
            Design::new(x, y, Array1::ones(d)),
            &projector,
            Formulation::Basic,
            false,
            SolverSettings::default(),
        )
        .unwrap();
        let null = context.null_fit().unwrap();
        let lambda_max = lambda_max(&context, &null).unwrap();
        let outcome = context.fit(0.95 * lambda_max, None).unwrap();
        assert!(!context.penalized_support(outcome.beta.view()).is_empty());
    }

    #[test]
    fn zero_sum_lambda_max_is_half_the_gradient_spread() {
        let (n, d) = (60, 10);
        let mut rng = StdRng::seed_from_u64(3);
        let x = Array2::from_shape_fn((n, d), |_| rng.sample::<f64, _>(StandardNormal));
        let mut beta = Array1::zeros(d);
        beta[0] = 3.0;
        beta[1] = -0.3;
        let noise = Array1::from_shape_fn(n, |_| 0.1 * rng.sample::<f64, _>(StandardNormal));
        let y = x.dot(&beta) + noise;
        let gradient = -x.t().dot(&y) / n as f64;

        let projector = ConstraintProjector::new(Array2::<f64>::ones((1, d)).view()).unwrap();
        let context = FitContext::new(
            Design::new(x, y, Array1::ones(d)),
            &projector,
            Formulation::Basic,
            false,
            SolverSettings::default(),
        )
        .unwrap();
        let null = context.null_fit().unwrap();
        let lambda_max = lambda_max(&context, &null).unwrap();

        let spread = gradient.fold(f64::NEG_INFINITY, |a, &g| a.max(g))
            - gradient.fold(f64::INFINITY, |a, &g| a.min(g));
        assert_abs_diff_eq!(lambda_max, 0.5 * spread, epsilon = 1e-9 * spread);

        let at_max = context.fit(lambda_max, Some(&null.start())).unwrap();
        assert!(context.penalized_support(at_max.beta.view()).is_empty());
        let below = context.fit(0.99 * lambda_max, Some(&null.start())).unwrap();
        assert!(!context.penalized_support(below.beta.view()).is_empty());
    }

    #[test]
    fn general_constraint_lambda_max_is_tight() {
        let (x, y) = sparse_problem(10);
        let d = x.ncols();
        let c = Array2::from_shape_fn((2, d), |(row, j)| match row {
            0 => 1.0,
            _ if j % 2 == 0 => 1.0,
            _ => -1.0,
        });
        let projector = ConstraintProjector::new(c.view()).unwrap();
        let context = FitContext::new(
            Design::new(x, y, Array1::ones(d)),
            &projector,
            Formulation::Basic,
            false,
            SolverSettings::default(),
        )
        .unwrap();
        let null = context.null_fit().unwrap();
        let lambda_max = lambda_max(&context, &null).unwrap();

        let at_max = context.fit(lambda_max, Some(&null.start())).unwrap();
        assert!(context.penalized_support(at_max.beta.view()).is_empty());
        let below = context.fit(0.99 * lambda_max, Some(&null.start())).unwrap();
        assert!(!context.penalized_support(below.beta.view()).is_empty());
    }

    #[test]
    fn max_active_truncates_the_path() {
        let (x, y) = sparse_problem(9);
        let d = x.ncols();
        let projector = ConstraintProjector::new(Array2::<f64>::ones((1, d)).view()).unwrap();
        let context = FitContext::new(
            Design::new(x, y, Array1::ones(d)),
            &projector,
            Formulation::Basic,
            false,
            SolverSettings::default(),
        )
        .unwrap();
        let null = context.null_fit().unwrap();
        let lambda_max = lambda_max(&context, &null).unwrap();
        let grid = relative_grid(30, 1e-3, true);
        let path = solve_path(&context, lambda_max, &grid, &null, Some(1)).unwrap();
        assert!(path.truncated);
        assert!(path.points.len() < 30);
        let last = path.points.last().unwrap();
        assert!(last.support().len() > 1);
    }
}
