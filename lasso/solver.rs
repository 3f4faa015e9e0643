//! # Proximal-Gradient Core
//!
//! One accelerated proximal-gradient loop (FISTA with backtracking and adaptive
//! restart) serves every formulation. The loop only sees the `DataFit` trait and
//! the `ConstraintProjector`; the projector's constrained prox keeps every iterate
//! exactly sparse and feasible, so no separate projection step is needed.
//!
//! Formulations that carry a scale (the concomitant variants) alternate an exact
//! scale update after every coefficient step.

use crate::constraint::ConstraintProjector;
use crate::estimate::EstimationError;
use crate::formulation::{
    DEFAULT_HUBER_THRESHOLD, DataFit, Formulation, HuberThreshold, threshold_from_residuals,
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};
use serde::{Deserialize, Serialize};

/// Coefficients with magnitude at or below this value count as zero when
/// reading off a support.
pub const SUPPORT_THRESHOLD: f64 = 1e-8;

const POWER_ITERATIONS: usize = 200;
const POWER_TOLERANCE: f64 = 1e-8;
const BACKTRACK_FACTOR: f64 = 2.0;
const MAX_BACKTRACKS: usize = 60;
const MIN_LIPSCHITZ: f64 = 1e-12;
const NULL_FIT_TOLERANCE: f64 = 1e-10;

/// Stopping rule shared by every fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Relative tolerance on the coefficient (and scale) change per iteration.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 10_000,
        }
    }
}

impl SolverSettings {
    pub(crate) fn validate(&self) -> Result<(), EstimationError> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(EstimationError::InvalidConfiguration(format!(
                "solver tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(EstimationError::InvalidConfiguration(
                "solver max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A fitted coefficient vector at one lambda, in the caller's column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedPoint {
    pub lambda: f64,
    /// `lambda / lambda_max`.
    pub relative_lambda: f64,
    pub beta: Array1<f64>,
    pub intercept: Option<f64>,
    /// Estimated noise scale, for the concomitant formulations.
    pub scale: Option<f64>,
    pub objective: f64,
    pub iterations: usize,
    pub converged: bool,
    /// `||C beta||_inf` of the reported coefficients.
    pub constraint_violation: f64,
}

impl FittedPoint {
    /// Indices of the non-zero coefficients.
    pub fn support(&self) -> Vec<usize> {
        support_of(self.beta.view())
    }
}

pub(crate) fn support_of(beta: ArrayView1<f64>) -> Vec<usize> {
    beta.iter()
        .enumerate()
        .filter(|(_, b)| b.abs() > SUPPORT_THRESHOLD)
        .map(|(j, _)| j)
        .collect()
}

/// Design matrix, response and penalty weights of one (sub)problem, with the
/// intercept column already appended when requested.
#[derive(Debug, Clone)]
pub(crate) struct Design {
    x: Array2<f64>,
    y: Array1<f64>,
    weights: Array1<f64>,
    /// Power-iteration estimate of `||X||_2^2 / n`.
    spectral: f64,
}

impl Design {
    pub(crate) fn new(x: Array2<f64>, y: Array1<f64>, weights: Array1<f64>) -> Self {
        let spectral = spectral_norm_squared(x.view()) / x.nrows().max(1) as f64;
        Self {
            x,
            y,
            weights,
            spectral,
        }
    }

    fn subset(&self, rows: &[usize]) -> Self {
        Self::new(
            self.x.select(Axis(0), rows),
            self.y.select(Axis(0), rows),
            self.weights.clone(),
        )
    }
}

/// Warm-start state carried from one fit to the next.
#[derive(Debug, Clone)]
pub(crate) struct Start {
    beta: Array1<f64>,
    scale: f64,
    inflation: f64,
}

/// Raw result of one minimization, in augmented coordinates.
#[derive(Debug, Clone)]
pub(crate) struct FitOutcome {
    pub(crate) beta: Array1<f64>,
    pub(crate) scale: f64,
    pub(crate) objective: f64,
    pub(crate) iterations: usize,
    pub(crate) converged: bool,
    inflation: f64,
}

impl FitOutcome {
    pub(crate) fn start(&self) -> Start {
        Start {
            beta: self.beta.clone(),
            scale: self.scale,
            inflation: self.inflation,
        }
    }
}

/// Largest eigenvalue of `X'X` by power iteration.
fn spectral_norm_squared(x: ArrayView2<f64>) -> f64 {
    let d = x.ncols();
    if d == 0 {
        return 0.0;
    }
    // A non-constant start avoids being orthogonal to the leading direction when
    // the rows of X sum to zero (centered log-ratio designs).
    let mut v = Array1::from_shape_fn(d, |j| 1.0 / (1.0 + j as f64));
    let norm = v.dot(&v).sqrt();
    v /= norm;
    let mut estimate = 0.0;
    for _ in 0..POWER_ITERATIONS {
        let w = x.t().dot(&x.dot(&v));
        let next = w.dot(&w).sqrt();
        if next == 0.0 {
            return estimate;
        }
        v = w / next;
        let settled = (next - estimate).abs() <= POWER_TOLERANCE * next;
        estimate = next;
        if settled {
            break;
        }
    }
    estimate
}

fn thresholds(lambda: f64, weights: ArrayView1<f64>, lipschitz: f64) -> Array1<f64> {
    weights.mapv(|w| {
        if w == 0.0 {
            0.0
        } else if w.is_infinite() {
            f64::INFINITY
        } else {
            lambda * w / lipschitz
        }
    })
}

fn penalty(lambda: f64, weights: ArrayView1<f64>, beta: ArrayView1<f64>) -> f64 {
    Zip::from(&weights).and(&beta).fold(0.0, |acc, &w, &b| {
        if b == 0.0 || w == 0.0 {
            acc
        } else {
            acc + lambda * w * b.abs()
        }
    })
}

/// Minimizes `f(X beta, sigma) + lambda * sum_j w_j |beta_j|` subject to
/// `C beta = 0`.
///
/// Hitting the iteration cap is not an error: the last iterate is returned with
/// `converged = false`.
fn minimize(
    design: &Design,
    projector: &ConstraintProjector,
    datafit: &dyn DataFit,
    lambda: f64,
    weights: ArrayView1<f64>,
    start: Option<&Start>,
    settings: &SolverSettings,
) -> Result<FitOutcome, EstimationError> {
    let x = design.x.view();
    let y = design.y.view();

    let (mut beta, mut inflation) = match start {
        Some(start) => (start.beta.clone(), start.inflation),
        None => (Array1::zeros(x.ncols()), 1.0),
    };
    let mut eta = x.dot(&beta);
    let mut scale = match start {
        Some(start) => start.scale,
        None => datafit.update_scale(eta.view(), y).unwrap_or(1.0),
    };

    let mut z = beta.clone();
    let mut eta_z = eta.clone();
    let mut momentum = 1.0_f64;
    let mut iterations = 0;
    let mut converged = false;

    while iterations < settings.max_iterations {
        iterations += 1;

        let derivative = datafit.derivative(eta_z.view(), y, scale);
        let gradient = x.t().dot(&derivative);
        let value_z = datafit.value(eta_z.view(), y, scale);

        let mut lipschitz =
            (design.spectral * datafit.curvature(scale) * inflation).max(MIN_LIPSCHITZ);
        let mut backtracks = 0;
        let (candidate, eta_candidate) = loop {
            let v = &z - &(&gradient / lipschitz);
            let t = thresholds(lambda, weights, lipschitz);
            let candidate = projector.prox(v.view(), t.view())?;
            let step = &candidate - &z;
            let eta_candidate = x.dot(&candidate);
            let value = datafit.value(eta_candidate.view(), y, scale);
            let bound = value_z + gradient.dot(&step) + 0.5 * lipschitz * step.dot(&step);
            if value <= bound + 1e-12 * value_z.abs().max(1.0) || backtracks >= MAX_BACKTRACKS {
                break (candidate, eta_candidate);
            }
            inflation *= BACKTRACK_FACTOR;
            lipschitz *= BACKTRACK_FACTOR;
            backtracks += 1;
        };

        let delta = &candidate - &beta;
        let delta_norm = delta.dot(&delta).sqrt();
        let beta_norm = candidate.dot(&candidate).sqrt();
        let new_scale = datafit
            .update_scale(eta_candidate.view(), y)
            .unwrap_or(scale);
        let scale_change = (new_scale - scale).abs();

        // Restart when the proximal step points against the momentum direction.
        if (&z - &candidate).dot(&delta) > 0.0 {
            momentum = 1.0;
            z = candidate.clone();
            eta_z = eta_candidate.clone();
        } else {
            let next = 0.5 * (1.0 + (1.0 + 4.0 * momentum * momentum).sqrt());
            let weight = (momentum - 1.0) / next;
            z = &candidate + &(&delta * weight);
            eta_z = &eta_candidate + &((&eta_candidate - &eta) * weight);
            momentum = next;
        }

        beta = candidate;
        eta = eta_candidate;
        scale = new_scale;

        if delta_norm <= settings.tolerance * beta_norm.max(1.0)
            && scale_change <= settings.tolerance * scale
        {
            converged = true;
            break;
        }
    }

    let objective = datafit.value(eta.view(), y, scale) + penalty(lambda, weights, beta.view());
    Ok(FitOutcome {
        beta,
        scale,
        objective,
        iterations,
        converged,
        inflation,
    })
}

/// Everything needed to fit one (sub)problem at any lambda.
///
/// Borrowed projectors are shared read-only across folds and subsamples, so a
/// context is cheap to derive for a row subset.
pub(crate) struct FitContext<'a> {
    design: Design,
    projector: &'a ConstraintProjector,
    formulation: Formulation,
    datafit: Box<dyn DataFit>,
    rho: Option<f64>,
    intercept: bool,
    settings: SolverSettings,
}

impl<'a> FitContext<'a> {
    pub(crate) fn new(
        design: Design,
        projector: &'a ConstraintProjector,
        formulation: Formulation,
        intercept: bool,
        settings: SolverSettings,
    ) -> Result<Self, EstimationError> {
        let rho = resolve_threshold(&design, projector, &formulation, &settings)?;
        let datafit = formulation.datafit(rho);
        Ok(Self {
            design,
            projector,
            formulation,
            datafit,
            rho,
            intercept,
            settings,
        })
    }

    /// The same rows refitted under a different formulation.
    pub(crate) fn with_formulation(&self, formulation: Formulation) -> Result<Self, EstimationError> {
        Self::new(
            self.design.clone(),
            self.projector,
            formulation,
            self.intercept,
            self.settings,
        )
    }

    /// Context restricted to `rows`. An estimated Huber threshold is
    /// re-estimated on the subset.
    pub(crate) fn subset(&self, rows: &[usize]) -> Result<Self, EstimationError> {
        Self::new(
            self.design.subset(rows),
            self.projector,
            self.formulation,
            self.intercept,
            self.settings,
        )
    }

    pub(crate) fn formulation(&self) -> Formulation {
        self.formulation
    }

    pub(crate) fn rho(&self) -> Option<f64> {
        self.rho
    }

    pub(crate) fn projector(&self) -> &ConstraintProjector {
        self.projector
    }

    pub(crate) fn n_samples(&self) -> usize {
        self.design.x.nrows()
    }

    /// Number of columns reported to the caller (intercept excluded).
    pub(crate) fn n_features(&self) -> usize {
        self.design.x.ncols() - usize::from(self.intercept)
    }

    pub(crate) fn x(&self) -> ArrayView2<'_, f64> {
        self.design.x.view()
    }

    pub(crate) fn weights(&self) -> ArrayView1<'_, f64> {
        self.design.weights.view()
    }

    /// Mask of augmented columns carrying no penalty.
    pub(crate) fn unpenalized(&self) -> Vec<bool> {
        self.design.weights.iter().map(|&w| w == 0.0).collect()
    }

    pub(crate) fn fit(&self, lambda: f64, start: Option<&Start>) -> Result<FitOutcome, EstimationError> {
        minimize(
            &self.design,
            self.projector,
            self.datafit.as_ref(),
            lambda,
            self.design.weights.view(),
            start,
            &self.settings,
        )
    }

    /// The fit with every penalized coefficient held at zero.
    ///
    /// Solved to a tighter tolerance than the other fits: `lambda_max` is read off
    /// its gradient.
    pub(crate) fn null_fit(&self) -> Result<FitOutcome, EstimationError> {
        let settings = SolverSettings {
            tolerance: self.settings.tolerance.min(NULL_FIT_TOLERANCE),
            ..self.settings
        };
        minimize(
            &self.design,
            self.projector,
            self.datafit.as_ref(),
            f64::INFINITY,
            self.design.weights.view(),
            None,
            &settings,
        )
    }

    /// Unpenalized refit over `selected` (user column indices) plus the exempt
    /// columns; every other column is frozen at zero.
    pub(crate) fn refit_restricted(&self, selected: &[usize]) -> Result<FitOutcome, EstimationError> {
        let mut weights = self.design.weights.mapv(|w| if w == 0.0 { 0.0 } else { f64::INFINITY });
        for &j in selected {
            weights[j] = 0.0;
        }
        minimize(
            &self.design,
            self.projector,
            self.datafit.as_ref(),
            0.0,
            weights.view(),
            None,
            &self.settings,
        )
    }

    /// Gradient of the data-fit term with respect to the augmented coefficients.
    pub(crate) fn gradient(&self, outcome: &FitOutcome) -> Array1<f64> {
        let eta = self.design.x.dot(&outcome.beta);
        let derivative = self
            .datafit
            .derivative(eta.view(), self.design.y.view(), outcome.scale);
        self.design.x.t().dot(&derivative)
    }

    /// Mean error of `outcome` on `rows` of `data`, scored with this context's
    /// data fit (and so with its own Huber threshold).
    pub(crate) fn held_out_error(&self, outcome: &FitOutcome, data: &FitContext<'_>, rows: &[usize]) -> f64 {
        let x = data.design.x.select(Axis(0), rows);
        let y = data.design.y.select(Axis(0), rows);
        let eta = x.dot(&outcome.beta);
        self.datafit.held_out_error(eta.view(), y.view())
    }

    /// Non-zero penalized user columns of an augmented coefficient vector.
    pub(crate) fn penalized_support(&self, beta: ArrayView1<f64>) -> Vec<usize> {
        let d = self.n_features();
        support_of(beta.slice(s![..d]))
            .into_iter()
            .filter(|&j| self.design.weights[j] > 0.0)
            .collect()
    }

    /// Converts an augmented outcome into a caller-facing point.
    pub(crate) fn report(&self, outcome: &FitOutcome, lambda: f64, relative_lambda: f64) -> FittedPoint {
        let d = self.n_features();
        let intercept = self.intercept.then(|| outcome.beta[d]);
        if !outcome.converged {
            log::warn!(
                "Fit at lambda = {lambda:.4e} stopped at the iteration cap ({} iterations).",
                outcome.iterations
            );
        }
        FittedPoint {
            lambda,
            relative_lambda,
            beta: outcome.beta.slice(s![..d]).to_owned(),
            intercept,
            scale: self.formulation.has_scale().then_some(outcome.scale),
            objective: outcome.objective,
            iterations: outcome.iterations,
            converged: outcome.converged,
            constraint_violation: self.projector.violation(outcome.beta.view()),
        }
    }
}

fn resolve_threshold(
    design: &Design,
    projector: &ConstraintProjector,
    formulation: &Formulation,
    settings: &SolverSettings,
) -> Result<Option<f64>, EstimationError> {
    match formulation.huber_threshold() {
        None => Ok(None),
        Some(HuberThreshold::Fixed(rho)) => Ok(Some(rho)),
        // Residuals are standardized by the jointly estimated scale, so the
        // Gaussian-efficiency constant already has the right units.
        Some(HuberThreshold::Estimated) if formulation.has_scale() => {
            Ok(Some(DEFAULT_HUBER_THRESHOLD))
        }
        Some(HuberThreshold::Estimated) => {
            let least_squares = Formulation::Basic.datafit(None);
            let outcome = minimize(
                design,
                projector,
                least_squares.as_ref(),
                f64::INFINITY,
                design.weights.view(),
                None,
                settings,
            )?;
            let residual = design.x.dot(&outcome.beta) - &design.y;
            let rho = threshold_from_residuals(residual.view());
            log::debug!("Estimated Huber threshold: {rho:.4}");
            Ok(Some(rho))
        }
    }
}
