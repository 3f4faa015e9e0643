//! # Loss Formulations
//!
//! The user toggles three flags (`huber`, `concomitant`, `classification`); they
//! resolve to exactly one `Formulation`, which in turn produces a `DataFit` trait
//! object. Left unset, `concomitant` is on for regression and off for
//! classification, so the default formulation is R3. The optimizer core only ever talks to `DataFit`, so every formulation
//! shares the same proximal-gradient loop, constraint handling and path logic.
//!
//! | flags | formulation | data-fit term (mean over rows, r = X b - y) |
//! |---|---|---|
//! | concomitant off | R1 | `||r||^2 / 2n` |
//! | huber, concomitant off | R2 | `sum h_rho(r_i) / n` |
//! | concomitant (default) | R3 | `||r||^2 / (2 n sigma) + sigma / 2` |
//! | huber + concomitant | R4 | `sigma * sum h_rho(r_i / sigma) / n + sigma / 2` |
//! | classification | C1 | logistic loss on labels in {-1, +1} |
//! | classification + huber | C2 | huberized squared hinge |

use crate::estimate::EstimationError;
use ndarray::{Array1, ArrayView1, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tuning constant giving 95% efficiency under Gaussian noise.
pub const DEFAULT_HUBER_THRESHOLD: f64 = 1.345;
/// Consistency factor turning a median absolute deviation into a Gaussian scale.
const MAD_TO_SIGMA: f64 = 1.4826;
const DEFAULT_HINGE_THRESHOLD: f64 = -1.0;
const DEFAULT_SCALE_FLOOR: f64 = 1e-4;

/// How the Huber transition point is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HuberThreshold {
    Fixed(f64),
    /// `1.345 * 1.4826 * MAD` of the residuals of the unpenalized-only fit,
    /// computed once per (sub)problem.
    Estimated,
}

/// User-facing formulation switches, set before solving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormulationConfig {
    pub huber: bool,
    /// Joint scale estimation; `None` means on unless `classification` is set.
    pub concomitant: Option<bool>,
    pub classification: bool,
    /// Adds an unpenalized, unconstrained column of ones.
    pub intercept: bool,
    /// Huber threshold for the regression formulations.
    pub rho: HuberThreshold,
    /// Hinge threshold (must be below 1) for huberized classification.
    pub rho_classification: f64,
    /// Lower bound kept on the concomitant scale.
    pub scale_floor: f64,
    /// Per-variable penalty weights (default all ones). A zero weight exempts the
    /// column from the L1 penalty.
    pub penalty_weights: Option<Vec<f64>>,
    /// Columns exempt from the penalty, in addition to zero weights.
    pub unpenalized: Vec<usize>,
}

impl Default for FormulationConfig {
    fn default() -> Self {
        Self {
            huber: false,
            concomitant: None,
            classification: false,
            intercept: false,
            rho: HuberThreshold::Fixed(DEFAULT_HUBER_THRESHOLD),
            rho_classification: DEFAULT_HINGE_THRESHOLD,
            scale_floor: DEFAULT_SCALE_FLOOR,
            penalty_weights: None,
            unpenalized: Vec::new(),
        }
    }
}

impl FormulationConfig {
    /// Whether the noise scale is estimated jointly, after applying the default.
    pub fn uses_concomitant(&self) -> bool {
        self.concomitant.unwrap_or(!self.classification)
    }

    /// Resolves the flags into a single formulation, rejecting contradictions.
    pub fn resolve(&self) -> Result<Formulation, EstimationError> {
        if self.classification && self.concomitant == Some(true) {
            return Err(EstimationError::InvalidConfiguration(
                "classification cannot be combined with concomitant scale estimation".to_string(),
            ));
        }
        if let HuberThreshold::Fixed(rho) = self.rho {
            if !(rho.is_finite() && rho > 0.0) {
                return Err(EstimationError::InvalidConfiguration(format!(
                    "the Huber threshold must be positive and finite, got {rho}"
                )));
            }
        }
        if !(self.rho_classification.is_finite() && self.rho_classification < 1.0) {
            return Err(EstimationError::InvalidConfiguration(format!(
                "the classification hinge threshold must be finite and below 1, got {}",
                self.rho_classification
            )));
        }
        if !(self.scale_floor.is_finite() && self.scale_floor > 0.0) {
            return Err(EstimationError::InvalidConfiguration(format!(
                "the scale floor must be positive, got {}",
                self.scale_floor
            )));
        }

        let formulation = match (self.classification, self.uses_concomitant(), self.huber) {
            (true, _, false) => Formulation::Classification {
                huberized_hinge: None,
            },
            (true, _, true) => Formulation::Classification {
                huberized_hinge: Some(self.rho_classification),
            },
            (false, true, huber) => Formulation::Concomitant {
                huber: huber.then_some(self.rho),
                scale_floor: self.scale_floor,
            },
            (false, false, true) => Formulation::Huber {
                threshold: self.rho,
            },
            (false, false, false) => Formulation::Basic,
        };
        Ok(formulation)
    }

    /// Per-column penalty weights for a design with `d` columns.
    pub fn penalty_weights(&self, d: usize) -> Result<Array1<f64>, EstimationError> {
        let mut weights = match &self.penalty_weights {
            Some(w) if w.len() != d => {
                return Err(EstimationError::ShapeMismatch {
                    what: "penalty weights vs. design columns",
                    expected: d,
                    found: w.len(),
                });
            }
            Some(w) => Array1::from_vec(w.clone()),
            None => Array1::ones(d),
        };
        if weights.iter().any(|w| !(w.is_finite() && *w >= 0.0)) {
            return Err(EstimationError::InvalidConfiguration(
                "penalty weights must be finite and non-negative".to_string(),
            ));
        }
        for &j in &self.unpenalized {
            if j >= d {
                return Err(EstimationError::InvalidConfiguration(format!(
                    "unpenalized column {j} is out of range for {d} columns"
                )));
            }
            weights[j] = 0.0;
        }
        Ok(weights)
    }
}

/// The single active loss variant of a solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Formulation {
    Basic,
    Huber {
        threshold: HuberThreshold,
    },
    Concomitant {
        huber: Option<HuberThreshold>,
        scale_floor: f64,
    },
    Classification {
        huberized_hinge: Option<f64>,
    },
}

impl Formulation {
    /// Short code in the R1..R4 / C1..C2 naming.
    pub fn code(&self) -> &'static str {
        match self {
            Formulation::Basic => "R1",
            Formulation::Huber { .. } => "R2",
            Formulation::Concomitant { huber: None, .. } => "R3",
            Formulation::Concomitant { huber: Some(_), .. } => "R4",
            Formulation::Classification {
                huberized_hinge: None,
            } => "C1",
            Formulation::Classification {
                huberized_hinge: Some(_),
            } => "C2",
        }
    }

    pub fn is_classification(&self) -> bool {
        matches!(self, Formulation::Classification { .. })
    }

    pub fn has_scale(&self) -> bool {
        matches!(self, Formulation::Concomitant { .. })
    }

    pub(crate) fn huber_threshold(&self) -> Option<HuberThreshold> {
        match self {
            Formulation::Huber { threshold } => Some(*threshold),
            Formulation::Concomitant { huber, .. } => *huber,
            _ => None,
        }
    }

    /// Checks that the response is admissible for this formulation.
    pub fn validate_response(&self, y: ArrayView1<f64>) -> Result<(), EstimationError> {
        if self.is_classification() && y.iter().any(|&v| v != 1.0 && v != -1.0) {
            return Err(EstimationError::InvalidConfiguration(
                "classification requires labels in {-1, +1}".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the data-fit term. `rho` is the resolved Huber threshold and is only
    /// read by the Huber variants.
    pub(crate) fn datafit(&self, rho: Option<f64>) -> Box<dyn DataFit> {
        let rho = rho.unwrap_or(DEFAULT_HUBER_THRESHOLD);
        match *self {
            Formulation::Basic => Box::new(LeastSquares),
            Formulation::Huber { .. } => Box::new(Huber { rho }),
            Formulation::Concomitant { huber, scale_floor } => Box::new(Concomitant {
                rho: if huber.is_some() { rho } else { f64::INFINITY },
                floor: scale_floor,
            }),
            Formulation::Classification {
                huberized_hinge: None,
            } => Box::new(Logistic),
            Formulation::Classification {
                huberized_hinge: Some(threshold),
            } => Box::new(HuberizedHinge { rho: threshold }),
        }
    }
}

impl fmt::Display for Formulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let describe_rho = |t: &HuberThreshold| match t {
            HuberThreshold::Fixed(rho) => format!("rho = {rho}"),
            HuberThreshold::Estimated => "rho estimated".to_string(),
        };
        match self {
            Formulation::Basic => write!(f, "R1 (least squares)"),
            Formulation::Huber { threshold } => {
                write!(f, "R2 (Huber, {})", describe_rho(threshold))
            }
            Formulation::Concomitant { huber: None, .. } => {
                write!(f, "R3 (least squares, concomitant scale)")
            }
            Formulation::Concomitant {
                huber: Some(threshold),
                ..
            } => write!(f, "R4 (Huber, concomitant scale, {})", describe_rho(threshold)),
            Formulation::Classification {
                huberized_hinge: None,
            } => write!(f, "C1 (logistic classification)"),
            Formulation::Classification {
                huberized_hinge: Some(rho),
            } => write!(f, "C2 (huberized hinge classification, rho = {rho})"),
        }
    }
}

/// The smooth data-fit term of the objective, as a function of the linear
/// predictor `eta = X beta` and, for concomitant fits, the scale `sigma`.
pub trait DataFit: Send + Sync {
    /// Mean loss over the rows.
    fn value(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>, scale: f64) -> f64;

    /// Derivative of `value` with respect to each `eta_i` (already divided by n).
    fn derivative(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>, scale: f64) -> Array1<f64>;

    /// Upper bound on the per-row second derivative; multiplied by `||X||^2 / n`
    /// it bounds the Lipschitz constant of the gradient.
    fn curvature(&self, scale: f64) -> f64;

    /// Exact minimizer of the loss over the scale for fixed `eta`, for the
    /// formulations that carry one.
    fn update_scale(&self, _: ArrayView1<f64>, _: ArrayView1<f64>) -> Option<f64> {
        None
    }

    /// Error reported on held-out rows during cross-validation.
    fn held_out_error(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>) -> f64;
}

/// `h_rho(t)`: quadratic inside `[-rho, rho]`, linear outside.
fn huber(t: f64, rho: f64) -> f64 {
    if t.abs() <= rho {
        0.5 * t * t
    } else {
        rho * t.abs() - 0.5 * rho * rho
    }
}

fn mean_over<F: Fn(f64, f64) -> f64>(eta: ArrayView1<f64>, y: ArrayView1<f64>, f: F) -> f64 {
    let n = eta.len().max(1) as f64;
    Zip::from(&eta).and(&y).fold(0.0, |acc, &e, &yi| acc + f(e, yi)) / n
}

fn per_row<F: Fn(f64, f64) -> f64>(eta: ArrayView1<f64>, y: ArrayView1<f64>, f: F) -> Array1<f64> {
    let n = eta.len().max(1) as f64;
    Zip::from(&eta).and(&y).map_collect(|&e, &yi| f(e, yi) / n)
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LeastSquares;

impl DataFit for LeastSquares {
    fn value(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>, _: f64) -> f64 {
        mean_over(eta, y, |e, yi| 0.5 * (e - yi) * (e - yi))
    }

    fn derivative(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>, _: f64) -> Array1<f64> {
        per_row(eta, y, |e, yi| e - yi)
    }

    fn curvature(&self, _: f64) -> f64 {
        1.0
    }

    fn held_out_error(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
        mean_over(eta, y, |e, yi| (e - yi) * (e - yi))
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Huber {
    rho: f64,
}

impl DataFit for Huber {
    fn value(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>, _: f64) -> f64 {
        mean_over(eta, y, |e, yi| huber(e - yi, self.rho))
    }

    fn derivative(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>, _: f64) -> Array1<f64> {
        per_row(eta, y, |e, yi| (e - yi).clamp(-self.rho, self.rho))
    }

    fn curvature(&self, _: f64) -> f64 {
        1.0
    }

    fn held_out_error(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
        mean_over(eta, y, |e, yi| 2.0 * huber(e - yi, self.rho))
    }
}

/// Joint loss in `(beta, sigma)`; `rho = inf` gives the plain least-squares
/// concomitant (scaled Lasso) objective.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Concomitant {
    rho: f64,
    floor: f64,
}

const SCALE_BISECTION_STEPS: usize = 200;

impl DataFit for Concomitant {
    fn value(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>, scale: f64) -> f64 {
        mean_over(eta, y, |e, yi| scale * huber((e - yi) / scale, self.rho)) + 0.5 * scale
    }

    fn derivative(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>, scale: f64) -> Array1<f64> {
        per_row(eta, y, |e, yi| ((e - yi) / scale).clamp(-self.rho, self.rho))
    }

    fn curvature(&self, scale: f64) -> f64 {
        1.0 / scale
    }

    fn update_scale(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>) -> Option<f64> {
        let residual = &eta - &y;
        let n = residual.len().max(1) as f64;
        let rms = (residual.dot(&residual) / n).sqrt();
        if rms <= self.floor {
            return Some(self.floor);
        }
        if self.rho.is_infinite() {
            return Some(rms);
        }

        // sigma solves mean(min(r^2 / sigma^2, rho^2)) = 1; the left side decreases
        // in sigma and is at most 1 at sigma = rms.
        let rho_sq = self.rho * self.rho;
        let excess = |sigma: f64| {
            residual
                .iter()
                .map(|r| (r * r / (sigma * sigma)).min(rho_sq))
                .sum::<f64>()
                / n
                - 1.0
        };
        if excess(self.floor) <= 0.0 {
            return Some(self.floor);
        }
        let (mut lo, mut hi) = (self.floor, rms);
        for _ in 0..SCALE_BISECTION_STEPS {
            let mid = 0.5 * (lo + hi);
            if excess(mid) > 0.0 {
                lo = mid;
            } else {
                hi = mid;
            }
            if hi - lo <= 1e-12 * hi {
                break;
            }
        }
        Some(0.5 * (lo + hi))
    }

    fn held_out_error(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
        mean_over(eta, y, |e, yi| (e - yi) * (e - yi))
    }
}

/// Logistic loss `log(1 + exp(-y eta))`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Logistic;

fn softplus(z: f64) -> f64 {
    z.max(0.0) + (-z.abs()).exp().ln_1p()
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let ez = z.exp();
        ez / (1.0 + ez)
    }
}

impl DataFit for Logistic {
    fn value(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>, _: f64) -> f64 {
        mean_over(eta, y, |e, yi| softplus(-yi * e))
    }

    fn derivative(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>, _: f64) -> Array1<f64> {
        per_row(eta, y, |e, yi| -yi * sigmoid(-yi * e))
    }

    fn curvature(&self, _: f64) -> f64 {
        0.25
    }

    fn held_out_error(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
        mean_over(eta, y, |e, yi| softplus(-yi * e))
    }
}

/// Squared hinge that turns linear below the margin `rho`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HuberizedHinge {
    rho: f64,
}

impl HuberizedHinge {
    fn loss(&self, margin: f64) -> f64 {
        if margin >= 1.0 {
            0.0
        } else if margin >= self.rho {
            (1.0 - margin) * (1.0 - margin)
        } else {
            let gap = 1.0 - self.rho;
            gap * gap + 2.0 * gap * (self.rho - margin)
        }
    }

    fn slope(&self, margin: f64) -> f64 {
        if margin >= 1.0 {
            0.0
        } else if margin >= self.rho {
            -2.0 * (1.0 - margin)
        } else {
            -2.0 * (1.0 - self.rho)
        }
    }
}

impl DataFit for HuberizedHinge {
    fn value(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>, _: f64) -> f64 {
        mean_over(eta, y, |e, yi| self.loss(yi * e))
    }

    fn derivative(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>, _: f64) -> Array1<f64> {
        per_row(eta, y, |e, yi| yi * self.slope(yi * e))
    }

    fn curvature(&self, _: f64) -> f64 {
        2.0
    }

    fn held_out_error(&self, eta: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
        mean_over(eta, y, |e, yi| self.loss(yi * e))
    }
}

/// Robust threshold from residuals: `1.345 * 1.4826 * MAD`.
pub(crate) fn threshold_from_residuals(residual: ArrayView1<f64>) -> f64 {
    let median = |values: &mut Vec<f64>| -> f64 {
        values.sort_by(|a, b| a.total_cmp(b));
        let m = values.len();
        if m == 0 {
            0.0
        } else if m % 2 == 1 {
            values[m / 2]
        } else {
            0.5 * (values[m / 2 - 1] + values[m / 2])
        }
    };
    let mut values = residual.to_vec();
    let center = median(&mut values);
    let mut deviations: Vec<f64> = residual.iter().map(|r| (r - center).abs()).collect();
    let mad = median(&mut deviations);
    let rho = DEFAULT_HUBER_THRESHOLD * MAD_TO_SIGMA * mad;
    if rho > 0.0 {
        rho
    } else {
        log::warn!("Residual MAD is zero; falling back to the default Huber threshold.");
        DEFAULT_HUBER_THRESHOLD
    }
}
