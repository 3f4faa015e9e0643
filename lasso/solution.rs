//! # Solution
//!
//! The immutable result of one `solve`. Only the procedures that were requested
//! are present; persistence lives in `export` and is never triggered from here.

use crate::cv::CvResult;
use crate::formulation::Formulation;
use crate::lambda::TheoreticalLambda;
use crate::path::PathResult;
use crate::solver::FittedPoint;
use crate::stability::StabilityResult;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which procedure a fit belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fixed,
    Path,
    CrossValidation,
    Stability,
    Refit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fixed => "fixed lambda",
            Stage::Path => "path",
            Stage::CrossValidation => "cross-validation",
            Stage::Stability => "stability selection",
            Stage::Refit => "refit",
        };
        f.write_str(name)
    }
}

/// A fit that stopped at the iteration cap. Recorded, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonConvergence {
    pub stage: Stage,
    pub lambda: f64,
    /// Fold or subsample index, when the fit ran on a subset of rows.
    pub subsample: Option<usize>,
    pub iterations: usize,
}

impl fmt::Display for NonConvergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} fit at lambda {:.4e} did not converge in {} iterations",
            self.stage, self.lambda, self.iterations
        )?;
        if let Some(i) = self.subsample {
            write!(f, " (subset {i})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedLambdaResult {
    pub point: FittedPoint,
    /// Non-zero penalized columns.
    pub selected: Vec<usize>,
    /// Unpenalized refit restricted to `selected`.
    pub refit: Option<FittedPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub formulation: Formulation,
    /// Huber threshold actually used, after estimation.
    pub huber_threshold: Option<f64>,
    pub labels: Vec<String>,
    pub lambda_max: f64,
    pub theoretical: TheoreticalLambda,
    pub fixed: Option<FixedLambdaResult>,
    pub path: Option<PathResult>,
    pub cv: Option<CvResult>,
    pub stability: Option<StabilityResult>,
}

fn stalled(point: &FittedPoint, stage: Stage) -> Option<NonConvergence> {
    (!point.converged).then(|| NonConvergence {
        stage,
        lambda: point.lambda,
        subsample: None,
        iterations: point.iterations,
    })
}

impl Solution {
    /// Every non-converged fit across the procedures that ran.
    pub fn warnings(&self) -> Vec<NonConvergence> {
        let mut warnings = Vec::new();
        if let Some(fixed) = &self.fixed {
            warnings.extend(stalled(&fixed.point, Stage::Fixed));
            if let Some(refit) = &fixed.refit {
                warnings.extend(stalled(refit, Stage::Refit));
            }
        }
        if let Some(path) = &self.path {
            warnings.extend(path.non_converged().filter_map(|p| stalled(p, Stage::Path)));
        }
        if let Some(cv) = &self.cv {
            warnings.extend(cv.non_converged.iter().cloned());
        }
        if let Some(stability) = &self.stability {
            warnings.extend(stability.non_converged.iter().cloned());
            warnings.extend(stalled(&stability.refit, Stage::Refit));
        }
        warnings
    }

    fn names(&self, indices: &[usize]) -> String {
        if indices.is_empty() {
            return "(none)".to_string();
        }
        indices.iter().map(|&j| self.labels[j].as_str()).join(", ")
    }
}

impl fmt::Display for Solution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SOLUTION")?;
        writeln!(f, "  formulation: {}", self.formulation)?;
        if let Some(rho) = self.huber_threshold {
            writeln!(f, "  huber threshold: {rho:.4}")?;
        }
        writeln!(f, "  lambda_max: {:.4e}", self.lambda_max)?;
        writeln!(
            f,
            "  theoretical lambda: {:.4e} ({:.4} of lambda_max)",
            self.theoretical.lambda, self.theoretical.relative
        )?;

        if let Some(fixed) = &self.fixed {
            writeln!(f, "FIXED LAMBDA")?;
            writeln!(
                f,
                "  lambda {:.4e}  selected: {}",
                fixed.point.lambda,
                self.names(&fixed.selected)
            )?;
            if let Some(scale) = fixed.point.scale {
                writeln!(f, "  sigma: {scale:.4}")?;
            }
            if let Some(intercept) = fixed.point.intercept {
                writeln!(f, "  intercept: {intercept:.4}")?;
            }
        }

        if let Some(path) = &self.path {
            writeln!(f, "PATH")?;
            let sizes = path.support_sizes();
            writeln!(
                f,
                "  {} lambdas{}; support size {} -> {}",
                path.points.len(),
                if path.truncated { " (truncated)" } else { "" },
                sizes.first().copied().unwrap_or(0),
                sizes.last().copied().unwrap_or(0)
            )?;
        }

        if let Some(cv) = &self.cv {
            writeln!(f, "CROSS-VALIDATION")?;
            writeln!(
                f,
                "  selected lambda {:.4e}{}  error {:.4e} +/- {:.2e}",
                cv.selected_lambda(),
                if cv.one_se { " (1-SE rule)" } else { "" },
                cv.mean_error[cv.selected_index],
                cv.standard_error[cv.selected_index]
            )?;
            writeln!(f, "  selected: {}", self.names(&cv.refit.support()))?;
        }

        if let Some(stability) = &self.stability {
            writeln!(f, "STABILITY SELECTION")?;
            writeln!(
                f,
                "  rule {:?}, {} subsamples of {} rows, threshold {}",
                stability.method, stability.n_subsamples, stability.subsample_size, stability.threshold
            )?;
            writeln!(f, "  selected: {}", self.names(&stability.selected))?;
        }

        let warnings = self.warnings();
        if !warnings.is_empty() {
            writeln!(f, "WARNINGS")?;
            for warning in warnings.iter().take(10) {
                writeln!(f, "  {warning}")?;
            }
            if warnings.len() > 10 {
                writeln!(f, "  ... and {} more", warnings.len() - 10)?;
            }
        }
        Ok(())
    }
}
