//! # Theoretical Lambda
//!
//! A closed-form penalty level from the quantile rule of Sun and Zhang for the
//! scaled Lasso, applied to the dimension `p` of the feasible subspace rather than
//! to the raw number of columns: constraints remove directions the penalty never
//! has to dominate.
//!
//! With `k` the root of `k = L^4 + 2 L^2` for `L = Phi^{-1}(1 - k / p)`, the pivotal
//! level is `lambda0 = sqrt(2 / n) * L`, multiplied by the largest root-mean-square
//! norm of a penalized column so unstandardized designs get a comparable penalty.

use crate::config::LambdaChoice;
use crate::estimate::EstimationError;
use crate::formulation::Formulation;
use crate::solver::FitContext;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

const QUANTILE_BISECTION_STEPS: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TheoreticalLambda {
    /// Absolute lambda for the active formulation.
    pub lambda: f64,
    /// `lambda / lambda_max`.
    pub relative: f64,
    /// Scale-free level before multiplying by the noise level.
    pub lambda0: f64,
    pub null_space_dim: usize,
    /// Noise level used by the regression formulations without joint scale.
    pub noise_level: Option<f64>,
}

/// `sqrt(2 / n) * L` for an `n`-row problem with `p` free directions.
pub fn quantile_lambda(n: usize, p: usize) -> Result<f64, EstimationError> {
    if n == 0 || p == 0 {
        return Err(EstimationError::InvalidConfiguration(format!(
            "theoretical lambda needs n > 0 and p > 0, got n = {n}, p = {p}"
        )));
    }
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| EstimationError::InvalidConfiguration(e.to_string()))?;
    let p = p as f64;
    let quantile = |k: f64| normal.inverse_cdf(1.0 - k / p);
    // g(k) = L^4 + 2L^2 - k is decreasing on (0, p/2], positive near 0 and
    // equal to -p/2 at the right end.
    let excess = |k: f64| {
        let l = quantile(k);
        l.powi(4) + 2.0 * l * l - k
    };
    let (mut lo, mut hi) = (1e-12 * p, 0.5 * p);
    for _ in 0..QUANTILE_BISECTION_STEPS {
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
    let k = 0.5 * (lo + hi);
    Ok((2.0 / n as f64).sqrt() * quantile(k))
}

/// Theoretical lambda for the problem held by `context`.
///
/// Without a configured `noise_level`, the regression formulations estimate it by
/// a scaled-Lasso fit (plain concomitant formulation) at `lambda0`.
pub(crate) fn theoretical(
    context: &FitContext<'_>,
    lambda_max: f64,
    noise_level: Option<f64>,
    scale_floor: f64,
) -> Result<TheoreticalLambda, EstimationError> {
    let n = context.n_samples();
    let weights = context.weights();
    let exempt = weights.iter().filter(|w| **w == 0.0).count();
    let null_space_dim = context
        .projector()
        .null_space_dim()
        .saturating_sub(exempt)
        .max(1);

    let x = context.x();
    let column_scale = x
        .columns()
        .into_iter()
        .zip(weights.iter())
        .filter(|(_, w)| **w > 0.0)
        .map(|(col, _)| (col.dot(&col) / n as f64).sqrt())
        .fold(0.0_f64, f64::max);
    let column_scale = if column_scale > 0.0 { column_scale } else { 1.0 };
    let lambda0 = quantile_lambda(n, null_space_dim)? * column_scale;

    let (lambda, noise_level) = match context.formulation() {
        Formulation::Concomitant { .. } => (lambda0, None),
        Formulation::Classification { .. } => (0.5 * lambda0, None),
        Formulation::Basic | Formulation::Huber { .. } => {
            let sigma = match noise_level {
                Some(sigma) => sigma,
                None => {
                    let scaled = context.with_formulation(Formulation::Concomitant {
                        huber: None,
                        scale_floor,
                    })?;
                    let outcome = scaled.fit(lambda0, Some(&scaled.null_fit()?.start()))?;
                    log::info!("Scaled-lasso noise estimate: {:.4}", outcome.scale);
                    outcome.scale
                }
            };
            (sigma * lambda0, Some(sigma))
        }
    };

    log::info!(
        "Theoretical lambda {lambda:.4e} ({:.4} of lambda_max), null-space dimension {null_space_dim}",
        lambda / lambda_max
    );
    Ok(TheoreticalLambda {
        lambda,
        relative: lambda / lambda_max,
        lambda0,
        null_space_dim,
        noise_level,
    })
}

/// Absolute and relative lambda for a user choice.
pub(crate) fn resolve_choice(
    choice: LambdaChoice,
    lambda_max: f64,
    theoretical: &TheoreticalLambda,
) -> (f64, f64) {
    match choice {
        LambdaChoice::Theoretical => (theoretical.lambda, theoretical.lambda / lambda_max),
        LambdaChoice::Relative(r) => (r * lambda_max, r),
        LambdaChoice::Absolute(lambda) => (lambda, lambda / lambda_max),
    }
}
