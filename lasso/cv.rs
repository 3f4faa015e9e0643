//! # Cross-Validation
//!
//! Rows are shuffled once with a seeded generator and cut into contiguous folds.
//! Every fold refits the whole path on its complement, on the same absolute
//! lambdas as the full data, so the per-fold error curves line up point by point.

use crate::config::CvParameters;
use crate::estimate::EstimationError;
use crate::path::{grid_or_default, path_outcomes};
use crate::solution::{NonConvergence, Stage};
use crate::solver::{FitContext, FitOutcome, FittedPoint};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvResult {
    pub lambdas: Vec<f64>,
    pub relative_lambdas: Vec<f64>,
    pub mean_error: Vec<f64>,
    /// Standard error of the mean across folds.
    pub standard_error: Vec<f64>,
    /// Held-out error per fold (outer) and lambda (inner).
    pub fold_errors: Vec<Vec<f64>>,
    /// Index of the smallest mean error.
    pub best_index: usize,
    /// Index actually chosen (differs from `best_index` under the 1-SE rule).
    pub selected_index: usize,
    pub one_se: bool,
    /// Fit on all rows at the selected lambda.
    pub refit: FittedPoint,
    pub non_converged: Vec<NonConvergence>,
}

impl CvResult {
    pub fn selected_lambda(&self) -> f64 {
        self.lambdas[self.selected_index]
    }
}

/// Shuffles `0..n` with `seed` and splits it into `k` folds whose sizes differ
/// by at most one. Each fold is returned sorted.
pub fn fold_partition(n: usize, k: usize, seed: u64) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    let base = n / k;
    let extra = n % k;
    let mut folds = Vec::with_capacity(k);
    let mut offset = 0;
    for f in 0..k {
        let size = base + usize::from(f < extra);
        let mut fold = order[offset..offset + size].to_vec();
        fold.sort_unstable();
        folds.push(fold);
        offset += size;
    }
    folds
}

fn complement(n: usize, fold: &[usize]) -> Vec<usize> {
    let mut held_out = vec![false; n];
    for &i in fold {
        held_out[i] = true;
    }
    (0..n).filter(|&i| !held_out[i]).collect()
}

/// Index of the smallest value; the first one on ties.
fn argmin(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |(best, min), (i, &v)| {
            if v < min { (i, v) } else { (best, min) }
        })
        .0
}

/// Selected index: the minimum, or with `one_se` the largest lambda (earliest
/// grid index) whose mean error is within one standard error of the minimum.
fn select_index(mean: &[f64], standard_error: &[f64], one_se: bool) -> (usize, usize) {
    let best = argmin(mean);
    if !one_se {
        return (best, best);
    }
    let ceiling = mean[best] + standard_error[best];
    let selected = mean.iter().position(|&m| m <= ceiling).unwrap_or(best);
    (best, selected)
}

pub(crate) fn cross_validate(
    context: &FitContext<'_>,
    lambda_max: f64,
    params: &CvParameters,
) -> Result<CvResult, EstimationError> {
    let n = context.n_samples();
    let relative = grid_or_default(params.lambdas.as_deref(), params.n_lam, params.lamin, params.logscale);
    let lambdas: Vec<f64> = relative.iter().map(|r| r * lambda_max).collect();
    let folds = fold_partition(n, params.n_folds, params.seed);
    log::info!(
        "Cross-validating over {} folds and {} lambdas",
        folds.len(),
        lambdas.len()
    );

    let per_fold: Vec<(Vec<f64>, Vec<NonConvergence>)> = folds
        .par_iter()
        .enumerate()
        .map(|(f, held_out)| -> Result<_, EstimationError> {
            let training = complement(n, held_out);
            let fold_context = context.subset(&training)?;
            let null = fold_context.null_fit()?;
            let (outcomes, _) = path_outcomes(&fold_context, &lambdas, Some(null.start()), None)?;
            let errors: Vec<f64> = outcomes
                .iter()
                .map(|outcome| fold_context.held_out_error(outcome, context, held_out))
                .collect();
            let stalled = stalled_fits(&outcomes, &lambdas, Some(f));
            log::debug!("Fold {f}: {} held-out rows", held_out.len());
            Ok((errors, stalled))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let k = per_fold.len() as f64;
    let n_lambdas = lambdas.len();
    let mut mean_error = vec![0.0; n_lambdas];
    let mut standard_error = vec![0.0; n_lambdas];
    for i in 0..n_lambdas {
        let mean = per_fold.iter().map(|(e, _)| e[i]).sum::<f64>() / k;
        let variance = per_fold
            .iter()
            .map(|(e, _)| (e[i] - mean).powi(2))
            .sum::<f64>()
            / (k - 1.0).max(1.0);
        mean_error[i] = mean;
        standard_error[i] = (variance / k).sqrt();
    }

    let (best_index, selected_index) = select_index(&mean_error, &standard_error, params.one_se);
    log::info!(
        "Cross-validation selected lambda {:.4e} (minimum at {:.4e})",
        lambdas[selected_index],
        lambdas[best_index]
    );

    let null = context.null_fit()?;
    let outcome = context.fit(lambdas[selected_index], Some(&null.start()))?;
    let refit = context.report(&outcome, lambdas[selected_index], relative[selected_index]);

    let (fold_errors, stalled): (Vec<_>, Vec<_>) = per_fold.into_iter().unzip();
    let mut non_converged: Vec<NonConvergence> = stalled.into_iter().flatten().collect();
    if !refit.converged {
        non_converged.push(NonConvergence {
            stage: Stage::CrossValidation,
            lambda: refit.lambda,
            subsample: None,
            iterations: refit.iterations,
        });
    }

    Ok(CvResult {
        lambdas,
        relative_lambdas: relative,
        mean_error,
        standard_error,
        fold_errors,
        best_index,
        selected_index,
        one_se: params.one_se,
        refit,
        non_converged,
    })
}

fn stalled_fits(outcomes: &[FitOutcome], lambdas: &[f64], fold: Option<usize>) -> Vec<NonConvergence> {
    outcomes
        .iter()
        .zip(lambdas)
        .filter(|(outcome, _)| !outcome.converged)
        .map(|(outcome, &lambda)| NonConvergence {
            stage: Stage::CrossValidation,
            lambda,
            subsample: fold,
            iterations: outcome.iterations,
        })
        .collect()
}
