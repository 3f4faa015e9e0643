//! # Stability Selection
//!
//! `B` subsamples of the rows are drawn without replacement. Each one is refitted
//! and reports the penalized columns it selects; a column's frequency is the share
//! of subsamples that selected it.
//!
//! Reproducibility: one master `StdRng` seeded from the configuration hands out a
//! seed per subsample before any work starts. Subsamples run in parallel but are
//! reduced in draw order, so frequencies are identical for any thread count.

use crate::config::{LambdaChoice, StabilityMethod, StabilityParameters};
use crate::estimate::EstimationError;
use crate::lambda::{TheoreticalLambda, resolve_choice};
use crate::path::{lambda_max, path_outcomes, relative_grid};
use crate::solution::{NonConvergence, Stage};
use crate::solver::{FitContext, FitOutcome, FittedPoint};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

const FIRST_BISECTION_STEPS: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityResult {
    pub method: StabilityMethod,
    /// Selection frequency of every column, in `[0, 1]`.
    pub frequencies: Array1<f64>,
    /// Columns with frequency at or above `threshold`, ascending.
    pub selected: Vec<usize>,
    pub threshold: f64,
    pub n_subsamples: usize,
    pub subsample_size: usize,
    /// Lambda used by the `lam` rule, after rescaling to the subsample size.
    pub lambda: Option<f64>,
    /// Target support size of the `first` rule.
    pub q: Option<usize>,
    /// Absolute lambda grid of the `max` rule.
    pub path_lambdas: Option<Vec<f64>>,
    /// Frequency per grid lambda (rows) and column, for the `max` rule.
    pub path_frequencies: Option<Array2<f64>>,
    /// Unpenalized refit restricted to the selected columns.
    pub refit: FittedPoint,
    pub non_converged: Vec<NonConvergence>,
}

impl StabilityResult {
    /// Number of subsamples with at least one fit stopped by the iteration cap.
    pub fn n_non_converged_subsamples(&self) -> usize {
        let mut draws: Vec<usize> = self.non_converged.iter().filter_map(|w| w.subsample).collect();
        draws.sort_unstable();
        draws.dedup();
        draws.len()
    }
}

/// What one subsample reports back.
struct Draw {
    /// Selected columns (`lam`, `first`) or one support per grid lambda (`max`).
    supports: Vec<Vec<usize>>,
    stalled: Vec<NonConvergence>,
}

/// Row count of each subsample.
pub fn subsample_size(n: usize, fraction: f64) -> usize {
    ((fraction * n as f64).floor() as usize).clamp(2.min(n), n)
}

/// Per-subsample seeds drawn sequentially from the master seed.
fn draw_seeds(seed: u64, b: usize) -> Vec<u64> {
    let mut master = StdRng::seed_from_u64(seed);
    (0..b).map(|_| master.next_u64()).collect()
}

fn subsample_rows(n: usize, m: usize, seed: u64) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rows = rand::seq::index::sample(&mut rng, n, m).into_vec();
    rows.sort_unstable();
    rows
}

fn note_stall(outcome: &FitOutcome, lambda: f64, draw: usize, stalled: &mut Vec<NonConvergence>) {
    if !outcome.converged {
        stalled.push(NonConvergence {
            stage: Stage::Stability,
            lambda,
            subsample: Some(draw),
            iterations: outcome.iterations,
        });
    }
}

/// The `q` penalized columns of largest magnitude in `outcome`.
fn largest_q(context: &FitContext<'_>, outcome: &FitOutcome, q: usize) -> Vec<usize> {
    let mut support = context.penalized_support(outcome.beta.view());
    support.sort_by(|&a, &b| outcome.beta[b].abs().total_cmp(&outcome.beta[a].abs()));
    support.truncate(q);
    support.sort_unstable();
    support
}

/// Bisection on `log(lambda)` for the support of size `q`.
///
/// When no lambda gives exactly `q`, the closest fit with a larger support is
/// trimmed to its `q` largest coefficients; when even the bottom of the bracket
/// selects fewer than `q`, that support is returned as is.
fn first_q(
    context: &FitContext<'_>,
    q: usize,
    lamin: f64,
    draw: usize,
    stalled: &mut Vec<NonConvergence>,
) -> Result<Vec<usize>, EstimationError> {
    let null = context.null_fit()?;
    let top = lambda_max(context, &null)?;
    let bottom = top * lamin;

    let low_fit = context.fit(bottom, Some(&null.start()))?;
    note_stall(&low_fit, bottom, draw, stalled);
    let low_support = context.penalized_support(low_fit.beta.view());
    if low_support.len() <= q {
        return Ok(low_support);
    }

    let (mut lo, mut hi) = (bottom.ln(), top.ln());
    let mut above = low_fit;
    let mut start = null.start();
    for _ in 0..FIRST_BISECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        let lambda = mid.exp();
        let outcome = context.fit(lambda, Some(&start))?;
        note_stall(&outcome, lambda, draw, stalled);
        let support = context.penalized_support(outcome.beta.view());
        match support.len().cmp(&q) {
            std::cmp::Ordering::Equal => return Ok(support),
            std::cmp::Ordering::Less => {
                hi = mid;
                start = outcome.start();
            }
            std::cmp::Ordering::Greater => {
                lo = mid;
                above = outcome;
            }
        }
    }
    Ok(largest_q(context, &above, q))
}

fn run_draw(
    context: &FitContext<'_>,
    params: &StabilityParameters,
    rows: &[usize],
    draw: usize,
    lam_lambda: f64,
    grid: &[f64],
) -> Result<Draw, EstimationError> {
    let sub = context.subset(rows)?;
    let mut stalled = Vec::new();
    let supports = match params.method {
        StabilityMethod::Lam => {
            let null = sub.null_fit()?;
            let outcome = sub.fit(lam_lambda, Some(&null.start()))?;
            note_stall(&outcome, lam_lambda, draw, &mut stalled);
            vec![sub.penalized_support(outcome.beta.view())]
        }
        StabilityMethod::First => vec![first_q(&sub, params.q, params.lamin, draw, &mut stalled)?],
        StabilityMethod::Max => {
            let null = sub.null_fit()?;
            let (outcomes, _) = path_outcomes(&sub, grid, Some(null.start()), None)?;
            outcomes
                .iter()
                .zip(grid)
                .map(|(outcome, &lambda)| {
                    note_stall(outcome, lambda, draw, &mut stalled);
                    sub.penalized_support(outcome.beta.view())
                })
                .collect()
        }
    };
    log::debug!(
        "Subsample {draw}: {} rows, support sizes {:?}",
        rows.len(),
        supports.iter().map(Vec::len).collect::<Vec<_>>()
    );
    Ok(Draw { supports, stalled })
}

pub(crate) fn stability_selection(
    context: &FitContext<'_>,
    lambda_max: f64,
    theoretical: &TheoreticalLambda,
    params: &StabilityParameters,
) -> Result<StabilityResult, EstimationError> {
    let n = context.n_samples();
    let d = context.n_features();
    let m = subsample_size(n, params.fraction);

    // A penalty tuned for n rows is rescaled to the subsample size.
    let (lam_lambda, _) = resolve_choice(params.lambda, lambda_max, theoretical);
    let lam_lambda = match params.lambda {
        LambdaChoice::Theoretical => lam_lambda * (n as f64 / m as f64).sqrt(),
        _ => lam_lambda,
    };
    let grid: Vec<f64> = relative_grid(params.n_lam, params.lamin, true)
        .into_iter()
        .map(|r| r * lambda_max)
        .collect();

    log::info!(
        "Stability selection ({:?}): {} subsamples of {} rows",
        params.method,
        params.b,
        m
    );

    let seeds = draw_seeds(params.seed, params.b);
    let draws: Vec<Draw> = seeds
        .par_iter()
        .enumerate()
        .map(|(i, &seed)| {
            let rows = subsample_rows(n, m, seed);
            run_draw(context, params, &rows, i, lam_lambda, &grid)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let b = draws.len() as f64;
    let n_points = draws.first().map_or(0, |draw| draw.supports.len());
    let mut counts = Array2::<f64>::zeros((n_points, d));
    for draw in &draws {
        for (i, support) in draw.supports.iter().enumerate() {
            for &j in support {
                counts[[i, j]] += 1.0;
            }
        }
    }
    let per_point = counts / b;
    let frequencies = Array1::from_shape_fn(d, |j| {
        per_point
            .column(j)
            .iter()
            .fold(0.0_f64, |acc, &f| acc.max(f))
    });

    let selected: Vec<usize> = (0..d).filter(|&j| frequencies[j] >= params.threshold).collect();
    log::info!("Stability selection kept {} of {} columns", selected.len(), d);

    let non_converged: Vec<NonConvergence> = draws.into_iter().flat_map(|draw| draw.stalled).collect();
    if !non_converged.is_empty() {
        log::warn!(
            "{} fits across the subsamples stopped at the iteration cap.",
            non_converged.len()
        );
    }

    let outcome = context.refit_restricted(&selected)?;
    let refit = context.report(&outcome, 0.0, 0.0);

    let is_max = params.method == StabilityMethod::Max;
    Ok(StabilityResult {
        method: params.method,
        frequencies,
        selected,
        threshold: params.threshold,
        n_subsamples: params.b,
        subsample_size: m,
        lambda: (params.method == StabilityMethod::Lam).then_some(lam_lambda),
        q: (params.method == StabilityMethod::First).then_some(params.q),
        path_lambdas: is_max.then_some(grid),
        path_frequencies: is_max.then_some(per_point),
        refit,
        non_converged,
    })
}
