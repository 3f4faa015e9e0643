// ========================================================================================
//
//                        THE ORCHESTRATOR: PROBLEM -> SOLUTION
//
// ========================================================================================
//
// `solve` is a pure function of (Problem, FormulationConfig, ModelSelectionConfig).
// It validates everything up front, factorizes the constraint once, and then drives
// the requested procedures (fixed lambda, path, cross-validation, stability selection)
// over one shared fit context. Nothing here touches the filesystem; persistence is the
// caller's business through `export`.

use crate::config::{LambdaFixedParameters, ModelSelectionConfig};
use crate::constraint::ConstraintProjector;
use crate::cv::cross_validate;
use crate::formulation::FormulationConfig;
use crate::lambda::theoretical;
use crate::path::{grid_or_default, lambda_max, solve_path};
use crate::problem::Problem;
use crate::solution::Solution;
use crate::solver::{Design, FitContext};
use crate::stability::stability_selection;
use std::fmt;
use std::time::Instant;
use thiserror::Error;

/// Fatal errors. Non-convergence is not one of them; see `Solution::warnings`.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Shape mismatch in {what}: expected {expected}, found {found}.")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "The constraint matrix has rank {rank} over {columns} columns, leaving no feasible non-zero coefficients."
    )]
    DegenerateConstraint { rank: usize, columns: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("A linear system solve failed: {0}")]
    LinearSystemSolveFailed(#[from] ndarray_linalg::error::LinalgError),
}

/// Solves `problem` under `formulation`, running the procedures `selection` asks for.
pub fn solve(
    problem: &Problem,
    formulation: &FormulationConfig,
    selection: &ModelSelectionConfig,
) -> Result<Solution, EstimationError> {
    let started = Instant::now();

    // 1. Validate everything before any numerical work.
    let resolved = formulation.resolve()?;
    resolved.validate_response(problem.y())?;
    selection.validate(problem.n_samples())?;
    let weights = formulation.penalty_weights(problem.n_features())?;
    if weights.iter().all(|&w| w == 0.0) {
        return Err(EstimationError::InvalidConfiguration(
            "every column is exempt from the penalty; nothing to select".to_string(),
        ));
    }

    // 2. Factorize the constraint once, with the intercept column appended.
    let (x, c, weights) = internal::augment(problem, weights, formulation.intercept);
    let projector = ConstraintProjector::new(c.view())?;
    if projector.rank() >= problem.n_features() {
        return Err(EstimationError::DegenerateConstraint {
            rank: projector.rank(),
            columns: problem.n_features(),
        });
    }
    log::info!(
        "Solving {} on {} x {} with {} independent constraint(s)",
        resolved,
        problem.n_samples(),
        problem.n_features(),
        projector.rank()
    );

    let context = FitContext::new(
        Design::new(x, problem.y().to_owned(), weights),
        &projector,
        resolved,
        formulation.intercept,
        selection.solver,
    )?;

    // 3. Anchors shared by every procedure.
    let null = context.null_fit()?;
    let lambda_max = lambda_max(&context, &null)?;
    let theoretical = theoretical(
        &context,
        lambda_max,
        selection.noise_level,
        formulation.scale_floor,
    )?;
    log::info!("lambda_max = {lambda_max:.4e}");

    // 4. Requested procedures.
    let fixed = if selection.lam_fixed || selection.nothing_requested() {
        let params = if selection.lam_fixed {
            selection.lam_fixed_parameters.clone()
        } else {
            LambdaFixedParameters::default()
        };
        Some(internal::fixed_fit(&context, &null, lambda_max, &theoretical, &params)?)
    } else {
        None
    };

    let path = if selection.path {
        let p = &selection.path_parameters;
        let grid = grid_or_default(p.lambdas.as_deref(), p.n_lam, p.lamin, p.logscale);
        Some(solve_path(&context, lambda_max, &grid, &null, p.max_active)?)
    } else {
        None
    };

    let cv = if selection.cv {
        Some(cross_validate(&context, lambda_max, &selection.cv_parameters)?)
    } else {
        None
    };

    let stability = if selection.stab_sel {
        Some(stability_selection(
            &context,
            lambda_max,
            &theoretical,
            &selection.stab_sel_parameters,
        )?)
    } else {
        None
    };

    let solution = Solution {
        formulation: resolved,
        huber_threshold: context.rho(),
        labels: problem.labels().to_vec(),
        lambda_max,
        theoretical,
        fixed,
        path,
        cv,
        stability,
    };

    let warnings = solution.warnings();
    for warning in &warnings {
        log::warn!("{warning}");
    }
    log::info!(
        "Solve finished in {:.2?} with {} non-converged fit(s)",
        started.elapsed(),
        warnings.len()
    );
    Ok(solution)
}

/// A problem together with its formulation and model-selection settings.
///
/// Built up front, then solved with `solve(&self)`; solving never mutates it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassoProblem {
    pub problem: Problem,
    pub formulation: FormulationConfig,
    pub model_selection: ModelSelectionConfig,
}

impl ClassoProblem {
    pub fn new(problem: Problem) -> Self {
        Self {
            problem,
            formulation: FormulationConfig::default(),
            model_selection: ModelSelectionConfig::default(),
        }
    }

    pub fn with_formulation(mut self, formulation: FormulationConfig) -> Self {
        self.formulation = formulation;
        self
    }

    pub fn with_model_selection(mut self, model_selection: ModelSelectionConfig) -> Self {
        self.model_selection = model_selection;
        self
    }

    pub fn solve(&self) -> Result<Solution, EstimationError> {
        solve(&self.problem, &self.formulation, &self.model_selection)
    }
}

impl fmt::Display for ClassoProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.problem)?;
        writeln!(f, "FORMULATION")?;
        let flag = |on: bool| if on { "yes" } else { "no" };
        writeln!(
            f,
            "  huber: {}   concomitant: {}   classification: {}   intercept: {}",
            flag(self.formulation.huber),
            flag(self.formulation.uses_concomitant()),
            flag(self.formulation.classification),
            flag(self.formulation.intercept)
        )?;
        writeln!(f, "MODEL SELECTION")?;
        let selection = &self.model_selection;
        write!(
            f,
            "  fixed lambda: {}   path: {}   cross-validation: {}   stability selection: {}",
            flag(selection.lam_fixed),
            flag(selection.path),
            flag(selection.cv),
            flag(selection.stab_sel)
        )
    }
}

/// Internal module for design augmentation and the fixed-lambda procedure.
mod internal {
    use super::{EstimationError, FitContext, LambdaFixedParameters, Problem};
    use crate::lambda::{TheoreticalLambda, resolve_choice};
    use crate::solution::FixedLambdaResult;
    use crate::solver::FitOutcome;
    use ndarray::{Array1, Array2, s};

    /// Appends the intercept column (ones in X, zeros in C, weight zero).
    pub(super) fn augment(
        problem: &Problem,
        weights: Array1<f64>,
        intercept: bool,
    ) -> (Array2<f64>, Array2<f64>, Array1<f64>) {
        if !intercept {
            return (problem.x().to_owned(), problem.c().to_owned(), weights);
        }
        let (n, d) = (problem.n_samples(), problem.n_features());
        let k = problem.n_constraints();

        let mut x = Array2::ones((n, d + 1));
        x.slice_mut(s![.., ..d]).assign(&problem.x());
        let mut c = Array2::zeros((k, d + 1));
        c.slice_mut(s![.., ..d]).assign(&problem.c());
        let mut augmented = Array1::zeros(d + 1);
        augmented.slice_mut(s![..d]).assign(&weights);
        (x, c, augmented)
    }

    pub(super) fn fixed_fit(
        context: &FitContext<'_>,
        null: &FitOutcome,
        lambda_max: f64,
        theoretical: &TheoreticalLambda,
        params: &LambdaFixedParameters,
    ) -> Result<FixedLambdaResult, EstimationError> {
        let (lambda, relative) = resolve_choice(params.lambda, lambda_max, theoretical);
        log::info!("Fixed-lambda fit at {lambda:.4e} ({relative:.4} of lambda_max)");
        let outcome = context.fit(lambda, Some(&null.start()))?;
        let point = context.report(&outcome, lambda, relative);
        let selected = context.penalized_support(outcome.beta.view());
        let refit = if params.refit {
            let refit = context.refit_restricted(&selected)?;
            Some(context.report(&refit, 0.0, 0.0))
        } else {
            None
        };
        Ok(FixedLambdaResult {
            point,
            selected,
            refit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2, array};

    #[test]
    fn intercept_column_is_exempt_and_unconstrained() {
        let x = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let y = array![1.0, 2.0, 3.0];
        let problem = Problem::zero_sum(x, y, None).unwrap();
        let (xa, ca, wa) = internal::augment(&problem, Array1::ones(2), true);
        assert_eq!(xa.column(2).to_vec(), vec![1.0, 1.0, 1.0]);
        assert_eq!(ca, array![[1.0, 1.0, 0.0]]);
        assert_eq!(wa, array![1.0, 1.0, 0.0]);
    }

    #[test]
    fn degenerate_constraint_is_fatal() {
        let x = Array2::from_shape_fn((6, 2), |(i, j)| (i + 2 * j) as f64);
        let y = Array1::from_shape_fn(6, |i| i as f64);
        let c = array![[1.0, 1.0], [1.0, -1.0]];
        let problem = Problem::new(x, y, c, None).unwrap();
        let result = solve(
            &problem,
            &FormulationConfig::default(),
            &ModelSelectionConfig::default(),
        );
        assert!(matches!(
            result,
            Err(EstimationError::DegenerateConstraint { rank: 2, columns: 2 })
        ));
    }

    #[test]
    fn all_exempt_columns_are_rejected() {
        let x = Array2::from_shape_fn((5, 2), |(i, j)| (i * j) as f64 + 1.0);
        let y = Array1::ones(5);
        let problem = Problem::zero_sum(x, y, None).unwrap();
        let formulation = FormulationConfig {
            unpenalized: vec![0, 1],
            ..Default::default()
        };
        assert!(matches!(
            solve(&problem, &formulation, &ModelSelectionConfig::default()),
            Err(EstimationError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn nothing_requested_runs_a_theoretical_fixed_fit() {
        let x = Array2::from_shape_fn((20, 4), |(i, j)| ((i * 7 + j * 3) % 5) as f64 - 2.0);
        let y = Array1::from_shape_fn(20, |i| (i % 3) as f64);
        let problem = Problem::zero_sum(x, y, None).unwrap();
        let selection = ModelSelectionConfig {
            stab_sel: false,
            noise_level: Some(1.0),
            ..Default::default()
        };
        let solution = ClassoProblem::new(problem)
            .with_model_selection(selection)
            .solve()
            .unwrap();
        let fixed = solution.fixed.unwrap();
        assert_eq!(fixed.point.lambda, solution.theoretical.lambda);
        assert!(solution.path.is_none());
        assert_eq!(solution.formulation.code(), "R3");
    }
}
