//! Model-selection configuration.
//!
//! Every struct derives `Deserialize` with `#[serde(default)]` so a partial TOML
//! file only has to name the fields it changes.

use crate::estimate::EstimationError;
use crate::solver::SolverSettings;
use serde::{Deserialize, Serialize};

/// How a single lambda is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LambdaChoice {
    /// The closed-form theoretical lambda.
    Theoretical,
    /// A fraction of `lambda_max`.
    Relative(f64),
    /// An absolute penalty level.
    Absolute(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LambdaFixedParameters {
    pub lambda: LambdaChoice,
    /// Also report an unpenalized refit on the selected support.
    pub refit: bool,
}

impl Default for LambdaFixedParameters {
    fn default() -> Self {
        Self {
            lambda: LambdaChoice::Theoretical,
            refit: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathParameters {
    /// Number of grid points from `lambda_max` down to `lamin * lambda_max`.
    pub n_lam: usize,
    pub lamin: f64,
    /// Geometric (true) or linear (false) spacing.
    pub logscale: bool,
    /// Explicit relative grid, strictly decreasing; overrides `n_lam`/`lamin`.
    pub lambdas: Option<Vec<f64>>,
    /// Stop once more than this many penalized coefficients are non-zero.
    pub max_active: Option<usize>,
}

impl Default for PathParameters {
    fn default() -> Self {
        Self {
            n_lam: 80,
            lamin: 1e-2,
            logscale: true,
            lambdas: None,
            max_active: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CvParameters {
    pub n_folds: usize,
    pub n_lam: usize,
    pub lamin: f64,
    pub logscale: bool,
    pub lambdas: Option<Vec<f64>>,
    /// Choose the largest lambda within one standard error of the minimum.
    pub one_se: bool,
    pub seed: u64,
}

impl Default for CvParameters {
    fn default() -> Self {
        Self {
            n_folds: 5,
            n_lam: 80,
            lamin: 1e-3,
            logscale: true,
            lambdas: None,
            one_se: true,
            seed: 0,
        }
    }
}

/// Rule deciding which variables a subsample selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityMethod {
    /// Support at one fixed lambda.
    Lam,
    /// The first `q` variables to enter the path.
    First,
    /// Maximum selection frequency over a lambda grid.
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityParameters {
    pub method: StabilityMethod,
    /// Number of subsamples.
    pub b: usize,
    /// Target support size for the `first` rule.
    pub q: usize,
    /// Fraction of rows drawn without replacement for each subsample.
    pub fraction: f64,
    /// Selection frequency needed to enter the stable set.
    pub threshold: f64,
    /// Lambda for the `lam` rule.
    pub lambda: LambdaChoice,
    /// Relative grid for the `max` rule and lower bracket for `first`.
    pub n_lam: usize,
    pub lamin: f64,
    pub seed: u64,
}

impl Default for StabilityParameters {
    fn default() -> Self {
        Self {
            method: StabilityMethod::First,
            b: 50,
            q: 10,
            fraction: 0.5,
            threshold: 0.7,
            lambda: LambdaChoice::Theoretical,
            n_lam: 50,
            lamin: 1e-2,
            seed: 0,
        }
    }
}

/// Which model-selection procedures run, and with what parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSelectionConfig {
    pub lam_fixed: bool,
    pub path: bool,
    pub cv: bool,
    pub stab_sel: bool,
    pub lam_fixed_parameters: LambdaFixedParameters,
    pub path_parameters: PathParameters,
    pub cv_parameters: CvParameters,
    pub stab_sel_parameters: StabilityParameters,
    /// Known noise standard deviation; estimated when absent.
    pub noise_level: Option<f64>,
    pub solver: SolverSettings,
}

impl Default for ModelSelectionConfig {
    fn default() -> Self {
        Self {
            lam_fixed: false,
            path: false,
            cv: false,
            stab_sel: true,
            lam_fixed_parameters: LambdaFixedParameters::default(),
            path_parameters: PathParameters::default(),
            cv_parameters: CvParameters::default(),
            stab_sel_parameters: StabilityParameters::default(),
            noise_level: None,
            solver: SolverSettings::default(),
        }
    }
}

fn check_choice(choice: LambdaChoice, what: &str) -> Result<(), EstimationError> {
    let ok = match choice {
        LambdaChoice::Theoretical => true,
        LambdaChoice::Relative(v) | LambdaChoice::Absolute(v) => v.is_finite() && v >= 0.0,
    };
    if ok {
        Ok(())
    } else {
        Err(EstimationError::InvalidConfiguration(format!(
            "{what} lambda must be finite and non-negative, got {choice:?}"
        )))
    }
}

fn check_grid(
    n_lam: usize,
    lamin: f64,
    lambdas: Option<&[f64]>,
    what: &str,
) -> Result<(), EstimationError> {
    match lambdas {
        Some(grid) => crate::path::validate_grid(grid).map_err(|reason| {
            EstimationError::InvalidConfiguration(format!("{what} grid: {reason}"))
        }),
        None if n_lam == 0 => Err(EstimationError::InvalidConfiguration(format!(
            "{what} grid needs at least one point"
        ))),
        None if !(lamin > 0.0 && lamin <= 1.0) => Err(EstimationError::InvalidConfiguration(
            format!("{what} lamin must lie in (0, 1], got {lamin}"),
        )),
        None => Ok(()),
    }
}

impl ModelSelectionConfig {
    /// Rejects parameter combinations that cannot run on `n` observations.
    pub fn validate(&self, n: usize) -> Result<(), EstimationError> {
        self.solver.validate()?;

        if let Some(sigma) = self.noise_level {
            if !(sigma.is_finite() && sigma > 0.0) {
                return Err(EstimationError::InvalidConfiguration(format!(
                    "noise_level must be positive, got {sigma}"
                )));
            }
        }
        if self.lam_fixed {
            check_choice(self.lam_fixed_parameters.lambda, "fixed")?;
        }
        if self.path {
            let p = &self.path_parameters;
            check_grid(p.n_lam, p.lamin, p.lambdas.as_deref(), "path")?;
        }
        if self.cv {
            let p = &self.cv_parameters;
            check_grid(p.n_lam, p.lamin, p.lambdas.as_deref(), "cross-validation")?;
            if p.n_folds < 2 || p.n_folds > n {
                return Err(EstimationError::InvalidConfiguration(format!(
                    "cross-validation needs between 2 and {n} folds, got {}",
                    p.n_folds
                )));
            }
        }
        if self.stab_sel {
            let p = &self.stab_sel_parameters;
            if p.b == 0 {
                return Err(EstimationError::InvalidConfiguration(
                    "stability selection needs at least one subsample".to_string(),
                ));
            }
            if !(p.fraction > 0.0 && p.fraction <= 1.0) {
                return Err(EstimationError::InvalidConfiguration(format!(
                    "subsample fraction must lie in (0, 1], got {}",
                    p.fraction
                )));
            }
            if !(p.threshold > 0.0 && p.threshold <= 1.0) {
                return Err(EstimationError::InvalidConfiguration(format!(
                    "selection threshold must lie in (0, 1], got {}",
                    p.threshold
                )));
            }
            if n < 2 {
                return Err(EstimationError::InvalidConfiguration(
                    "stability selection needs at least two observations".to_string(),
                ));
            }
            match p.method {
                StabilityMethod::First if p.q == 0 => {
                    return Err(EstimationError::InvalidConfiguration(
                        "the `first` rule needs q >= 1".to_string(),
                    ));
                }
                StabilityMethod::Lam => check_choice(p.lambda, "stability")?,
                _ => check_grid(p.n_lam, p.lamin, None, "stability")?,
            }
        }
        Ok(())
    }

    /// True when no procedure was requested, in which case a fixed-lambda fit at
    /// the theoretical lambda runs.
    pub fn nothing_requested(&self) -> bool {
        !(self.lam_fixed || self.path || self.cv || self.stab_sel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let text = r#"
            path = true
            stab_sel = false

            [path_parameters]
            n_lam = 20

            [stab_sel_parameters]
            method = "max"
        "#;
        let config: ModelSelectionConfig = toml::from_str(text).unwrap();
        assert!(config.path);
        assert!(!config.stab_sel);
        assert_eq!(config.path_parameters.n_lam, 20);
        assert_eq!(config.path_parameters.lamin, 1e-2);
        assert_eq!(config.stab_sel_parameters.method, StabilityMethod::Max);
        assert_eq!(config.stab_sel_parameters.b, 50);
        assert_eq!(config.solver, SolverSettings::default());
    }

    #[test]
    fn lambda_choice_reads_from_toml() {
        let text = r#"
            lam_fixed = true
            [lam_fixed_parameters]
            lambda = { relative = 0.1 }
        "#;
        let config: ModelSelectionConfig = toml::from_str(text).unwrap();
        assert_eq!(
            config.lam_fixed_parameters.lambda,
            LambdaChoice::Relative(0.1)
        );
    }

    #[test]
    fn rejects_single_fold() {
        let config = ModelSelectionConfig {
            cv: true,
            cv_parameters: CvParameters {
                n_folds: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate(20).is_err());
    }

    #[test]
    fn rejects_threshold_outside_unit_interval() {
        let mut config = ModelSelectionConfig::default();
        config.stab_sel_parameters.threshold = 1.5;
        assert!(config.validate(20).is_err());
    }

    #[test]
    fn rejects_increasing_explicit_grid() {
        let config = ModelSelectionConfig {
            path: true,
            path_parameters: PathParameters {
                lambdas: Some(vec![0.1, 0.5]),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate(20).is_err());
    }

    #[test]
    fn defaults_run_stability_selection() {
        let config = ModelSelectionConfig::default();
        assert!(config.stab_sel);
        assert!(!config.nothing_requested());
        assert!(config.validate(10).is_ok());
    }
}
