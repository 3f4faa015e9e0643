//! # Problem Definition
//!
//! A `Problem` bundles the design matrix `X` (n × d), the response `y` (length n),
//! the linear equality constraint matrix `C` (k × d) and one label per column.
//! Shapes are checked once, at construction, and the value is immutable afterwards:
//! every solve reads it, none mutates it.

use crate::estimate::EstimationError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A validated constrained-regression problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    x: Array2<f64>,
    y: Array1<f64>,
    c: Array2<f64>,
    labels: Vec<String>,
}

impl Problem {
    /// Builds a problem, rejecting inconsistent shapes and non-finite entries.
    ///
    /// `c` may have zero rows, in which case the problem is an ordinary Lasso.
    /// When `labels` is `None`, columns are named `x0`, `x1`, ...
    pub fn new(
        x: Array2<f64>,
        y: Array1<f64>,
        c: Array2<f64>,
        labels: Option<Vec<String>>,
    ) -> Result<Self, EstimationError> {
        let (n, d) = x.dim();
        if n == 0 || d == 0 {
            return Err(EstimationError::InvalidConfiguration(format!(
                "the design matrix must be non-empty, got {n} x {d}"
            )));
        }
        if y.len() != n {
            return Err(EstimationError::ShapeMismatch {
                what: "response length vs. design rows",
                expected: n,
                found: y.len(),
            });
        }
        if c.ncols() != d {
            return Err(EstimationError::ShapeMismatch {
                what: "constraint columns vs. design columns",
                expected: d,
                found: c.ncols(),
            });
        }
        let labels = match labels {
            Some(labels) if labels.len() != d => {
                return Err(EstimationError::ShapeMismatch {
                    what: "label count vs. design columns",
                    expected: d,
                    found: labels.len(),
                });
            }
            Some(labels) => labels,
            None => (0..d).map(|j| format!("x{j}")).collect(),
        };

        if !x.iter().all(|v| v.is_finite()) {
            return Err(EstimationError::InvalidConfiguration(
                "the design matrix contains non-finite values".to_string(),
            ));
        }
        if !y.iter().all(|v| v.is_finite()) {
            return Err(EstimationError::InvalidConfiguration(
                "the response contains non-finite values".to_string(),
            ));
        }
        if !c.iter().all(|v| v.is_finite()) {
            return Err(EstimationError::InvalidConfiguration(
                "the constraint matrix contains non-finite values".to_string(),
            ));
        }

        Ok(Self { x, y, c, labels })
    }

    /// Convenience constructor for the compositional case: a single zero-sum
    /// constraint `sum_j beta_j = 0` over every column.
    pub fn zero_sum(
        x: Array2<f64>,
        y: Array1<f64>,
        labels: Option<Vec<String>>,
    ) -> Result<Self, EstimationError> {
        let d = x.ncols();
        Self::new(x, y, Array2::ones((1, d)), labels)
    }

    pub fn x(&self) -> ArrayView2<'_, f64> {
        self.x.view()
    }

    pub fn y(&self) -> ArrayView1<'_, f64> {
        self.y.view()
    }

    pub fn c(&self) -> ArrayView2<'_, f64> {
        self.c.view()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn n_samples(&self) -> usize {
        self.x.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.x.ncols()
    }

    pub fn n_constraints(&self) -> usize {
        self.c.nrows()
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PROBLEM")?;
        writeln!(
            f,
            "  observations: {}   variables: {}   constraint rows: {}",
            self.n_samples(),
            self.n_features(),
            self.n_constraints()
        )?;
        let shown: Vec<&str> = self.labels.iter().take(6).map(String::as_str).collect();
        let ellipsis = if self.labels.len() > shown.len() { ", ..." } else { "" };
        write!(f, "  labels: {}{}", shown.join(", "), ellipsis)
    }
}
