//! # Equality Constraints
//!
//! Every optimizer iterate must satisfy `C beta = 0`. Rather than projecting after
//! soft-thresholding (which destroys sparsity), the proximal step itself is solved
//! under the constraint:
//!
//! ```text
//! prox(v) = argmin_b  0.5 ||b - v||^2 + sum_j t_j |b_j|   subject to  C b = 0
//! ```
//!
//! The constraint is first replaced by `Q`, an orthonormal basis of the row space of
//! `C` taken from its SVD. Writing `b(mu) = S_t(v - Q' mu)` for the soft-threshold of
//! the shifted point, the prox is found by minimizing the convex, piecewise quadratic
//! dual merit `0.5 ||b(mu)||^2` over `mu` with a semismooth Newton method. The dual
//! has one unknown per independent constraint, so each step solves an `r × r` system.
//! A single zero-sum row leaves one unknown, and its root is found in closed form.
//!
//! The factorization happens once per constraint matrix; the projector is then shared
//! read-only by every lambda, fold and subsample.

use crate::estimate::EstimationError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};
use ndarray_linalg::{SVD, Solve};

/// Singular values below this fraction of the largest one (times the matrix
/// dimension) are treated as zero when computing the rank of `C`.
const RANK_TOLERANCE: f64 = 1e-10;

const NEWTON_MAX_ITERATIONS: usize = 100;
const NEWTON_TOLERANCE: f64 = 1e-11;
const NEWTON_RIDGE: f64 = 1e-12;
const ARMIJO_SLOPE: f64 = 1e-4;
const MIN_LINE_SEARCH_STEP: f64 = 1e-10;

/// Coordinates this close to their threshold are rounding residue of the Newton
/// boundary step and are snapped to zero.
const SNAP_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq)]
enum ProjectorKind {
    /// No constraint rows (or only zero rows).
    Unconstrained,
    /// A single row whose non-zero entries are all equal: `sum_{j in members} beta_j = 0`.
    ZeroSum { members: Vec<usize> },
    General,
}

/// Null-space projector and constrained proximal operator for `C beta = 0`.
#[derive(Debug, Clone)]
pub struct ConstraintProjector {
    constraint: Array2<f64>,
    /// `r × d` matrix with orthonormal rows spanning the row space of `C`.
    basis: Array2<f64>,
    kind: ProjectorKind,
}

impl ConstraintProjector {
    /// Factorizes `C` once.
    ///
    /// Fails with `DegenerateConstraint` when the rank of `C` equals the number of
    /// columns, since the only feasible coefficient vector would then be zero.
    pub fn new(c: ArrayView2<f64>) -> Result<Self, EstimationError> {
        let (k, d) = c.dim();
        let constraint = c.to_owned();

        if k == 0 || c.iter().all(|&v| v == 0.0) {
            return Ok(Self {
                constraint,
                basis: Array2::zeros((0, d)),
                kind: ProjectorKind::Unconstrained,
            });
        }

        let (_, singular_values, vt) = c.svd(false, true)?;
        let vt = vt.ok_or_else(|| {
            EstimationError::InvalidConfiguration(
                "SVD of the constraint matrix did not return right singular vectors".to_string(),
            )
        })?;
        let largest = singular_values.iter().cloned().fold(0.0_f64, f64::max);
        let cutoff = RANK_TOLERANCE * largest * (k.max(d) as f64);
        let rank = singular_values.iter().filter(|&&sv| sv > cutoff).count();

        if rank >= d {
            return Err(EstimationError::DegenerateConstraint { rank, columns: d });
        }

        let basis = vt.slice(s![..rank, ..]).to_owned();
        let kind = detect_zero_sum(c).unwrap_or(ProjectorKind::General);
        log::debug!(
            "Constraint factorized: {k} rows, rank {rank}, null-space dimension {}",
            d - rank
        );

        Ok(Self {
            constraint,
            basis,
            kind,
        })
    }

    /// Number of independent constraint rows.
    pub fn rank(&self) -> usize {
        self.basis.nrows()
    }

    pub fn n_columns(&self) -> usize {
        self.constraint.ncols()
    }

    /// Dimension of the feasible subspace `{beta : C beta = 0}`.
    pub fn null_space_dim(&self) -> usize {
        self.n_columns() - self.rank()
    }

    /// `||C beta||_inf` measured against the original (unnormalized) constraint.
    pub fn violation(&self, beta: ArrayView1<f64>) -> f64 {
        if self.constraint.nrows() == 0 {
            return 0.0;
        }
        self.constraint
            .dot(&beta)
            .iter()
            .fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }

    /// Orthogonal projection onto the null space of `C`.
    pub fn project(&self, v: ArrayView1<f64>) -> Array1<f64> {
        match &self.kind {
            ProjectorKind::Unconstrained => v.to_owned(),
            ProjectorKind::ZeroSum { members } => {
                let mean = members.iter().map(|&j| v[j]).sum::<f64>() / members.len() as f64;
                let mut out = v.to_owned();
                for &j in members {
                    out[j] -= mean;
                }
                out
            }
            ProjectorKind::General => {
                let coords = self.basis.dot(&v);
                &v - &self.basis.t().dot(&coords)
            }
        }
    }

    /// Constrained soft-thresholding with per-coordinate thresholds `t`.
    ///
    /// A threshold of zero leaves the coordinate unpenalized and an infinite
    /// threshold pins it to zero.
    pub fn prox(
        &self,
        v: ArrayView1<f64>,
        thresholds: ArrayView1<f64>,
    ) -> Result<Array1<f64>, EstimationError> {
        match &self.kind {
            ProjectorKind::Unconstrained => return Ok(soft_threshold(v, thresholds)),
            ProjectorKind::ZeroSum { members } => return Ok(zero_sum_prox(v, thresholds, members)),
            ProjectorKind::General => {}
        }

        let scale = v.iter().fold(1.0_f64, |acc, x| acc.max(x.abs()));
        let tolerance = NEWTON_TOLERANCE * scale;
        let r = self.rank();

        let mut mu = Array1::<f64>::zeros(r);
        let mut shifted = v.to_owned();
        let mut beta = soft_threshold(shifted.view(), thresholds);
        let mut merit = 0.5 * beta.dot(&beta);

        for iteration in 0..NEWTON_MAX_ITERATIONS {
            let residual = self.basis.dot(&beta);
            if max_abs(residual.view()) <= tolerance {
                return Ok(snap(beta, shifted.view(), thresholds, scale));
            }

            // Generalized Hessian of the dual merit: Q_A Q_A' over active coordinates.
            let mut masked = self.basis.clone();
            for (j, mut column) in masked.axis_iter_mut(Axis(1)).enumerate() {
                if !is_active(shifted[j], thresholds[j]) {
                    column.fill(0.0);
                }
            }
            let mut hessian = masked.dot(&self.basis.t());
            hessian.diag_mut().mapv_inplace(|h| h + NEWTON_RIDGE);
            let direction = hessian.solve(&residual)?;
            let slope = residual.dot(&direction);

            let mut step = 1.0;
            loop {
                let mu_trial = &mu + &(&direction * step);
                let shifted_trial = &v - &self.basis.t().dot(&mu_trial);
                let beta_trial = soft_threshold(shifted_trial.view(), thresholds);
                let merit_trial = 0.5 * beta_trial.dot(&beta_trial);
                if merit_trial <= merit - ARMIJO_SLOPE * step * slope
                    || step < MIN_LINE_SEARCH_STEP
                {
                    mu = mu_trial;
                    shifted = shifted_trial;
                    beta = beta_trial;
                    merit = merit_trial;
                    break;
                }
                step *= 0.5;
            }

            if iteration + 1 == NEWTON_MAX_ITERATIONS {
                log::debug!(
                    "Constrained prox reached the Newton cap; residual {:.3e}",
                    max_abs(self.basis.dot(&beta).view())
                );
            }
        }

        Ok(snap(beta, shifted.view(), thresholds, scale))
    }

    /// Constraint-adjusted gradient `g + Q' mu` where `mu` is chosen so that the
    /// adjusted entries vanish on the unpenalized coordinates (least squares).
    ///
    /// Any lambda with `lambda * w_j >= |result_j|` on every penalized coordinate
    /// keeps them all at zero, so the penalized entries bound `lambda_max` from
    /// above. The bound is not tight: `mu` minimizes a sum of squares, not the
    /// largest entry.
    pub fn dual_certificate(
        &self,
        gradient: ArrayView1<f64>,
        unpenalized: &[bool],
    ) -> Result<Array1<f64>, EstimationError> {
        if self.rank() == 0 {
            return Ok(gradient.to_owned());
        }
        let ridge = 1e-10;
        let mut masked = self.basis.clone();
        for (j, mut column) in masked.axis_iter_mut(Axis(1)).enumerate() {
            if !unpenalized[j] {
                column.fill(0.0);
            }
        }
        let mut normal = masked.dot(&masked.t());
        normal.diag_mut().mapv_inplace(|h| h + ridge);
        let rhs = -(&masked.dot(&gradient) + &(self.basis.dot(&gradient) * ridge));
        let mu = normal.solve(&rhs)?;
        Ok(&gradient + &self.basis.t().dot(&mu))
    }
}

/// Entrywise soft-thresholding `sign(v) * max(|v| - t, 0)`.
pub fn soft_threshold(v: ArrayView1<f64>, thresholds: ArrayView1<f64>) -> Array1<f64> {
    Zip::from(&v)
        .and(&thresholds)
        .map_collect(|&value, &t| scalar_soft_threshold(value, t))
}

/// Constrained prox for `sum_{j in members} b_j = 0`.
///
/// With a single constraint row the dual has one unknown: member coordinates are
/// `S_t(v_j - mu)` and their sum is non-increasing and piecewise linear in `mu`,
/// with kinks at `v_j +/- t_j`. The root is bracketed between sorted kinks and
/// interpolated exactly on the linear piece containing it.
fn zero_sum_prox(v: ArrayView1<f64>, thresholds: ArrayView1<f64>, members: &[usize]) -> Array1<f64> {
    let shift = zero_sum_shift(v, thresholds, members);
    let mut shifted = v.to_owned();
    for &j in members {
        shifted[j] -= shift;
    }
    soft_threshold(shifted.view(), thresholds)
}

fn zero_sum_shift(v: ArrayView1<f64>, thresholds: ArrayView1<f64>, members: &[usize]) -> f64 {
    let member_sum = |mu: f64| -> f64 {
        members
            .iter()
            .map(|&j| scalar_soft_threshold(v[j] - mu, thresholds[j]))
            .sum()
    };

    let finite_members = members
        .iter()
        .filter(|&&j| thresholds[j] > 0.0 && thresholds[j].is_finite())
        .count();
    let free: Vec<f64> = members
        .iter()
        .filter(|&&j| thresholds[j] == 0.0)
        .map(|&j| v[j])
        .collect();
    let mut kinks: Vec<f64> = members
        .iter()
        .filter(|&&j| thresholds[j] > 0.0 && thresholds[j].is_finite())
        .flat_map(|&j| [v[j] - thresholds[j], v[j] + thresholds[j]])
        .collect();

    if kinks.is_empty() {
        // Only unpenalized and pinned members: the sum is linear or identically zero.
        return if free.is_empty() {
            0.0
        } else {
            free.iter().sum::<f64>() / free.len() as f64
        };
    }
    kinks.sort_by(f64::total_cmp);
    kinks.dedup();

    // Outside the outermost kinks every finite-threshold member is active.
    let outer_slope = (free.len() + finite_members) as f64;

    let lowest = kinks[0];
    let at_lowest = member_sum(lowest);
    if at_lowest <= 0.0 {
        return lowest + at_lowest / outer_slope;
    }
    let highest = kinks[kinks.len() - 1];
    let at_highest = member_sum(highest);
    if at_highest >= 0.0 {
        return highest + at_highest / outer_slope;
    }

    // First kink where the sum is no longer positive; the root lies just before it.
    let upper = kinks.partition_point(|&mu| member_sum(mu) > 0.0);
    let (a, b) = (kinks[upper - 1], kinks[upper]);
    let (fa, fb) = (member_sum(a), member_sum(b));
    a + fa * (b - a) / (fa - fb)
}

fn scalar_soft_threshold(value: f64, threshold: f64) -> f64 {
    if threshold == 0.0 {
        value
    } else {
        let magnitude = value.abs() - threshold;
        if magnitude > 0.0 {
            magnitude.copysign(value)
        } else {
            0.0
        }
    }
}

fn is_active(value: f64, threshold: f64) -> bool {
    threshold == 0.0 || value.abs() > threshold
}

fn max_abs(v: ArrayView1<f64>) -> f64 {
    v.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}

fn snap(
    mut beta: Array1<f64>,
    shifted: ArrayView1<f64>,
    thresholds: ArrayView1<f64>,
    scale: f64,
) -> Array1<f64> {
    let cutoff = SNAP_TOLERANCE * scale;
    Zip::from(&mut beta)
        .and(&shifted)
        .and(&thresholds)
        .for_each(|b, &w, &t| {
            if t > 0.0 && *b != 0.0 && (w.abs() - t).abs() <= cutoff {
                *b = 0.0;
            }
        });
    beta
}

fn detect_zero_sum(c: ArrayView2<f64>) -> Option<ProjectorKind> {
    if c.nrows() != 1 {
        return None;
    }
    let row = c.row(0);
    let members: Vec<usize> = row
        .iter()
        .enumerate()
        .filter(|(_, v)| **v != 0.0)
        .map(|(j, _)| j)
        .collect();
    let first = row[*members.first()?];
    if members.iter().all(|&j| row[j] == first) {
        Some(ProjectorKind::ZeroSum { members })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn prox_objective(b: &Array1<f64>, v: &Array1<f64>, t: &Array1<f64>) -> f64 {
        let diff = b - v;
        0.5 * diff.dot(&diff)
            + b.iter()
                .zip(t.iter())
                .map(|(bj, tj)| if *bj == 0.0 { 0.0 } else { tj * bj.abs() })
                .sum::<f64>()
    }

    #[test]
    fn unconstrained_prox_is_soft_thresholding() {
        let projector = ConstraintProjector::new(Array2::<f64>::zeros((0, 4)).view()).unwrap();
        let v = array![3.0, -0.5, 1.2, -2.0];
        let t = array![1.0, 1.0, 0.0, 1.0];
        let out = projector.prox(v.view(), t.view()).unwrap();
        assert_eq!(out, array![2.0, 0.0, 1.2, -1.0]);
    }

    #[test]
    fn zero_sum_projection_removes_the_mean() {
        let projector = ConstraintProjector::new(Array2::ones((1, 4)).view()).unwrap();
        let v = array![1.0, 2.0, 3.0, 6.0];
        let p = projector.project(v.view());
        assert_abs_diff_eq!(p.sum(), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p[0], -2.0, epsilon = 1e-12);
        assert_eq!(projector.null_space_dim(), 3);
    }

    #[test]
    fn general_projection_is_idempotent_and_feasible() {
        let c = array![[1.0, 2.0, 0.0, -1.0], [0.0, 1.0, 1.0, 1.0]];
        let projector = ConstraintProjector::new(c.view()).unwrap();
        let v = array![0.3, -1.0, 2.0, 0.7];
        let p = projector.project(v.view());
        let pp = projector.project(p.view());
        assert!(projector.violation(p.view()) < 1e-12);
        for (a, b) in p.iter().zip(pp.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn constrained_prox_is_sparse_feasible_and_optimal() {
        let mut rng = StdRng::seed_from_u64(11);
        let d = 12;
        let c = {
            let mut c = Array2::ones((2, d));
            for j in 0..d {
                c[[1, j]] = if j % 3 == 0 { 1.0 } else { 0.0 };
            }
            c
        };
        let projector = ConstraintProjector::new(c.view()).unwrap();
        let v = Array1::from_shape_fn(d, |_| rng.gen_range(-3.0..3.0));
        let t = Array1::from_elem(d, 0.8);
        let b = projector.prox(v.view(), t.view()).unwrap();

        assert!(projector.violation(b.view()) < 1e-8);
        assert!(b.iter().any(|x| *x == 0.0), "expected exact zeros in {b:?}");

        let best = prox_objective(&b, &v, &t);
        for _ in 0..200 {
            let raw = Array1::from_shape_fn(d, |_| rng.gen_range(-1.0..1.0));
            let direction = projector.project(raw.view());
            for eps in [1e-3, 1e-2, 1e-1] {
                let trial = &b + &(&direction * eps);
                assert!(prox_objective(&trial, &v, &t) >= best - 1e-9);
            }
        }
    }

    #[test]
    fn infinite_threshold_pins_coordinate_to_zero() {
        let projector = ConstraintProjector::new(Array2::ones((1, 3)).view()).unwrap();
        let v = array![5.0, -1.0, 2.0];
        let t = array![f64::INFINITY, 0.0, 0.0];
        let b = projector.prox(v.view(), t.view()).unwrap();
        assert_eq!(b[0], 0.0);
        assert_abs_diff_eq!(b[1] + b[2], 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(b[1], -1.5, epsilon = 1e-9);
    }

    #[test]
    fn zero_sum_closed_form_matches_the_newton_prox() {
        let mut rng = StdRng::seed_from_u64(29);
        let d = 10;
        let row = Array1::from_shape_fn(d, |j| if j < 8 { 1.0 } else { 0.0 });
        let mut single = Array2::zeros((1, d));
        single.row_mut(0).assign(&row);
        let mut doubled = Array2::zeros((2, d));
        doubled.row_mut(0).assign(&row);
        doubled.row_mut(1).assign(&(&row * 2.0));

        let closed_form = ConstraintProjector::new(single.view()).unwrap();
        let newton = ConstraintProjector::new(doubled.view()).unwrap();
        assert_eq!(newton.rank(), 1);

        let t = array![0.5, 0.5, 0.0, f64::INFINITY, 1.5, 0.2, 0.5, 0.0, 0.3, f64::INFINITY];
        for _ in 0..20 {
            let v = Array1::from_shape_fn(d, |_| rng.gen_range(-3.0..3.0));
            let a = closed_form.prox(v.view(), t.view()).unwrap();
            let b = newton.prox(v.view(), t.view()).unwrap();
            assert!(closed_form.violation(a.view()) < 1e-12);
            for (x, y) in a.iter().zip(b.iter()) {
                assert_abs_diff_eq!(*x, *y, epsilon = 1e-8);
            }
            assert_eq!(a[3], 0.0);
            assert_eq!(a[9], 0.0);
        }
    }

    #[test]
    fn zero_sum_prox_keeps_a_sparse_feasible_optimum() {
        let projector = ConstraintProjector::new(Array2::ones((1, 5)).view()).unwrap();
        let v = array![2.0, 0.1, -0.1, 0.2, -2.2];
        let t = Array1::from_elem(5, 0.5);
        let b = projector.prox(v.view(), t.view()).unwrap();
        assert_abs_diff_eq!(b.sum(), 0.0, epsilon = 1e-12);
        // The shift is -0.1; only the two outer coordinates clear their threshold.
        assert_abs_diff_eq!(b[0], 1.6, epsilon = 1e-12);
        assert_abs_diff_eq!(b[4], -1.6, epsilon = 1e-12);
        assert_eq!(&b.as_slice().unwrap()[1..4], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn zero_sum_prox_with_every_member_pinned_is_zero() {
        let projector = ConstraintProjector::new(array![[1.0, 1.0, 0.0]].view()).unwrap();
        let v = array![2.0, -7.0, 3.0];
        let t = array![f64::INFINITY, f64::INFINITY, 0.0];
        let b = projector.prox(v.view(), t.view()).unwrap();
        assert_eq!(b, array![0.0, 0.0, 3.0]);
    }

    #[test]
    fn full_rank_constraint_is_degenerate() {
        let c = Array2::<f64>::eye(3);
        match ConstraintProjector::new(c.view()) {
            Err(EstimationError::DegenerateConstraint { rank, columns }) => {
                assert_eq!(rank, 3);
                assert_eq!(columns, 3);
            }
            other => panic!("expected a degenerate constraint, got {other:?}"),
        }
    }

    #[test]
    fn duplicated_rows_do_not_inflate_the_rank() {
        let c = array![[1.0, 1.0, 0.0], [2.0, 2.0, 0.0]];
        let projector = ConstraintProjector::new(c.view()).unwrap();
        assert_eq!(projector.rank(), 1);
        assert_eq!(projector.null_space_dim(), 2);
    }

    #[test]
    fn certificate_vanishes_on_unpenalized_coordinates() {
        let projector = ConstraintProjector::new(array![[1.0, 1.0, 1.0, 0.0]].view()).unwrap();
        let g = array![0.5, -1.0, 2.0, 0.0];
        let cert = projector
            .dual_certificate(g.view(), &[false, false, false, true])
            .unwrap();
        assert_abs_diff_eq!(cert[3], 0.0, epsilon = 1e-12);
        // The penalized part is the centered gradient.
        assert_abs_diff_eq!(cert[0], 0.0, epsilon = 1e-8);
        assert_abs_diff_eq!(cert[2], 1.5, epsilon = 1e-8);
    }
}
