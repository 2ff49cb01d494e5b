//! The boxed LCP contract and a projected Gauss–Seidel implementation.
//!
//! A boxed LCP asks for `x` with `w = A x + b` such that each row is either
//! inside its bounds with `w = 0` or saturated at a bound with `w` pushing
//! against it. Friction coupling makes the bounds of a tangent row
//! proportional to the solution of its normal row through `findex`.

use crate::fph;
use nalgebra::{DMatrix, DVector};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a solved LCP row relates to its bounds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConstraintRegime {
    /// Strictly inside its bounds with zero complementary velocity: the row
    /// actively enforces its constraint.
    Clamping,
    /// Saturated at a friction bound; the force magnitude is pinned to the
    /// coupled normal force.
    UpperBound,
    /// Zero force with strict inequality; contributes nothing to first-order
    /// sensitivity.
    NotClamping,
}

/// A boxed LCP solver. `findex[i] = Some(j)` couples the bounds of row `i`
/// to the solution of row `j`: the effective bounds are `lo[i]·|x[j]|` and
/// `hi[i]·|x[j]|`.
///
/// Implementations return `false` on failure (non-convergence, non-finite
/// data); callers must be able to recover.
pub trait BoxedLcpSolver: fmt::Debug {
    fn solve(
        &self,
        a: &DMatrix<fph>,
        x: &mut DVector<fph>,
        b: &DVector<fph>,
        lo: &DVector<fph>,
        hi: &DVector<fph>,
        findex: &[Option<usize>],
    ) -> bool;
}

/// Configuration for [`PgsSolver`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PgsConfig {
    /// Maximum number of Gauss–Seidel sweeps.
    pub max_iterations: u32,
    /// Sweep-to-sweep solution change below which the solve is converged.
    pub tolerance: fph,
    /// Successive over-relaxation factor.
    pub relaxation: fph,
}

impl Default for PgsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-12,
            relaxation: 1.0,
        }
    }
}

impl PgsConfig {
    /// A slower, more robust configuration used when the default solve
    /// reports failure.
    pub fn fallback() -> Self {
        Self {
            max_iterations: 10_000,
            tolerance: 1e-10,
            relaxation: 0.9,
        }
    }
}

/// Projected Gauss–Seidel over the boxed problem, with per-sweep bound
/// refresh from the friction-coupled rows.
#[derive(Clone, Debug, Default)]
pub struct PgsSolver {
    config: PgsConfig,
}

impl PgsSolver {
    pub fn new(config: PgsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PgsConfig {
        &self.config
    }
}

impl BoxedLcpSolver for PgsSolver {
    fn solve(
        &self,
        a: &DMatrix<fph>,
        x: &mut DVector<fph>,
        b: &DVector<fph>,
        lo: &DVector<fph>,
        hi: &DVector<fph>,
        findex: &[Option<usize>],
    ) -> bool {
        let n = b.len();
        debug_assert_eq!(a.nrows(), n);
        debug_assert_eq!(a.ncols(), n);
        debug_assert_eq!(x.len(), n);
        debug_assert_eq!(findex.len(), n);

        if n == 0 {
            return true;
        }
        if a.iter().any(|value| !value.is_finite()) || b.iter().any(|value| !value.is_finite()) {
            return false;
        }

        for i in 0..n {
            if a[(i, i)] <= fph::EPSILON {
                return false;
            }
        }

        for _ in 0..self.config.max_iterations {
            let mut max_change: fph = 0.0;

            for i in 0..n {
                let residual = a.row(i).transpose().dot(x) + b[i];
                let mut candidate = x[i] - self.config.relaxation * residual / a[(i, i)];

                let (lower, upper) = match findex[i] {
                    Some(j) => {
                        let magnitude = x[j].abs();
                        (lo[i] * magnitude, hi[i] * magnitude)
                    }
                    None => (lo[i], hi[i]),
                };
                candidate = candidate.clamp(lower, upper);

                max_change = max_change.max((candidate - x[i]).abs());
                x[i] = candidate;
            }

            if max_change < self.config.tolerance {
                return x.iter().all(|value| value.is_finite());
            }
        }

        false
    }
}

/// Classifies each solved row into its [`ConstraintRegime`].
pub fn classify_rows(
    x: &DVector<fph>,
    lo: &DVector<fph>,
    hi: &DVector<fph>,
    findex: &[Option<usize>],
    tolerance: fph,
) -> Vec<ConstraintRegime> {
    (0..x.len())
        .map(|i| {
            let (lower, upper) = match findex[i] {
                Some(j) => {
                    let magnitude = x[j].abs();
                    (lo[i] * magnitude, hi[i] * magnitude)
                }
                None => (lo[i], hi[i]),
            };

            match findex[i] {
                None => {
                    // Unilateral rows: zero force means a strict inequality.
                    if x[i].abs() <= tolerance {
                        ConstraintRegime::NotClamping
                    } else if (upper.is_finite() && (upper - x[i]).abs() <= tolerance)
                        || (lower != 0.0 && lower.is_finite() && (x[i] - lower).abs() <= tolerance)
                    {
                        ConstraintRegime::UpperBound
                    } else {
                        ConstraintRegime::Clamping
                    }
                }
                Some(_) => {
                    // Friction rows: a collapsed bound means the coupled
                    // normal force vanished.
                    if upper - lower <= 2.0 * tolerance {
                        ConstraintRegime::NotClamping
                    } else if (x[i] - lower).abs() <= tolerance
                        || (upper - x[i]).abs() <= tolerance
                    {
                        ConstraintRegime::UpperBound
                    } else {
                        ConstraintRegime::Clamping
                    }
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector};
    use proptest::prelude::*;

    const NO_COUPLING: Option<usize> = None;

    prop_compose! {
        /// A diagonally dominant symmetric positive definite matrix with the
        /// given size, plus an offset vector.
        fn boxed_problem_strategy(size: usize)(
            entries in proptest::collection::vec(-1.0..1.0f64, size * size),
            offsets in proptest::collection::vec(-2.0..2.0f64, size),
        ) -> (DMatrix<fph>, DVector<fph>) {
            let raw = DMatrix::from_vec(size, size, entries);
            let mut a = &raw * raw.transpose();
            for i in 0..size {
                a[(i, i)] += size as fph;
            }
            (a, DVector::from_vec(offsets))
        }
    }

    proptest! {
        #[test]
        fn solved_unilateral_rows_satisfy_complementarity(
            (a, b) in boxed_problem_strategy(4),
        ) {
            let n = b.len();
            let lo = DVector::zeros(n);
            let hi = DVector::from_element(n, fph::INFINITY);
            let mut x = DVector::zeros(n);

            prop_assert!(PgsSolver::default().solve(&a, &mut x, &b, &lo, &hi, &[NO_COUPLING; 4]));

            let w = &a * &x + &b;
            for i in 0..n {
                // Either the row pushes (w = 0) or it is inactive (x = 0).
                prop_assert!(x[i] >= -1e-12);
                prop_assert!(w[i] >= -1e-7);
                prop_assert!(x[i] * w[i] < 1e-7);
            }
        }
    }

    #[test]
    fn interior_solution_solves_the_linear_system() {
        let a = dmatrix![4.0, 1.0; 1.0, 3.0];
        let b = dvector![-1.0, -2.0];
        let lo = dvector![0.0, 0.0];
        let hi = dvector![fph::INFINITY, fph::INFINITY];
        let mut x = dvector![0.0, 0.0];

        let solved = PgsSolver::default().solve(&a, &mut x, &b, &lo, &hi, &[NO_COUPLING; 2]);
        assert!(solved);

        let w = &a * &x + &b;
        assert_abs_diff_eq!(w[0], 0.0, epsilon = 1e-8);
        assert_abs_diff_eq!(w[1], 0.0, epsilon = 1e-8);
    }

    #[test]
    fn separating_row_stays_at_zero() {
        let a = dmatrix![2.0];
        let b = dvector![3.0];
        let lo = dvector![0.0];
        let hi = dvector![fph::INFINITY];
        let mut x = dvector![0.0];

        assert!(PgsSolver::default().solve(&a, &mut x, &b, &lo, &hi, &[NO_COUPLING]));
        assert_abs_diff_eq!(x[0], 0.0);

        let regimes = classify_rows(&x, &lo, &hi, &[NO_COUPLING], 1e-9);
        assert_eq!(regimes[0], ConstraintRegime::NotClamping);
    }

    #[test]
    fn friction_row_saturates_at_coupled_bound() {
        // Row 0 is a normal with solution 2; row 1 is a tangent whose
        // unconstrained solution exceeds µ·x₀ = 1.
        let a = dmatrix![1.0, 0.0; 0.0, 1.0];
        let b = dvector![-2.0, -5.0];
        let lo = dvector![0.0, -0.5];
        let hi = dvector![fph::INFINITY, 0.5];
        let findex = [None, Some(0)];
        let mut x = dvector![0.0, 0.0];

        assert!(PgsSolver::default().solve(&a, &mut x, &b, &lo, &hi, &findex));
        assert_abs_diff_eq!(x[0], 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(x[1], 1.0, epsilon = 1e-9);

        let regimes = classify_rows(&x, &lo, &hi, &findex, 1e-9);
        assert_eq!(regimes[0], ConstraintRegime::Clamping);
        assert_eq!(regimes[1], ConstraintRegime::UpperBound);
    }

    #[test]
    fn sticking_friction_row_is_clamping() {
        let a = dmatrix![1.0, 0.0; 0.0, 1.0];
        let b = dvector![-2.0, -0.3];
        let lo = dvector![0.0, -0.5];
        let hi = dvector![fph::INFINITY, 0.5];
        let findex = [None, Some(0)];
        let mut x = dvector![0.0, 0.0];

        assert!(PgsSolver::default().solve(&a, &mut x, &b, &lo, &hi, &findex));
        assert_abs_diff_eq!(x[1], 0.3, epsilon = 1e-9);

        let regimes = classify_rows(&x, &lo, &hi, &findex, 1e-9);
        assert_eq!(regimes[1], ConstraintRegime::Clamping);
    }

    #[test]
    fn non_finite_input_is_rejected() {
        let a = dmatrix![fph::NAN];
        let b = dvector![0.0];
        let lo = dvector![0.0];
        let hi = dvector![fph::INFINITY];
        let mut x = dvector![0.0];
        assert!(!PgsSolver::default().solve(&a, &mut x, &b, &lo, &hi, &[NO_COUPLING]));
    }
}
