//! Exact transfer between nested spline spaces by knot insertion.
//!
//! Inserting a knot into a spline space enlarges the space
//! without changing any function already in it,
//! so the coefficients of a coarse spline in a refined basis
//! are a linear function of its coarse coefficients.
//! Inserting knots one at a time (Boehm's algorithm)
//! and multiplying the single-insertion matrices together
//! gives the prolongation matrix between any two nested spaces.

use nalgebra as na;
use nalgebra_sparse as nas;

use crate::{
    operator::{self, MatrixOperator},
    spline::{BasisKind, SplineSpace1d},
};

/// Breakpoints closer than this are considered equal.
pub const KNOT_MATCH_TOL: f64 = 1e-12;
/// Breakpoints farther apart than this are considered distinct.
/// Distances between the two tolerances cannot be classified safely
/// and are reported as errors.
pub const KNOT_AMBIGUITY_TOL: f64 = 1e-9;

/// Failure to relate two spline spaces by knot insertion.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum KnotInsertionError {
    /// A breakpoint was too close to another to be called new,
    /// but too far to be called equal.
    #[error("Breakpoint {value} is {distance:e} away from breakpoint {nearest}, which is neither equal nor distinct")]
    AmbiguousBreakpoint {
        /// The breakpoint.
        value: f64,
        /// The closest breakpoint on the other grid.
        nearest: f64,
        /// Distance between them.
        distance: f64,
    },
    /// The coarse grid has a breakpoint that the fine grid lacks.
    #[error("Coarse breakpoint {value} is missing from the fine grid")]
    NotNested {
        /// The missing breakpoint.
        value: f64,
    },
    /// Knot insertion preserves the degree.
    #[error("Knot insertion requires equal degrees, got {coarse} and {fine}")]
    DegreeMismatch {
        /// Coarse degree.
        coarse: usize,
        /// Fine degree.
        fine: usize,
    },
    /// The spaces used different normalizations.
    #[error("Cannot transfer between spaces of different basis kinds")]
    KindMismatch,
    /// Only clamped knot vectors are supported.
    #[error("Knot insertion is not supported for periodic spaces")]
    Periodic,
}

/// Find the breakpoints of `fine` that are not in `coarse`,
/// verifying that every breakpoint of `coarse` is also in `fine`.
///
/// Both slices must be sorted.
pub fn knots_to_insert(coarse: &[f64], fine: &[f64]) -> Result<Vec<f64>, KnotInsertionError> {
    for &value in coarse {
        let (nearest, distance) = nearest(fine, value);
        if distance >= KNOT_AMBIGUITY_TOL {
            return Err(KnotInsertionError::NotNested { value });
        }
        if distance >= KNOT_MATCH_TOL {
            return Err(KnotInsertionError::AmbiguousBreakpoint {
                value,
                nearest,
                distance,
            });
        }
    }

    let mut new_knots = Vec::new();
    for &value in fine {
        let (nearest, distance) = nearest(coarse, value);
        if distance < KNOT_MATCH_TOL {
            continue;
        }
        if distance < KNOT_AMBIGUITY_TOL {
            return Err(KnotInsertionError::AmbiguousBreakpoint {
                value,
                nearest,
                distance,
            });
        }
        new_knots.push(value);
    }
    Ok(new_knots)
}

/// Closest value in a sorted slice and its distance to `x`.
fn nearest(sorted: &[f64], x: f64) -> (f64, f64) {
    let idx = sorted.partition_point(|&v| v < x);
    [idx.checked_sub(1), Some(idx)]
        .into_iter()
        .flatten()
        .filter_map(|i| sorted.get(i))
        .map(|&v| (v, (v - x).abs()))
        .fold((f64::NAN, f64::INFINITY), |best, cand| {
            if cand.1 < best.1 {
                cand
            } else {
                best
            }
        })
}

/// The matrix inserting the knot `x` once into a clamped knot vector of the given degree.
///
/// Maps the `n` old coefficients to the `n + 1` new ones.
fn insertion_matrix(degree: usize, knots: &[f64], x: f64) -> nas::CsrMatrix<f64> {
    let p = degree;
    let n = knots.len() - p - 1;
    // knot span containing x
    let span = (knots.partition_point(|&t| t <= x).saturating_sub(1)).clamp(p, n - 1);

    let mut coo = nas::CooMatrix::new(n + 1, n);
    for i in 0..=n {
        if i + p <= span {
            coo.push(i, i, 1.);
        } else if i <= span {
            let alpha = (x - knots[i]) / (knots[i + p] - knots[i]);
            coo.push(i, i, alpha);
            coo.push(i, i - 1, 1. - alpha);
        } else {
            coo.push(i, i - 1, 1.);
        }
    }
    nas::CsrMatrix::from(&coo)
}

/// The prolongation matrix from a coarse 1D space to a nested fine one,
/// mapping coarse coefficients to fine coefficients of the same function.
///
/// Its shape is `(fine.nbasis(), coarse.nbasis())`.
/// Spaces with identical breakpoints give the identity.
pub fn prolongation(
    coarse: &SplineSpace1d,
    fine: &SplineSpace1d,
) -> Result<MatrixOperator, KnotInsertionError> {
    if coarse.kind() != fine.kind() {
        return Err(KnotInsertionError::KindMismatch);
    }
    if coarse.degree() != fine.degree() {
        return Err(KnotInsertionError::DegreeMismatch {
            coarse: coarse.degree(),
            fine: fine.degree(),
        });
    }
    let new_knots = knots_to_insert(coarse.breaks(), fine.breaks())?;
    if new_knots.is_empty() {
        return Ok(operator::identity(coarse.nbasis()));
    }
    if coarse.is_periodic() || fine.is_periodic() {
        return Err(KnotInsertionError::Periodic);
    }

    let p = coarse.degree();
    let mut knots = coarse.knots().to_vec();
    let mut prolong = nas::CsrMatrix::identity(coarse.nbasis());
    for x in new_knots {
        prolong = insertion_matrix(p, &knots, x) * prolong;
        let pos = knots.partition_point(|&t| t <= x);
        knots.insert(pos, x);
    }

    if coarse.kind() == BasisKind::M {
        // M-splines are scaled B-splines:
        // rescale coarse coefficients into B-spline coefficients and back
        let coarse_scale = coarse.scalings();
        let fine_scale = fine.scalings();
        let mut coo = nas::CooMatrix::new(prolong.nrows(), prolong.ncols());
        for (i, j, &v) in prolong.triplet_iter() {
            coo.push(i, j, v * coarse_scale[j] / fine_scale[i]);
        }
        prolong = nas::CsrMatrix::from(&coo);
    }

    Ok(prolong.into())
}

/// Prolongation between tensor-product spaces,
/// the Kronecker product of the per-axis prolongations.
pub fn prolongation_2d(
    coarse: &[SplineSpace1d; 2],
    fine: &[SplineSpace1d; 2],
) -> Result<MatrixOperator, KnotInsertionError> {
    let p0 = prolongation(&coarse[0], &fine[0])?;
    let p1 = prolongation(&coarse[1], &fine[1])?;
    Ok(operator::kron(&p0, &p1))
}

/// A prolongation between two nested spline spaces,
/// together with its transpose used as a restriction.
#[derive(Clone, Debug)]
pub struct KnotInsertionTransfer {
    prolong: MatrixOperator,
    restrict: MatrixOperator,
}

impl KnotInsertionTransfer {
    /// Transfer between two 1D spaces.
    pub fn new(coarse: &SplineSpace1d, fine: &SplineSpace1d) -> Result<Self, KnotInsertionError> {
        Ok(Self::from_prolongation(prolongation(coarse, fine)?))
    }

    /// Transfer between two tensor-product spaces.
    pub fn tensor(
        coarse: &[SplineSpace1d; 2],
        fine: &[SplineSpace1d; 2],
    ) -> Result<Self, KnotInsertionError> {
        Ok(Self::from_prolongation(prolongation_2d(coarse, fine)?))
    }

    fn from_prolongation(prolong: MatrixOperator) -> Self {
        let restrict = operator::transpose(&prolong);
        Self { prolong, restrict }
    }

    /// The prolongation matrix (fine × coarse).
    #[inline]
    pub fn matrix(&self) -> &MatrixOperator {
        &self.prolong
    }

    /// Express a coarse function in the fine basis.
    pub fn prolong(&self, coarse_coeffs: &na::DVector<f64>) -> na::DVector<f64> {
        self.prolong.mul_vec(coarse_coeffs)
    }

    /// Apply the transposed prolongation to fine (dual) coefficients.
    pub fn restrict(&self, fine_coeffs: &na::DVector<f64>) -> na::DVector<f64> {
        self.restrict.mul_vec(fine_coeffs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::Operator;
    use approx::assert_relative_eq;

    fn sample_points() -> impl Iterator<Item = f64> {
        (0..=97).map(|i| i as f64 / 97.)
    }

    #[test]
    fn prolongation_reproduces_coarse_splines() {
        let coarse = SplineSpace1d::new(3, vec![0., 0.3, 0.5, 1.], false).unwrap();
        let fine =
            SplineSpace1d::new(3, vec![0., 0.1, 0.3, 0.4, 0.5, 0.75, 0.9, 1.], false).unwrap();
        let transfer = KnotInsertionTransfer::new(&coarse, &fine).unwrap();
        assert_eq!(
            transfer.matrix().shape(),
            (fine.nbasis(), coarse.nbasis())
        );

        let coeffs = na::DVector::from_fn(coarse.nbasis(), |i, _| (1.3 * i as f64).cos());
        let fine_coeffs = transfer.prolong(&coeffs);
        for x in sample_points() {
            assert_relative_eq!(
                coarse.eval(coeffs.as_slice(), x),
                fine.eval(fine_coeffs.as_slice(), x),
                epsilon = 1e-13
            );
        }
    }

    #[test]
    fn prolongation_reproduces_m_splines() {
        let coarse = SplineSpace1d::uniform(3, 3, false).unwrap().reduced();
        let fine = SplineSpace1d::uniform(3, 9, false).unwrap().reduced();
        let transfer = KnotInsertionTransfer::new(&coarse, &fine).unwrap();
        let coeffs = na::DVector::from_fn(coarse.nbasis(), |i, _| 1. + i as f64 * 0.25);
        let fine_coeffs = transfer.prolong(&coeffs);
        for x in sample_points() {
            assert_relative_eq!(
                coarse.eval(coeffs.as_slice(), x),
                fine.eval(fine_coeffs.as_slice(), x),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn constants_stay_constant() {
        let coarse = SplineSpace1d::uniform(3, 4, false).unwrap();
        let fine = SplineSpace1d::uniform(3, 8, false).unwrap();
        let transfer = KnotInsertionTransfer::new(&coarse, &fine).unwrap();
        let ones = na::DVector::from_element(coarse.nbasis(), 1.);
        let fine_coeffs = transfer.prolong(&ones);
        for x in sample_points() {
            assert!((fine.eval(fine_coeffs.as_slice(), x) - 1.).abs() <= 1e-12);
        }
    }

    #[test]
    fn equal_spaces_give_identity() {
        let space = SplineSpace1d::uniform(2, 5, false).unwrap();
        let p = prolongation(&space, &space).unwrap();
        assert_eq!(p, operator::identity(space.nbasis()));
    }

    #[test]
    fn tensor_transfer_is_kronecker_product() {
        let coarse = [
            SplineSpace1d::uniform(2, 2, false).unwrap(),
            SplineSpace1d::uniform(2, 3, false).unwrap(),
        ];
        let fine = [
            SplineSpace1d::uniform(2, 4, false).unwrap(),
            SplineSpace1d::uniform(2, 3, false).unwrap(),
        ];
        let transfer = KnotInsertionTransfer::tensor(&coarse, &fine).unwrap();
        let n_fine = fine[0].nbasis() * fine[1].nbasis();
        let n_coarse = coarse[0].nbasis() * coarse[1].nbasis();
        assert_eq!(transfer.matrix().shape(), (n_fine, n_coarse));
        // restriction is the adjoint of prolongation
        let x = na::DVector::from_fn(n_coarse, |i, _| i as f64);
        let y = na::DVector::from_fn(n_fine, |i, _| (i % 3) as f64);
        assert_relative_eq!(
            transfer.prolong(&x).dot(&y),
            x.dot(&transfer.restrict(&y)),
            epsilon = 1e-12
        );
    }

    #[test]
    fn breakpoint_classification() {
        assert_eq!(
            knots_to_insert(&[0., 0.5, 1.], &[0., 0.25, 0.5 + 1e-14, 0.75, 1.]),
            Ok(vec![0.25, 0.75])
        );
        assert!(matches!(
            knots_to_insert(&[0., 0.5, 1.], &[0., 0.25, 0.5, 0.5 + 1e-10, 1.]),
            Err(KnotInsertionError::AmbiguousBreakpoint { .. })
        ));
        assert_eq!(
            knots_to_insert(&[0., 0.4, 1.], &[0., 0.5, 1.]),
            Err(KnotInsertionError::NotNested { value: 0.4 })
        );

        let p2 = SplineSpace1d::uniform(2, 2, false).unwrap();
        let p3 = SplineSpace1d::uniform(3, 4, false).unwrap();
        assert_eq!(
            prolongation(&p2, &p3),
            Err(KnotInsertionError::DegreeMismatch { coarse: 2, fine: 3 })
        );
    }
}
