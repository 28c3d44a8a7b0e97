//! One-dimensional spline spaces, the building blocks of patch spaces.
//!
//! A [`SplineSpace1d`] is defined by a degree, a set of breakpoints
//! and a periodicity flag.
//! Non-periodic spaces use an open (clamped) knot vector,
//! so the first and last basis functions interpolate the end points.
//!
//! Two normalizations of the basis are supported (see [`BasisKind`]).
//! B-splines form a partition of unity and are used in directions
//! where a form is continuous.
//! M-splines span the derivatives of B-splines of one degree higher
//! and are scaled to unit integral, which makes the derivative
//! between the two a pure difference operator
//! (see [`SplineSpace1d::derivative_matrix`]).

use nalgebra as na;
use nalgebra_sparse as nas;
use serde::{Deserialize, Serialize};

/// Error in constructing a spline space.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SplineError {
    /// Fewer than two breakpoints were given.
    #[error("A spline space needs at least two breakpoints, got {0}")]
    TooFewBreakpoints(usize),
    /// Breakpoints were not strictly increasing.
    #[error("Breakpoints must be strictly increasing (breakpoint {index} = {value})")]
    UnsortedBreakpoints {
        /// Index of the first offending breakpoint.
        index: usize,
        /// Its value.
        value: f64,
    },
    /// Degree zero B-spline spaces have no derivative space.
    #[error("B-spline spaces must have degree at least 1")]
    DegreeTooLow,
    /// A periodic space needs more cells than its degree.
    #[error("Periodic space of degree {degree} needs more than {degree} cells, got {ncells}")]
    TooFewPeriodicCells {
        /// Degree of the space.
        degree: usize,
        /// Number of cells.
        ncells: usize,
    },
}

/// Normalization of the basis functions in a [`SplineSpace1d`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BasisKind {
    /// Ordinary B-splines, a partition of unity.
    B,
    /// B-splines scaled to unit integral.
    M,
}

/// A univariate spline space on a set of breakpoints.
#[derive(Clone, Debug, PartialEq)]
pub struct SplineSpace1d {
    degree: usize,
    breaks: Vec<f64>,
    periodic: bool,
    kind: BasisKind,
    /// extended knot vector of length `ncells + 2 * degree + 1`.
    /// knot `degree + c` is breakpoint `c` for both clamped and periodic spaces;
    /// only the ghost knots at either end differ
    knots: Vec<f64>,
}

impl SplineSpace1d {
    /// Construct a B-spline space of the given degree on the given breakpoints.
    pub fn new(degree: usize, breaks: Vec<f64>, periodic: bool) -> Result<Self, SplineError> {
        if breaks.len() < 2 {
            return Err(SplineError::TooFewBreakpoints(breaks.len()));
        }
        if let Some(index) = (1..breaks.len()).find(|&i| breaks[i] <= breaks[i - 1]) {
            return Err(SplineError::UnsortedBreakpoints {
                index,
                value: breaks[index],
            });
        }
        if degree == 0 {
            return Err(SplineError::DegreeTooLow);
        }
        let ncells = breaks.len() - 1;
        if periodic && ncells <= degree {
            return Err(SplineError::TooFewPeriodicCells { degree, ncells });
        }

        let knots = if periodic {
            periodic_knots(degree, &breaks)
        } else {
            clamped_knots(degree, &breaks)
        };

        Ok(Self {
            degree,
            breaks,
            periodic,
            kind: BasisKind::B,
            knots,
        })
    }

    /// Construct a B-spline space with `ncells` uniform cells on [0, 1].
    pub fn uniform(degree: usize, ncells: usize, periodic: bool) -> Result<Self, SplineError> {
        let ncells = ncells.max(1);
        let breaks = (0..=ncells).map(|i| i as f64 / ncells as f64).collect();
        Self::new(degree, breaks, periodic)
    }

    /// The derivative space of this B-spline space:
    /// M-splines of one degree lower on the same breakpoints.
    ///
    /// Calling this on an M-spline space returns a copy of the space.
    pub fn reduced(&self) -> Self {
        if self.kind == BasisKind::M {
            return self.clone();
        }
        Self {
            degree: self.degree - 1,
            breaks: self.breaks.clone(),
            periodic: self.periodic,
            kind: BasisKind::M,
            knots: self.knots[1..self.knots.len() - 1].to_vec(),
        }
    }

    /// Polynomial degree of the basis functions.
    #[inline]
    pub fn degree(&self) -> usize {
        self.degree
    }

    /// Breakpoints (cell boundaries without repetition).
    #[inline]
    pub fn breaks(&self) -> &[f64] {
        &self.breaks
    }

    /// Number of cells.
    #[inline]
    pub fn ncells(&self) -> usize {
        self.breaks.len() - 1
    }

    /// Whether the space is periodic.
    #[inline]
    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    /// Normalization of the basis.
    #[inline]
    pub fn kind(&self) -> BasisKind {
        self.kind
    }

    /// The extended knot vector.
    #[inline]
    pub fn knots(&self) -> &[f64] {
        &self.knots
    }

    /// Number of basis functions.
    #[inline]
    pub fn nbasis(&self) -> usize {
        if self.periodic {
            self.ncells()
        } else {
            self.ncells() + self.degree
        }
    }

    /// Start and end of the parametric interval.
    #[inline]
    pub fn interval(&self) -> (f64, f64) {
        (self.breaks[0], self.breaks[self.breaks.len() - 1])
    }

    /// Map an extended basis index (as returned by [`basis_values`][Self::basis_values])
    /// to a coefficient index.
    #[inline]
    pub fn global_index(&self, ext_index: usize) -> usize {
        if self.periodic {
            ext_index % self.ncells()
        } else {
            ext_index
        }
    }

    /// Find the cell containing the point `x`.
    ///
    /// Points outside the interval are clamped into the first or last cell,
    /// except for periodic spaces where they are wrapped around.
    pub fn find_cell(&self, x: f64) -> usize {
        let x = self.wrap(x);
        let cell = self.breaks.partition_point(|&b| b <= x);
        cell.saturating_sub(1).min(self.ncells() - 1)
    }

    fn wrap(&self, x: f64) -> f64 {
        if !self.periodic {
            return x;
        }
        let (start, end) = self.interval();
        let len = end - start;
        start + (x - start).rem_euclid(len)
    }

    /// Evaluate the `degree + 1` basis functions that are nonzero in `cell` at the point `x`.
    ///
    /// Returns the extended index of the first nonzero function.
    /// The values correspond to extended indices `first..=first + degree`;
    /// use [`global_index`][Self::global_index] to get coefficient indices.
    pub fn basis_values(&self, cell: usize, x: f64) -> (usize, Vec<f64>) {
        let x = self.wrap(x);
        let p = self.degree;
        let span = p + cell;
        let t = &self.knots;

        let mut values = vec![0.0; p + 1];
        let mut left = vec![0.0; p + 1];
        let mut right = vec![0.0; p + 1];
        values[0] = 1.0;
        for j in 1..=p {
            left[j] = x - t[span + 1 - j];
            right[j] = t[span + j] - x;
            let mut saved = 0.0;
            for r in 0..j {
                let temp = values[r] / (right[r + 1] + left[j - r]);
                values[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            values[j] = saved;
        }

        if self.kind == BasisKind::M {
            for (r, val) in values.iter_mut().enumerate() {
                *val *= self.scaling(cell + r);
            }
        }

        (cell, values)
    }

    /// Scaling factor turning the B-spline with extended index `ext_index`
    /// into the corresponding M-spline.
    #[inline]
    pub(crate) fn scaling(&self, ext_index: usize) -> f64 {
        let p = self.degree;
        (p + 1) as f64 / (self.knots[ext_index + p + 1] - self.knots[ext_index])
    }

    /// Scaling factors of all basis functions (coefficient-indexed).
    /// These are all 1 for a B-spline space.
    pub fn scalings(&self) -> na::DVector<f64> {
        match self.kind {
            BasisKind::B => na::DVector::from_element(self.nbasis(), 1.0),
            BasisKind::M => na::DVector::from_iterator(
                self.nbasis(),
                (0..self.nbasis()).map(|i| self.scaling(i)),
            ),
        }
    }

    /// Evaluate the spline with the given coefficients at the point `x`.
    pub fn eval(&self, coeffs: &[f64], x: f64) -> f64 {
        debug_assert_eq!(coeffs.len(), self.nbasis());
        let cell = self.find_cell(x);
        let (first, values) = self.basis_values(cell, x);
        values
            .iter()
            .enumerate()
            .map(|(r, v)| v * coeffs[self.global_index(first + r)])
            .sum()
    }

    /// The matrix of the derivative from this B-spline space to its [`reduced`][Self::reduced] space.
    ///
    /// Because the reduced space uses M-splines,
    /// this is the incidence matrix with entries -1 and 1.
    pub fn derivative_matrix(&self) -> nas::CsrMatrix<f64> {
        let n_in = self.nbasis();
        let n_out = self.reduced().nbasis();
        let mut coo = nas::CooMatrix::new(n_out, n_in);
        for row in 0..n_out {
            coo.push(row, row, -1.0);
            coo.push(row, (row + 1) % n_in, 1.0);
        }
        nas::CsrMatrix::from(&coo)
    }

    /// Coefficient index of the basis function that is nonzero
    /// at the start or end of the interval, if the space is clamped.
    pub fn end_index(&self, at_end: bool) -> Option<usize> {
        if self.periodic || self.kind != BasisKind::B {
            return None;
        }
        Some(if at_end { self.nbasis() - 1 } else { 0 })
    }
}

fn clamped_knots(degree: usize, breaks: &[f64]) -> Vec<f64> {
    let first = breaks[0];
    let last = breaks[breaks.len() - 1];
    std::iter::repeat(first)
        .take(degree)
        .chain(breaks.iter().cloned())
        .chain(std::iter::repeat(last).take(degree))
        .collect()
}

fn periodic_knots(degree: usize, breaks: &[f64]) -> Vec<f64> {
    let n = breaks.len() - 1;
    let period = breaks[n] - breaks[0];
    (1..=degree)
        .rev()
        .map(|m| breaks[n - m] - period)
        .chain(breaks.iter().cloned())
        .chain((1..=degree).map(|m| breaks[m] + period))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn clamped_space_is_partition_of_unity() {
        let space = SplineSpace1d::uniform(3, 5, false).unwrap();
        assert_eq!(space.nbasis(), 8);
        assert_eq!(space.knots().len(), 5 + 2 * 3 + 1);
        let ones = vec![1.0; space.nbasis()];
        for i in 0..=40 {
            let x = i as f64 / 40.;
            assert_relative_eq!(space.eval(&ones, x), 1.0, epsilon = 1e-14);
        }
        // endpoint interpolation
        let mut first = vec![0.0; space.nbasis()];
        first[0] = 1.0;
        assert_relative_eq!(space.eval(&first, 0.0), 1.0);
        assert_relative_eq!(space.eval(&first, 1.0), 0.0);
    }

    #[test]
    fn periodic_space_is_partition_of_unity() {
        let space = SplineSpace1d::uniform(2, 6, true).unwrap();
        assert_eq!(space.nbasis(), 6);
        let ones = vec![1.0; 6];
        for i in 0..=30 {
            let x = i as f64 / 30.;
            assert_relative_eq!(space.eval(&ones, x), 1.0, epsilon = 1e-14);
        }
        // values wrap around the period
        let coeffs: Vec<f64> = (0..6).map(|i| (i * i) as f64).collect();
        assert_relative_eq!(
            space.eval(&coeffs, 0.1),
            space.eval(&coeffs, 1.1),
            epsilon = 1e-13
        );
    }

    #[test]
    fn m_splines_have_unit_integral() {
        let space = SplineSpace1d::new(3, vec![0., 0.1, 0.35, 0.5, 0.8, 1.0], false)
            .unwrap()
            .reduced();
        assert_eq!(space.kind(), BasisKind::M);
        assert_eq!(space.degree(), 2);
        // midpoint rule on a fine grid is accurate enough here
        let samples = 20000;
        for i in 0..space.nbasis() {
            let mut coeffs = vec![0.0; space.nbasis()];
            coeffs[i] = 1.0;
            let integral: f64 = (0..samples)
                .map(|s| space.eval(&coeffs, (s as f64 + 0.5) / samples as f64))
                .sum::<f64>()
                / samples as f64;
            assert_relative_eq!(integral, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn derivative_matrix_differentiates_exactly() {
        let space = SplineSpace1d::new(3, vec![0., 0.2, 0.3, 0.7, 1.0], false).unwrap();
        let reduced = space.reduced();
        let d = space.derivative_matrix();
        assert_eq!(d.nrows(), reduced.nbasis());
        assert_eq!(d.ncols(), space.nbasis());

        let coeffs = na::DVector::from_fn(space.nbasis(), |i, _| (i as f64 * 0.7).sin());
        let d_coeffs = &d * &coeffs;
        // compare against a central difference of the spline
        let h = 1e-6;
        for i in 1..20 {
            let x = i as f64 / 20. + 0.013;
            let fd = (space.eval(coeffs.as_slice(), x + h) - space.eval(coeffs.as_slice(), x - h))
                / (2. * h);
            assert_relative_eq!(
                reduced.eval(d_coeffs.as_slice(), x),
                fd,
                epsilon = 1e-6,
                max_relative = 1e-6
            );
        }
    }

    #[test]
    fn invalid_spaces_are_rejected() {
        assert_eq!(
            SplineSpace1d::new(2, vec![0.0], false),
            Err(SplineError::TooFewBreakpoints(1))
        );
        assert!(matches!(
            SplineSpace1d::new(2, vec![0.0, 0.5, 0.5, 1.0], false),
            Err(SplineError::UnsortedBreakpoints { index: 2, .. })
        ));
        assert_eq!(
            SplineSpace1d::uniform(3, 3, true),
            Err(SplineError::TooFewPeriodicCells {
                degree: 3,
                ncells: 3
            })
        );
        assert_eq!(
            SplineSpace1d::uniform(0, 3, false),
            Err(SplineError::DegreeTooLow)
        );
    }
}
