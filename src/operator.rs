//! Sparse operators on broken coefficient vectors
//! and a small algebra for composing them.
//!
//! Most operators in this crate are explicit sparse matrices ([`MatrixOperator`]).
//! Some, like the iterative inverse of a large mass matrix,
//! can only be applied to a vector;
//! these implement the [`Operator`] trait without materializing a matrix,
//! and can be chained lazily with [`ComposedOperator`].

use nalgebra as na;
use nalgebra_sparse as nas;

use itertools::izip;
use std::sync::Arc;

use crate::linalg::SolverError;

/// Error in applying or combining operators.
#[derive(thiserror::Error, Debug)]
pub enum OperatorError {
    /// An input vector had the wrong length.
    #[error("Operator of shape {shape:?} cannot be applied to a vector of length {len}")]
    InputLength {
        /// Shape of the operator (rows, columns).
        shape: (usize, usize),
        /// Length of the vector.
        len: usize,
    },
    /// Two operators could not be composed or combined.
    #[error("Operators of shapes {left:?} and {right:?} are incompatible")]
    ShapeMismatch {
        /// Shape of the left operand.
        left: (usize, usize),
        /// Shape of the right operand.
        right: (usize, usize),
    },
    /// A block matrix had a block row or column with no blocks to infer its size from.
    #[error("Block {kind} {index} is empty, its size cannot be inferred")]
    EmptyBlock {
        /// "row" or "column".
        kind: &'static str,
        /// Index of the block row or column.
        index: usize,
    },
    /// Blocks in the same block row or column had different sizes.
    #[error("Blocks in block {kind} {index} have sizes {expected} and {found}")]
    BlockSize {
        /// "row" or "column".
        kind: &'static str,
        /// Index of the block row or column.
        index: usize,
        /// Size of the first block.
        expected: usize,
        /// Size of the offending block.
        found: usize,
    },
    /// An implicit operator failed to solve a linear system.
    #[error(transparent)]
    Solver(#[from] SolverError),
}

//
// traits
//

/// A linear map between two coefficient spaces.
pub trait Operator: Send + Sync {
    /// Shape of the operator as (rows, columns),
    /// i.e. (output dimension, input dimension).
    fn shape(&self) -> (usize, usize);
    /// Apply the operator to a vector.
    fn apply(&self, input: &na::DVector<f64>) -> Result<na::DVector<f64>, OperatorError>;
    /// The operator as an explicit sparse matrix, if one is available.
    fn to_csr(&self) -> Option<nas::CsrMatrix<f64>> {
        None
    }
}

#[inline]
fn check_input(shape: (usize, usize), input: &na::DVector<f64>) -> Result<(), OperatorError> {
    if input.len() != shape.1 {
        return Err(OperatorError::InputLength {
            shape,
            len: input.len(),
        });
    }
    Ok(())
}

//
// concrete operators
//

/// A diagonal matrix operator.
#[derive(Clone, Debug, PartialEq)]
pub struct DiagonalOperator {
    // a diagonal vector is a more efficient form of storage than a CSR matrix.
    // this is converted to a matrix upon composition with other operators
    diagonal: na::DVector<f64>,
}

impl DiagonalOperator {
    /// The diagonal values.
    #[inline]
    pub fn diagonal(&self) -> &na::DVector<f64> {
        &self.diagonal
    }

    /// Convert into a CSR matrix.
    pub fn into_csr(self) -> nas::CsrMatrix<f64> {
        // nalgebra doesn't have a method to construct CSR directly from a diagonal.
        // construct an identity matrix to get the right sparsity pattern
        // and then replace the entries
        let mut csr = nas::CsrMatrix::identity(self.diagonal.len());
        for (&diag, mat_diag) in self.diagonal.iter().zip(csr.values_mut()) {
            *mat_diag = diag;
        }
        csr
    }

}

impl From<na::DVector<f64>> for DiagonalOperator {
    fn from(diagonal: na::DVector<f64>) -> Self {
        Self { diagonal }
    }
}

impl Operator for DiagonalOperator {
    fn shape(&self) -> (usize, usize) {
        (self.diagonal.len(), self.diagonal.len())
    }

    fn apply(&self, input: &na::DVector<f64>) -> Result<na::DVector<f64>, OperatorError> {
        check_input(self.shape(), input)?;
        Ok(na::DVector::from_iterator(
            input.len(),
            izip!(self.diagonal.iter(), input.iter()).map(|(&diag_val, &in_val)| diag_val * in_val),
        ))
    }

    fn to_csr(&self) -> Option<nas::CsrMatrix<f64>> {
        Some(self.clone().into_csr())
    }
}

/// A general sparse matrix operator.
///
/// Composition can be done using multiplication syntax:
/// `&a * &b` is the operator applying `b` first and then `a`.
/// Like sparse matrix products in `nalgebra_sparse`,
/// this panics if the shapes are incompatible;
/// use [`compose`] for a checked version.
#[derive(Clone, Debug, PartialEq)]
pub struct MatrixOperator {
    mat: nas::CsrMatrix<f64>,
}

impl MatrixOperator {
    /// The underlying matrix.
    #[inline]
    pub fn csr(&self) -> &nas::CsrMatrix<f64> {
        &self.mat
    }

    /// Convert into the underlying matrix.
    #[inline]
    pub fn into_csr(self) -> nas::CsrMatrix<f64> {
        self.mat
    }

    /// Number of rows.
    #[inline]
    pub fn nrows(&self) -> usize {
        self.mat.nrows()
    }

    /// Number of columns.
    #[inline]
    pub fn ncols(&self) -> usize {
        self.mat.ncols()
    }

    /// Apply to a vector without checking its length first.
    /// Panics on a length mismatch.
    #[inline]
    pub fn mul_vec(&self, input: &na::DVector<f64>) -> na::DVector<f64> {
        &self.mat * input
    }

}

impl Operator for MatrixOperator {
    fn shape(&self) -> (usize, usize) {
        (self.mat.nrows(), self.mat.ncols())
    }

    fn apply(&self, input: &na::DVector<f64>) -> Result<na::DVector<f64>, OperatorError> {
        check_input(self.shape(), input)?;
        Ok(&self.mat * input)
    }

    fn to_csr(&self) -> Option<nas::CsrMatrix<f64>> {
        Some(self.mat.clone())
    }
}

impl From<nas::CsrMatrix<f64>> for MatrixOperator {
    fn from(mat: nas::CsrMatrix<f64>) -> Self {
        Self { mat }
    }
}

impl From<DiagonalOperator> for MatrixOperator {
    fn from(s: DiagonalOperator) -> Self {
        Self { mat: s.into_csr() }
    }
}

/// A lazy product of operators, applied right to left.
///
/// Used when one of the factors has no explicit matrix.
#[derive(Clone)]
pub struct ComposedOperator {
    // in application order, i.e. the rightmost factor first
    factors: Vec<Arc<dyn Operator>>,
}

impl ComposedOperator {
    /// Chain operators given in mathematical order:
    /// `[a, b, c]` is `a ∘ b ∘ c`, which applies `c` first.
    pub fn new(factors: Vec<Arc<dyn Operator>>) -> Result<Self, OperatorError> {
        for pair in factors.windows(2) {
            let (left, right) = (pair[0].shape(), pair[1].shape());
            if left.1 != right.0 {
                return Err(OperatorError::ShapeMismatch { left, right });
            }
        }
        let mut factors = factors;
        factors.reverse();
        Ok(Self { factors })
    }
}

impl std::fmt::Debug for ComposedOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComposedOperator")
            .field("shape", &self.shape())
            .field("factors", &self.factors.len())
            .finish()
    }
}

impl Operator for ComposedOperator {
    fn shape(&self) -> (usize, usize) {
        match (self.factors.last(), self.factors.first()) {
            (Some(outer), Some(inner)) => (outer.shape().0, inner.shape().1),
            _ => (0, 0),
        }
    }

    fn apply(&self, input: &na::DVector<f64>) -> Result<na::DVector<f64>, OperatorError> {
        check_input(self.shape(), input)?;
        let mut value = input.clone();
        for factor in &self.factors {
            value = factor.apply(&value)?;
        }
        Ok(value)
    }

    fn to_csr(&self) -> Option<nas::CsrMatrix<f64>> {
        let mut factors = self.factors.iter();
        let mut mat = factors.next()?.to_csr()?;
        for factor in factors {
            mat = factor.to_csr()? * mat;
        }
        Some(mat)
    }
}

//
// algebra
//

/// Compose two operators such that `r` is applied before `l`.
///
/// Equivalent to `&l * &r` except that shapes are checked.
pub fn compose(l: &MatrixOperator, r: &MatrixOperator) -> Result<MatrixOperator, OperatorError> {
    if l.ncols() != r.nrows() {
        return Err(OperatorError::ShapeMismatch {
            left: l.shape(),
            right: r.shape(),
        });
    }
    Ok((&l.mat * &r.mat).into())
}

/// The transpose of an operator.
pub fn transpose(op: &MatrixOperator) -> MatrixOperator {
    op.mat.transpose().into()
}

/// The identity operator on an `n`-dimensional space.
pub fn identity(n: usize) -> MatrixOperator {
    nas::CsrMatrix::identity(n).into()
}

/// The all-zero operator of the given shape.
pub fn zeros(nrows: usize, ncols: usize) -> MatrixOperator {
    nas::CsrMatrix::zeros(nrows, ncols).into()
}

/// The Kronecker product of two operators,
/// with the index of `a` varying slowest.
pub fn kron(a: &MatrixOperator, b: &MatrixOperator) -> MatrixOperator {
    let (bn, bm) = (b.nrows(), b.ncols());
    let mut coo = nas::CooMatrix::new(a.nrows() * bn, a.ncols() * bm);
    for (ai, aj, &av) in a.mat.triplet_iter() {
        for (bi, bj, &bv) in b.mat.triplet_iter() {
            coo.push(ai * bn + bi, aj * bm + bj, av * bv);
        }
    }
    nas::CsrMatrix::from(&coo).into()
}

/// A block-diagonal operator.
pub fn block_diag(blocks: &[MatrixOperator]) -> MatrixOperator {
    let nrows = blocks.iter().map(|b| b.nrows()).sum();
    let ncols = blocks.iter().map(|b| b.ncols()).sum();
    let mut coo = nas::CooMatrix::new(nrows, ncols);
    let (mut row_offset, mut col_offset) = (0, 0);
    for block in blocks {
        for (i, j, &v) in block.mat.triplet_iter() {
            coo.push(row_offset + i, col_offset + j, v);
        }
        row_offset += block.nrows();
        col_offset += block.ncols();
    }
    nas::CsrMatrix::from(&coo).into()
}

/// A general block operator.
///
/// `blocks[i][j]` is the block in block row `i` and block column `j`,
/// `None` standing for a zero block.
/// Every block row and column must contain at least one block
/// so that its size can be inferred,
/// and all blocks in a block row (column) must have equal row (column) counts.
pub fn block(blocks: &[Vec<Option<&MatrixOperator>>]) -> Result<MatrixOperator, OperatorError> {
    let block_rows = blocks.len();
    let block_cols = blocks.iter().map(|r| r.len()).max().unwrap_or(0);

    let mut row_sizes = vec![None; block_rows];
    let mut col_sizes = vec![None; block_cols];
    for (i, row) in blocks.iter().enumerate() {
        for (j, b) in row.iter().enumerate() {
            let Some(b) = b else { continue };
            let checks = [
                (&mut row_sizes[i], b.nrows(), "row", i),
                (&mut col_sizes[j], b.ncols(), "column", j),
            ];
            for (size, found, kind, index) in checks {
                match *size {
                    Some(expected) if expected != found => {
                        return Err(OperatorError::BlockSize {
                            kind,
                            index,
                            expected,
                            found,
                        })
                    }
                    _ => *size = Some(found),
                }
            }
        }
    }
    let offsets = |sizes: &[Option<usize>], kind: &'static str| {
        let mut offsets = Vec::with_capacity(sizes.len() + 1);
        offsets.push(0);
        for (index, s) in sizes.iter().enumerate() {
            let s = s.ok_or(OperatorError::EmptyBlock { kind, index })?;
            offsets.push(offsets[index] + s);
        }
        Ok::<_, OperatorError>(offsets)
    };
    let row_offsets = offsets(&row_sizes, "row")?;
    let col_offsets = offsets(&col_sizes, "column")?;

    let mut coo = nas::CooMatrix::new(row_offsets[block_rows], col_offsets[block_cols]);
    for (i, row) in blocks.iter().enumerate() {
        for (j, b) in row.iter().enumerate() {
            let Some(b) = b else { continue };
            for (bi, bj, &v) in b.mat.triplet_iter() {
                coo.push(row_offsets[i] + bi, col_offsets[j] + bj, v);
            }
        }
    }
    Ok(nas::CsrMatrix::from(&coo).into())
}

//
// std trait implementations
//

// composition

impl std::ops::Mul<&MatrixOperator> for &MatrixOperator {
    type Output = MatrixOperator;

    fn mul(self, rhs: &MatrixOperator) -> Self::Output {
        (&self.mat * &rhs.mat).into()
    }
}

impl std::ops::Mul<MatrixOperator> for MatrixOperator {
    type Output = MatrixOperator;

    fn mul(self, rhs: MatrixOperator) -> Self::Output {
        &self * &rhs
    }
}

// scalar multiplication

impl std::ops::Mul<MatrixOperator> for f64 {
    type Output = MatrixOperator;

    fn mul(self, mut rhs: MatrixOperator) -> Self::Output {
        rhs.mat *= self;
        rhs
    }
}

impl std::ops::Mul<DiagonalOperator> for f64 {
    type Output = DiagonalOperator;

    fn mul(self, mut rhs: DiagonalOperator) -> Self::Output {
        rhs.diagonal *= self;
        rhs
    }
}

// sums, used for e.g. `I - P` and penalized stiffness matrices

impl std::ops::Add<&MatrixOperator> for &MatrixOperator {
    type Output = MatrixOperator;

    fn add(self, rhs: &MatrixOperator) -> Self::Output {
        (&self.mat + &rhs.mat).into()
    }
}

impl std::ops::Sub<&MatrixOperator> for &MatrixOperator {
    type Output = MatrixOperator;

    fn sub(self, rhs: &MatrixOperator) -> Self::Output {
        (&self.mat - &rhs.mat).into()
    }
}

// vectors

impl std::ops::Mul<&na::DVector<f64>> for &MatrixOperator {
    type Output = na::DVector<f64>;

    fn mul(self, rhs: &na::DVector<f64>) -> Self::Output {
        self.mul_vec(rhs)
    }
}

//
// tests
//

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(op: &MatrixOperator) -> na::DMatrix<f64> {
        nas::convert::serial::convert_csr_dense(op.csr())
    }

    fn from_dense(m: na::DMatrix<f64>) -> MatrixOperator {
        nas::convert::serial::convert_dense_csr(&m).into()
    }

    #[test]
    fn kron_matches_dense_definition() {
        let a = from_dense(na::DMatrix::from_row_slice(2, 2, &[1., 2., 0., 3.]));
        let b = from_dense(na::DMatrix::from_row_slice(2, 3, &[0., 1., 0., -1., 0., 4.]));
        let k = dense(&kron(&a, &b));
        assert_eq!(k.shape(), (4, 6));
        let da = dense(&a);
        let db = dense(&b);
        for i in 0..4 {
            for j in 0..6 {
                assert_eq!(k[(i, j)], da[(i / 2, j / 3)] * db[(i % 2, j % 3)]);
            }
        }
    }

    #[test]
    fn block_and_block_diag_agree() {
        let a = from_dense(na::DMatrix::from_row_slice(2, 2, &[1., 2., 3., 4.]));
        let b = from_dense(na::DMatrix::from_row_slice(1, 3, &[5., 0., 6.]));
        let diag = block_diag(&[a.clone(), b.clone()]);
        let general = block(&[vec![Some(&a), None], vec![None, Some(&b)]]).unwrap();
        assert_eq!(dense(&diag), dense(&general));
        assert_eq!(diag.shape(), (3, 5));

        let empty = block(&[vec![Some(&a), None], vec![None, None]]);
        assert!(matches!(
            empty,
            Err(OperatorError::EmptyBlock { kind: "row", index: 1 })
        ));
    }

    #[test]
    fn lazy_composition_matches_explicit() {
        let a = from_dense(na::DMatrix::from_row_slice(2, 3, &[1., 0., 2., 0., 3., 1.]));
        let b = from_dense(na::DMatrix::from_row_slice(3, 2, &[1., 1., 0., 2., 4., 0.]));
        let explicit = compose(&a, &b).unwrap();
        let lazy = ComposedOperator::new(vec![Arc::new(a.clone()), Arc::new(b.clone())]).unwrap();
        assert_eq!(lazy.shape(), (2, 2));
        let x = na::DVector::from_vec(vec![0.5, -2.]);
        assert_eq!(lazy.apply(&x).unwrap(), explicit.apply(&x).unwrap());
        assert_eq!(lazy.to_csr().map(MatrixOperator::from), Some(explicit));

        assert!(compose(&a, &a).is_err());
        assert!(ComposedOperator::new(vec![Arc::new(a.clone()), Arc::new(a.clone())]).is_err());
        assert!(matches!(
            a.apply(&x),
            Err(OperatorError::InputLength { len: 2, .. })
        ));
    }
}
