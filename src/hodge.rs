//! Discrete Hodge operators: a mass matrix together with its inverse,
//! which maps primal coefficients to their dual representation and back.

use nalgebra as na;
use nalgebra_sparse as nas;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{ops::Range, sync::Arc};

use crate::{
    linalg::{self, IterativeParams, Jacobi},
    operator::{self, MatrixOperator, Operator, OperatorError},
    space::BrokenSpace,
};

/// Parameters controlling how the dual (inverse mass) operator is computed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HodgeParams {
    /// Largest patch block that is inverted with a dense factorization.
    /// If any patch block is larger, the dual is applied iteratively instead.
    pub direct_max_block: usize,
    /// Tolerance and iteration cap of the iterative dual.
    pub dual: IterativeParams,
}

impl Default for HodgeParams {
    fn default() -> Self {
        Self {
            direct_max_block: 2000,
            dual: IterativeParams::default(),
        }
    }
}

impl HodgeParams {
    /// Whether every patch block of the space is small enough to invert directly.
    pub fn uses_exact_dual(&self, space: &BrokenSpace) -> bool {
        (0..space.patch_count()).all(|p| space.patch_range(p).len() <= self.direct_max_block)
    }
}

/// Failure to set up a Hodge operator.
#[derive(thiserror::Error, Debug)]
pub enum HodgeError {
    /// The mass block of a patch could not be factorized.
    #[error("Mass matrix block of patch {patch} (size {size}) is not positive definite to working precision")]
    NearSingular {
        /// Index of the patch.
        patch: usize,
        /// Size of the block.
        size: usize,
    },
    /// The mass matrix does not match the space.
    #[error("Mass matrix has shape {shape:?} but the space has dimension {dim}")]
    Shape {
        /// Shape of the mass matrix.
        shape: (usize, usize),
        /// Dimension of the space.
        dim: usize,
    },
    /// A dual matrix loaded from elsewhere does not match the mass matrix.
    #[error("Dual matrix has shape {dual:?} but the mass matrix has shape {mass:?}")]
    DualShape {
        /// Shape of the mass matrix.
        mass: (usize, usize),
        /// Shape of the dual matrix.
        dual: (usize, usize),
    },
}

/// How accurately the dual operator inverts the mass matrix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DualAccuracy {
    /// The dual is the inverse up to rounding.
    Exact,
    /// The dual is computed by an iterative solve
    /// with the given relative residual tolerance.
    Iterative {
        /// Relative residual tolerance of each application.
        tol: f64,
    },
}

/// A mass matrix paired with its (exact or iterative) inverse.
#[derive(Clone)]
pub struct HodgeOperator {
    mass: MatrixOperator,
    dual: Dual,
}

#[derive(Clone)]
enum Dual {
    Exact(Arc<MatrixOperator>),
    Iterative(Arc<IterativeInverse>),
}

impl std::fmt::Debug for HodgeOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HodgeOperator")
            .field("shape", &self.mass.shape())
            .field("accuracy", &self.accuracy())
            .finish()
    }
}

impl HodgeOperator {
    /// Build the Hodge operator of a patch-block-diagonal mass matrix.
    ///
    /// Each patch block is inverted separately with a dense Cholesky factorization
    /// unless some block is larger than `params.direct_max_block`,
    /// in which case the dual is applied with preconditioned CG.
    pub fn new(
        mass: MatrixOperator,
        space: &BrokenSpace,
        params: &HodgeParams,
    ) -> Result<Self, HodgeError> {
        if mass.shape() != (space.dim(), space.dim()) {
            return Err(HodgeError::Shape {
                shape: mass.shape(),
                dim: space.dim(),
            });
        }
        if !params.uses_exact_dual(space) {
            log::info!(
                "Mass blocks exceed the direct limit {}, using an iterative dual (tol {:e})",
                params.direct_max_block,
                params.dual.tol
            );
            let dual = IterativeInverse::new(mass.csr().clone(), params.dual);
            return Ok(Self {
                mass,
                dual: Dual::Iterative(Arc::new(dual)),
            });
        }
        let dual = exact_dual(&mass, space)?;
        Ok(Self {
            mass,
            dual: Dual::Exact(Arc::new(dual)),
        })
    }

    /// Pair a mass matrix with an explicitly known inverse,
    /// e.g. one loaded from an [`OperatorCache`][crate::cache::OperatorCache].
    pub fn with_exact_dual(mass: MatrixOperator, dual: MatrixOperator) -> Result<Self, HodgeError> {
        if dual.shape() != mass.shape() {
            return Err(HodgeError::DualShape {
                mass: mass.shape(),
                dual: dual.shape(),
            });
        }
        Ok(Self {
            mass,
            dual: Dual::Exact(Arc::new(dual)),
        })
    }

    /// The mass matrix.
    #[inline]
    pub fn to_matrix(&self) -> &MatrixOperator {
        &self.mass
    }

    /// The inverse mass matrix, if it was computed explicitly.
    pub fn dual_matrix(&self) -> Option<&MatrixOperator> {
        match &self.dual {
            Dual::Exact(mat) => Some(mat.as_ref()),
            Dual::Iterative(_) => None,
        }
    }

    /// The inverse mass matrix as an operator,
    /// explicit or not.
    pub fn dual(&self) -> Arc<dyn Operator> {
        match &self.dual {
            Dual::Exact(mat) => mat.clone() as Arc<dyn Operator>,
            Dual::Iterative(inv) => inv.clone() as Arc<dyn Operator>,
        }
    }

    /// How accurately the dual inverts the mass matrix.
    pub fn accuracy(&self) -> DualAccuracy {
        match &self.dual {
            Dual::Exact(_) => DualAccuracy::Exact,
            Dual::Iterative(inv) => DualAccuracy::Iterative {
                tol: inv.params.tol,
            },
        }
    }

    /// Apply the dual operator to a vector.
    pub fn apply_dual(&self, input: &na::DVector<f64>) -> Result<na::DVector<f64>, OperatorError> {
        match &self.dual {
            Dual::Exact(mat) => mat.apply(input),
            Dual::Iterative(inv) => inv.apply(input),
        }
    }
}

/// The inverse of a patch-block-diagonal mass matrix,
/// computed with a dense Cholesky factorization of each patch block in parallel.
pub fn exact_dual(mass: &MatrixOperator, space: &BrokenSpace) -> Result<MatrixOperator, HodgeError> {
    if mass.shape() != (space.dim(), space.dim()) {
        return Err(HodgeError::Shape {
            shape: mass.shape(),
            dim: space.dim(),
        });
    }
    let blocks: Vec<MatrixOperator> = (0..space.patch_count())
        .into_par_iter()
        .map(|patch| {
            let range = space.patch_range(patch);
            let dense = dense_block(mass.csr(), range.clone());
            let inv = dense
                .cholesky()
                .ok_or(HodgeError::NearSingular {
                    patch,
                    size: range.len(),
                })?
                .inverse();
            Ok(MatrixOperator::from(nas::CsrMatrix::from(&inv)))
        })
        .collect::<Result<_, HodgeError>>()?;
    log::debug!("Inverted {} mass blocks of total size {}", blocks.len(), space.dim());
    Ok(operator::block_diag(&blocks))
}

/// Dense copy of a diagonal block of a sparse matrix.
fn dense_block(mat: &nas::CsrMatrix<f64>, range: Range<usize>) -> na::DMatrix<f64> {
    let mut dense = na::DMatrix::zeros(range.len(), range.len());
    for (i, row) in range.clone().enumerate() {
        let row_view = mat.row(row);
        for (&col, &val) in row_view.col_indices().iter().zip(row_view.values()) {
            if range.contains(&col) {
                dense[(i, col - range.start)] = val;
            }
        }
    }
    dense
}

/// The action of the inverse of a symmetric positive definite matrix,
/// computed with Jacobi-preconditioned conjugate gradients on every application.
#[derive(Clone, Debug)]
pub struct IterativeInverse {
    matrix: nas::CsrMatrix<f64>,
    precond: Jacobi,
    params: IterativeParams,
}

impl IterativeInverse {
    /// Set up the inverse of `matrix`.
    pub fn new(matrix: nas::CsrMatrix<f64>, params: IterativeParams) -> Self {
        let precond = Jacobi::new(&matrix);
        Self {
            matrix,
            precond,
            params,
        }
    }

    /// Solve parameters in use.
    #[inline]
    pub fn params(&self) -> &IterativeParams {
        &self.params
    }
}

impl Operator for IterativeInverse {
    fn shape(&self) -> (usize, usize) {
        (self.matrix.nrows(), self.matrix.ncols())
    }

    fn apply(&self, input: &na::DVector<f64>) -> Result<na::DVector<f64>, OperatorError> {
        if input.len() != self.matrix.ncols() {
            return Err(OperatorError::InputLength {
                shape: self.shape(),
                len: input.len(),
            });
        }
        let (x, stats) =
            linalg::conjugate_gradient(&self.matrix, input, &self.precond, &self.params)?;
        log::trace!("Iterative dual: {} CG iterations", stats.iterations);
        Ok(x)
    }
}
