//! Linear solvers used behind operator interfaces:
//! dense LU for small systems,
//! and ILU(0)-preconditioned GMRES or Jacobi-preconditioned CG for large ones.
//!
//! Solver strategy is chosen once with [`LinearSolver::new`]
//! and the resulting object is reused for every right-hand side.

use nalgebra as na;
use nalgebra_sparse as nas;
use serde::{Deserialize, Serialize};

/// Failure of a linear solve.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    /// An iterative method hit its iteration cap.
    #[error("{method} did not converge in {iterations} iterations (relative residual {residual:e})")]
    NotConverged {
        /// Name of the method.
        method: &'static str,
        /// Iterations performed.
        iterations: usize,
        /// Last relative residual.
        residual: f64,
    },
    /// Direct factorization found the matrix singular.
    #[error("Matrix of size {size} is singular to working precision")]
    Singular {
        /// Dimension of the matrix.
        size: usize,
    },
    /// Incomplete factorization hit a zero pivot.
    #[error("Incomplete factorization hit a zero pivot in row {row}")]
    ZeroPivot {
        /// The row.
        row: usize,
    },
    /// Only square matrices can be solved with.
    #[error("Expected a square matrix, got {rows}x{cols}")]
    NotSquare {
        /// Number of rows.
        rows: usize,
        /// Number of columns.
        cols: usize,
    },
}

/// Parameters of iterative solvers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterativeParams {
    /// Relative residual tolerance.
    pub tol: f64,
    /// Maximum total number of iterations.
    pub max_iter: usize,
    /// Krylov subspace size before GMRES restarts.
    pub restart: usize,
}

impl Default for IterativeParams {
    fn default() -> Self {
        Self {
            tol: 1e-10,
            max_iter: 2000,
            restart: 60,
        }
    }
}

/// Diagnostic data of a successful iterative solve.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolveStats {
    /// Iterations performed.
    pub iterations: usize,
    /// Final relative residual.
    pub residual: f64,
}

//
// preconditioners
//

/// An approximate inverse used to accelerate Krylov methods.
pub trait Preconditioner: Send + Sync {
    /// Apply the approximate inverse to a vector.
    fn precondition(&self, r: &na::DVector<f64>) -> na::DVector<f64>;
}

/// Diagonal scaling.
#[derive(Clone, Debug)]
pub struct Jacobi {
    inv_diag: na::DVector<f64>,
}

impl Jacobi {
    /// Build from the diagonal of a matrix.
    /// Zero diagonal entries are left unscaled.
    pub fn new(mat: &nas::CsrMatrix<f64>) -> Self {
        let inv_diag = na::DVector::from_iterator(
            mat.nrows(),
            (0..mat.nrows()).map(|i| {
                let d = diagonal_entry(mat, i);
                if d != 0. {
                    1. / d
                } else {
                    1.
                }
            }),
        );
        Self { inv_diag }
    }
}

impl Preconditioner for Jacobi {
    fn precondition(&self, r: &na::DVector<f64>) -> na::DVector<f64> {
        r.component_mul(&self.inv_diag)
    }
}

fn diagonal_entry(mat: &nas::CsrMatrix<f64>, row: usize) -> f64 {
    let row_view = mat.row(row);
    match row_view.col_indices().binary_search(&row) {
        Ok(pos) => row_view.values()[pos],
        Err(_) => 0.,
    }
}

/// Incomplete LU factorization with zero fill-in.
///
/// The factors share the sparsity pattern of the original matrix;
/// L has an implicit unit diagonal.
#[derive(Clone, Debug)]
pub struct Ilu0 {
    n: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<f64>,
    /// position of the diagonal entry of each row in `values`
    diag_pos: Vec<usize>,
}

impl Ilu0 {
    /// Factorize a square sparse matrix.
    pub fn new(mat: &nas::CsrMatrix<f64>) -> Result<Self, SolverError> {
        let n = mat.nrows();
        if mat.ncols() != n {
            return Err(SolverError::NotSquare {
                rows: n,
                cols: mat.ncols(),
            });
        }
        let row_offsets = mat.row_offsets().to_vec();
        let col_indices = mat.col_indices().to_vec();
        let mut values = mat.values().to_vec();

        let mut diag_pos = Vec::with_capacity(n);
        for row in 0..n {
            let range = row_offsets[row]..row_offsets[row + 1];
            let pos = col_indices[range.clone()]
                .binary_search(&row)
                .map_err(|_| SolverError::ZeroPivot { row })?;
            diag_pos.push(range.start + pos);
        }

        // IKJ variant restricted to the existing pattern.
        // `pos_in_row[j]` is the position of column j in the current row, if present
        let mut pos_in_row: Vec<Option<usize>> = vec![None; n];
        for i in 0..n {
            let row_range = row_offsets[i]..row_offsets[i + 1];
            for p in row_range.clone() {
                pos_in_row[col_indices[p]] = Some(p);
            }
            for p in row_range.clone() {
                let k = col_indices[p];
                if k >= i {
                    break;
                }
                let pivot = values[diag_pos[k]];
                if pivot == 0. {
                    return Err(SolverError::ZeroPivot { row: k });
                }
                let factor = values[p] / pivot;
                values[p] = factor;
                for q in diag_pos[k] + 1..row_offsets[k + 1] {
                    if let Some(target) = pos_in_row[col_indices[q]] {
                        values[target] -= factor * values[q];
                    }
                }
            }
            if values[diag_pos[i]] == 0. {
                return Err(SolverError::ZeroPivot { row: i });
            }
            for p in row_range {
                pos_in_row[col_indices[p]] = None;
            }
        }

        Ok(Self {
            n,
            row_offsets,
            col_indices,
            values,
            diag_pos,
        })
    }
}

impl Preconditioner for Ilu0 {
    fn precondition(&self, r: &na::DVector<f64>) -> na::DVector<f64> {
        let mut x = r.clone();
        // forward substitution with unit lower triangle
        for i in 0..self.n {
            let mut sum = x[i];
            for p in self.row_offsets[i]..self.diag_pos[i] {
                sum -= self.values[p] * x[self.col_indices[p]];
            }
            x[i] = sum;
        }
        // backward substitution with upper triangle
        for i in (0..self.n).rev() {
            let mut sum = x[i];
            for p in self.diag_pos[i] + 1..self.row_offsets[i + 1] {
                sum -= self.values[p] * x[self.col_indices[p]];
            }
            x[i] = sum / self.values[self.diag_pos[i]];
        }
        x
    }
}

//
// Krylov methods
//

/// Preconditioned conjugate gradients for symmetric positive definite systems.
pub fn conjugate_gradient(
    mat: &nas::CsrMatrix<f64>,
    rhs: &na::DVector<f64>,
    precond: &dyn Preconditioner,
    params: &IterativeParams,
) -> Result<(na::DVector<f64>, SolveStats), SolverError> {
    let rhs_norm = rhs.norm();
    let mut x = na::DVector::zeros(rhs.len());
    if rhs_norm == 0. {
        return Ok((
            x,
            SolveStats {
                iterations: 0,
                residual: 0.,
            },
        ));
    }

    let mut r = rhs.clone();
    let mut z = precond.precondition(&r);
    let mut p = z.clone();
    let mut rz = r.dot(&z);
    let mut residual = 1.;
    for iter in 1..=params.max_iter {
        let ap = mat * &p;
        let alpha = rz / p.dot(&ap);
        x.axpy(alpha, &p, 1.);
        r.axpy(-alpha, &ap, 1.);
        residual = r.norm() / rhs_norm;
        if residual < params.tol {
            return Ok((
                x,
                SolveStats {
                    iterations: iter,
                    residual,
                },
            ));
        }
        z = precond.precondition(&r);
        let rz_next = r.dot(&z);
        let beta = rz_next / rz;
        rz = rz_next;
        p *= beta;
        p += &z;
    }

    Err(SolverError::NotConverged {
        method: "CG",
        iterations: params.max_iter,
        residual,
    })
}

/// Restarted GMRES with right preconditioning,
/// so that the monitored residual is the true residual.
pub fn gmres(
    mat: &nas::CsrMatrix<f64>,
    rhs: &na::DVector<f64>,
    precond: &dyn Preconditioner,
    params: &IterativeParams,
) -> Result<(na::DVector<f64>, SolveStats), SolverError> {
    let n = rhs.len();
    let rhs_norm = rhs.norm();
    let mut x = na::DVector::zeros(n);
    if rhs_norm == 0. {
        return Ok((
            x,
            SolveStats {
                iterations: 0,
                residual: 0.,
            },
        ));
    }
    let m = params.restart.clamp(1, n.max(1));

    let mut total_iters = 0;
    let mut residual;
    loop {
        let r = rhs - mat * &x;
        let beta = r.norm();
        residual = beta / rhs_norm;
        if residual < params.tol {
            return Ok((
                x,
                SolveStats {
                    iterations: total_iters,
                    residual,
                },
            ));
        }
        if total_iters >= params.max_iter {
            break;
        }

        let mut basis: Vec<na::DVector<f64>> = Vec::with_capacity(m + 1);
        basis.push(r / beta);
        let mut hess = na::DMatrix::<f64>::zeros(m + 1, m);
        let mut cs = vec![0.; m];
        let mut sn = vec![0.; m];
        let mut g = na::DVector::<f64>::zeros(m + 1);
        g[0] = beta;

        let mut k = 0;
        for j in 0..m {
            let mut w = mat * &precond.precondition(&basis[j]);
            // modified Gram-Schmidt
            for (i, v) in basis.iter().enumerate() {
                let h = w.dot(v);
                hess[(i, j)] = h;
                w.axpy(-h, v, 1.);
            }
            let w_norm = w.norm();
            hess[(j + 1, j)] = w_norm;

            // apply previous rotations to the new column
            for i in 0..j {
                let temp = cs[i] * hess[(i, j)] + sn[i] * hess[(i + 1, j)];
                hess[(i + 1, j)] = -sn[i] * hess[(i, j)] + cs[i] * hess[(i + 1, j)];
                hess[(i, j)] = temp;
            }
            // and compute a new one eliminating the subdiagonal
            let denom = hess[(j, j)].hypot(hess[(j + 1, j)]);
            if denom == 0. {
                cs[j] = 1.;
                sn[j] = 0.;
            } else {
                cs[j] = hess[(j, j)] / denom;
                sn[j] = hess[(j + 1, j)] / denom;
            }
            hess[(j, j)] = denom;
            hess[(j + 1, j)] = 0.;
            g[j + 1] = -sn[j] * g[j];
            g[j] *= cs[j];

            total_iters += 1;
            k = j + 1;
            residual = g[j + 1].abs() / rhs_norm;
            let breakdown = w_norm <= f64::EPSILON * beta;
            if residual < params.tol || total_iters >= params.max_iter || breakdown {
                break;
            }
            basis.push(w / w_norm);
        }

        // solve the small triangular system and update the solution
        let mut y = na::DVector::<f64>::zeros(k);
        for i in (0..k).rev() {
            let mut sum = g[i];
            for l in i + 1..k {
                sum -= hess[(i, l)] * y[l];
            }
            y[i] = if hess[(i, i)] != 0. {
                sum / hess[(i, i)]
            } else {
                0.
            };
        }
        let mut update = na::DVector::zeros(n);
        for (i, v) in basis.iter().take(k).enumerate() {
            update.axpy(y[i], v, 1.);
        }
        x += precond.precondition(&update);
    }

    Err(SolverError::NotConverged {
        method: "GMRES",
        iterations: total_iters,
        residual,
    })
}

//
// strategy
//

/// Dense or sparse direct solve versus preconditioned iteration,
/// decided once when the solver is built.
#[derive(Clone, Debug)]
pub enum LinearSolver {
    /// Dense LU factorization.
    Direct(na::LU<f64, na::Dyn, na::Dyn>),
    /// ILU(0)-preconditioned restarted GMRES.
    Iterative {
        /// The system matrix.
        matrix: nas::CsrMatrix<f64>,
        /// Its incomplete factorization.
        ilu: Ilu0,
        /// Iteration parameters.
        params: IterativeParams,
    },
}

impl LinearSolver {
    /// Factorize directly if the system has at most `direct_max` unknowns,
    /// otherwise set up GMRES with an ILU(0) preconditioner.
    pub fn new(
        matrix: &nas::CsrMatrix<f64>,
        direct_max: usize,
        params: &IterativeParams,
    ) -> Result<Self, SolverError> {
        let n = matrix.nrows();
        if matrix.ncols() != n {
            return Err(SolverError::NotSquare {
                rows: n,
                cols: matrix.ncols(),
            });
        }
        if n <= direct_max {
            let lu = nas::convert::serial::convert_csr_dense(matrix).lu();
            if !lu.is_invertible() {
                return Err(SolverError::Singular { size: n });
            }
            Ok(Self::Direct(lu))
        } else {
            Ok(Self::Iterative {
                matrix: matrix.clone(),
                ilu: Ilu0::new(matrix)?,
                params: *params,
            })
        }
    }

    /// Whether the solver uses a direct factorization.
    #[inline]
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct(_))
    }

    /// Solve for one right-hand side.
    pub fn solve(&self, rhs: &na::DVector<f64>) -> Result<na::DVector<f64>, SolverError> {
        match self {
            Self::Direct(lu) => lu
                .solve(rhs)
                .ok_or(SolverError::Singular { size: rhs.len() }),
            Self::Iterative { matrix, ilu, params } => {
                let (x, stats) = gmres(matrix, rhs, ilu, params)?;
                log::trace!(
                    "GMRES converged in {} iterations (residual {:e})",
                    stats.iterations,
                    stats.residual
                );
                Ok(x)
            }
        }
    }
}
