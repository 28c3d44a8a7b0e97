//! Generalized symmetric eigenproblems `A x = λ M x` near a target shift,
//! solved by a restarted block Krylov method on the shift-invert operator
//! with locking of converged pairs.
//!
//! The shift-invert action `(A - σM)⁻¹` comes from a [`LinearSolver`],
//! which factorizes small systems densely
//! and wraps ILU(0)-preconditioned GMRES around large ones.

use nalgebra as na;
use nalgebra_sparse as nas;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    linalg::{IterativeParams, LinearSolver, SolverError},
    operator::{MatrixOperator, Operator},
};

// columns whose M-norm shrinks by more than this in orthogonalization are dropped
const DEPENDENCE_TOL: f64 = 1e-10;

/// Parameters of an eigensolve.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EigenParams {
    /// Target shift; the eigenvalues closest to it are computed.
    pub sigma: f64,
    /// Number of eigenpairs to compute.
    pub count: usize,
    /// Largest system solved with a dense factorization.
    pub direct_max: usize,
    /// Relative residual at which an eigenpair counts as converged.
    pub tol: f64,
    /// Maximum number of restarts.
    pub max_iter: usize,
    /// Number of shift-invert applications to the block between restarts.
    pub krylov_depth: usize,
    /// Eigenvalues with absolute value below this are reported as near-kernel.
    pub kernel_threshold: f64,
    /// Parameters of the iterative shift-invert solve.
    pub solver: IterativeParams,
    /// Seed of the random starting subspace.
    pub seed: u64,
}

impl Default for EigenParams {
    fn default() -> Self {
        Self {
            sigma: 0.,
            count: 10,
            direct_max: 3000,
            tol: 1e-9,
            max_iter: 300,
            krylov_depth: 3,
            kernel_threshold: 1e-8,
            solver: IterativeParams::default(),
            seed: 0,
        }
    }
}

/// Failure of an eigensolve.
#[derive(thiserror::Error, Debug)]
pub enum EigenError {
    /// No eigenpairs were requested.
    #[error("Eigenpair count must be positive")]
    ZeroCount,
    /// More eigenpairs were requested than the problem has.
    #[error("Requested {count} eigenpairs of a problem of size {dim}")]
    TooManyPairs {
        /// Requested count.
        count: usize,
        /// Problem size.
        dim: usize,
    },
    /// A and M are not square matrices of the same size.
    #[error("Matrices of shapes {a:?} and {m:?} do not form an eigenproblem")]
    Shape {
        /// Shape of A.
        a: (usize, usize),
        /// Shape of M.
        m: (usize, usize),
    },
    /// The iterated subspace lost rank.
    #[error("Search subspace collapsed to rank {rank}")]
    Breakdown {
        /// Remaining rank.
        rank: usize,
    },
    /// The wanted eigenpairs did not converge in time.
    #[error("Eigensolve did not converge in {iterations} iterations (residual {residual:e})")]
    NotConverged {
        /// Iterations performed.
        iterations: usize,
        /// Largest relative residual among the wanted pairs.
        residual: f64,
    },
    /// The shift-invert solve failed.
    #[error(transparent)]
    Solver(#[from] SolverError),
}

/// One eigenvalue with its eigenvector.
#[derive(Clone, Debug, PartialEq)]
pub struct EigenPair {
    /// The eigenvalue.
    pub value: f64,
    /// The eigenvector, normalized to unit M-norm.
    pub vector: na::DVector<f64>,
}

/// Result of an eigensolve.
#[derive(Clone, Debug, PartialEq)]
pub struct EigenSolution {
    /// Eigenpairs with eigenvalues at or above the kernel threshold, in ascending order.
    pub pairs: Vec<EigenPair>,
    /// Eigenpairs with eigenvalues below the kernel threshold, in ascending order.
    pub near_kernel: Vec<EigenPair>,
    /// Whether the shift-invert action used a direct factorization.
    pub direct: bool,
    /// Restarts performed.
    pub iterations: usize,
}

impl EigenSolution {
    /// Eigenvalues of the non-kernel pairs.
    pub fn values(&self) -> Vec<f64> {
        self.pairs.iter().map(|p| p.value).collect()
    }
}

/// Computes eigenpairs nearest a shift with a fixed configuration.
#[derive(Clone, Debug)]
pub struct EigensolverDriver {
    params: EigenParams,
}

impl EigensolverDriver {
    /// Create a driver.
    pub fn new(params: EigenParams) -> Self {
        Self { params }
    }

    /// The configuration in use.
    #[inline]
    pub fn params(&self) -> &EigenParams {
        &self.params
    }

    /// Compute the `count` eigenpairs of `A x = λ M x` nearest `sigma`.
    ///
    /// A must be symmetric and M symmetric positive definite.
    pub fn solve(&self, a: &MatrixOperator, m: &MatrixOperator) -> Result<EigenSolution, EigenError> {
        let params = &self.params;
        let n = a.nrows();
        if a.ncols() != n || m.shape() != (n, n) {
            return Err(EigenError::Shape {
                a: a.shape(),
                m: m.shape(),
            });
        }
        if params.count == 0 {
            return Err(EigenError::ZeroCount);
        }
        if params.count > n {
            return Err(EigenError::TooManyPairs {
                count: params.count,
                dim: n,
            });
        }
        let k = params.count;
        let block_size = n.min((2 * k).max(k + 8));

        let shifted = a - &(params.sigma * m.clone());
        let solver = LinearSolver::new(shifted.csr(), params.direct_max, &params.solver)?;
        log::info!(
            "Computing {k} eigenpairs near {} of a problem of size {n} ({} shift-invert)",
            params.sigma,
            if solver.is_direct() { "direct" } else { "iterative" }
        );

        let shift_invert = |cols: &[na::DVector<f64>]| {
            cols.par_iter()
                .map(|x| solver.solve(&m.mul_vec(x)))
                .collect::<Result<Vec<_>, _>>()
        };

        let mut rng = rand::rngs::SmallRng::seed_from_u64(params.seed);
        let mut block: Vec<na::DVector<f64>> = (0..block_size)
            .map(|_| na::DVector::from_fn(n, |_, _| rng.gen_range(-1.0..1.0)))
            .collect();
        let mut locked: Vec<EigenPair> = Vec::with_capacity(k);

        let mut residual = f64::INFINITY;
        for iter in 1..=params.max_iter {
            // converged vectors only constrain the search space
            let mut basis = MBasis::new(m.csr());
            basis.extend(locked.iter().map(|p| p.vector.clone()).collect());
            let locked_len = basis.len();
            let wanted = k - locked.len();

            // block Krylov space of (A - σM)⁻¹ M started from the current block
            let mut frontier = basis.extend(block);
            if frontier.len() < wanted {
                return Err(EigenError::Breakdown {
                    rank: locked_len + frontier.len(),
                });
            }
            let mut images = Vec::with_capacity(basis.len() * (params.krylov_depth + 1));
            for depth in 0..=params.krylov_depth {
                let next = shift_invert(&frontier[..])?;
                images.extend(next.iter().cloned());
                if depth == params.krylov_depth {
                    break;
                }
                frontier = basis.extend(next);
                if frontier.is_empty() {
                    break;
                }
            }

            let ritz = rayleigh_ritz(a, &basis, locked_len, &images);
            residual = 0.;
            // lock the converged pairs nearest the shift,
            // a converged pair behind an unconverged one waits
            let mut newly_locked = 0;
            let mut blocked = false;
            for pair in ritz.iter().take(wanted) {
                let r = relative_residual(a, m, pair, params.sigma);
                if r <= params.tol && !blocked {
                    locked.push(pair.clone());
                    newly_locked += 1;
                } else {
                    blocked = true;
                    residual = f64::max(residual, r);
                }
            }
            log::trace!(
                "Restart {iter}: {} of {k} pairs converged, residual {residual:e}",
                locked.len()
            );

            if locked.len() == k {
                log::debug!("Eigensolve converged after {iter} restarts");
                locked.sort_by(|l, r| l.value.total_cmp(&r.value));
                let (near_kernel, pairs): (Vec<_>, Vec<_>) = locked
                    .into_iter()
                    .partition(|p| p.value.abs() < params.kernel_threshold);
                if !near_kernel.is_empty() {
                    log::info!(
                        "{} eigenvalues below {:e} reported as near-kernel",
                        near_kernel.len(),
                        params.kernel_threshold
                    );
                }
                return Ok(EigenSolution {
                    pairs,
                    near_kernel,
                    direct: solver.is_direct(),
                    iterations: iter,
                });
            }
            block = ritz
                .into_iter()
                .skip(newly_locked)
                .take(block_size)
                .map(|p| p.vector)
                .collect();
        }
        Err(EigenError::NotConverged {
            iterations: params.max_iter,
            residual,
        })
    }
}

/// An M-orthonormal set of vectors, stored along with their products with M.
struct MBasis<'m> {
    m: &'m nas::CsrMatrix<f64>,
    vectors: Vec<na::DVector<f64>>,
    m_vectors: Vec<na::DVector<f64>>,
}

impl<'m> MBasis<'m> {
    fn new(m: &'m nas::CsrMatrix<f64>) -> Self {
        Self {
            m,
            vectors: Vec::new(),
            m_vectors: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    /// Orthonormalize `cols` against the basis and each other
    /// with two passes of modified Gram-Schmidt and append them,
    /// dropping columns that turn out linearly dependent.
    /// Returns the appended vectors.
    fn extend(&mut self, cols: Vec<na::DVector<f64>>) -> Vec<na::DVector<f64>> {
        let first_new = self.vectors.len();
        for mut v in cols {
            let before = v.dot(&(self.m * &v)).sqrt();
            for _ in 0..2 {
                for (b, mb) in self.vectors.iter().zip(&self.m_vectors) {
                    let r = mb.dot(&v);
                    v.axpy(-r, b, 1.);
                }
            }
            let mut mv = self.m * &v;
            let norm = v.dot(&mv).sqrt();
            if norm.is_nan() || norm <= DEPENDENCE_TOL * before {
                continue;
            }
            v /= norm;
            mv /= norm;
            self.vectors.push(v);
            self.m_vectors.push(mv);
        }
        self.vectors[first_new..].to_vec()
    }
}

/// Ritz pairs of the shift-invert operator `S = (A - σM)⁻¹ M`
/// on the basis vectors after `skip`, given their images under S.
///
/// S is self-adjoint in the M inner product and its eigenvalues
/// `1 / (λ - σ)` are largest in magnitude for the λ closest to σ,
/// so the pairs are returned in order of distance from the shift.
/// Eigenvalues are the Rayleigh quotients of A.
fn rayleigh_ritz(
    a: &MatrixOperator,
    basis: &MBasis,
    skip: usize,
    images: &[na::DVector<f64>],
) -> Vec<EigenPair> {
    let y = na::DMatrix::from_columns(&basis.vectors[skip..]);
    let my = na::DMatrix::from_columns(&basis.m_vectors[skip..]);
    let sy = na::DMatrix::from_columns(images);
    let h = my.transpose() * sy;
    let h = 0.5 * (&h + h.transpose());
    let eig = na::SymmetricEigen::new(h);

    let mut order: Vec<usize> = (0..eig.eigenvalues.len()).collect();
    order.sort_by(|&l, &r| eig.eigenvalues[r].abs().total_cmp(&eig.eigenvalues[l].abs()));
    order
        .into_iter()
        .map(|i| {
            let vector = &y * eig.eigenvectors.column(i);
            EigenPair {
                value: vector.dot(&a.mul_vec(&vector)),
                vector,
            }
        })
        .collect()
}

// scaled so that eigenvalues at or near zero still get a meaningful residual
fn relative_residual(a: &MatrixOperator, m: &MatrixOperator, pair: &EigenPair, sigma: f64) -> f64 {
    let ax = a.mul_vec(&pair.vector);
    let mx = m.mul_vec(&pair.vector);
    let scale = mx.norm() * pair.value.abs().max(sigma.abs()).max(1.);
    (ax - pair.value * &mx).norm() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        derham::{DiscreteDeRham, DiscretizationParams},
        topology::domains,
    };
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn diagonal(values: impl IntoIterator<Item = f64>) -> MatrixOperator {
        let values: Vec<f64> = values.into_iter().collect();
        let mut coo = nas::CooMatrix::new(values.len(), values.len());
        for (i, v) in values.into_iter().enumerate() {
            coo.push(i, i, v);
        }
        nas::CsrMatrix::from(&coo).into()
    }

    /// Stiffness and mass of 1D linear elements on [0, 1] with Dirichlet ends.
    fn fem_1d(n: usize) -> (MatrixOperator, MatrixOperator) {
        let h = 1. / (n + 1) as f64;
        let mut a = nas::CooMatrix::new(n, n);
        let mut m = nas::CooMatrix::new(n, n);
        for i in 0..n {
            a.push(i, i, 2. / h);
            m.push(i, i, 4. * h / 6.);
            if i + 1 < n {
                for (r, c) in [(i, i + 1), (i + 1, i)] {
                    a.push(r, c, -1. / h);
                    m.push(r, c, h / 6.);
                }
            }
        }
        (
            nas::CsrMatrix::from(&a).into(),
            nas::CsrMatrix::from(&m).into(),
        )
    }

    #[test]
    fn diagonal_spectrum_near_shift() {
        let a = diagonal((1..=20).map(|i| i as f64));
        let m = diagonal(std::iter::repeat(2.).take(20));
        let driver = EigensolverDriver::new(EigenParams {
            sigma: 3.2,
            count: 4,
            ..Default::default()
        });
        let sol = driver.solve(&a, &m).unwrap();
        assert!(sol.direct);
        assert!(sol.near_kernel.is_empty());
        let values = sol.values();
        for (found, expected) in values.iter().zip([2.5, 3., 3.5, 4.]) {
            assert_relative_eq!(*found, expected, epsilon = 1e-9);
        }
        for pair in &sol.pairs {
            let mx = m.mul_vec(&pair.vector);
            assert_relative_eq!(pair.vector.dot(&mx), 1., epsilon = 1e-9);
        }
    }

    #[test]
    fn kernel_is_reported_separately() {
        let a = diagonal([0., 0., 0., 1., 2., 3., 4., 5., 6., 7., 8., 9.]);
        let m = diagonal(std::iter::repeat(1.).take(12));
        let driver = EigensolverDriver::new(EigenParams {
            sigma: 0.3,
            count: 5,
            ..Default::default()
        });
        let sol = driver.solve(&a, &m).unwrap();
        assert_eq!(sol.near_kernel.len(), 3);
        let values = sol.values();
        assert_eq!(values.len(), 2);
        assert_relative_eq!(values[0], 1., epsilon = 1e-9);
        assert_relative_eq!(values[1], 2., epsilon = 1e-9);
        for pair in &sol.near_kernel {
            // kernel vectors live in the first three coordinates
            assert!(pair.vector.rows(3, 9).norm() < 1e-8);
        }
    }

    #[test]
    fn direct_and_iterative_agree() {
        let (a, m) = fem_1d(60);
        let params = EigenParams {
            sigma: 50.,
            count: 3,
            tol: 1e-8,
            ..Default::default()
        };
        let direct = EigensolverDriver::new(params).solve(&a, &m).unwrap();
        let iterative = EigensolverDriver::new(EigenParams {
            direct_max: 0,
            ..params
        })
        .solve(&a, &m)
        .unwrap();
        assert!(direct.direct);
        assert!(!iterative.direct);
        for (d, i) in direct.values().iter().zip(iterative.values()) {
            assert_relative_eq!(*d, i, max_relative = 1e-6);
        }
        // continuous eigenvalues (k π)² for k = 1, 2, 3
        for (k, value) in direct.values().iter().enumerate() {
            let exact = ((k + 1) as f64 * PI).powi(2);
            assert_relative_eq!(*value, exact, max_relative = 1e-2);
        }
    }

    #[test]
    fn invalid_problems() {
        let a = diagonal([1., 2., 3.]);
        let m = diagonal([1., 1.]);
        let driver = EigensolverDriver::new(EigenParams {
            count: 2,
            ..Default::default()
        });
        assert!(matches!(driver.solve(&a, &m), Err(EigenError::Shape { .. })));
        let zero = EigensolverDriver::new(EigenParams {
            count: 0,
            ..Default::default()
        });
        assert!(matches!(zero.solve(&a, &a), Err(EigenError::ZeroCount)));
        let many = EigensolverDriver::new(EigenParams {
            count: 4,
            ..Default::default()
        });
        assert!(matches!(
            many.solve(&a, &a),
            Err(EigenError::TooManyPairs { count: 4, dim: 3 })
        ));
    }

    fn rectangle_curl_curl() -> (MatrixOperator, MatrixOperator) {
        let domain = domains::two_patch(3, [8, 8]).unwrap();
        let derham = DiscreteDeRham::new(&domain, DiscretizationParams::default()).unwrap();
        let cc = derham.curl_curl(true).unwrap();
        let m1 = derham.mass(1).unwrap().clone();
        (cc, m1)
    }

    #[test]
    fn maxwell_eigenvalues_on_rectangle() {
        let (cc, m1) = rectangle_curl_curl();
        let sol = EigensolverDriver::new(EigenParams {
            sigma: 6.,
            count: 3,
            ..Default::default()
        })
        .solve(&cc, &m1)
        .unwrap();
        // (m π / 2)² + (n π)² on [0, 2] × [0, 1]
        let expected = [PI * PI / 4., PI * PI, PI * PI];
        let values = sol.values();
        assert_eq!(values.len(), 3);
        assert!(sol.near_kernel.is_empty());
        for (found, exact) in values.iter().zip(expected) {
            assert_relative_eq!(*found, exact, max_relative = 5e-3);
        }
    }

    #[test]
    fn maxwell_kernel_mode_within_count() {
        // the fourth closest eigenvalue to 6 is the gradient kernel,
        // which is far larger than the search block
        let (cc, m1) = rectangle_curl_curl();
        let sol = EigensolverDriver::new(EigenParams {
            sigma: 6.,
            count: 4,
            ..Default::default()
        })
        .solve(&cc, &m1)
        .unwrap();
        assert!(sol.iterations < EigenParams::default().max_iter);
        assert_eq!(sol.near_kernel.len(), 1);
        let values = sol.values();
        assert_eq!(values.len(), 3);
        for (found, exact) in values.iter().zip([PI * PI / 4., PI * PI, PI * PI]) {
            assert_relative_eq!(*found, exact, max_relative = 5e-3);
        }
        let kernel = &sol.near_kernel[0].vector;
        assert!(cc.mul_vec(kernel).norm() < 1e-6 * m1.mul_vec(kernel).norm());
    }
}
