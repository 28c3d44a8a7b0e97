//! Patch-local assembly of mass and derivative operators on broken spaces.
//!
//! Every patch is assembled independently (in parallel with rayon)
//! and the results are placed on the diagonal of the global matrix.
//! Continuity between patches is not enforced here;
//! that's the job of [`ConformingProjector`][crate::conforming::ConformingProjector].

use nalgebra as na;
use nalgebra_sparse as nas;
use rayon::prelude::*;

use crate::{
    mapping::DEGENERATE_JACOBIAN_TOL,
    operator::{self, MatrixOperator, OperatorError},
    quadrature::GaussLegendre,
    space::{BrokenSpace, SequenceKind, TensorSpace2d},
    topology::MultipatchDomain,
};

/// Failure in assembling a patch-local operator.
#[derive(thiserror::Error, Debug)]
pub enum AssemblyError {
    /// The geometry mapping of a patch degenerated at a quadrature point.
    #[error("Degenerate geometry in patch {patch:?}: Jacobian determinant {det:e} at logical point ({u}, {v})")]
    DegenerateJacobian {
        /// Name of the patch.
        patch: String,
        /// The Jacobian determinant.
        det: f64,
        /// Logical coordinate along axis 0.
        u: f64,
        /// Logical coordinate along axis 1.
        v: f64,
    },
    /// The space was built on a different domain.
    #[error("Space has {space} patches but the domain has {domain}")]
    PatchCountMismatch {
        /// Patches in the space.
        space: usize,
        /// Patches in the domain.
        domain: usize,
    },
    /// Top-degree forms have no derivative.
    #[error("{0}-forms have no exterior derivative in 2D")]
    NoDerivative(usize),
    /// Combining the per-axis matrices failed.
    #[error(transparent)]
    Operator(#[from] OperatorError),
}

/// Assembles block-diagonal operators over the patches of a domain.
#[derive(Clone, Copy, Debug)]
pub struct BrokenAssembler<'a> {
    domain: &'a MultipatchDomain,
    quad_points: Option<usize>,
}

impl<'a> BrokenAssembler<'a> {
    /// Assembler with the default quadrature of `degree + 2` points per axis.
    pub fn new(domain: &'a MultipatchDomain) -> Self {
        Self {
            domain,
            quad_points: None,
        }
    }

    /// Use a fixed number of quadrature points per axis and cell.
    pub fn with_quadrature_points(mut self, points: usize) -> Self {
        self.quad_points = Some(points);
        self
    }

    fn check_space(&self, space: &BrokenSpace) -> Result<(), AssemblyError> {
        if space.patch_count() != self.domain.patch_count() {
            return Err(AssemblyError::PatchCountMismatch {
                space: space.patch_count(),
                domain: self.domain.patch_count(),
            });
        }
        Ok(())
    }

    /// The mass matrix of a broken space,
    /// i.e. the L2 inner products of its basis functions in physical space.
    pub fn mass(&self, space: &BrokenSpace) -> Result<MatrixOperator, AssemblyError> {
        self.check_space(space)?;
        let blocks: Vec<MatrixOperator> = (0..space.patch_count())
            .into_par_iter()
            .map(|patch| self.patch_mass(space, patch))
            .collect::<Result<_, _>>()?;
        let mass = operator::block_diag(&blocks);
        log::debug!(
            "Assembled mass matrix of {}-forms: {} dofs, {} nonzeros",
            space.form_degree(),
            space.dim(),
            mass.csr().nnz()
        );
        Ok(mass)
    }

    /// The exterior derivative from a broken space of k-forms to (k+1)-forms.
    ///
    /// With M-spline derivative spaces this is a pure incidence matrix
    /// independent of the geometry.
    pub fn derivative(&self, space: &BrokenSpace) -> Result<MatrixOperator, AssemblyError> {
        self.check_space(space)?;
        let k = space.form_degree();
        if k >= 2 {
            return Err(AssemblyError::NoDerivative(k));
        }
        let blocks: Vec<MatrixOperator> = (0..space.patch_count())
            .into_par_iter()
            .map(|patch| self.patch_derivative(space.sequence(), k, patch))
            .collect::<Result<_, _>>()?;
        Ok(operator::block_diag(&blocks))
    }

    fn patch_derivative(
        &self,
        sequence: SequenceKind,
        k: usize,
        patch: usize,
    ) -> Result<MatrixOperator, AssemblyError> {
        let [b0, b1] = self.domain.patch_spaces(patch);
        let d0 = MatrixOperator::from(b0.derivative_matrix());
        let d1 = MatrixOperator::from(b1.derivative_matrix());
        let (id_b0, id_b1) = (operator::identity(b0.nbasis()), operator::identity(b1.nbasis()));
        let (id_m0, id_m1) = (
            operator::identity(d0.nrows()),
            operator::identity(d1.nrows()),
        );

        let mat = match (k, sequence) {
            // grad
            (0, SequenceKind::Hcurl) => operator::block(&[
                vec![Some(&operator::kron(&d0, &id_b1))],
                vec![Some(&operator::kron(&id_b0, &d1))],
            ])?,
            // rot = (∂y, -∂x)
            (0, SequenceKind::Hdiv) => operator::block(&[
                vec![Some(&operator::kron(&id_b0, &d1))],
                vec![Some(&(-1. * operator::kron(&d0, &id_b1)))],
            ])?,
            // scalar curl = ∂x u_y - ∂y u_x
            (1, SequenceKind::Hcurl) => operator::block(&[vec![
                Some(&(-1. * operator::kron(&id_m0, &d1))),
                Some(&operator::kron(&d0, &id_m1)),
            ]])?,
            // div
            (1, SequenceKind::Hdiv) => operator::block(&[vec![
                Some(&operator::kron(&d0, &id_m1)),
                Some(&operator::kron(&id_m0, &d1)),
            ]])?,
            _ => return Err(AssemblyError::NoDerivative(k)),
        };
        Ok(mat)
    }

    fn patch_mass(&self, space: &BrokenSpace, patch: usize) -> Result<MatrixOperator, AssemblyError> {
        let patch_desc = self.domain.patch(patch);
        let mapping = patch_desc.mapping();
        let comps = space.components(patch);
        let k = space.form_degree();
        let sequence = space.sequence();

        let local_offsets: Vec<usize> = comps
            .iter()
            .scan(0, |acc, c| {
                let start = *acc;
                *acc += c.nbasis();
                Some(start)
            })
            .collect();
        let local_dim: usize = comps.iter().map(|c| c.nbasis()).sum();

        let [b0, b1] = self.domain.patch_spaces(patch);
        let rules = [
            GaussLegendre::new(self.quad_points.unwrap_or(b0.degree() + 2)),
            GaussLegendre::new(self.quad_points.unwrap_or(b1.degree() + 2)),
        ];
        let breaks = [b0.breaks(), b1.breaks()];

        let mut coo = nas::CooMatrix::new(local_dim, local_dim);
        for c0 in 0..b0.ncells() {
            let pts0: Vec<(f64, f64)> = rules[0].on_interval(breaks[0][c0], breaks[0][c0 + 1]).collect();
            for c1 in 0..b1.ncells() {
                let pts1: Vec<(f64, f64)> =
                    rules[1].on_interval(breaks[1][c1], breaks[1][c1 + 1]).collect();

                // metric tensor times quadrature weight at each point
                let mut metric = Vec::with_capacity(pts0.len() * pts1.len());
                for &(u, wu) in &pts0 {
                    for &(v, wv) in &pts1 {
                        let jac = mapping.jacobian(na::Vector2::new(u, v));
                        let det = jac.determinant();
                        if det.abs() < DEGENERATE_JACOBIAN_TOL || det.is_nan() {
                            return Err(AssemblyError::DegenerateJacobian {
                                patch: patch_desc.name().to_string(),
                                det,
                                u,
                                v,
                            });
                        }
                        metric.push(wu * wv * form_metric(k, sequence, &jac, det.abs()));
                    }
                }

                let values: Vec<CellValues> = comps
                    .iter()
                    .map(|comp| CellValues::new(comp, [c0, c1], [&pts0, &pts1]))
                    .collect();

                for (a, comp_a) in comps.iter().enumerate() {
                    for (b, comp_b) in comps.iter().enumerate() {
                        if metric.iter().all(|g| g[(a, b)] == 0.) {
                            continue;
                        }
                        add_cell_block(
                            &mut coo,
                            (comp_a, &values[a], local_offsets[a]),
                            (comp_b, &values[b], local_offsets[b]),
                            metric.iter().map(|g| g[(a, b)]),
                        );
                    }
                }
            }
        }

        Ok(nas::CsrMatrix::from(&coo).into())
    }
}

/// Pullback of the L2 inner product of k-forms to logical coordinates.
///
/// Scalar forms only use the (0, 0) entry.
fn form_metric(k: usize, sequence: SequenceKind, jac: &na::Matrix2<f64>, det: f64) -> na::Matrix2<f64> {
    match (k, sequence) {
        (0, _) => na::Matrix2::new(det, 0., 0., 0.),
        (1, SequenceKind::Hcurl) => {
            // covariant pullback: J^{-1} J^{-T} |det J|
            let inv = jac.try_inverse().unwrap_or_else(na::Matrix2::zeros);
            inv * inv.transpose() * det
        }
        // contravariant Piola: J^T J / |det J|
        (1, SequenceKind::Hdiv) => jac.transpose() * jac / det,
        _ => na::Matrix2::new(1. / det, 0., 0., 0.),
    }
}

/// 1D basis values of a component at the quadrature points of one cell.
struct CellValues {
    /// extended index of the first nonzero function per axis
    first: [usize; 2],
    /// values[axis][point][local function]
    values: [Vec<Vec<f64>>; 2],
}

impl CellValues {
    fn new(comp: &TensorSpace2d, cell: [usize; 2], points: [&[(f64, f64)]; 2]) -> Self {
        let mut first = [0; 2];
        let values = [0, 1].map(|axis| {
            let space = &comp.axes()[axis];
            points[axis]
                .iter()
                .map(|&(x, _)| {
                    let (f, vals) = space.basis_values(cell[axis], x);
                    first[axis] = f;
                    vals
                })
                .collect::<Vec<_>>()
        });
        Self { first, values }
    }
}

/// Integrate products of basis functions of two components over one cell
/// and add them to the patch matrix.
fn add_cell_block(
    coo: &mut nas::CooMatrix<f64>,
    (comp_a, vals_a, offset_a): (&TensorSpace2d, &CellValues, usize),
    (comp_b, vals_b, offset_b): (&TensorSpace2d, &CellValues, usize),
    weights: impl Iterator<Item = f64>,
) {
    let len = |v: &CellValues, axis: usize| v.values[axis].first().map_or(0, |p| p.len());
    let (na0, na1) = (len(vals_a, 0), len(vals_a, 1));
    let (nb0, nb1) = (len(vals_b, 0), len(vals_b, 1));
    let nq1 = vals_a.values[1].len();

    let mut elem = na::DMatrix::<f64>::zeros(na0 * na1, nb0 * nb1);
    for (q, w) in weights.enumerate() {
        let (q0, q1) = (q / nq1, q % nq1);
        let (a0, a1) = (&vals_a.values[0][q0], &vals_a.values[1][q1]);
        let (b0, b1) = (&vals_b.values[0][q0], &vals_b.values[1][q1]);
        for ra0 in 0..na0 {
            for ra1 in 0..na1 {
                let va = w * a0[ra0] * a1[ra1];
                let row = ra0 * na1 + ra1;
                for rb0 in 0..nb0 {
                    let vab = va * b0[rb0];
                    for rb1 in 0..nb1 {
                        elem[(row, rb0 * nb1 + rb1)] += vab * b1[rb1];
                    }
                }
            }
        }
    }

    let global = |comp: &TensorSpace2d, vals: &CellValues, offset: usize, r0: usize, r1: usize| {
        let [s0, s1] = comp.axes();
        offset
            + comp.index(
                s0.global_index(vals.first[0] + r0),
                s1.global_index(vals.first[1] + r1),
            )
    };
    for ra0 in 0..na0 {
        for ra1 in 0..na1 {
            let row = global(comp_a, vals_a, offset_a, ra0, ra1);
            for rb0 in 0..nb0 {
                for rb1 in 0..nb1 {
                    let col = global(comp_b, vals_b, offset_b, rb0, rb1);
                    coo.push(row, col, elem[(ra0 * na1 + ra1, rb0 * nb1 + rb1)]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mapping::{AffineMapping, PolarMapping},
        operator::Operator,
        spline::SplineSpace1d,
        topology::{domains, DomainBuilder, Patch},
    };
    use approx::assert_relative_eq;

    fn single_patch(patch: Patch) -> MultipatchDomain {
        DomainBuilder::new("single").patch(patch).build().unwrap()
    }

    /// Coefficients of the identity function in a clamped B-spline space.
    fn greville(space: &SplineSpace1d) -> Vec<f64> {
        let p = space.degree();
        let t = space.knots();
        (0..space.nbasis())
            .map(|i| t[i + 1..=i + p].iter().sum::<f64>() / p as f64)
            .collect()
    }

    #[test]
    fn zero_form_mass_integrates_area() {
        let domain = single_patch(
            Patch::new("box", [2, 3], [3, 4]).with_mapping(AffineMapping::rectangle((0., 2.), (1., 4.))),
        );
        let v0 = BrokenSpace::new(&domain, SequenceKind::Hcurl, 0).unwrap();
        let mass = BrokenAssembler::new(&domain).mass(&v0).unwrap();
        let ones = na::DVector::from_element(v0.dim(), 1.);
        assert_relative_eq!(ones.dot(&(&mass * &ones)), 6., epsilon = 1e-12);
    }

    #[test]
    fn gradient_norm_respects_the_mapping() {
        // φ = logical x = X / 2 on [0, 2] x [0, 3] has |grad φ|² = 1/4 over area 6
        let domain = single_patch(
            Patch::new("box", [3, 2], [4, 3]).with_mapping(AffineMapping::rectangle((0., 2.), (0., 3.))),
        );
        let [b0, b1] = domain.patch_spaces(0);
        let g = greville(b0);
        let phi = na::DVector::from_fn(b0.nbasis() * b1.nbasis(), |i, _| g[i / b1.nbasis()]);

        for sequence in [SequenceKind::Hcurl, SequenceKind::Hdiv] {
            let v0 = BrokenSpace::new(&domain, sequence, 0).unwrap();
            let v1 = BrokenSpace::new(&domain, sequence, 1).unwrap();
            let assembler = BrokenAssembler::new(&domain);
            let d0 = assembler.derivative(&v0).unwrap();
            let m1 = assembler.mass(&v1).unwrap();
            let grad = &d0 * &phi;
            assert_relative_eq!(grad.dot(&(&m1 * &grad)), 1.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn derivatives_form_a_complex() {
        let domain = domains::l_shape(3, 3).unwrap();
        let assembler = BrokenAssembler::new(&domain);
        for sequence in [SequenceKind::Hcurl, SequenceKind::Hdiv] {
            let v0 = BrokenSpace::new(&domain, sequence, 0).unwrap();
            let v1 = BrokenSpace::new(&domain, sequence, 1).unwrap();
            let v2 = BrokenSpace::new(&domain, sequence, 2).unwrap();
            let d0 = assembler.derivative(&v0).unwrap();
            let d1 = assembler.derivative(&v1).unwrap();
            assert_eq!(d0.shape(), (v1.dim(), v0.dim()));
            assert_eq!(d1.shape(), (v2.dim(), v1.dim()));
            let dd = &d1 * &d0;
            assert!(dd.csr().values().iter().all(|&v| v == 0.));
            assert!(matches!(
                assembler.derivative(&v2),
                Err(AssemblyError::NoDerivative(2))
            ));
        }
    }

    #[test]
    fn curved_masses_are_symmetric_positive_definite() {
        let domain = single_patch(Patch::new("sector", [2, 2], [3, 4]).with_mapping(PolarMapping {
            center: na::Vector2::zeros(),
            radii: (0.5, 1.),
            angles: (0., 1.5),
        }));
        let assembler = BrokenAssembler::new(&domain);
        for sequence in [SequenceKind::Hcurl, SequenceKind::Hdiv] {
            for k in 0..=2 {
                let space = BrokenSpace::new(&domain, sequence, k).unwrap();
                let mass = assembler.mass(&space).unwrap();
                let dense = nas::convert::serial::convert_csr_dense(mass.csr());
                assert_relative_eq!(dense, dense.transpose(), epsilon = 1e-14);
                assert!(dense.cholesky().is_some());
            }
        }
    }

    #[test]
    fn degenerate_mapping_names_the_patch() {
        let domain = single_patch(
            Patch::new("squashed", [2, 2], [2, 2]).with_mapping(AffineMapping::rectangle((0., 1.), (0., 0.))),
        );
        let v0 = BrokenSpace::new(&domain, SequenceKind::Hcurl, 0).unwrap();
        let err = BrokenAssembler::new(&domain).mass(&v0).unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::DegenerateJacobian { ref patch, .. } if patch == "squashed"
        ));
        assert!(err.to_string().contains("squashed"));
    }
}
