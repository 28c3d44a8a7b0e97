//! Projection from a broken space onto its conforming subspace.
//!
//! Continuity across interfaces is expressed by an extension operator `E`
//! that maps conforming coefficients to broken ones:
//! - matching interfaces identify trace coefficients on both sides
//!   (up to orientation and sign), so one conforming coefficient
//!   extends to every member of its class,
//! - non-matching interfaces express each coefficient on the fine side
//!   as a combination of coarse-side coefficients given by knot insertion.
//!
//! The projection is then `P = E (EᵀE)⁻¹ Eᵀ`,
//! the orthogonal projection (in coefficient space) onto the range of `E`.
//! For matching interfaces this is plain averaging of the identified coefficients.
//! Moment-preserving corrections near interfaces are not implemented.
//! The homogeneous variant leaves out classes touching a Dirichlet boundary,
//! so that those coefficients are projected to zero.

use fixedbitset as fb;
use nalgebra as na;
use nalgebra_sparse as nas;
use rayon::prelude::*;

use crate::{
    knot_insertion::{KnotInsertionError, KnotInsertionTransfer},
    mapping::DEGENERATE_JACOBIAN_TOL,
    operator::{self, MatrixOperator, Operator, OperatorError},
    space::{BrokenSpace, SequenceKind},
    spline::{BasisKind, SplineError, SplineSpace1d},
    topology::{Extremity, Interface, InterfaceKind, MultipatchDomain, Orientation, PatchFace, Side},
};

/// Rows of a prolongation matrix within this distance of a unit vector
/// are treated as identifying two coefficients.
const UNIT_ROW_TOL: f64 = 1e-13;

/// Failure to build a conforming projection.
#[derive(thiserror::Error, Debug)]
pub enum ProjectionError {
    /// The space has a different number of patches than the domain.
    #[error("Space has {space} patches but the domain has {domain}")]
    SpaceMismatch {
        /// Patches in the space.
        space: usize,
        /// Patches in the domain.
        domain: usize,
    },
    /// Interface constraints require a coefficient to equal
    /// both a value and its negative.
    #[error("Interface {interface} has an ambiguous orientation: coefficient {dof} is identified with opposite signs")]
    AmbiguousOrientation {
        /// Index of the interface.
        interface: usize,
        /// Global coefficient index.
        dof: usize,
    },
    /// A coefficient is constrained by more than one non-matching interface.
    #[error("Coefficient {dof} is overconstrained at interface {interface}")]
    Overconstrained {
        /// Index of the interface.
        interface: usize,
        /// Global coefficient index.
        dof: usize,
    },
    /// The two sides of a matching interface have different numbers of trace coefficients.
    #[error("Interface {interface} has {minus} trace coefficients on one side and {plus} on the other")]
    TraceMismatch {
        /// Index of the interface.
        interface: usize,
        /// Coefficients on the minus side.
        minus: usize,
        /// Coefficients on the plus side.
        plus: usize,
    },
    /// A non-matching interface could not be related by knot insertion.
    #[error("Knot insertion failed at interface {interface}: {source}")]
    KnotInsertion {
        /// Index of the interface.
        interface: usize,
        /// The underlying failure.
        #[source]
        source: KnotInsertionError,
    },
    /// The trace space of a non-matching interface could not be built.
    #[error("Invalid trace space at interface {interface}: {source}")]
    TraceSpace {
        /// Index of the interface.
        interface: usize,
        /// The underlying failure.
        #[source]
        source: SplineError,
    },
    /// Periodic traces can only be glued with aligned orientation.
    #[error("Interface {interface} glues periodic traces with reversed orientation")]
    PeriodicReversed {
        /// Index of the interface.
        interface: usize,
    },
    /// The orientation of a patch could not be determined on an interface face.
    #[error("Mapping is degenerate on {face} of interface {interface}")]
    DegenerateFace {
        /// Index of the interface.
        interface: usize,
        /// The face.
        face: PatchFace,
    },
    /// The Gram matrix of the extension could not be inverted.
    #[error("Extension Gram block of size {size} is singular")]
    Singular {
        /// Size of the block.
        size: usize,
    },
    /// Composing the projection failed.
    #[error(transparent)]
    Operator(#[from] OperatorError),
}

/// The projection onto the conforming subspace of a broken space.
#[derive(Clone, Debug)]
pub struct ConformingProjector {
    form_degree: usize,
    homogeneous: bool,
    extension: MatrixOperator,
    projection: MatrixOperator,
    transfers: Vec<Option<KnotInsertionTransfer>>,
}

impl ConformingProjector {
    /// Build the projector of a broken space.
    ///
    /// If `homogeneous` is set, coefficients on Dirichlet boundary faces
    /// (and everything identified with them) are projected to zero.
    pub fn new(
        domain: &MultipatchDomain,
        space: &BrokenSpace,
        homogeneous: bool,
    ) -> Result<Self, ProjectionError> {
        if space.patch_count() != domain.patch_count() {
            return Err(ProjectionError::SpaceMismatch {
                space: space.patch_count(),
                domain: domain.patch_count(),
            });
        }
        let n = space.dim();

        let couplings: Vec<InterfaceCoupling> = domain
            .interfaces()
            .par_iter()
            .enumerate()
            .map(|(idx, iface)| couple_interface(domain, space, idx, iface))
            .collect::<Result<_, _>>()?;

        let mut classes = SignedUnionFind::new(n);
        // fine-side coefficients of non-matching interfaces,
        // with the interface and the coarse combination defining them
        let mut slaves: Vec<Option<(usize, &[(usize, f64)])>> = vec![None; n];
        for (idx, coupling) in couplings.iter().enumerate() {
            for constraint in &coupling.constraints {
                match constraint {
                    Constraint::Equal { a, b, sign } => {
                        if !classes.union(*a, *b, *sign) {
                            return Err(ProjectionError::AmbiguousOrientation {
                                interface: idx,
                                dof: *b,
                            });
                        }
                    }
                    Constraint::Combination { dof, terms } => {
                        if slaves[*dof].is_some() {
                            return Err(ProjectionError::Overconstrained {
                                interface: idx,
                                dof: *dof,
                            });
                        }
                        slaves[*dof] = Some((idx, terms.as_slice()));
                    }
                }
            }
        }

        let roots: Vec<(usize, f64)> = (0..n).map(|i| classes.find(i)).collect();
        let mut class_size = vec![0usize; n];
        for &(root, _) in &roots {
            class_size[root] += 1;
        }

        let mut dropped = fb::FixedBitSet::with_capacity(n);
        if homogeneous {
            for dof in space.dirichlet_dofs(domain).ones() {
                dropped.insert(roots[dof].0);
            }
        }

        // one conforming coefficient per surviving class
        let mut column: Vec<Option<usize>> = vec![None; n];
        let mut conforming_dim = 0;
        for dof in 0..n {
            if slaves[dof].is_none() && roots[dof].0 == dof && !dropped.contains(dof) {
                column[dof] = Some(conforming_dim);
                conforming_dim += 1;
            }
        }

        let mut coo = nas::CooMatrix::new(n, conforming_dim);
        for dof in 0..n {
            match slaves[dof] {
                None => {
                    let (root, sign) = roots[dof];
                    if let Some(col) = column[root] {
                        coo.push(dof, col, sign);
                    }
                }
                Some((interface, terms)) => {
                    if class_size[roots[dof].0] > 1 {
                        return Err(ProjectionError::Overconstrained { interface, dof });
                    }
                    for &(coarse, weight) in terms {
                        if slaves[coarse].is_some() {
                            return Err(ProjectionError::Overconstrained {
                                interface,
                                dof: coarse,
                            });
                        }
                        let (root, sign) = roots[coarse];
                        if let Some(col) = column[root] {
                            coo.push(dof, col, weight * sign);
                        }
                    }
                }
            }
        }
        let extension = MatrixOperator::from(nas::CsrMatrix::from(&coo));

        let ext_t = operator::transpose(&extension);
        let gram = operator::compose(&ext_t, &extension)?;
        let gram_inv = MatrixOperator::from(invert_by_components(gram.csr())?);
        let projection = operator::compose(&operator::compose(&extension, &gram_inv)?, &ext_t)?;

        log::debug!(
            "Built {}conforming projection of {}-forms: {} of {} coefficients are free",
            if homogeneous { "homogeneous " } else { "" },
            space.form_degree(),
            conforming_dim,
            n
        );

        Ok(Self {
            form_degree: space.form_degree(),
            homogeneous,
            extension,
            projection,
            transfers: couplings.into_iter().map(|c| c.transfer).collect(),
        })
    }

    /// The projection matrix.
    #[inline]
    pub fn matrix(&self) -> &MatrixOperator {
        &self.projection
    }

    /// Take the projection matrix, discarding the rest.
    pub fn into_matrix(self) -> MatrixOperator {
        self.projection
    }

    /// The extension from conforming coefficients to broken coefficients,
    /// whose range is the range of the projection.
    #[inline]
    pub fn extension(&self) -> &MatrixOperator {
        &self.extension
    }

    /// Dimension of the conforming subspace.
    #[inline]
    pub fn conforming_dim(&self) -> usize {
        self.extension.ncols()
    }

    /// Degree of the forms projected.
    #[inline]
    pub fn form_degree(&self) -> usize {
        self.form_degree
    }

    /// Whether Dirichlet boundary coefficients are projected to zero.
    #[inline]
    pub fn is_homogeneous(&self) -> bool {
        self.homogeneous
    }

    /// The knot insertion transfer used at a non-matching interface,
    /// from the coarse trace space to the fine one,
    /// both parametrized in the minus side's orientation.
    pub fn interface_transfer(&self, interface: usize) -> Option<&KnotInsertionTransfer> {
        self.transfers.get(interface)?.as_ref()
    }
}

impl Operator for ConformingProjector {
    fn shape(&self) -> (usize, usize) {
        self.projection.shape()
    }

    fn apply(&self, input: &na::DVector<f64>) -> Result<na::DVector<f64>, OperatorError> {
        self.projection.apply(input)
    }

    fn to_csr(&self) -> Option<nas::CsrMatrix<f64>> {
        Some(self.projection.csr().clone())
    }
}

//
// interface constraints
//

enum Constraint {
    /// `value(b) = sign * value(a)`
    Equal { a: usize, b: usize, sign: f64 },
    /// `value(dof) = Σ w value(c)` over `terms = [(c, w)]`
    Combination { dof: usize, terms: Vec<(usize, f64)> },
}

struct InterfaceCoupling {
    constraints: Vec<Constraint>,
    transfer: Option<KnotInsertionTransfer>,
}

fn couple_interface(
    domain: &MultipatchDomain,
    space: &BrokenSpace,
    idx: usize,
    iface: &Interface,
) -> Result<InterfaceCoupling, ProjectionError> {
    let (Some(minus), Some(plus)) = (space.face_trace(iface.minus()), space.face_trace(iface.plus())) else {
        return Ok(InterfaceCoupling {
            constraints: Vec::new(),
            transfer: None,
        });
    };
    let sign = trace_sign(domain, space, idx, iface)?;

    let reversed = iface.orientation() == Orientation::Reversed;
    if reversed && minus.space.is_periodic() {
        return Err(ProjectionError::PeriodicReversed { interface: idx });
    }
    // plus side trace coefficients in order of the minus side's face parameter
    let mut plus_dofs = plus.dofs.clone();
    if reversed {
        plus_dofs.reverse();
    }

    match iface.kind() {
        InterfaceKind::Matching => {
            if minus.dofs.len() != plus_dofs.len() {
                return Err(ProjectionError::TraceMismatch {
                    interface: idx,
                    minus: minus.dofs.len(),
                    plus: plus_dofs.len(),
                });
            }
            let constraints = minus
                .dofs
                .iter()
                .zip(&plus_dofs)
                .map(|(&a, &b)| Constraint::Equal { a, b, sign })
                .collect();
            Ok(InterfaceCoupling {
                constraints,
                transfer: None,
            })
        }
        InterfaceKind::NonMatching { coarse } => {
            let [minus_breaks, plus_breaks] = domain.oriented_interface_breaks(iface);
            let trace_space = |breaks: Vec<f64>, like: &SplineSpace1d| {
                let degree = match like.kind() {
                    BasisKind::B => like.degree(),
                    BasisKind::M => like.degree() + 1,
                };
                let space = SplineSpace1d::new(degree, breaks, like.is_periodic())
                    .map_err(|source| ProjectionError::TraceSpace {
                        interface: idx,
                        source,
                    })?;
                Ok::<_, ProjectionError>(match like.kind() {
                    BasisKind::B => space,
                    BasisKind::M => space.reduced(),
                })
            };
            let minus_side = (trace_space(minus_breaks, &minus.space)?, minus.dofs);
            let plus_side = (trace_space(plus_breaks, &plus.space)?, plus_dofs);
            let ((coarse_space, coarse_dofs), (fine_space, fine_dofs)) = match coarse {
                Side::Minus => (minus_side, plus_side),
                Side::Plus => (plus_side, minus_side),
            };
            for (trace, dofs) in [(&coarse_space, &coarse_dofs), (&fine_space, &fine_dofs)] {
                if trace.nbasis() != dofs.len() {
                    return Err(ProjectionError::TraceMismatch {
                        interface: idx,
                        minus: coarse_dofs.len(),
                        plus: fine_dofs.len(),
                    });
                }
            }

            let transfer = KnotInsertionTransfer::new(&coarse_space, &fine_space).map_err(
                |source| ProjectionError::KnotInsertion {
                    interface: idx,
                    source,
                },
            )?;
            let constraints = transfer
                .matrix()
                .csr()
                .row_iter()
                .enumerate()
                .map(|(f, row)| {
                    let terms: Vec<(usize, f64)> = row
                        .col_indices()
                        .iter()
                        .zip(row.values())
                        .filter(|(_, &w)| w != 0.)
                        .map(|(&c, &w)| (coarse_dofs[c], sign * w))
                        .collect();
                    if let [(c, w)] = terms[..] {
                        if (w.abs() - 1.).abs() < UNIT_ROW_TOL {
                            return Constraint::Equal {
                                a: c,
                                b: fine_dofs[f],
                                sign: w.signum(),
                            };
                        }
                    }
                    Constraint::Combination {
                        dof: fine_dofs[f],
                        terms,
                    }
                })
                .collect();
            Ok(InterfaceCoupling {
                constraints,
                transfer: Some(transfer),
            })
        }
    }
}

/// Sign relating the trace coefficients on the plus side of an interface
/// to those on the minus side.
///
/// Tangential traces of 1-forms flip with the face parameter.
/// Normal traces flip with the outward normals,
/// which point in opposite directions on the two sides.
fn trace_sign(
    domain: &MultipatchDomain,
    space: &BrokenSpace,
    idx: usize,
    iface: &Interface,
) -> Result<f64, ProjectionError> {
    match (space.form_degree(), space.sequence()) {
        (0, _) => Ok(1.),
        (_, SequenceKind::Hcurl) => Ok(iface.orientation().sign()),
        (_, SequenceKind::Hdiv) => {
            let outward = |face: PatchFace| {
                let det = face_jacobian_det(domain, face);
                if det.abs() < DEGENERATE_JACOBIAN_TOL || det.is_nan() {
                    return Err(ProjectionError::DegenerateFace {
                        interface: idx,
                        face,
                    });
                }
                Ok(face.ext.sign() * det.signum())
            };
            Ok(-outward(iface.minus())? * outward(iface.plus())?)
        }
    }
}

/// Jacobian determinant of a patch mapping at the midpoint of a face.
fn face_jacobian_det(domain: &MultipatchDomain, face: PatchFace) -> f64 {
    let spaces = domain.patch_spaces(face.patch);
    let (start, end) = spaces[face.axis].interval();
    let (t0, t1) = spaces[face.tangent_axis()].interval();
    let mut point = na::Vector2::zeros();
    point[face.axis] = match face.ext {
        Extremity::Start => start,
        Extremity::End => end,
    };
    point[face.tangent_axis()] = 0.5 * (t0 + t1);
    domain.patch(face.patch).mapping().jacobian(point).determinant()
}

//
// classes of identified coefficients
//

/// Union-find over coefficients where every element
/// stores its value relative to its parent as a sign.
struct SignedUnionFind {
    parent: Vec<usize>,
    /// `value(i) = sign[i] * value(parent[i])`
    sign: Vec<f64>,
}

impl SignedUnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            sign: vec![1.; n],
        }
    }

    /// The root of `i` and the sign `s` with `value(i) = s * value(root)`.
    fn find(&mut self, i: usize) -> (usize, f64) {
        let mut root = i;
        let mut total = 1.;
        while self.parent[root] != root {
            total *= self.sign[root];
            root = self.parent[root];
        }
        // compress the path
        let mut node = i;
        let mut node_sign = total;
        while self.parent[node] != root && node != root {
            let next = self.parent[node];
            let next_sign = node_sign * self.sign[node];
            self.parent[node] = root;
            self.sign[node] = node_sign;
            node = next;
            node_sign = next_sign;
        }
        (root, total)
    }

    /// Require `value(b) = sign * value(a)`.
    /// Returns false if this contradicts earlier requirements.
    fn union(&mut self, a: usize, b: usize, sign: f64) -> bool {
        let (ra, sa) = self.find(a);
        let (rb, sb) = self.find(b);
        if ra == rb {
            return sb == sign * sa;
        }
        // value(rb) = sign * sa * sb * value(ra), and symmetrically
        let rel = sign * sa * sb;
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[child] = root;
        self.sign[child] = rel;
        true
    }
}

/// Invert a symmetric positive definite matrix
/// one connected component of its sparsity graph at a time.
fn invert_by_components(gram: &nas::CsrMatrix<f64>) -> Result<nas::CsrMatrix<f64>, ProjectionError> {
    let n = gram.nrows();
    let mut components = SignedUnionFind::new(n);
    for (i, j, _) in gram.triplet_iter() {
        components.union(i, j, 1.);
    }
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        let (root, _) = components.find(i);
        members[root].push(i);
    }

    let blocks: Vec<Vec<(usize, usize, f64)>> = members
        .par_iter()
        .filter(|m| !m.is_empty())
        .map(|idx| {
            let mut dense = na::DMatrix::zeros(idx.len(), idx.len());
            for (a, &i) in idx.iter().enumerate() {
                let row = gram.row(i);
                for (&j, &v) in row.col_indices().iter().zip(row.values()) {
                    if let Ok(b) = idx.binary_search(&j) {
                        dense[(a, b)] = v;
                    }
                }
            }
            let inv = dense
                .cholesky()
                .ok_or(ProjectionError::Singular { size: idx.len() })?
                .inverse();
            let mut entries = Vec::with_capacity(idx.len() * idx.len());
            for (a, &i) in idx.iter().enumerate() {
                for (b, &j) in idx.iter().enumerate() {
                    entries.push((i, j, inv[(a, b)]));
                }
            }
            Ok(entries)
        })
        .collect::<Result<_, ProjectionError>>()?;

    let mut coo = nas::CooMatrix::new(n, n);
    for (i, j, v) in blocks.into_iter().flatten() {
        coo.push(i, j, v);
    }
    Ok(nas::CsrMatrix::from(&coo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mapping::AffineMapping,
        topology::{domains, DomainBuilder, Patch},
    };
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};

    fn random_vector(n: usize, seed: u64) -> na::DVector<f64> {
        let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
        na::DVector::from_fn(n, |_, _| rng.gen_range(-1.0..1.0))
    }

    fn sample_params() -> impl Iterator<Item = f64> {
        (0..=23).map(|i| i as f64 / 23.)
    }

    /// Two unit squares glued along x = 1,
    /// the second one mapped with both logical axes reversed.
    fn reversed_pair() -> MultipatchDomain {
        DomainBuilder::new("reversed_pair")
            .patch(Patch::new("a", [2, 3], [3, 4]))
            .patch(Patch::new("b", [2, 3], [3, 4]).with_mapping(AffineMapping {
                origin: na::Vector2::new(2., 1.),
                extent: na::Vector2::new(-1., -1.),
            }))
            .interface(
                PatchFace::new(0, 0, Extremity::End),
                PatchFace::new(1, 0, Extremity::End),
                Orientation::Reversed,
            )
            .build()
            .unwrap()
    }

    #[test]
    fn homogeneous_projection_of_constant_on_single_patch() {
        let domain = DomainBuilder::new("single")
            .patch(Patch::new("p", [3, 3], [4, 4]))
            .build()
            .unwrap();
        let v0 = BrokenSpace::new(&domain, SequenceKind::Hcurl, 0).unwrap();
        let proj = ConformingProjector::new(&domain, &v0, true).unwrap();
        let boundary = v0.dirichlet_dofs(&domain);
        let ones = na::DVector::from_element(v0.dim(), 1.);
        let projected = proj.apply(&ones).unwrap();
        for (i, &v) in projected.iter().enumerate() {
            if boundary.contains(i) {
                assert_eq!(v, 0.);
            } else {
                assert_eq!(v, 1.);
            }
        }
        assert!(proj.is_homogeneous());
        assert_eq!(proj.conforming_dim(), 5 * 5);
    }

    #[test]
    fn matching_averages_interface_coefficients() {
        let domain = domains::two_patch(2, [3, 3]).unwrap();
        let v0 = BrokenSpace::new(&domain, SequenceKind::Hcurl, 0).unwrap();
        let proj = ConformingProjector::new(&domain, &v0, false).unwrap();
        let iface = &domain.interfaces()[0];
        let minus = v0.face_trace(iface.minus()).unwrap().dofs;
        let plus = v0.face_trace(iface.plus()).unwrap().dofs;

        let mut x = na::DVector::zeros(v0.dim());
        x[minus[2]] = 1.;
        x[plus[2]] = 3.;
        let y = proj.apply(&x).unwrap();
        assert_relative_eq!(y[minus[2]], 2., epsilon = 1e-15);
        assert_relative_eq!(y[plus[2]], 2., epsilon = 1e-15);
        assert_eq!(y.iter().filter(|v| **v != 0.).count(), 2);
        assert_eq!(proj.conforming_dim(), v0.dim() - minus.len());
        assert!(proj.interface_transfer(0).is_none());
    }

    #[test]
    fn projected_fields_are_continuous_across_reversed_interfaces() {
        let domain = reversed_pair();
        for (sequence, k) in [
            (SequenceKind::Hcurl, 0),
            (SequenceKind::Hcurl, 1),
            (SequenceKind::Hdiv, 1),
        ] {
            let space = BrokenSpace::new(&domain, sequence, k).unwrap();
            let proj = ConformingProjector::new(&domain, &space, false).unwrap();
            let y = proj.apply(&random_vector(space.dim(), 7)).unwrap();
            for t in sample_params() {
                let a = space.eval(&y, 0, na::Vector2::new(1., t));
                let b = space.eval(&y, 1, na::Vector2::new(1., 1. - t));
                // both mappings have unit Jacobian determinant,
                // the second one negating both logical directions
                match (k, sequence) {
                    (0, _) => assert_relative_eq!(a[0], b[0], epsilon = 1e-12),
                    (_, SequenceKind::Hcurl) => assert_relative_eq!(a[1], -b[1], epsilon = 1e-12),
                    (_, SequenceKind::Hdiv) => assert_relative_eq!(a[0], -b[0], epsilon = 1e-12),
                }
            }
        }
    }

    #[test]
    fn projected_fields_are_continuous_across_non_matching_interfaces() {
        let domain = domains::two_patch(2, [2, 6]).unwrap();
        assert!(matches!(
            domain.interfaces()[0].kind(),
            InterfaceKind::NonMatching { coarse: Side::Minus }
        ));
        for (sequence, k, comp) in [
            (SequenceKind::Hcurl, 0, 0),
            (SequenceKind::Hcurl, 1, 1),
            (SequenceKind::Hdiv, 1, 0),
        ] {
            let space = BrokenSpace::new(&domain, sequence, k).unwrap();
            let proj = ConformingProjector::new(&domain, &space, false).unwrap();
            assert!(proj.interface_transfer(0).is_some());
            let y = proj.apply(&random_vector(space.dim(), 11)).unwrap();
            for t in sample_params() {
                let a = space.eval(&y, 0, na::Vector2::new(1., t));
                let b = space.eval(&y, 1, na::Vector2::new(0., t));
                assert_relative_eq!(a[comp], b[comp], epsilon = 1e-11);
            }
        }
    }

    #[test]
    fn corners_of_the_l_shape_are_shared() {
        let domain = domains::l_shape(2, 2).unwrap();
        let v0 = BrokenSpace::new(&domain, SequenceKind::Hcurl, 0).unwrap();
        let proj = ConformingProjector::new(&domain, &v0, false).unwrap();
        // the reentrant corner is shared by all three patches
        let corner_dofs: Vec<usize> = (0..3)
            .map(|p| {
                let ends = v0.components(p)[0].shape().map(|n| n - 1);
                let origin = domain.patch(p).mapping().eval(na::Vector2::zeros());
                let idx = [0, 1].map(|a| if origin[a] < 0. { ends[a] } else { 0 });
                v0.global_index(p, 0, idx[0], idx[1])
            })
            .collect();
        let mut x = na::DVector::zeros(v0.dim());
        x[corner_dofs[0]] = 3.;
        let y = proj.apply(&x).unwrap();
        for dof in corner_dofs {
            assert_relative_eq!(y[dof], 1., epsilon = 1e-14);
        }
    }

    #[test]
    fn constant_prolongs_exactly_across_four_to_eight_cells() {
        let domain = domains::two_patch(3, [4, 8]).unwrap();
        let v0 = BrokenSpace::new(&domain, SequenceKind::Hcurl, 0).unwrap();
        let proj = ConformingProjector::new(&domain, &v0, false).unwrap();
        let transfer = proj.interface_transfer(0).unwrap();

        let coarse = SplineSpace1d::uniform(3, 4, false).unwrap();
        let fine = SplineSpace1d::uniform(3, 8, false).unwrap();
        let prolonged = transfer.prolong(&na::DVector::from_element(coarse.nbasis(), 1.));
        assert_eq!(prolonged.len(), fine.nbasis());
        for t in sample_params() {
            assert!((fine.eval(prolonged.as_slice(), t) - 1.).abs() < 1e-12);
        }

        // constants are conforming
        let ones = na::DVector::from_element(v0.dim(), 1.);
        let projected = proj.apply(&ones).unwrap();
        assert_relative_eq!(projected, ones, epsilon = 1e-12);
        for t in sample_params() {
            let fine_side = v0.eval(&projected, 1, na::Vector2::new(0., t));
            assert!((fine_side[0] - 1.).abs() < 1e-12);
        }
    }

    #[test]
    fn two_forms_are_unconstrained() {
        let domain = domains::l_shape(2, 3).unwrap();
        let v2 = BrokenSpace::new(&domain, SequenceKind::Hdiv, 2).unwrap();
        let proj = ConformingProjector::new(&domain, &v2, true).unwrap();
        let x = random_vector(v2.dim(), 3);
        assert_eq!(proj.apply(&x).unwrap(), x);
    }

    #[test]
    fn conflicting_signs_are_detected() {
        let mut classes = SignedUnionFind::new(4);
        assert!(classes.union(0, 1, 1.));
        assert!(classes.union(1, 2, -1.));
        assert!(classes.union(3, 2, 1.));
        assert_eq!(classes.find(3), (0, -1.));
        assert!(classes.union(0, 3, -1.));
        assert!(!classes.union(0, 2, 1.));
    }

    #[test]
    fn non_nested_breakpoints_fail_at_build_time() {
        let result = DomainBuilder::new("bad")
            .patch(Patch::new("a", [2, 2], [3, 3]))
            .patch(Patch::new("b", [2, 2], [2, 2]).with_mapping(AffineMapping::rectangle((1., 2.), (0., 1.))))
            .interface(
                PatchFace::new(0, 0, Extremity::End),
                PatchFace::new(1, 0, Extremity::Start),
                Orientation::Aligned,
            )
            .build();
        assert!(result.is_err());
    }

    fn projection_cases() -> Vec<(MultipatchDomain, SequenceKind)> {
        vec![
            (domains::l_shape(2, 2).unwrap(), SequenceKind::Hcurl),
            (domains::two_patch(2, [2, 4]).unwrap(), SequenceKind::Hdiv),
            (domains::annulus([2, 2], [2, 3], 3, (0.5, 1.)).unwrap(), SequenceKind::Hcurl),
            (reversed_pair(), SequenceKind::Hdiv),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn projection_is_idempotent_and_symmetric(
            case in 0usize..4,
            k in 0usize..3,
            homogeneous in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let (domain, sequence) = projection_cases().swap_remove(case);
            let space = BrokenSpace::new(&domain, sequence, k).unwrap();
            let proj = ConformingProjector::new(&domain, &space, homogeneous).unwrap();
            let x = random_vector(space.dim(), seed);
            let px = proj.apply(&x).unwrap();
            let ppx = proj.apply(&px).unwrap();
            prop_assert!((&ppx - &px).amax() < 1e-12);

            let y = random_vector(space.dim(), seed.wrapping_add(1));
            let py = proj.apply(&y).unwrap();
            prop_assert!((px.dot(&y) - x.dot(&py)).abs() < 1e-11);
        }
    }
}
