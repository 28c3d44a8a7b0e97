//! The discrete de Rham sequence of a multipatch domain
//! and the CONGA operators built from it.
//!
//! All operators are assembled lazily on first use and kept
//! for the lifetime of the [`DiscreteDeRham`],
//! optionally going through an [`OperatorCache`].

use itertools::Itertools;
use nalgebra as na;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

use crate::{
    assembly::{AssemblyError, BrokenAssembler},
    cache::OperatorCache,
    conforming::ConformingProjector,
    hodge::{self, HodgeOperator, HodgeParams},
    linalg::{IterativeParams, LinearSolver},
    operator::{self, ComposedOperator, MatrixOperator, Operator, OperatorError},
    space::{BrokenSpace, SequenceKind},
    topology::{MultipatchDomain, PatchFace},
    Error,
};

/// Parameters of a discretization.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscretizationParams {
    /// Which de Rham sequence to discretize.
    pub sequence: SequenceKind,
    /// Gauss points per axis and cell in mass assembly.
    /// `None` uses the patch degree plus two.
    pub quad_points: Option<usize>,
    /// How mass matrices are inverted.
    pub hodge: HodgeParams,
    /// Largest system solved with a dense factorization in [`DiscreteDeRham::solve_source`].
    pub solver_direct_max: usize,
    /// Parameters of iterative source solves.
    pub solver: IterativeParams,
}

impl Default for DiscretizationParams {
    fn default() -> Self {
        Self {
            sequence: SequenceKind::default(),
            quad_points: None,
            hodge: HodgeParams::default(),
            solver_direct_max: 3000,
            solver: IterativeParams::default(),
        }
    }
}

/// Coefficients of the static source problem
/// `(CC + gamma_h JP + eta M) x = Pᵀ b`
/// solved by [`DiscreteDeRham::solve_source`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceParams {
    /// Weight of the jump penalization.
    pub gamma_h: f64,
    /// Weight of the mass term.
    pub eta: f64,
    /// Whether to impose homogeneous Dirichlet conditions.
    pub homogeneous: bool,
}

impl Default for SourceParams {
    fn default() -> Self {
        Self {
            gamma_h: 10.,
            eta: 0.,
            homogeneous: true,
        }
    }
}

/// Solution of a static source problem.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceSolution {
    /// The conforming solution `P x`.
    pub coeffs: na::DVector<f64>,
    /// The broken solution `x` of the penalized system.
    pub broken: na::DVector<f64>,
}

/// Solution of the magnetostatic problem
/// solved by [`DiscreteDeRham::solve_magnetostatic`].
#[derive(Clone, Debug, PartialEq)]
pub struct MagnetostaticSolution {
    /// The conforming field.
    pub field: na::DVector<f64>,
    /// The discrete harmonic field, of unit norm in the 1-form mass.
    pub harmonic: na::DVector<f64>,
    /// Component of `field` along `harmonic`.
    pub harmonic_coefficient: f64,
}

/// The operator pair driving time-domain Maxwell problems.
#[derive(Clone)]
pub struct MaxwellOperators {
    /// Weak curl from 2-forms to 1-forms, `M1⁻¹ (D1 P1)ᵀ M2`.
    pub ampere: Arc<dyn Operator>,
    /// Strong curl from 1-forms to 2-forms, `D1 P1`.
    pub faraday: Arc<dyn Operator>,
}

/// Broken spaces of 0-, 1- and 2-forms on a domain
/// together with their (memoized) operators.
pub struct DiscreteDeRham<'a> {
    domain: &'a MultipatchDomain,
    params: DiscretizationParams,
    cache: Option<&'a OperatorCache>,
    cache_key: String,
    spaces: [BrokenSpace; 3],
    masses: [OnceLock<MatrixOperator>; 3],
    hodges: [OnceLock<HodgeOperator>; 3],
    derivatives: [OnceLock<MatrixOperator>; 2],
    // indexed by [form degree][homogeneous as usize]
    projections: [[OnceLock<MatrixOperator>; 2]; 3],
}

impl std::fmt::Debug for DiscreteDeRham<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscreteDeRham")
            .field("key", &self.cache_key)
            .field("dims", &self.spaces.iter().map(|s| s.dim()).collect::<Vec<_>>())
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

/// Get a memoized value or build it.
fn memo<T>(lock: &OnceLock<T>, build: impl FnOnce() -> Result<T, Error>) -> Result<&T, Error> {
    if let Some(value) = lock.get() {
        return Ok(value);
    }
    let value = build()?;
    Ok(lock.get_or_init(|| value))
}

impl<'a> DiscreteDeRham<'a> {
    /// Set up the discrete sequence of a domain.
    /// No operators are assembled yet.
    pub fn new(domain: &'a MultipatchDomain, params: DiscretizationParams) -> Result<Self, Error> {
        let spaces = [
            BrokenSpace::new(domain, params.sequence, 0)?,
            BrokenSpace::new(domain, params.sequence, 1)?,
            BrokenSpace::new(domain, params.sequence, 2)?,
        ];
        let quad = params
            .quad_points
            .map_or_else(|| "auto".to_string(), |q| q.to_string());
        let cache_key = format!(
            "{}_{}_q{}",
            domain.descriptor(),
            params.sequence.name(),
            quad
        );
        log::info!(
            "Discretized {:?} with {} dofs in the {} sequence",
            domain.name(),
            spaces.iter().map(|s| s.dim()).join("/"),
            params.sequence.name()
        );
        Ok(Self {
            domain,
            params,
            cache: None,
            cache_key,
            spaces,
            masses: Default::default(),
            hodges: Default::default(),
            derivatives: Default::default(),
            projections: Default::default(),
        })
    }

    /// Store and look up assembled matrices in a cache.
    pub fn with_cache(mut self, cache: &'a OperatorCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The domain.
    #[inline]
    pub fn domain(&self) -> &'a MultipatchDomain {
        self.domain
    }

    /// The parameters in use.
    #[inline]
    pub fn params(&self) -> &DiscretizationParams {
        &self.params
    }

    /// The key identifying this discretization in a cache.
    #[inline]
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// The broken space of k-forms.
    pub fn space(&self, k: usize) -> Result<&BrokenSpace, Error> {
        self.spaces.get(k).ok_or(Error::FormDegree(k))
    }

    fn cached(
        &self,
        artifact: String,
        shape: (usize, usize),
        build: impl FnOnce() -> Result<MatrixOperator, Error>,
    ) -> Result<MatrixOperator, Error> {
        match self.cache {
            Some(cache) => cache.load_or_build(&self.cache_key, &artifact, shape, build),
            None => build(),
        }
    }

    fn assembler(&self) -> BrokenAssembler<'a> {
        let assembler = BrokenAssembler::new(self.domain);
        match self.params.quad_points {
            Some(q) => assembler.with_quadrature_points(q),
            None => assembler,
        }
    }

    /// The broken mass matrix of k-forms.
    pub fn mass(&self, k: usize) -> Result<&MatrixOperator, Error> {
        let space = self.space(k)?;
        memo(&self.masses[k], || {
            self.cached(format!("mass{k}"), (space.dim(), space.dim()), || {
                Ok(self.assembler().mass(space)?)
            })
        })
    }

    /// The Hodge operator (mass matrix and its inverse) of k-forms.
    pub fn hodge(&self, k: usize) -> Result<&HodgeOperator, Error> {
        let space = self.space(k)?;
        memo(&self.hodges[k], || {
            let mass = self.mass(k)?.clone();
            if !self.params.hodge.uses_exact_dual(space) {
                return Ok(HodgeOperator::new(mass, space, &self.params.hodge)?);
            }
            let dual = self.cached(format!("dual_mass{k}"), mass.shape(), || {
                Ok(hodge::exact_dual(&mass, space)?)
            })?;
            Ok(HodgeOperator::with_exact_dual(mass, dual)?)
        })
    }

    /// The inverse mass matrix of k-forms as an operator.
    pub fn dual_mass(&self, k: usize) -> Result<Arc<dyn Operator>, Error> {
        Ok(self.hodge(k)?.dual())
    }

    /// The broken exterior derivative from k-forms to (k+1)-forms.
    pub fn derivative(&self, k: usize) -> Result<&MatrixOperator, Error> {
        let space = self.space(k)?;
        let target = self
            .spaces
            .get(k + 1)
            .ok_or(AssemblyError::NoDerivative(k))?;
        memo(&self.derivatives[k], || {
            self.cached(format!("derivative{k}"), (target.dim(), space.dim()), || {
                Ok(self.assembler().derivative(space)?)
            })
        })
    }

    /// The projection onto conforming k-forms,
    /// zeroing Dirichlet boundary values if `homogeneous` is set.
    ///
    /// Built once per flag and reused afterwards.
    pub fn conforming_projection(&self, k: usize, homogeneous: bool) -> Result<&MatrixOperator, Error> {
        let space = self.space(k)?;
        let suffix = if homogeneous { "_hom" } else { "" };
        memo(&self.projections[k][homogeneous as usize], || {
            self.cached(
                format!("projection{k}{suffix}"),
                (space.dim(), space.dim()),
                || Ok(ConformingProjector::new(self.domain, space, homogeneous)?.into_matrix()),
            )
        })
    }

    /// The CONGA derivative `D_k P_k`.
    pub fn conga_derivative(&self, k: usize, homogeneous: bool) -> Result<MatrixOperator, Error> {
        Ok(operator::compose(
            self.derivative(k)?,
            self.conforming_projection(k, homogeneous)?,
        )?)
    }

    /// The stiffness matrix `(D1 P1)ᵀ M2 (D1 P1)`,
    /// curl-curl in the H(curl) sequence and div-div in the H(div) sequence.
    pub fn curl_curl(&self, homogeneous: bool) -> Result<MatrixOperator, Error> {
        let dp = self.conga_derivative(1, homogeneous)?;
        let weak = operator::compose(&operator::transpose(&dp), self.mass(2)?)?;
        Ok(operator::compose(&weak, &dp)?)
    }

    /// The stiffness matrix `(D1 P1_hom)ᵀ M2 (D1 P1)`
    /// that lifts non-homogeneous boundary data into a homogeneous problem.
    pub fn curl_curl_lifting(&self) -> Result<MatrixOperator, Error> {
        let dp_hom = self.conga_derivative(1, true)?;
        let dp = self.conga_derivative(1, false)?;
        let weak = operator::compose(&operator::transpose(&dp_hom), self.mass(2)?)?;
        Ok(operator::compose(&weak, &dp)?)
    }

    /// The jump penalization `(I - P_k)ᵀ M_k (I - P_k)`,
    /// which vanishes exactly on conforming fields.
    pub fn jump_penalization(&self, k: usize, homogeneous: bool) -> Result<MatrixOperator, Error> {
        let proj = self.conforming_projection(k, homogeneous)?;
        let jump = &operator::identity(proj.nrows()) - proj;
        let weighted = operator::compose(&operator::transpose(&jump), self.mass(k)?)?;
        Ok(operator::compose(&weighted, &jump)?)
    }

    /// The weak divergence `(D0 P0)ᵀ M1` of 1-forms,
    /// whose norm measures how far a field is from being divergence-free.
    pub fn weak_divergence(&self, homogeneous: bool) -> Result<MatrixOperator, Error> {
        let dp = self.conga_derivative(0, homogeneous)?;
        Ok(operator::compose(&operator::transpose(&dp), self.mass(1)?)?)
    }

    /// The operator `-P1ᵀ M1 D0 P0 M0⁻¹ P0ᵀ D0ᵀ M1 P1` on 1-forms.
    ///
    /// Explicit if the 0-form mass has an explicit inverse,
    /// otherwise a lazy composition.
    pub fn grad_div(&self, homogeneous: bool) -> Result<Arc<dyn Operator>, Error> {
        let p1 = self.conforming_projection(1, homogeneous)?;
        // L = P1ᵀ M1 D0 P0
        let left = operator::compose(
            &operator::compose(&operator::transpose(p1), self.mass(1)?)?,
            &self.conga_derivative(0, homogeneous)?,
        )?;
        let right = operator::transpose(&left);
        let hodge = self.hodge(0)?;
        match hodge.dual_matrix() {
            Some(inv) => {
                let product = operator::compose(&operator::compose(&left, inv)?, &right)?;
                Ok(Arc::new(-1. * product))
            }
            None => Ok(Arc::new(ComposedOperator::new(vec![
                Arc::new(-1. * left) as Arc<dyn Operator>,
                hodge.dual(),
                Arc::new(right),
            ])?)),
        }
    }

    /// The Ampère and Faraday operators of the semi-discrete Maxwell system
    /// `dD/dt = ampere B - J`, `dB/dt = -faraday D`.
    pub fn maxwell_evolution(&self, homogeneous: bool) -> Result<MaxwellOperators, Error> {
        let faraday = self.conga_derivative(1, homogeneous)?;
        let weak_curl = operator::compose(&operator::transpose(&faraday), self.mass(2)?)?;
        let hodge = self.hodge(1)?;
        let ampere: Arc<dyn Operator> = match hodge.dual_matrix() {
            Some(inv) => Arc::new(operator::compose(inv, &weak_curl)?),
            None => Arc::new(ComposedOperator::new(vec![
                hodge.dual(),
                Arc::new(weak_curl) as Arc<dyn Operator>,
            ])?),
        };
        Ok(MaxwellOperators {
            ampere,
            faraday: Arc::new(faraday),
        })
    }

    /// Solve the penalized static problem `(CC + gamma_h JP + eta M1) x = P1ᵀ b`
    /// for a 1-form right-hand side `b` given as inner products with the broken basis.
    pub fn solve_source(
        &self,
        rhs: &na::DVector<f64>,
        source: &SourceParams,
    ) -> Result<SourceSolution, Error> {
        let dim = self.space(1)?.dim();
        if rhs.len() != dim {
            return Err(OperatorError::InputLength {
                shape: (dim, dim),
                len: rhs.len(),
            }
            .into());
        }
        let hom = source.homogeneous;
        let mut system = self.curl_curl(hom)?;
        if source.gamma_h != 0. {
            system = &system + &(source.gamma_h * self.jump_penalization(1, hom)?);
        }
        if source.eta != 0. {
            system = &system + &(source.eta * self.mass(1)?.clone());
        }

        let proj = self.conforming_projection(1, hom)?;
        let tested = operator::transpose(proj).mul_vec(rhs);
        let solver = LinearSolver::new(
            system.csr(),
            self.params.solver_direct_max,
            &self.params.solver,
        )?;
        log::info!(
            "Solving source problem with {} dofs ({})",
            dim,
            if solver.is_direct() { "direct" } else { "iterative" }
        );
        let broken = solver.solve(&tested)?;
        Ok(SourceSolution {
            coeffs: proj.mul_vec(&broken),
            broken,
        })
    }

    /// Solve the magnetostatic problem on a domain with one hole.
    ///
    /// Finds the conforming homogeneous 1-form `B` with `D1 B = 0`
    /// and `(B, D0 τ) = ⟨j, τ⟩` for all conforming homogeneous 0-forms `τ`,
    /// where `j` is given as inner products with the broken 0-form basis.
    /// These leave the harmonic part of `B` free;
    /// it is fixed by `trace_integral`,
    /// the integral of `B` over the boundary component made up of `outer`.
    ///
    /// In the H(div) sequence this is `div B = 0` and `curl B = J` with `B·n = 0`,
    /// and `trace_integral` is the counterclockwise circulation of `B` along `outer`.
    /// In the H(curl) sequence it is `curl B = 0` and `-div B = J` with `B·t = 0`,
    /// and `trace_integral` is the outward flux of `B` through `outer`.
    pub fn solve_magnetostatic(
        &self,
        j: &na::DVector<f64>,
        outer: &[PatchFace],
        trace_integral: f64,
    ) -> Result<MagnetostaticSolution, Error> {
        let space0 = self.space(0)?;
        let n0 = space0.dim();
        if j.len() != n0 {
            return Err(OperatorError::InputLength {
                shape: (n0, n0),
                len: j.len(),
            }
            .into());
        }

        // conforming 0-form equal to one on `outer`
        // and zero on the rest of the boundary
        let mut cut = na::DVector::zeros(n0);
        for &face in outer {
            if !self.domain.boundaries().iter().any(|b| b.face == face) {
                return Err(Error::NotBoundaryFace(face));
            }
            if let Some(trace) = space0.face_trace(face) {
                for dof in trace.dofs {
                    cut[dof] = 1.;
                }
            }
        }
        let psi = self.conforming_projection(0, false)?.mul_vec(&cut);
        let cut_field = self
            .conforming_projection(1, true)?
            .mul_vec(&self.derivative(0)?.mul_vec(&psi));
        let closed_defect = self.conga_derivative(1, true)?.mul_vec(&cut_field).amax();
        if closed_defect > 1e-8 * cut_field.amax() {
            // `outer` is not a whole boundary component
            return Err(Error::NoHarmonicField);
        }

        let grad = self.conga_derivative(0, true)?;
        let m1 = self.mass(1)?;
        let weak_div = operator::compose(&operator::transpose(&grad), m1)?;
        let laplacian = &operator::compose(&weak_div, &grad)? + &self.jump_penalization(0, true)?;
        let solver = LinearSolver::new(
            laplacian.csr(),
            self.params.solver_direct_max,
            &self.params.solver,
        )?;
        log::info!(
            "Solving magnetostatic problem with {} potential dofs ({})",
            n0,
            if solver.is_direct() { "direct" } else { "iterative" }
        );

        let p0 = self.conforming_projection(0, true)?;
        let potential = solver.solve(&operator::transpose(p0).mul_vec(j))?;
        let exact = grad.mul_vec(&potential);

        // the harmonic field is what remains of the cut field
        // after removing its component along conforming gradients
        let cut_potential = solver.solve(&weak_div.mul_vec(&cut_field))?;
        let mut harmonic = &cut_field - grad.mul_vec(&cut_potential);
        let m1_cut = m1.mul_vec(&cut_field);
        let norm_sq = harmonic.dot(&m1.mul_vec(&harmonic));
        if norm_sq <= 1e-12 * cut_field.dot(&m1_cut) {
            return Err(Error::NoHarmonicField);
        }
        harmonic /= norm_sq.sqrt();

        // integrating by parts against the cut function gives
        // (B, D0 ψ) = ⟨j, ψ⟩ plus the boundary term
        let boundary_term = match self.params.sequence {
            SequenceKind::Hcurl => trace_integral,
            SequenceKind::Hdiv => -trace_integral,
        };
        let target = j.dot(&psi) + boundary_term;
        let harmonic_coefficient = (target - exact.dot(&m1_cut)) / harmonic.dot(&m1_cut);
        log::debug!("Harmonic coefficient {harmonic_coefficient:e}");

        Ok(MagnetostaticSolution {
            field: exact + &harmonic * harmonic_coefficient,
            harmonic,
            harmonic_coefficient,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{domains, Extremity};
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};

    fn random_vector(n: usize, seed: u64) -> na::DVector<f64> {
        let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
        na::DVector::from_fn(n, |_, _| rng.gen_range(-1.0..1.0))
    }

    fn test_domains() -> Vec<MultipatchDomain> {
        vec![
            domains::l_shape(2, 2).unwrap(),
            domains::two_patch(2, [2, 4]).unwrap(),
            domains::annulus([2, 3], [2, 4], 3, (0.5, 1.)).unwrap(),
        ]
    }

    #[test]
    fn conga_derivatives_form_a_complex() {
        for domain in test_domains() {
            for sequence in [SequenceKind::Hcurl, SequenceKind::Hdiv] {
                let derham = DiscreteDeRham::new(
                    &domain,
                    DiscretizationParams {
                        sequence,
                        ..Default::default()
                    },
                )
                .unwrap();
                for hom in [false, true] {
                    let d0 = derham.conga_derivative(0, hom).unwrap();
                    let d1 = derham.conga_derivative(1, hom).unwrap();
                    let x = random_vector(derham.space(0).unwrap().dim(), 5);
                    let grad = d0.mul_vec(&x);
                    assert!(grad.amax() > 1e-3);
                    // conforming gradients are conforming
                    let p1 = derham.conforming_projection(1, hom).unwrap();
                    assert!((p1.mul_vec(&grad) - &grad).amax() < 1e-10);
                    assert!(d1.mul_vec(&grad).amax() < 1e-10);
                }
            }
        }
    }

    #[test]
    fn operators_are_memoized() {
        let domain = domains::l_shape(2, 2).unwrap();
        let derham = DiscreteDeRham::new(&domain, DiscretizationParams::default()).unwrap();
        let first = derham.conforming_projection(1, true).unwrap() as *const MatrixOperator;
        let second = derham.conforming_projection(1, true).unwrap() as *const MatrixOperator;
        assert_eq!(first, second);
        let non_hom = derham.conforming_projection(1, false).unwrap() as *const MatrixOperator;
        assert_ne!(first, non_hom);
    }

    #[test]
    fn cached_operators_are_identical() {
        let dir = tempfile::tempdir().unwrap();
        let cache = OperatorCache::new(dir.path()).unwrap();
        let domain = domains::two_patch(2, [2, 4]).unwrap();

        let built = DiscreteDeRham::new(&domain, DiscretizationParams::default())
            .unwrap()
            .with_cache(&cache);
        let mass = built.mass(1).unwrap().clone();
        let dual = built.hodge(1).unwrap().dual_matrix().unwrap().clone();
        let proj = built.conforming_projection(1, true).unwrap().clone();
        let deriv = built.derivative(0).unwrap().clone();
        for artifact in ["mass1", "dual_mass1", "projection1_hom", "derivative0"] {
            assert!(cache.contains(built.cache_key(), artifact));
        }

        let loaded = DiscreteDeRham::new(&domain, DiscretizationParams::default())
            .unwrap()
            .with_cache(&cache);
        assert_eq!(loaded.cache_key(), built.cache_key());
        assert_eq!(loaded.mass(1).unwrap(), &mass);
        assert_eq!(loaded.hodge(1).unwrap().dual_matrix().unwrap(), &dual);
        assert_eq!(loaded.conforming_projection(1, true).unwrap(), &proj);
        assert_eq!(loaded.derivative(0).unwrap(), &deriv);

        // a different discretization gets a different key
        let other = DiscreteDeRham::new(
            &domain,
            DiscretizationParams {
                sequence: SequenceKind::Hdiv,
                ..Default::default()
            },
        )
        .unwrap();
        assert_ne!(other.cache_key(), built.cache_key());
    }

    #[test]
    fn curl_curl_annihilates_gradients() {
        let domain = domains::l_shape(2, 3).unwrap();
        let derham = DiscreteDeRham::new(&domain, DiscretizationParams::default()).unwrap();
        let cc = derham.curl_curl(true).unwrap();
        let dense = crate::nas::convert::serial::convert_csr_dense(cc.csr());
        assert_relative_eq!(dense, dense.transpose(), epsilon = 1e-12);

        let x = random_vector(derham.space(0).unwrap().dim(), 1);
        let grad = derham.conga_derivative(0, true).unwrap().mul_vec(&x);
        assert!(cc.mul_vec(&grad).amax() < 1e-10);

        let y = random_vector(derham.space(1).unwrap().dim(), 2);
        assert!(y.dot(&cc.mul_vec(&y)) >= -1e-12);

        let lifting = derham.curl_curl_lifting().unwrap();
        assert_eq!(lifting.shape(), cc.shape());
    }

    #[test]
    fn jump_penalization_vanishes_on_conforming_fields() {
        let domain = domains::two_patch(2, [2, 4]).unwrap();
        let derham = DiscreteDeRham::new(&domain, DiscretizationParams::default()).unwrap();
        for k in 0..3 {
            let jp = derham.jump_penalization(k, false).unwrap();
            let x = random_vector(derham.space(k).unwrap().dim(), k as u64);
            let conforming = derham.conforming_projection(k, false).unwrap().mul_vec(&x);
            assert!(jp.mul_vec(&conforming).amax() < 1e-12);
            if k < 2 {
                assert!(x.dot(&jp.mul_vec(&x)) > 0.);
            }
        }
    }

    #[test]
    fn grad_div_is_negative_semidefinite_either_way() {
        let domain = domains::l_shape(2, 2).unwrap();
        let x = random_vector(
            BrokenSpace::new(&domain, SequenceKind::Hcurl, 1).unwrap().dim(),
            3,
        );
        let mut results = Vec::new();
        for direct_max_block in [2000, 0] {
            let derham = DiscreteDeRham::new(
                &domain,
                DiscretizationParams {
                    hodge: HodgeParams {
                        direct_max_block,
                        dual: IterativeParams {
                            tol: 1e-13,
                            ..Default::default()
                        },
                    },
                    ..Default::default()
                },
            )
            .unwrap();
            let gd = derham.grad_div(true).unwrap();
            assert_eq!(gd.to_csr().is_some(), direct_max_block > 0);
            let gx = gd.apply(&x).unwrap();
            assert!(x.dot(&gx) <= 1e-12);
            results.push(gx);
        }
        assert_relative_eq!(results[0], results[1], epsilon = 1e-8 * results[0].amax());
    }

    #[test]
    fn maxwell_operators_are_adjoint() {
        let domain = domains::annulus([2, 2], [2, 4], 4, (0.5, 1.)).unwrap();
        let derham = DiscreteDeRham::new(&domain, DiscretizationParams::default()).unwrap();
        let ops = derham.maxwell_evolution(true).unwrap();
        let (n1, n2) = (
            derham.space(1).unwrap().dim(),
            derham.space(2).unwrap().dim(),
        );
        assert_eq!(ops.faraday.shape(), (n2, n1));
        assert_eq!(ops.ampere.shape(), (n1, n2));

        // ⟨a, ampere b⟩_M1 = ⟨faraday a, b⟩_M2
        let a = random_vector(n1, 8);
        let b = random_vector(n2, 9);
        let m1 = derham.mass(1).unwrap();
        let m2 = derham.mass(2).unwrap();
        let lhs = a.dot(&m1.mul_vec(&ops.ampere.apply(&b).unwrap()));
        let rhs = ops.faraday.apply(&a).unwrap().dot(&m2.mul_vec(&b));
        assert_relative_eq!(lhs, rhs, epsilon = 1e-10 * lhs.abs().max(1.));
    }

    #[test]
    fn source_problem_residual() {
        let domain = domains::two_patch(2, [2, 4]).unwrap();
        let derham = DiscreteDeRham::new(&domain, DiscretizationParams::default()).unwrap();
        let source = SourceParams {
            eta: 1.,
            ..Default::default()
        };
        let dim = derham.space(1).unwrap().dim();
        let b = random_vector(dim, 4);
        let solution = derham.solve_source(&b, &source).unwrap();

        let system = &(&derham.curl_curl(true).unwrap()
            + &(source.gamma_h * derham.jump_penalization(1, true).unwrap()))
            + &derham.mass(1).unwrap().clone();
        let proj = derham.conforming_projection(1, true).unwrap();
        let residual = system.mul_vec(&solution.broken) - operator::transpose(proj).mul_vec(&b);
        assert!(residual.amax() < 1e-9);
        assert_relative_eq!(proj.mul_vec(&solution.coeffs), solution.coeffs, epsilon = 1e-12);

        assert!(matches!(
            derham.solve_source(&na::DVector::zeros(dim + 1), &source),
            Err(Error::Operator(OperatorError::InputLength { .. }))
        ));
    }

    fn outer_faces(domain: &MultipatchDomain) -> Vec<PatchFace> {
        domain
            .boundaries()
            .iter()
            .map(|b| b.face)
            .filter(|face| face.ext == Extremity::End)
            .collect()
    }

    #[test]
    fn magnetostatic_field_without_current_is_harmonic() {
        // B = c / 2πr along the circles (H(div)) or the radii (H(curl)),
        // with energy c² ln(r_out / r_in) / 2π
        let domain = domains::annulus([3, 3], [6, 4], 4, (1., 2.)).unwrap();
        let outer = outer_faces(&domain);
        let c = 1.5;
        for sequence in [SequenceKind::Hcurl, SequenceKind::Hdiv] {
            let derham = DiscreteDeRham::new(
                &domain,
                DiscretizationParams {
                    sequence,
                    ..Default::default()
                },
            )
            .unwrap();
            let zero = na::DVector::zeros(derham.space(0).unwrap().dim());
            let sol = derham.solve_magnetostatic(&zero, &outer, c).unwrap();

            let m1 = derham.mass(1).unwrap();
            let energy = sol.field.dot(&m1.mul_vec(&sol.field));
            assert_relative_eq!(
                energy,
                c * c * 2f64.ln() / std::f64::consts::TAU,
                max_relative = 1e-3
            );
            assert_relative_eq!(
                sol.harmonic.dot(&m1.mul_vec(&sol.harmonic)),
                1.,
                epsilon = 1e-10
            );
            let h_norm = sol.harmonic.amax();
            let d1 = derham.conga_derivative(1, true).unwrap();
            assert!(d1.mul_vec(&sol.harmonic).amax() < 1e-9 * h_norm);
            let weak_div = derham.weak_divergence(true).unwrap();
            assert!(weak_div.mul_vec(&sol.harmonic).amax() < 1e-9 * h_norm);

            let reversed = derham.solve_magnetostatic(&zero, &outer, -c).unwrap();
            assert_relative_eq!(reversed.field, -&sol.field, epsilon = 1e-10);

            let nothing = derham.solve_magnetostatic(&zero, &outer, 0.).unwrap();
            assert!(nothing.field.amax() < 1e-12);
        }
    }

    #[test]
    fn magnetostatic_equations_hold_with_current() {
        let domain = domains::annulus([2, 2], [4, 3], 3, (0.5, 1.)).unwrap();
        let derham = DiscreteDeRham::new(
            &domain,
            DiscretizationParams {
                sequence: SequenceKind::Hdiv,
                ..Default::default()
            },
        )
        .unwrap();
        let n0 = derham.space(0).unwrap().dim();
        // J = 1
        let j = derham
            .mass(0)
            .unwrap()
            .mul_vec(&na::DVector::from_element(n0, 1.));
        let sol = derham
            .solve_magnetostatic(&j, &outer_faces(&domain), 0.3)
            .unwrap();
        let b = &sol.field;
        let scale = b.amax();
        assert!(scale > 1e-3);

        // conforming with vanishing normal trace
        let p1 = derham.conforming_projection(1, true).unwrap();
        assert!((p1.mul_vec(b) - b).amax() < 1e-10 * scale);
        // div B = 0
        let d1 = derham.conga_derivative(1, true).unwrap();
        assert!(d1.mul_vec(b).amax() < 1e-9 * scale);
        // curl B = J, tested with conforming 0-forms
        let weak_curl = derham.weak_divergence(true).unwrap().mul_vec(b);
        let p0 = derham.conforming_projection(0, true).unwrap();
        let tested = operator::transpose(p0).mul_vec(&j);
        assert_relative_eq!(weak_curl, tested, epsilon = 1e-10 * tested.amax());
    }

    #[test]
    fn magnetostatic_needs_a_boundary_component() {
        let domain = domains::annulus([2, 2], [3, 3], 3, (0.5, 1.)).unwrap();
        let derham = DiscreteDeRham::new(&domain, DiscretizationParams::default()).unwrap();
        let zero = na::DVector::zeros(derham.space(0).unwrap().dim());

        let everything: Vec<PatchFace> = domain.boundaries().iter().map(|b| b.face).collect();
        assert!(matches!(
            derham.solve_magnetostatic(&zero, &everything, 1.),
            Err(Error::NoHarmonicField)
        ));
        let interface = PatchFace::new(0, 1, Extremity::End);
        assert!(matches!(
            derham.solve_magnetostatic(&zero, &[interface], 1.),
            Err(Error::NotBoundaryFace(face)) if face == interface
        ));
        assert!(matches!(
            derham.solve_magnetostatic(&na::DVector::zeros(3), &outer_faces(&domain), 1.),
            Err(Error::Operator(OperatorError::InputLength { len: 3, .. }))
        ));

        // part of the single boundary loop of a square
        let square = domains::two_patch(2, [2, 2]).unwrap();
        let derham = DiscreteDeRham::new(&square, DiscretizationParams::default()).unwrap();
        let zero = na::DVector::zeros(derham.space(0).unwrap().dim());
        let left: Vec<PatchFace> = square
            .boundaries()
            .iter()
            .map(|b| b.face)
            .filter(|face| face.patch == 0)
            .collect();
        assert!(matches!(
            derham.solve_magnetostatic(&zero, &left, 1.),
            Err(Error::NoHarmonicField)
        ));
    }

    #[test]
    fn invalid_degrees() {
        let domain = domains::two_patch(1, [1, 1]).unwrap();
        let derham = DiscreteDeRham::new(&domain, DiscretizationParams::default()).unwrap();
        assert!(matches!(derham.space(3), Err(Error::FormDegree(3))));
        assert!(matches!(
            derham.derivative(2),
            Err(Error::Assembly(AssemblyError::NoDerivative(2)))
        ));
    }
}
