//! Broken (patch-discontinuous) spline spaces of differential forms.
//!
//! On each patch, a k-form space is a list of tensor-product spline spaces,
//! one per component in logical coordinates:
//!
//! | form    | H(curl) sequence | H(div) sequence  |
//! |---------|------------------|------------------|
//! | 0-form  | B ⊗ B            | B ⊗ B            |
//! | 1-form  | [M ⊗ B, B ⊗ M]   | [B ⊗ M, M ⊗ B]   |
//! | 2-form  | M ⊗ M            | M ⊗ M            |
//!
//! where B is the patch's B-spline space along an axis
//! and M the corresponding M-spline derivative space.
//! The global coefficient vector concatenates patches in order,
//! components in order within a patch,
//! and uses the index `i0 * n1 + i1` within a component.

use fixedbitset as fb;
use nalgebra as na;
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::{
    spline::{BasisKind, SplineSpace1d},
    topology::{Extremity, MultipatchDomain, PatchFace},
    Error,
};

/// Which of the two 2D de Rham sequences to discretize.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceKind {
    /// H1 → H(curl) → L2, with grad and scalar curl.
    #[default]
    Hcurl,
    /// H1 → H(div) → L2, with vector rot and div.
    Hdiv,
}

impl SequenceKind {
    /// Short name used in cache keys.
    pub fn name(self) -> &'static str {
        match self {
            Self::Hcurl => "hcurl",
            Self::Hdiv => "hdiv",
        }
    }
}

/// Tensor product of two 1D spline spaces.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorSpace2d {
    axes: [SplineSpace1d; 2],
}

impl TensorSpace2d {
    /// Construct from the spaces along each axis.
    pub fn new(axes: [SplineSpace1d; 2]) -> Self {
        Self { axes }
    }

    /// The 1D spaces.
    #[inline]
    pub fn axes(&self) -> &[SplineSpace1d; 2] {
        &self.axes
    }

    /// Number of basis functions per axis.
    #[inline]
    pub fn shape(&self) -> [usize; 2] {
        [self.axes[0].nbasis(), self.axes[1].nbasis()]
    }

    /// Total number of basis functions.
    #[inline]
    pub fn nbasis(&self) -> usize {
        self.axes[0].nbasis() * self.axes[1].nbasis()
    }

    /// Flat index of a basis function.
    #[inline]
    pub fn index(&self, i0: usize, i1: usize) -> usize {
        i0 * self.axes[1].nbasis() + i1
    }

    /// Evaluate the spline with the given coefficients at a logical point.
    pub fn eval(&self, coeffs: &[f64], point: na::Vector2<f64>) -> f64 {
        debug_assert_eq!(coeffs.len(), self.nbasis());
        let [s0, s1] = &self.axes;
        let (first0, vals0) = s0.basis_values(s0.find_cell(point.x), point.x);
        let (first1, vals1) = s1.basis_values(s1.find_cell(point.y), point.y);
        let mut sum = 0.;
        for (r0, v0) in vals0.iter().enumerate() {
            let i0 = s0.global_index(first0 + r0);
            for (r1, v1) in vals1.iter().enumerate() {
                let i1 = s1.global_index(first1 + r1);
                sum += v0 * v1 * coeffs[self.index(i0, i1)];
            }
        }
        sum
    }
}

/// The coefficients of a form space lying on one patch face,
/// i.e. those that determine the (tangential or normal) trace of the form.
#[derive(Clone, Debug, PartialEq)]
pub struct FaceTrace {
    /// Component of the form carrying the trace.
    pub component: usize,
    /// Global coefficient indices in order of increasing face parameter.
    pub dofs: Vec<usize>,
    /// The 1D space of the trace along the face.
    pub space: SplineSpace1d,
}

/// Direct sum of the patch-local spaces of k-forms over a whole domain.
#[derive(Clone, Debug)]
pub struct BrokenSpace {
    form_degree: usize,
    sequence: SequenceKind,
    /// component spaces per patch
    patches: Vec<Vec<TensorSpace2d>>,
    /// global offset of each component per patch, plus the end of the patch
    offsets: Vec<Vec<usize>>,
    dim: usize,
}

impl BrokenSpace {
    /// Build the space of `form_degree`-forms on a domain.
    pub fn new(
        domain: &MultipatchDomain,
        sequence: SequenceKind,
        form_degree: usize,
    ) -> Result<Self, Error> {
        if form_degree > 2 {
            return Err(Error::FormDegree(form_degree));
        }
        let patches: Vec<Vec<TensorSpace2d>> = (0..domain.patch_count())
            .map(|p| patch_components(domain.patch_spaces(p), sequence, form_degree))
            .collect();

        let mut offsets = Vec::with_capacity(patches.len());
        let mut dim = 0;
        for comps in &patches {
            let mut patch_offsets = Vec::with_capacity(comps.len() + 1);
            for comp in comps {
                patch_offsets.push(dim);
                dim += comp.nbasis();
            }
            patch_offsets.push(dim);
            offsets.push(patch_offsets);
        }

        Ok(Self {
            form_degree,
            sequence,
            patches,
            offsets,
            dim,
        })
    }

    /// Degree of the forms in this space.
    #[inline]
    pub fn form_degree(&self) -> usize {
        self.form_degree
    }

    /// The de Rham sequence this space belongs to.
    #[inline]
    pub fn sequence(&self) -> SequenceKind {
        self.sequence
    }

    /// Total number of coefficients.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of patches.
    #[inline]
    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    /// Component spaces of a patch.
    #[inline]
    pub fn components(&self, patch: usize) -> &[TensorSpace2d] {
        &self.patches[patch]
    }

    /// Global offset of a component of a patch.
    #[inline]
    pub fn component_offset(&self, patch: usize, component: usize) -> usize {
        self.offsets[patch][component]
    }

    /// Global index range of a patch.
    #[inline]
    pub fn patch_range(&self, patch: usize) -> Range<usize> {
        let offsets = &self.offsets[patch];
        offsets[0]..offsets[offsets.len() - 1]
    }

    /// Global index of a basis function.
    #[inline]
    pub fn global_index(&self, patch: usize, component: usize, i0: usize, i1: usize) -> usize {
        self.offsets[patch][component] + self.patches[patch][component].index(i0, i1)
    }

    /// The coefficients determining the trace of a form on a face,
    /// or `None` if forms of this degree have no trace there
    /// (2-forms, or faces on periodic axes).
    pub fn face_trace(&self, face: PatchFace) -> Option<FaceTrace> {
        let comps = &self.patches[face.patch];
        let tangent = face.tangent_axis();
        let (component, comp) = comps.iter().enumerate().find(|(_, c)| {
            let normal_space = &c.axes[face.axis];
            normal_space.kind() == BasisKind::B && !normal_space.is_periodic()
        })?;

        let [n0, n1] = comp.shape();
        let fixed = match face.ext {
            Extremity::Start => 0,
            Extremity::End => comp.shape()[face.axis] - 1,
        };
        let offset = self.offsets[face.patch][component];
        let dofs = if face.axis == 0 {
            (0..n1).map(|j| offset + comp.index(fixed, j)).collect()
        } else {
            (0..n0).map(|j| offset + comp.index(j, fixed)).collect()
        };

        Some(FaceTrace {
            component,
            dofs,
            space: comp.axes[tangent].clone(),
        })
    }

    /// Coefficients lying on faces with a Dirichlet boundary condition.
    pub fn dirichlet_dofs(&self, domain: &MultipatchDomain) -> fb::FixedBitSet {
        let mut set = fb::FixedBitSet::with_capacity(self.dim);
        for face in domain.dirichlet_faces() {
            if let Some(trace) = self.face_trace(face) {
                for dof in trace.dofs {
                    set.insert(dof);
                }
            }
        }
        set
    }

    /// Evaluate every component of a form at a logical point of a patch.
    ///
    /// Values are in the logical frame, without the pushforward to physical space.
    pub fn eval(&self, coeffs: &na::DVector<f64>, patch: usize, point: na::Vector2<f64>) -> Vec<f64> {
        self.patches[patch]
            .iter()
            .enumerate()
            .map(|(c, comp)| {
                let offset = self.offsets[patch][c];
                comp.eval(&coeffs.as_slice()[offset..offset + comp.nbasis()], point)
            })
            .collect()
    }
}

/// Component spaces of k-forms on a patch with the given B-spline spaces.
fn patch_components(
    spaces: &[SplineSpace1d; 2],
    sequence: SequenceKind,
    form_degree: usize,
) -> Vec<TensorSpace2d> {
    let [b0, b1] = spaces.clone();
    let (m0, m1) = (b0.reduced(), b1.reduced());
    let tensor = |a: &SplineSpace1d, b: &SplineSpace1d| TensorSpace2d::new([a.clone(), b.clone()]);
    match (form_degree, sequence) {
        (0, _) => vec![tensor(&b0, &b1)],
        (1, SequenceKind::Hcurl) => vec![tensor(&m0, &b1), tensor(&b0, &m1)],
        (1, SequenceKind::Hdiv) => vec![tensor(&b0, &m1), tensor(&m0, &b1)],
        _ => vec![tensor(&m0, &m1)],
    }
}
