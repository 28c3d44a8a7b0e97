//! Multipatch domains: patches, the interfaces gluing them together,
//! and the exterior boundary.

/// Builders for commonly used domains.
pub mod domains;

//

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    knot_insertion::{self, KnotInsertionError, KNOT_MATCH_TOL},
    mapping::{IdentityMapping, Mapping},
    spline::{SplineError, SplineSpace1d},
};

/// Error in the description of a multipatch domain.
#[derive(thiserror::Error, Debug)]
pub enum TopologyError {
    /// A domain needs at least one patch.
    #[error("Domain {0:?} has no patches")]
    Empty(String),
    /// The spline parameters of a patch were invalid.
    #[error("Invalid patch {patch:?}: {source}")]
    InvalidPatch {
        /// Name of the patch.
        patch: String,
        /// What was wrong with it.
        #[source]
        source: SplineError,
    },
    /// An interface referred to a patch that doesn't exist.
    #[error("Interface {interface} refers to patch {patch}, but the domain only has {count} patches")]
    UnknownPatch {
        /// Index of the interface.
        interface: usize,
        /// The missing patch index.
        patch: usize,
        /// Number of patches in the domain.
        count: usize,
    },
    /// An interface used a face along a periodic axis, which has no boundary.
    #[error("Interface {interface} uses {face}, which lies on a periodic axis")]
    PeriodicFace {
        /// Index of the interface.
        interface: usize,
        /// The offending face.
        face: PatchFace,
    },
    /// The same face appeared in two interfaces (or twice in one).
    #[error("{face} is used by both interface {first} and interface {second}")]
    FaceReused {
        /// The face.
        face: PatchFace,
        /// Index of the first interface using it.
        first: usize,
        /// Index of the second interface using it.
        second: usize,
    },
    /// Degrees along the shared direction of an interface differ.
    #[error("Interface {interface} joins degree {minus} to degree {plus} along the shared direction")]
    DegreeMismatch {
        /// Index of the interface.
        interface: usize,
        /// Degree on the minus side.
        minus: usize,
        /// Degree on the plus side.
        plus: usize,
    },
    /// One side of an interface is periodic along the shared direction and the other isn't.
    #[error("Interface {interface} joins a periodic direction to a non-periodic one")]
    PeriodicityMismatch {
        /// Index of the interface.
        interface: usize,
    },
    /// Breakpoints on the two sides of an interface cannot be related by knot insertion.
    #[error("Interface {interface} has incompatible breakpoints: {source}")]
    IncompatibleBreakpoints {
        /// Index of the interface.
        interface: usize,
        /// Why knot insertion failed.
        #[source]
        source: KnotInsertionError,
    },
    /// A boundary condition was set on a face that is not on the exterior boundary.
    #[error("{face} is not an exterior boundary face")]
    NotExterior {
        /// The face.
        face: PatchFace,
    },
}

//
// faces and interfaces
//

/// Which end of a parametric axis a face lies on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Extremity {
    /// The face at parameter 0.
    Start,
    /// The face at parameter 1.
    End,
}

impl Extremity {
    /// Sign of the outward normal along the axis, -1 or 1.
    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            Self::Start => -1.,
            Self::End => 1.,
        }
    }
}

/// One of the four faces of a patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchFace {
    /// Index of the patch in the domain.
    pub patch: usize,
    /// The axis normal to the face.
    pub axis: usize,
    /// Which end of the axis.
    pub ext: Extremity,
}

impl PatchFace {
    /// Construct a face.
    pub fn new(patch: usize, axis: usize, ext: Extremity) -> Self {
        Self { patch, axis, ext }
    }

    /// The axis running along the face.
    #[inline]
    pub fn tangent_axis(&self) -> usize {
        1 - self.axis
    }
}

impl fmt::Display for PatchFace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ext = match self.ext {
            Extremity::Start => "start",
            Extremity::End => "end",
        };
        write!(f, "face ({ext} of axis {}) of patch {}", self.axis, self.patch)
    }
}

/// Relative direction of the face parameters on the two sides of an interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Orientation {
    /// Face parameters increase in the same direction.
    Aligned,
    /// Face parameter `s` on one side corresponds to `1 - s` on the other.
    Reversed,
}

impl Orientation {
    /// 1 for aligned and -1 for reversed faces.
    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            Self::Aligned => 1.,
            Self::Reversed => -1.,
        }
    }
}

/// One side of an interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// The first face of the interface.
    Minus,
    /// The second face of the interface.
    Plus,
}

/// Whether the grids on both sides of an interface coincide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Breakpoints along the shared direction agree.
    Matching,
    /// One side's breakpoints are a strict subset of the other's.
    NonMatching {
        /// The side with fewer breakpoints.
        coarse: Side,
    },
}

/// Two patch faces glued together.
#[derive(Clone, Debug, PartialEq)]
pub struct Interface {
    minus: PatchFace,
    plus: PatchFace,
    orientation: Orientation,
    kind: InterfaceKind,
}

impl Interface {
    /// The first face.
    #[inline]
    pub fn minus(&self) -> PatchFace {
        self.minus
    }

    /// The second face.
    #[inline]
    pub fn plus(&self) -> PatchFace {
        self.plus
    }

    /// The face on the given side.
    #[inline]
    pub fn face(&self, side: Side) -> PatchFace {
        match side {
            Side::Minus => self.minus,
            Side::Plus => self.plus,
        }
    }

    /// Relative orientation of the two faces.
    #[inline]
    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    /// Whether the interface is matching.
    #[inline]
    pub fn kind(&self) -> InterfaceKind {
        self.kind
    }
}

/// Boundary condition type of an exterior face.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BoundaryCondition {
    /// Essential condition, zeroed by homogeneous conforming projections.
    Dirichlet,
    /// Natural condition, left free.
    Natural,
}

/// A face on the exterior boundary of the domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Boundary {
    /// The face.
    pub face: PatchFace,
    /// Condition applied on it.
    pub condition: BoundaryCondition,
}

//
// patches
//

/// Description of one tensor-product spline patch.
#[derive(Clone, Debug)]
pub struct Patch {
    name: String,
    degree: [usize; 2],
    breaks: [Vec<f64>; 2],
    periodic: [bool; 2],
    mapping: Arc<dyn Mapping>,
}

impl Patch {
    /// A patch with uniform cells on the unit square and the identity mapping.
    pub fn new(name: impl Into<String>, degree: [usize; 2], ncells: [usize; 2]) -> Self {
        let uniform = |n: usize| -> Vec<f64> {
            let n = n.max(1);
            (0..=n).map(|i| i as f64 / n as f64).collect()
        };
        Self {
            name: name.into(),
            degree,
            breaks: [uniform(ncells[0]), uniform(ncells[1])],
            periodic: [false; 2],
            mapping: Arc::new(IdentityMapping),
        }
    }

    /// Set custom breakpoints along an axis.
    /// These should start at 0 and end at 1.
    pub fn with_breaks(mut self, axis: usize, breaks: Vec<f64>) -> Self {
        self.breaks[axis] = breaks;
        self
    }

    /// Make the patch periodic along some axes.
    pub fn with_periodic(mut self, periodic: [bool; 2]) -> Self {
        self.periodic = periodic;
        self
    }

    /// Set the mapping from logical to physical coordinates.
    pub fn with_mapping(mut self, mapping: impl Mapping + 'static) -> Self {
        self.mapping = Arc::new(mapping);
        self
    }

    /// Name used in error messages.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Degree per axis.
    #[inline]
    pub fn degree(&self) -> [usize; 2] {
        self.degree
    }

    /// Number of cells per axis.
    #[inline]
    pub fn ncells(&self) -> [usize; 2] {
        [self.breaks[0].len() - 1, self.breaks[1].len() - 1]
    }

    /// Breakpoints along an axis.
    #[inline]
    pub fn breaks(&self, axis: usize) -> &[f64] {
        &self.breaks[axis]
    }

    /// Periodicity per axis.
    #[inline]
    pub fn periodic(&self) -> [bool; 2] {
        self.periodic
    }

    /// The geometry mapping.
    #[inline]
    pub fn mapping(&self) -> &dyn Mapping {
        self.mapping.as_ref()
    }
}

//
// domain
//

/// A validated multipatch domain.
///
/// Immutable after construction; build one with [`DomainBuilder`]
/// or one of the functions in [`domains`].
#[derive(Clone, Debug)]
pub struct MultipatchDomain {
    name: String,
    patches: Vec<Patch>,
    /// B-spline spaces per patch and axis
    spaces: Vec<[SplineSpace1d; 2]>,
    interfaces: Vec<Interface>,
    boundaries: Vec<Boundary>,
}

impl MultipatchDomain {
    /// Name of the domain, used in cache keys.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of patches.
    #[inline]
    pub fn patch_count(&self) -> usize {
        self.patches.len()
    }

    /// All patches in order.
    #[inline]
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// A single patch.
    #[inline]
    pub fn patch(&self, idx: usize) -> &Patch {
        &self.patches[idx]
    }

    /// The 1D B-spline spaces of a patch.
    #[inline]
    pub fn patch_spaces(&self, idx: usize) -> &[SplineSpace1d; 2] {
        &self.spaces[idx]
    }

    /// All interfaces.
    #[inline]
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// All exterior boundary faces.
    #[inline]
    pub fn boundaries(&self) -> &[Boundary] {
        &self.boundaries
    }

    /// Exterior faces with a Dirichlet condition.
    pub fn dirichlet_faces(&self) -> impl '_ + Iterator<Item = PatchFace> {
        self.boundaries
            .iter()
            .filter(|b| b.condition == BoundaryCondition::Dirichlet)
            .map(|b| b.face)
    }

    /// A deterministic string identifying this discretized geometry,
    /// used as part of cache keys.
    pub fn descriptor(&self) -> String {
        let first = &self.patches[0];
        let uniform = self
            .patches
            .iter()
            .all(|p| p.degree == first.degree && p.ncells() == first.ncells());
        let summary = if uniform {
            format!(
                "deg{}x{}_nc{}x{}",
                first.degree[0],
                first.degree[1],
                first.ncells()[0],
                first.ncells()[1]
            )
        } else {
            "mixed".to_string()
        };
        // everything else (breakpoints, mappings, interfaces) goes into a hash
        let details = format!("{:?}|{:?}|{:?}", self.patches, self.interfaces, self.boundaries);
        format!(
            "{}_{}patches_{}_{:016x}",
            self.name,
            self.patches.len(),
            summary,
            fnv1a(details.as_bytes())
        )
    }

    /// Breakpoints along the shared direction of an interface
    /// for the minus and plus side respectively,
    /// normalized to [0, 1] and expressed in the minus side's orientation.
    pub(crate) fn oriented_interface_breaks(&self, iface: &Interface) -> [Vec<f64>; 2] {
        let normalized = |face: PatchFace| -> Vec<f64> {
            let breaks = self.patches[face.patch].breaks(face.tangent_axis());
            let start = breaks[0];
            let len = breaks[breaks.len() - 1] - start;
            breaks.iter().map(|b| (b - start) / len).collect()
        };
        let minus = normalized(iface.minus);
        let mut plus = normalized(iface.plus);
        if iface.orientation == Orientation::Reversed {
            plus = plus.iter().rev().map(|b| 1. - b).collect();
        }
        [minus, plus]
    }
}

/// FNV-1a, used for stable hashes in cache keys.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf29ce484222325, |hash, &b| {
        (hash ^ b as u64).wrapping_mul(0x100000001b3)
    })
}

/// Incremental construction of a [`MultipatchDomain`].
#[derive(Clone, Debug)]
pub struct DomainBuilder {
    name: String,
    patches: Vec<Patch>,
    interfaces: Vec<(PatchFace, PatchFace, Orientation)>,
    natural: Vec<PatchFace>,
}

impl DomainBuilder {
    /// Start building a domain with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            patches: Vec::new(),
            interfaces: Vec::new(),
            natural: Vec::new(),
        }
    }

    /// Add a patch, returning its index.
    pub fn add_patch(&mut self, patch: Patch) -> usize {
        self.patches.push(patch);
        self.patches.len() - 1
    }

    /// Glue two faces together.
    pub fn add_interface(&mut self, minus: PatchFace, plus: PatchFace, orientation: Orientation) {
        self.interfaces.push((minus, plus, orientation));
    }

    /// Mark an exterior face as having a natural boundary condition.
    /// Exterior faces are Dirichlet by default.
    pub fn add_natural_boundary(&mut self, face: PatchFace) {
        self.natural.push(face);
    }

    /// Chaining version of [`add_patch`][Self::add_patch].
    pub fn patch(mut self, patch: Patch) -> Self {
        self.add_patch(patch);
        self
    }

    /// Chaining version of [`add_interface`][Self::add_interface].
    pub fn interface(mut self, minus: PatchFace, plus: PatchFace, orientation: Orientation) -> Self {
        self.add_interface(minus, plus, orientation);
        self
    }

    /// Chaining version of [`add_natural_boundary`][Self::add_natural_boundary].
    pub fn natural_boundary(mut self, face: PatchFace) -> Self {
        self.add_natural_boundary(face);
        self
    }

    /// Validate the description and build the domain.
    pub fn build(self) -> Result<MultipatchDomain, TopologyError> {
        if self.patches.is_empty() {
            return Err(TopologyError::Empty(self.name));
        }

        let spaces: Vec<[SplineSpace1d; 2]> = self
            .patches
            .iter()
            .map(|patch| {
                let space = |axis: usize| {
                    SplineSpace1d::new(
                        patch.degree[axis],
                        patch.breaks[axis].clone(),
                        patch.periodic[axis],
                    )
                };
                match (space(0), space(1)) {
                    (Ok(s0), Ok(s1)) => Ok([s0, s1]),
                    (Err(source), _) | (_, Err(source)) => Err(TopologyError::InvalidPatch {
                        patch: patch.name.clone(),
                        source,
                    }),
                }
            })
            .collect::<Result<_, _>>()?;

        let mut domain = MultipatchDomain {
            name: self.name,
            patches: self.patches,
            spaces,
            interfaces: Vec::with_capacity(self.interfaces.len()),
            boundaries: Vec::new(),
        };

        let mut used_faces: HashMap<PatchFace, usize> = HashMap::new();
        for (iface_idx, &(minus, plus, orientation)) in self.interfaces.iter().enumerate() {
            for face in [minus, plus] {
                if face.patch >= domain.patches.len() {
                    return Err(TopologyError::UnknownPatch {
                        interface: iface_idx,
                        patch: face.patch,
                        count: domain.patches.len(),
                    });
                }
                if domain.patches[face.patch].periodic[face.axis] {
                    return Err(TopologyError::PeriodicFace {
                        interface: iface_idx,
                        face,
                    });
                }
                if let Some(&first) = used_faces.get(&face) {
                    return Err(TopologyError::FaceReused {
                        face,
                        first,
                        second: iface_idx,
                    });
                }
                used_faces.insert(face, iface_idx);
            }

            let minus_space = &domain.spaces[minus.patch][minus.tangent_axis()];
            let plus_space = &domain.spaces[plus.patch][plus.tangent_axis()];
            if minus_space.degree() != plus_space.degree() {
                return Err(TopologyError::DegreeMismatch {
                    interface: iface_idx,
                    minus: minus_space.degree(),
                    plus: plus_space.degree(),
                });
            }
            if minus_space.is_periodic() != plus_space.is_periodic() {
                return Err(TopologyError::PeriodicityMismatch {
                    interface: iface_idx,
                });
            }

            let mut iface = Interface {
                minus,
                plus,
                orientation,
                kind: InterfaceKind::Matching,
            };
            iface.kind = classify_interface(&domain, &iface).map_err(|source| {
                TopologyError::IncompatibleBreakpoints {
                    interface: iface_idx,
                    source,
                }
            })?;
            domain.interfaces.push(iface);
        }

        // every remaining non-periodic face is on the exterior boundary
        for (patch_idx, patch) in domain.patches.iter().enumerate() {
            for axis in 0..2 {
                if patch.periodic[axis] {
                    continue;
                }
                for ext in [Extremity::Start, Extremity::End] {
                    let face = PatchFace::new(patch_idx, axis, ext);
                    if !used_faces.contains_key(&face) {
                        domain.boundaries.push(Boundary {
                            face,
                            condition: BoundaryCondition::Dirichlet,
                        });
                    }
                }
            }
        }
        for face in self.natural {
            let boundary = domain
                .boundaries
                .iter_mut()
                .find(|b| b.face == face)
                .ok_or(TopologyError::NotExterior { face })?;
            boundary.condition = BoundaryCondition::Natural;
        }

        log::debug!(
            "Built domain {:?}: {} patches, {} interfaces ({} non-matching), {} boundary faces",
            domain.name,
            domain.patches.len(),
            domain.interfaces.len(),
            domain
                .interfaces
                .iter()
                .filter(|i| i.kind != InterfaceKind::Matching)
                .count(),
            domain.boundaries.len(),
        );

        Ok(domain)
    }
}

fn classify_interface(
    domain: &MultipatchDomain,
    iface: &Interface,
) -> Result<InterfaceKind, KnotInsertionError> {
    let [minus, plus] = domain.oriented_interface_breaks(iface);
    if minus.len() == plus.len()
        && minus
            .iter()
            .zip(&plus)
            .all(|(a, b)| (a - b).abs() < KNOT_MATCH_TOL)
    {
        return Ok(InterfaceKind::Matching);
    }
    // whichever side has fewer breakpoints must be nested in the other
    let (coarse, fine, coarse_side) = if minus.len() <= plus.len() {
        (&minus, &plus, Side::Minus)
    } else {
        (&plus, &minus, Side::Plus)
    };
    knot_insertion::knots_to_insert(coarse, fine)?;
    Ok(InterfaceKind::NonMatching {
        coarse: coarse_side,
    })
}
