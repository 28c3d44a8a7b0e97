//! Discrete de Rham sequences of broken spline spaces on multipatch domains,
//! with conforming projections between them
//! and the CONGA (conforming/nonconforming Galerkin) operators built from those.
//!
//! A typical workflow builds a [`MultipatchDomain`],
//! wraps it in a [`DiscreteDeRham`] (optionally backed by an [`OperatorCache`]),
//! and then either integrates the Maxwell system in time with a [`LeapfrogStepper`]
//! or solves static problems with [`DiscreteDeRham::solve_source`],
//! [`DiscreteDeRham::solve_magnetostatic`] and the [`EigensolverDriver`].

#![warn(missing_docs)]

pub mod spline;
#[doc(inline)]
pub use spline::{BasisKind, SplineSpace1d};

pub mod quadrature;

pub mod mapping;
#[doc(inline)]
pub use mapping::{AffineMapping, IdentityMapping, Mapping, PolarMapping};

pub mod topology;
#[doc(inline)]
pub use topology::{DomainBuilder, MultipatchDomain, Patch, PatchFace};

pub mod space;
#[doc(inline)]
pub use space::{BrokenSpace, SequenceKind};

pub mod operator;
#[doc(inline)]
pub use operator::{ComposedOperator, MatrixOperator, Operator};

pub mod linalg;

pub mod knot_insertion;
#[doc(inline)]
pub use knot_insertion::KnotInsertionTransfer;

pub mod assembly;
#[doc(inline)]
pub use assembly::BrokenAssembler;

pub mod hodge;
#[doc(inline)]
pub use hodge::{HodgeOperator, HodgeParams};

pub mod conforming;
#[doc(inline)]
pub use conforming::ConformingProjector;

pub mod cache;
#[doc(inline)]
pub use cache::OperatorCache;

pub mod derham;
#[doc(inline)]
pub use derham::{DiscreteDeRham, DiscretizationParams};

pub mod time_stepping;
#[doc(inline)]
pub use time_stepping::{LeapfrogStepper, TimeStepParams};

pub mod eigen;
#[doc(inline)]
pub use eigen::{EigenParams, EigensolverDriver};

mod error;
pub use error::Error;

// nalgebra re-exports for convenience

pub use nalgebra as na;
pub use nalgebra_sparse as nas;
