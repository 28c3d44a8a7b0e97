use crate::{
    assembly::AssemblyError, cache::CacheError, conforming::ProjectionError, eigen::EigenError,
    hodge::HodgeError, knot_insertion::KnotInsertionError, linalg::SolverError,
    operator::OperatorError, spline::SplineError, time_stepping::TimeStepError,
    topology::{PatchFace, TopologyError},
};

/// Any error produced while discretizing or solving.
///
/// Each module has its own error type;
/// this collects them for callers that don't need to tell them apart.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Only form degrees 0, 1 and 2 exist in 2D.
    #[error("No {0}-forms in two dimensions")]
    FormDegree(usize),
    /// A face given as part of the boundary is not on it.
    #[error("{0:?} is not a boundary face")]
    NotBoundaryFace(PatchFace),
    /// The chosen boundary faces don't separate the boundary into two parts,
    /// so there is no harmonic field to fix.
    #[error("No harmonic field is associated with the given boundary faces")]
    NoHarmonicField,
    #[error(transparent)]
    #[allow(missing_docs)]
    Spline(#[from] SplineError),
    #[error(transparent)]
    #[allow(missing_docs)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    #[allow(missing_docs)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    #[allow(missing_docs)]
    Hodge(#[from] HodgeError),
    #[error(transparent)]
    #[allow(missing_docs)]
    KnotInsertion(#[from] KnotInsertionError),
    #[error(transparent)]
    #[allow(missing_docs)]
    Projection(#[from] ProjectionError),
    #[error(transparent)]
    #[allow(missing_docs)]
    Operator(#[from] OperatorError),
    #[error(transparent)]
    #[allow(missing_docs)]
    Solver(#[from] SolverError),
    #[error(transparent)]
    #[allow(missing_docs)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    #[allow(missing_docs)]
    TimeStep(#[from] TimeStepError),
    #[error(transparent)]
    #[allow(missing_docs)]
    Eigen(#[from] EigenError),
}
