//! # bonsai
//!
//! Decay tree fitting made short and sweet.
//!
//! `bonsai` performs a global least-squares fit of a whole decay chain at once:
//! every vertex position, momentum and decay length in the tree is part of one
//! state vector, and the measurements (track helices, calorimeter clusters, an
//! optional beamspot) together with the exact relations between them
//! (four-momentum conservation, vertex geometry, optional mass and lifetime
//! constraints) are applied as a sequence of Kalman filter steps. The result is
//! a consistent set of fitted kinematics and covariances for the head particle
//! *and* every intermediate state, something per-vertex fitters cannot provide.
//!
//! The fit is organized around a few pieces:
//!
//! * [`Candidate`]: the input decay hypothesis, a plain owned tree of
//!   four-momenta plus optional track/cluster measurements.
//! * [`FitConfig`]: which constraints to apply and the numerical knobs.
//! * [`TreeFitter`]: builds the internal node tree from a [`Candidate`],
//!   assigns each node a slice of the global state vector, and iterates the
//!   constraint filter to convergence.
//! * [`FitReport`]: the fitted kinematics, vertices, decay lengths and
//!   covariance blocks, which can be written back onto the original
//!   [`Candidate`] tree with [`Candidate::apply_report`].
//!
//! ```no_run
//! use bonsai::{Candidate, FitConfig, TrackMeasurement, TreeFitter, Vec4};
//!
//! # fn main() -> Result<(), bonsai::FitError> {
//! let mut resolution = [[0.0; 5]; 5];
//! for slot in 0..5 {
//!     resolution[slot][slot] = 1e-6;
//! }
//! let kaon = Candidate::new(321, Vec4::from_momentum([0.6, 0.1, 0.8], 0.493677))
//!     .with_track(TrackMeasurement::new(
//!         [0.0, 0.1651, 0.0074, 0.0, 1.3152], // d0, phi0, omega, z0, tan(lambda)
//!         resolution,
//!         1,
//!     ));
//! let pion = Candidate::new(-211, Vec4::from_momentum([-0.4, -0.2, 0.5], 0.139570))
//!     .with_track(TrackMeasurement::new(
//!         [0.0, -2.6779, -0.0101, 0.0, 1.1180],
//!         resolution,
//!         -1,
//!     ));
//! let mut d0 = Candidate::composite(421, vec![kaon, pion]);
//!
//! let config = FitConfig::default();
//! let report = TreeFitter::new(&d0, &config)?.fit()?;
//! d0.apply_report(&report);
//! println!("chi2/ndf = {}/{}", report.chi_square, report.ndf);
//! # Ok(())
//! # }
//! ```
//!
//! All fallible node-level operations inside the fitter report through a small
//! bitmask code ([`fit::ErrCode`]); the public surface converts any failure
//! into a [`FitError`]. A failed fit never yields partial results: the
//! candidate is rejected as a whole.
#![warn(clippy::perf, clippy::style)]
#![allow(clippy::excessive_precision)]

use thiserror::Error;

/// The input decay hypothesis and the fitted output written back onto it.
pub mod candidate;
/// Fit configuration: constraint toggles and numerical tolerances.
pub mod config;
/// The constraint-fitting core: state container, projections, Kalman filter,
/// node hierarchy and tree.
pub mod fit;
/// The iteration driver.
pub mod fitter;
/// Static particle properties keyed by PDG code.
pub mod pdg;
/// Kinematic vectors, helix geometry and small numerical helpers.
pub mod utils;

pub use crate::candidate::{Candidate, ClusterMeasurement, FitReport, FittedEntry, TrackMeasurement};
pub use crate::config::{BeamSpot, FitConfig, MassConstraintMode};
pub use crate::fit::{ConstraintKind, ErrCode, FitParams, NodeKind, ParticleId};
pub use crate::fitter::TreeFitter;
pub use crate::pdg::ParticleProperties;
pub use crate::utils::vectors::{Vec3, Vec4};

/// The floating point type used across the crate (`f64` unless the `f32`
/// feature is enabled).
#[cfg(not(feature = "f32"))]
pub type Float = f64;
/// The floating point type used across the crate (`f64` unless the `f32`
/// feature is enabled).
#[cfg(feature = "f32")]
pub type Float = f32;

#[cfg(not(feature = "f32"))]
pub(crate) const PI: Float = std::f64::consts::PI;
#[cfg(feature = "f32")]
pub(crate) const PI: Float = std::f32::consts::PI;

pub type FitResult<T> = Result<T, FitError>;

/// The error type reported by the public fitting surface.
///
/// Node-level operations accumulate [`fit::ErrCode`] bits; the driver maps the
/// accumulated code onto this closed taxonomy when the fit is abandoned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    /// Malformed or physically invalid input (zero-norm momentum, an unknown
    /// PDG code, a cluster energy below the particle mass, ...).
    #[error("Bad input: {0}")]
    BadInput(String),
    /// The iteration limit was reached before the chi-square delta satisfied
    /// the convergence criterion, or the fit diverged outright.
    #[error("Fit did not converge after {iterations} iterations (last chi-square: {chi_square})")]
    NonConverging {
        /// Number of iterations performed before giving up.
        iterations: usize,
        /// Chi-square at the last completed iteration.
        chi_square: Float,
    },
    /// A linear system built from the accumulated constraints was not
    /// solvable (rank-deficient Jacobian, non-positive-definite covariance).
    #[error("Singular linear system: {0}")]
    SingularMatrix(String),
    /// A constraint's topology assumption was violated (for example a mass
    /// constraint on a node that cannot supply an invariant mass, or a tree
    /// with fewer constraint rows than parameters).
    #[error("Inconsistent constraint: {0}")]
    InconsistentConstraint(String),
}
