//! The fit machinery: the decay tree arena, the global state vector, the
//! constraint catalogue and the sequential Kalman filter.

/// Constraint bookkeeping and the per-kind projection formulas.
pub mod constraint;
/// Accumulating status bits for node-level operations.
pub mod errcode;
/// The per-constraint filter step.
pub mod kalman;
/// Node kinds, state layouts and parameter initialization.
pub mod node;
/// The global parameter vector, covariance and chi-square ledger.
pub mod params;
/// The residual/Jacobian/covariance workspace for one constraint.
pub mod projection;
/// The arena-backed decay tree and its factories.
pub mod tree;

pub use constraint::{Constraint, ConstraintKind};
pub use errcode::ErrCode;
pub use node::NodeKind;
pub use params::FitParams;
pub use projection::Projection;
pub use tree::{DecayTree, ParticleId};
