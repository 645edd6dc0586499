use nalgebra::{DMatrix, DVector};

use crate::Float;

/// The workspace for one linearized constraint: the residual `r`, its
/// Jacobian `h` with respect to the global state, and the measurement
/// covariance `v` (zero for exact constraints).
///
/// Projections write directly into the public matrices; a fresh (zeroed)
/// workspace is handed to each projection call.
#[derive(Clone, Debug)]
pub struct Projection {
    /// The residual vector, one entry per constraint row.
    pub r: DVector<Float>,
    /// The `rows × dim` Jacobian of the residual.
    pub h: DMatrix<Float>,
    /// The `rows × rows` measurement covariance.
    pub v: DMatrix<Float>,
}

impl Projection {
    /// Create a zeroed workspace for `n_rows` constraint rows over a state
    /// of dimension `dim`.
    pub fn new(n_rows: usize, dim: usize) -> Self {
        Self {
            r: DVector::zeros(n_rows),
            h: DMatrix::zeros(n_rows, dim),
            v: DMatrix::zeros(n_rows, n_rows),
        }
    }

    /// The number of constraint rows.
    pub fn n_rows(&self) -> usize {
        self.r.len()
    }

    /// The state dimension.
    pub fn dim(&self) -> usize {
        self.h.ncols()
    }

    /// True if every residual and Jacobian entry is finite.
    pub fn is_finite(&self) -> bool {
        self.r.iter().all(|value| value.is_finite()) && self.h.iter().all(|value| value.is_finite())
    }
}
