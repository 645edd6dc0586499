use indexmap::IndexMap;
use nalgebra::{DMatrix, DVector};

use crate::{
    fit::constraint::ConstraintKind,
    fit::tree::ParticleId,
    Float,
};

/// The global fit state: the stacked parameter vector of every node, its
/// covariance, and the chi-square ledger of the current filter sweep.
///
/// Owned by the driver and passed by reference into node operations; nodes
/// address it through their index ranges and never hold on to it.
#[derive(Clone, Debug)]
pub struct FitParams {
    par: DVector<Float>,
    cov: DMatrix<Float>,
    chi_squares: IndexMap<(ParticleId, ConstraintKind), (Float, usize)>,
}

impl FitParams {
    /// Create a zeroed state of the given dimension.
    pub fn new(dim: usize) -> Self {
        Self {
            par: DVector::zeros(dim),
            cov: DMatrix::zeros(dim, dim),
            chi_squares: IndexMap::new(),
        }
    }

    /// The state dimension.
    pub fn dim(&self) -> usize {
        self.par.len()
    }

    /// The parameter vector.
    pub fn par(&self) -> &DVector<Float> {
        &self.par
    }

    /// Mutable access to the parameter vector.
    pub fn par_mut(&mut self) -> &mut DVector<Float> {
        &mut self.par
    }

    /// The covariance matrix.
    pub fn cov(&self) -> &DMatrix<Float> {
        &self.cov
    }

    /// Mutable access to the covariance matrix.
    pub fn cov_mut(&mut self) -> &mut DMatrix<Float> {
        &mut self.cov
    }

    /// Zero the covariance ahead of a fresh seeding pass.
    pub fn reset_covariance(&mut self) {
        self.cov.fill(0.0);
    }

    /// Clear the chi-square ledger ahead of a filter sweep.
    pub fn reset_chi_square(&mut self) {
        self.chi_squares.clear();
    }

    /// Record the chi-square contribution of one filtered constraint.
    pub fn add_chi_square(
        &mut self,
        particle: ParticleId,
        kind: ConstraintKind,
        chi_square: Float,
        n_rows: usize,
    ) {
        let entry = self
            .chi_squares
            .entry((particle, kind))
            .or_insert((0.0, 0));
        entry.0 += chi_square;
        entry.1 += n_rows;
    }

    /// The total chi-square of the current sweep.
    pub fn chi_square(&self) -> Float {
        self.chi_squares.values().map(|(chi_square, _)| chi_square).sum()
    }

    /// The chi-square accumulated by the given node's own constraints.
    pub fn node_chi_square(&self, particle: ParticleId) -> Float {
        self.chi_squares
            .iter()
            .filter(|((id, _), _)| *id == particle)
            .map(|(_, (chi_square, _))| chi_square)
            .sum()
    }

    /// True if every parameter and covariance entry is finite.
    pub fn is_finite(&self) -> bool {
        self.par.iter().all(|value| value.is_finite())
            && self.cov.iter().all(|value| value.is_finite())
    }
}
