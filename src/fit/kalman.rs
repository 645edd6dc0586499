use nalgebra::{DMatrix, DVector};

use crate::{
    fit::constraint::ConstraintKind,
    fit::errcode::ErrCode,
    fit::params::FitParams,
    fit::projection::Projection,
    fit::tree::ParticleId,
    Float,
};

/// Fold one projected constraint into the state.
///
/// The projection was evaluated at `reference`, so the residual is first
/// carried to the current state with the linear term
/// `r + H (par - reference)`. The gain solve goes through a Cholesky
/// factorization of `H C Hᵀ + V`; a factorization failure reports
/// [`ErrCode::INVERSION_ERROR`] and leaves the state untouched.
pub(crate) fn filter(
    params: &mut FitParams,
    projection: &Projection,
    reference: &DVector<Float>,
    particle: ParticleId,
    kind: ConstraintKind,
) -> ErrCode {
    if !projection.is_finite() {
        return ErrCode::DIVERGING_CONSTRAINT;
    }
    let residual = &projection.r + &projection.h * (params.par() - reference);
    if residual.iter().any(|value| !value.is_finite()) {
        return ErrCode::DIVERGING_CONSTRAINT;
    }

    let ch_t = params.cov() * projection.h.transpose();
    let mut r_matrix = &projection.h * &ch_t + &projection.v;
    symmetrize(&mut r_matrix);
    let Some(cholesky) = r_matrix.cholesky() else {
        return ErrCode::INVERSION_ERROR;
    };

    // K = C Hᵀ R⁻¹, applied transposed so a single solve serves both the
    // state and the covariance update
    let gain_t = cholesky.solve(&ch_t.transpose());
    let correction = gain_t.transpose() * &residual;
    *params.par_mut() -= correction;
    let downdate = &ch_t * &gain_t;
    *params.cov_mut() -= downdate;
    symmetrize(params.cov_mut());

    let chi_square = residual.dot(&cholesky.solve(&residual));
    if !chi_square.is_finite() {
        return ErrCode::DIVERGING_CONSTRAINT;
    }
    params.add_chi_square(particle, kind, chi_square, projection.n_rows());
    ErrCode::OK
}

fn symmetrize(matrix: &mut DMatrix<Float>) {
    for row in 0..matrix.nrows() {
        for col in 0..row {
            let mean = 0.5 * (matrix[(row, col)] + matrix[(col, row)]);
            matrix[(row, col)] = mean;
            matrix[(col, row)] = mean;
        }
    }
}
