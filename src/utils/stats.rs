use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::Float;

/// Upper tail of the chi-square distribution: the probability that a
/// chi-square variable with `ndf` degrees of freedom exceeds `chi_square`.
pub fn chi_square_prob(chi_square: Float, ndf: usize) -> Float {
    if ndf == 0 || !chi_square.is_finite() {
        return 0.0;
    }
    if chi_square <= 0.0 {
        return 1.0;
    }
    let distribution = ChiSquared::new(ndf as f64).expect("positive degrees of freedom");
    (1.0 - distribution.cdf(chi_square as f64)).clamp(0.0, 1.0) as Float
}
