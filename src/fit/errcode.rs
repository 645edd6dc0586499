use std::fmt::Display;
use std::ops::{BitOr, BitOrAssign};

/// An accumulating status word for node-level fit operations.
///
/// Node operations return an [`ErrCode`] instead of a `Result` so that a
/// traversal can keep going and collect every problem it encounters with
/// `|=`. The driver converts a failed accumulation into the public
/// [`FitError`](crate::FitError) taxonomy at the end.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrCode(u16);

impl ErrCode {
    /// Nothing went wrong.
    pub const OK: ErrCode = ErrCode(0);
    /// A point-of-closest-approach computation failed (recoverable: the
    /// caller falls back to a cruder seed).
    pub const POCA_FAILURE: ErrCode = ErrCode(1 << 0);
    /// The tree cannot be fitted as configured (e.g. no way to seed a
    /// vertex).
    pub const BAD_SETUP: ErrCode = ErrCode(1 << 1);
    /// A covariance factorization failed.
    pub const INVERSION_ERROR: ErrCode = ErrCode(1 << 2);
    /// A constraint produced a non-finite residual or Jacobian.
    pub const DIVERGING_CONSTRAINT: ErrCode = ErrCode(1 << 3);
    /// The iteration limit was reached before the chi-square settled.
    pub const NON_CONVERGING: ErrCode = ErrCode(1 << 4);
    /// An input value was missing or unphysical.
    pub const BAD_INPUT: ErrCode = ErrCode(1 << 5);
    /// Mutually contradictory exact constraints.
    pub const INCONSISTENT: ErrCode = ErrCode(1 << 6);

    /// True if no status bit is set.
    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// True if any status bit is set.
    pub fn is_failure(self) -> bool {
        self.0 != 0
    }

    /// True if every bit of `other` is set in `self`.
    pub fn contains(self, other: ErrCode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ErrCode {
    type Output = ErrCode;
    fn bitor(self, rhs: ErrCode) -> ErrCode {
        ErrCode(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrCode {
    fn bitor_assign(&mut self, rhs: ErrCode) {
        self.0 |= rhs.0;
    }
}

impl Display for ErrCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_success() {
            return write!(f, "success");
        }
        let names = [
            (ErrCode::POCA_FAILURE, "poca failure"),
            (ErrCode::BAD_SETUP, "bad setup"),
            (ErrCode::INVERSION_ERROR, "inversion error"),
            (ErrCode::DIVERGING_CONSTRAINT, "diverging constraint"),
            (ErrCode::NON_CONVERGING, "non-converging"),
            (ErrCode::BAD_INPUT, "bad input"),
            (ErrCode::INCONSISTENT, "inconsistent"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    write!(f, ", ")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulation() {
        let mut status = ErrCode::OK;
        assert!(status.is_success());
        status |= ErrCode::POCA_FAILURE;
        status |= ErrCode::BAD_SETUP;
        assert!(status.is_failure());
        assert!(status.contains(ErrCode::POCA_FAILURE));
        assert!(status.contains(ErrCode::BAD_SETUP));
        assert!(!status.contains(ErrCode::INVERSION_ERROR));
    }

    #[test]
    fn display() {
        assert_eq!(format!("{}", ErrCode::OK), "success");
        assert_eq!(
            format!("{}", ErrCode::BAD_SETUP | ErrCode::BAD_INPUT),
            "bad setup, bad input"
        );
    }
}
