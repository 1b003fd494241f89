//! Utilities to approximate equality of floating point values.
//!
//! Distances are relative: `|a - b| / max(|a|, |b|, 1)`, so values near zero
//! are compared absolutely and large values proportionally.

/// Loosest accepted relative error on `f32`s.
pub const F32_MAX_ERROR: f32 = 1e-3;

/// Expected relative error of an `f32` reduction.
pub const F32_AVG_ERROR: f32 = 1e-5;

/// Best expected relative error on `f32`s.
pub const F32_MIN_ERROR: f32 = 1e-6;

/// Tolerance for results that passed through half precision.
pub const F16_MAX_ERROR: f32 = 1e-2;

/// Relative distance between `a` and `b`.
#[must_use]
pub fn relative_error(a: f32, b: f32) -> f32 {
    (a - b).abs() / a.abs().max(b.abs()).max(1.0)
}

/// `a` and `b` are within `tol` relative error.
#[must_use]
pub fn approx_eq_rel(a: f32, b: f32, tol: f32) -> bool {
    relative_error(a, b) <= tol
}

/// The approximated equality enumerated.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Within [`F32_MIN_ERROR`].
    Precise = 0,
    /// Within [`F32_AVG_ERROR`].
    Partial = 1,
    /// Within [`F32_MAX_ERROR`].
    Relative = 2,
    /// No relative equality.
    Scarce = 3,
}

impl ApproxEquality {
    /// Grades one pair.
    #[must_use]
    pub fn of(a: f32, b: f32) -> Self {
        let err = relative_error(a, b);
        if err < F32_MIN_ERROR {
            Self::Precise
        } else if err < F32_AVG_ERROR {
            Self::Partial
        } else if err < F32_MAX_ERROR {
            Self::Relative
        } else {
            Self::Scarce
        }
    }

    /// Worst grade over two slices; `Scarce` if the lengths differ.
    #[must_use]
    pub fn of_slices(a: &[f32], b: &[f32]) -> Self {
        if a.len() != b.len() {
            return Self::Scarce;
        }
        a.iter()
            .zip(b)
            .map(|(&x, &y)| Self::of(x, y))
            .max()
            .unwrap_or(Self::Precise)
    }
}

/// Index and values of the first pair further apart than `tol`, if any.
#[must_use]
pub fn first_mismatch(a: &[f32], b: &[f32], tol: f32) -> Option<(usize, f32, f32)> {
    a.iter()
        .zip(b)
        .enumerate()
        .find(|(_, (x, y))| !approx_eq_rel(**x, **y, tol))
        .map(|(i, (&x, &y))| (i, x, y))
}

/// Every pair is within `tol` and the lengths match.
#[must_use]
pub fn all_close(a: &[f32], b: &[f32], tol: f32) -> bool {
    a.len() == b.len() && first_mismatch(a, b, tol).is_none()
}
