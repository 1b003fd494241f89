//! Element types and the forward dtype-inference rule.

use crate::error::ConvError;
use core::fmt;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// IEEE 754 single precision.
    Float32,
    /// IEEE 754 half precision.
    Float16,
    /// bfloat16.
    BFloat16,
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 8-bit integer.
    Uint8,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
}

/// Coarse classification of a [`DType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DTypeCategory {
    /// Floating-point types.
    Float,
    /// Integer types.
    Int,
}

impl DType {
    /// Size of one element in bytes.
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::Float32 | Self::Int32 => 4,
            Self::Float16 | Self::BFloat16 | Self::Int16 => 2,
            Self::Int8 | Self::Uint8 => 1,
        }
    }

    /// Category of this dtype.
    #[must_use]
    pub const fn category(self) -> DTypeCategory {
        match self {
            Self::Float32 | Self::Float16 | Self::BFloat16 => DTypeCategory::Float,
            Self::Int8 | Self::Uint8 | Self::Int16 | Self::Int32 => DTypeCategory::Int,
        }
    }

    /// Short name, as used in log lines.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Float32 => "Float32",
            Self::Float16 => "Float16",
            Self::BFloat16 => "BFloat16",
            Self::Int8 => "Int8",
            Self::Uint8 => "Uint8",
            Self::Int16 => "Int16",
            Self::Int32 => "Int32",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Deduces the raw convolution output type from the two input types.
///
/// The conv-bias algorithms use this when the destination and bias dtypes
/// differ: the raw convolution is then materialized in the deduced type and
/// converted by the bias/activation step.
pub trait DTypeDeducer: Send + Sync {
    /// Returns the accumulator dtype for `src` convolved with `filter`.
    ///
    /// # Errors
    /// [`ConvError::DTypeDeduce`] when the pair has no defined output type.
    fn deduce_fwd(&self, src: DType, filter: DType) -> Result<DType, ConvError>;
}

/// Default forward rule: matching float inputs keep their type, small integer
/// inputs accumulate in `Int32`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDTypeDeducer;

impl DTypeDeducer for DefaultDTypeDeducer {
    fn deduce_fwd(&self, src: DType, filter: DType) -> Result<DType, ConvError> {
        use DType::{Int16, Int32, Int8, Uint8};
        match (src, filter) {
            (s, f) if s == f && s.category() == DTypeCategory::Float => Ok(s),
            (Int8 | Uint8, Int8 | Uint8) | (Int16, Int16) => Ok(Int32),
            _ => Err(ConvError::DTypeDeduce { src, filter }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_pairs_keep_their_type() {
        let d = DefaultDTypeDeducer;
        assert_eq!(d.deduce_fwd(DType::Float32, DType::Float32).unwrap(), DType::Float32);
        assert_eq!(d.deduce_fwd(DType::Float16, DType::Float16).unwrap(), DType::Float16);
    }

    #[test]
    fn int8_accumulates_in_int32() {
        let d = DefaultDTypeDeducer;
        assert_eq!(d.deduce_fwd(DType::Int8, DType::Int8).unwrap(), DType::Int32);
        assert_eq!(d.deduce_fwd(DType::Uint8, DType::Int8).unwrap(), DType::Int32);
    }

    #[test]
    fn mixed_floats_are_rejected() {
        let err = DefaultDTypeDeducer
            .deduce_fwd(DType::Float32, DType::Float16)
            .unwrap_err();
        assert!(matches!(err, ConvError::DTypeDeduce { .. }));
    }

    #[test]
    fn sizes_and_categories() {
        assert_eq!(DType::Float16.size_in_bytes(), 2);
        assert_eq!(DType::Int32.size_in_bytes(), 4);
        assert_eq!(DType::BFloat16.category(), DTypeCategory::Float);
        assert_eq!(DType::Uint8.category(), DTypeCategory::Int);
    }
}
