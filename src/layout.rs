//! Tensor layouts: shape, element strides and dtype.
//!
//! A layout with zero dimensions is the "absent tensor" marker, used for an
//! unused bias or Z input.

use crate::dtype::DType;
use crate::error::ConvError;
use core::fmt;

/// Shape, strides (in elements) and dtype of a tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLayout {
    /// Extent of each dimension.
    pub shape: Vec<usize>,
    /// Stride of each dimension, in elements.
    pub stride: Vec<isize>,
    /// Element type.
    pub dtype: DType,
}

/// Element range `[low, high)` addressed by a layout, relative to its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Lowest element offset (may be negative with negative strides).
    pub low_elem: isize,
    /// One past the highest element offset.
    pub high_elem: isize,
}

impl Span {
    /// Number of elements between the bounds.
    #[must_use]
    pub const fn dist_elem(&self) -> usize {
        self.high_elem.abs_diff(self.low_elem)
    }
}

impl TensorLayout {
    /// Creates a contiguous row-major layout.
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        let shape = shape.into();
        let stride = contiguous_strides(&shape);
        Self { shape, stride, dtype }
    }

    /// Creates a layout with explicit element strides.
    ///
    /// # Errors
    /// [`ConvError::InvalidLayout`] if `shape` and `stride` differ in length.
    pub fn with_strides(
        shape: impl Into<Vec<usize>>,
        stride: impl Into<Vec<isize>>,
        dtype: DType,
    ) -> Result<Self, ConvError> {
        let shape = shape.into();
        let stride = stride.into();
        if shape.len() != stride.len() {
            return Err(ConvError::InvalidLayout(format!(
                "shape {shape:?} has {} dims but stride {stride:?} has {}",
                shape.len(),
                stride.len()
            )));
        }
        Ok(Self { shape, stride, dtype })
    }

    /// The zero-dimensional "absent tensor" layout.
    #[must_use]
    pub const fn empty(dtype: DType) -> Self {
        Self {
            shape: Vec::new(),
            stride: Vec::new(),
            dtype,
        }
    }

    /// Number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// `true` for the absent-tensor marker.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    /// Total number of elements; 0 for the absent-tensor marker.
    #[must_use]
    pub fn total_nr_elems(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.shape.iter().product()
        }
    }

    /// Whether the elements are densely packed in row-major order.
    ///
    /// Dimensions of extent 1 may carry any stride.
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        let mut expected: isize = 1;
        for (&extent, &stride) in self.shape.iter().zip(&self.stride).rev() {
            if extent != 1 && stride != expected {
                return false;
            }
            expected *= extent as isize;
        }
        true
    }

    /// Element range addressed by this layout.
    #[must_use]
    pub fn span(&self) -> Span {
        if self.is_empty() || self.shape.contains(&0) {
            return Span {
                low_elem: 0,
                high_elem: 0,
            };
        }
        let (mut low, mut high) = (0isize, 0isize);
        for (&extent, &stride) in self.shape.iter().zip(&self.stride) {
            let reach = stride * (extent as isize - 1);
            if reach < 0 {
                low += reach;
            } else {
                high += reach;
            }
        }
        Span {
            low_elem: low,
            high_elem: high + 1,
        }
    }

    /// Byte distance covered by [`span`](Self::span).
    #[must_use]
    pub fn span_bytes(&self) -> usize {
        self.span().dist_elem() * self.dtype.size_in_bytes()
    }

    /// Same geometry, different element type.
    #[must_use]
    pub fn with_dtype(&self, dtype: DType) -> Self {
        Self {
            dtype,
            ..self.clone()
        }
    }
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.shape)?;
        if !self.is_contiguous() {
            write!(f, "s{:?}", self.stride)?;
        }
        write!(f, ":{}", self.dtype)
    }
}

/// Row-major strides for `shape`.
#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<isize> {
    let mut stride = vec![0isize; shape.len()];
    let mut acc: isize = 1;
    for (s, &extent) in stride.iter_mut().zip(shape).rev() {
        *s = acc;
        acc *= extent.max(1) as isize;
    }
    stride
}
