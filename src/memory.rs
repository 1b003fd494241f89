//! Device memory as seen by the kernels: buffers, tensors and workspaces.
//!
//! A [`DeviceBuffer`] is a word-aligned byte store shared between the host and
//! the stream worker. Kernels copy what they read out of a buffer before they
//! take the write lock of another, so aliased inputs and outputs never hold
//! two locks on the same buffer at once.

use crate::dtype::DType;
use crate::error::ConvError;
use crate::layout::TensorLayout;
use briny::prelude::*;
use bytemuck::Pod;
use half::{bf16, f16};
use parking_lot::RwLock;
use std::sync::Arc;

/// Bytes of device memory, shared by handle.
#[derive(Debug, Clone)]
pub struct DeviceBuffer {
    words: Arc<RwLock<Vec<u64>>>,
    len_bytes: usize,
}

impl DeviceBuffer {
    /// Allocates `len_bytes` zeroed bytes.
    #[must_use]
    pub fn zeroed(len_bytes: usize) -> Self {
        Self {
            words: Arc::new(RwLock::new(vec![0u64; len_bytes.div_ceil(8)])),
            len_bytes,
        }
    }

    /// Allocates a buffer holding a copy of `data`.
    #[must_use]
    pub fn from_slice<T: Pod>(data: &[T]) -> Self {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buf = Self::zeroed(bytes.len());
        bytemuck::cast_slice_mut::<u64, u8>(buf.words.write().as_mut_slice())[..bytes.len()]
            .copy_from_slice(bytes);
        buf
    }

    /// Size in bytes.
    #[must_use]
    pub const fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    /// Copies `count` elements of `T` starting at byte `offset`.
    ///
    /// # Errors
    /// [`ConvError::Validation`] if the range leaves the buffer or `offset` is
    /// not aligned for `T`.
    pub fn read<T: Pod>(&self, offset: usize, count: usize) -> Result<Vec<T>, ConvError> {
        let len = count * size_of::<T>();
        let guard = self.words.read_recursive();
        let bytes = self.byte_range(bytemuck::cast_slice(guard.as_slice()), offset, len)?;
        let typed: &[T] = bytemuck::try_cast_slice(bytes).map_err(|_| ValidationError)?;
        Ok(typed.to_vec())
    }

    /// Overwrites elements starting at byte `offset` with `data`.
    ///
    /// # Errors
    /// [`ConvError::Validation`] if the range leaves the buffer.
    pub fn write<T: Pod>(&self, offset: usize, data: &[T]) -> Result<(), ConvError> {
        let src: &[u8] = bytemuck::cast_slice(data);
        let mut guard = self.words.write();
        let all = bytemuck::cast_slice_mut::<u64, u8>(guard.as_mut_slice());
        let end = offset.checked_add(src.len()).ok_or(ValidationError)?;
        if end > self.len_bytes {
            return Err(ValidationError.into());
        }
        all[offset..end].copy_from_slice(src);
        Ok(())
    }

    /// Host copy of the whole buffer as `T`.
    ///
    /// # Errors
    /// [`ConvError::Validation`] if the length is not a multiple of `T`.
    pub fn to_vec<T: Pod>(&self) -> Result<Vec<T>, ConvError> {
        if self.len_bytes % size_of::<T>() != 0 {
            return Err(ValidationError.into());
        }
        self.read(0, self.len_bytes / size_of::<T>())
    }

    fn byte_range<'a>(&self, all: &'a [u8], offset: usize, len: usize) -> Result<&'a [u8], ConvError> {
        let end = offset.checked_add(len).ok_or(ValidationError)?;
        if end > self.len_bytes {
            return Err(ValidationError.into());
        }
        Ok(&all[offset..end])
    }
}

/// A device tensor: buffer, byte offset and layout.
#[derive(Debug, Clone)]
pub struct TensorND {
    pub buffer: DeviceBuffer,
    /// Byte offset of element 0.
    pub offset: usize,
    pub layout: TensorLayout,
}

impl Validate for TensorND {
    fn validate(&self) -> Result<(), ValidationError> {
        let esize = self.layout.dtype.size_in_bytes();
        if self.offset % esize != 0 {
            return Err(ValidationError);
        }
        let span = self.layout.span();
        let low = self.offset as isize + span.low_elem * esize as isize;
        let high = self.offset as isize + span.high_elem * esize as isize;
        if low < 0 || high > self.buffer.len_bytes() as isize {
            return Err(ValidationError);
        }
        Ok(())
    }
}

impl TensorND {
    /// Wraps a buffer region as a tensor.
    ///
    /// # Errors
    /// [`ConvError::Validation`] if the layout reaches outside the buffer or
    /// the offset is misaligned.
    pub fn new(buffer: DeviceBuffer, offset: usize, layout: TensorLayout) -> Result<Self, ConvError> {
        let t = Self {
            buffer,
            offset,
            layout,
        };
        t.validate()?;
        Ok(t)
    }

    /// Allocates a contiguous tensor holding `data`.
    ///
    /// # Errors
    /// [`ConvError::InvalidLayout`] if `T` does not match the dtype size or
    /// `data` has the wrong length.
    pub fn from_slice<T: Pod>(layout: TensorLayout, data: &[T]) -> Result<Self, ConvError> {
        if size_of::<T>() != layout.dtype.size_in_bytes() || data.len() != layout.total_nr_elems() {
            return Err(ConvError::InvalidLayout(format!(
                "{} elements of {} bytes cannot back {layout}",
                data.len(),
                size_of::<T>()
            )));
        }
        Self::new(DeviceBuffer::from_slice(data), 0, layout)
    }

    /// Allocates a zeroed contiguous tensor.
    #[must_use]
    pub fn zeroed(layout: TensorLayout) -> Self {
        Self {
            buffer: DeviceBuffer::zeroed(layout.span_bytes()),
            offset: 0,
            layout,
        }
    }

    /// An absent tensor (empty layout, empty buffer).
    #[must_use]
    pub fn absent(dtype: DType) -> Self {
        Self::zeroed(TensorLayout::empty(dtype))
    }

    /// Copies the elements out as `T`.
    ///
    /// # Errors
    /// [`ConvError::InvalidLayout`] for non-contiguous tensors or a `T` of the
    /// wrong size.
    pub fn read_vec<T: Pod>(&self) -> Result<Vec<T>, ConvError> {
        self.check_plain::<T>()?;
        self.buffer.read(self.offset, self.layout.total_nr_elems())
    }

    /// Overwrites the elements with `data`.
    ///
    /// # Errors
    /// As [`read_vec`](Self::read_vec), plus a length mismatch.
    pub fn write_slice<T: Pod>(&self, data: &[T]) -> Result<(), ConvError> {
        self.check_plain::<T>()?;
        if data.len() != self.layout.total_nr_elems() {
            return Err(ConvError::InvalidLayout(format!(
                "{} elements written into {}",
                data.len(),
                self.layout
            )));
        }
        self.buffer.write(self.offset, data)
    }

    /// Reads the elements converted to `f32`.
    ///
    /// # Errors
    /// As [`read_vec`](Self::read_vec).
    pub fn read_f32(&self) -> Result<Vec<f32>, ConvError> {
        Ok(match self.layout.dtype {
            DType::Float32 => self.read_vec::<f32>()?,
            DType::Float16 => self.read_vec::<f16>()?.into_iter().map(f16::to_f32).collect(),
            DType::BFloat16 => self.read_vec::<bf16>()?.into_iter().map(bf16::to_f32).collect(),
            DType::Int8 => self.read_vec::<i8>()?.into_iter().map(f32::from).collect(),
            DType::Uint8 => self.read_vec::<u8>()?.into_iter().map(f32::from).collect(),
            DType::Int16 => self.read_vec::<i16>()?.into_iter().map(f32::from).collect(),
            DType::Int32 => self.read_vec::<i32>()?.into_iter().map(|v| v as f32).collect(),
        })
    }

    /// Writes `f32` values converted to the tensor's dtype.
    ///
    /// Integer targets round to nearest and saturate; NaN becomes 0.
    ///
    /// # Errors
    /// As [`write_slice`](Self::write_slice).
    pub fn write_f32(&self, data: &[f32]) -> Result<(), ConvError> {
        match self.layout.dtype {
            DType::Float32 => self.write_slice(data),
            DType::Float16 => self.write_slice(&data.iter().map(|&v| f16::from_f32(v)).collect::<Vec<_>>()),
            DType::BFloat16 => self.write_slice(&data.iter().map(|&v| bf16::from_f32(v)).collect::<Vec<_>>()),
            DType::Int8 => self.write_slice(&data.iter().map(|&v| v.round() as i8).collect::<Vec<_>>()),
            DType::Uint8 => self.write_slice(&data.iter().map(|&v| v.round() as u8).collect::<Vec<_>>()),
            DType::Int16 => self.write_slice(&data.iter().map(|&v| v.round() as i16).collect::<Vec<_>>()),
            DType::Int32 => self.write_slice(&data.iter().map(|&v| v.round() as i32).collect::<Vec<_>>()),
        }
    }

    fn check_plain<T>(&self) -> Result<(), ConvError> {
        if !self.layout.is_contiguous() {
            return Err(ConvError::InvalidLayout(format!(
                "{} is not contiguous",
                self.layout
            )));
        }
        if size_of::<T>() != self.layout.dtype.size_in_bytes() {
            return Err(ConvError::UnsupportedDType(self.layout.dtype));
        }
        Ok(())
    }
}

/// Caller-provided scratch memory.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    pub buffer: Option<DeviceBuffer>,
    /// Byte offset of the usable region.
    pub offset: usize,
    /// Usable bytes.
    pub size: usize,
}

impl Workspace {
    /// No scratch memory.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// The whole of `buffer`.
    #[must_use]
    pub fn new(buffer: DeviceBuffer) -> Self {
        let size = buffer.len_bytes();
        Self {
            buffer: Some(buffer),
            offset: 0,
            size,
        }
    }

    /// Allocates a fresh workspace of `size` bytes (nothing for 0).
    #[must_use]
    pub fn alloc(size: usize) -> Self {
        if size == 0 {
            Self::empty()
        } else {
            Self::new(DeviceBuffer::zeroed(size))
        }
    }
}

/// Splits one workspace into aligned chunks.
#[derive(Debug, Clone)]
pub struct WorkspaceBundle {
    base: Workspace,
    sizes: Vec<usize>,
    offsets: Vec<usize>,
    total: usize,
}

impl WorkspaceBundle {
    /// Chunk alignment in bytes.
    pub const DEFAULT_ALIGN: usize = 512;

    /// Lays out `sizes` back to back, each chunk starting on `align` bytes.
    #[must_use]
    pub fn new(base: Workspace, sizes: &[usize], align: usize) -> Self {
        let align = align.max(1);
        let mut offsets = Vec::with_capacity(sizes.len());
        let mut cursor = 0;
        for &size in sizes {
            offsets.push(cursor);
            cursor += size.div_ceil(align) * align;
        }
        let total = match (offsets.last(), sizes.last()) {
            (Some(&o), Some(&s)) => o + s,
            _ => 0,
        };
        Self {
            base,
            sizes: sizes.to_vec(),
            offsets,
            total,
        }
    }

    /// Bytes the base workspace must provide.
    #[must_use]
    pub const fn total_size_in_bytes(&self) -> usize {
        self.total
    }

    /// Size of chunk `i`.
    #[must_use]
    pub fn get_size(&self, i: usize) -> usize {
        self.sizes.get(i).copied().unwrap_or(0)
    }

    /// Buffer and absolute byte offset of chunk `i`.
    ///
    /// # Errors
    /// [`ConvError::InvalidParam`] for an unknown chunk, and
    /// [`ConvError::Validation`] if the base workspace is missing or too small.
    pub fn get(&self, i: usize) -> Result<(DeviceBuffer, usize), ConvError> {
        let offset = *self
            .offsets
            .get(i)
            .ok_or_else(|| ConvError::InvalidParam(format!("workspace chunk {i} does not exist")))?;
        let buffer = self.base.buffer.clone().ok_or(ValidationError)?;
        if offset + self.sizes[i] > self.base.size {
            return Err(ValidationError.into());
        }
        Ok((buffer, self.base.offset + offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_roundtrips_through_f32_conversion() {
        let layout = TensorLayout::new(vec![4], DType::Float16);
        let t = TensorND::zeroed(layout);
        t.write_f32(&[1.0, -2.5, 0.25, 1024.0]).unwrap();
        assert_eq!(t.read_f32().unwrap(), vec![1.0, -2.5, 0.25, 1024.0]);
        assert_eq!(t.buffer.len_bytes(), 8);
    }

    #[test]
    fn integer_targets_round_and_saturate() {
        let t = TensorND::zeroed(TensorLayout::new(vec![3], DType::Int8));
        t.write_f32(&[1.6, -300.0, 127.4]).unwrap();
        assert_eq!(t.read_vec::<i8>().unwrap(), vec![2, -128, 127]);
    }

    #[test]
    fn nan_writes_zero_into_integer_targets() {
        let t = TensorND::zeroed(TensorLayout::new(vec![2], DType::Int32));
        t.write_f32(&[f32::NAN, 7.0]).unwrap();
        assert_eq!(t.read_vec::<i32>().unwrap(), vec![0, 7]);
    }

    #[test]
    fn tensors_must_stay_inside_their_buffer() {
        let buf = DeviceBuffer::zeroed(16);
        assert!(TensorND::new(buf.clone(), 0, TensorLayout::new(vec![4], DType::Float32)).is_ok());
        assert!(TensorND::new(buf.clone(), 4, TensorLayout::new(vec![4], DType::Float32)).is_err());
        // misaligned for f32
        assert!(TensorND::new(buf, 2, TensorLayout::new(vec![2], DType::Float32)).is_err());
    }

    #[test]
    fn offset_tensor_reads_its_own_region() {
        let buf = DeviceBuffer::from_slice(&[1.0f32, 2.0, 3.0, 4.0]);
        let t = TensorND::new(buf, 8, TensorLayout::new(vec![2], DType::Float32)).unwrap();
        assert_eq!(t.read_vec::<f32>().unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn bundle_aligns_chunks() {
        let bundle = WorkspaceBundle::new(Workspace::alloc(2048), &[100, 700, 4], 512);
        assert_eq!(bundle.total_size_in_bytes(), 1536 + 4);
        assert_eq!(bundle.get(1).unwrap().1, 512);
        assert_eq!(bundle.get(2).unwrap().1, 1536);
        assert_eq!(bundle.get_size(1), 700);
        assert!(bundle.get(3).is_err());
    }

    #[test]
    fn bundle_over_small_workspace_fails_on_access() {
        let bundle = WorkspaceBundle::new(Workspace::alloc(64), &[128], 512);
        assert!(matches!(bundle.get(0), Err(ConvError::Validation(_))));
        let none = WorkspaceBundle::new(Workspace::empty(), &[16], 512);
        assert!(none.get(0).is_err());
    }
}
