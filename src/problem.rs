//! Problem description of a conv-bias invocation.
//!
//! [`SizeArgs`] is what the admission check and the workspace planner see: layouts
//! plus the canonized filter metadata, no device memory. [`KernelParam`] is the
//! flattened geometry handed to the device kernel.

use crate::error::ConvError;
use crate::layout::TensorLayout;
use core::fmt;

/// Memory format of activations and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConvFormat {
    /// Channel-major: `[N, C, H, W]`.
    #[default]
    Nchw,
    /// Channel-last: `[N, H, W, C]`.
    Nhwc,
}

/// Whether the filter carries a leading group dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sparse {
    /// One group, filter `[OC, IC, FH, FW]`.
    #[default]
    Dense,
    /// Grouped, filter `[G, OCPG, ICPG, FH, FW]`.
    Group,
}

/// Convolution vs cross-correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConvMode {
    /// No kernel flip.
    #[default]
    CrossCorrelation,
    /// Flipped kernel (true convolution).
    Convolution,
}

/// Precision requested for intermediate accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeMode {
    /// Accumulate in whatever the kernel natively uses.
    #[default]
    Default,
    /// Force float32 accumulation.
    Float32,
}

/// Nonlinearity fused after the bias add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonlinearMode {
    /// `y = x`
    #[default]
    Identity,
    /// `y = max(x, 0)`
    Relu,
    /// `y = 1 / (1 + e^-x)`
    Sigmoid,
    /// `y = x * relu6(x + 3) / 6`
    HSwish,
}

/// Operator parameters of a conv-bias call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvBiasParam {
    pub format: ConvFormat,
    pub sparse: Sparse,
    pub mode: ConvMode,
    pub compute_mode: ComputeMode,
    pub nonlinear_mode: NonlinearMode,
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilate_h: usize,
    pub dilate_w: usize,
}

impl Default for ConvBiasParam {
    fn default() -> Self {
        Self {
            format: ConvFormat::Nchw,
            sparse: Sparse::Dense,
            mode: ConvMode::CrossCorrelation,
            compute_mode: ComputeMode::Default,
            nonlinear_mode: NonlinearMode::Identity,
            pad_h: 0,
            pad_w: 0,
            stride_h: 1,
            stride_w: 1,
            dilate_h: 1,
            dilate_w: 1,
        }
    }
}

impl ConvBiasParam {
    /// Grouped filter layout.
    #[must_use]
    pub const fn group(mut self) -> Self {
        self.sparse = Sparse::Group;
        self
    }

    #[must_use]
    pub const fn with_format(mut self, format: ConvFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub const fn with_padding(mut self, pad_h: usize, pad_w: usize) -> Self {
        self.pad_h = pad_h;
        self.pad_w = pad_w;
        self
    }

    #[must_use]
    pub const fn with_stride(mut self, stride_h: usize, stride_w: usize) -> Self {
        self.stride_h = stride_h;
        self.stride_w = stride_w;
        self
    }

    #[must_use]
    pub const fn with_dilation(mut self, dilate_h: usize, dilate_w: usize) -> Self {
        self.dilate_h = dilate_h;
        self.dilate_w = dilate_w;
        self
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: ConvMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub const fn with_compute_mode(mut self, compute_mode: ComputeMode) -> Self {
        self.compute_mode = compute_mode;
        self
    }

    #[must_use]
    pub const fn with_nonlinear(mut self, nonlinear_mode: NonlinearMode) -> Self {
        self.nonlinear_mode = nonlinear_mode;
        self
    }
}

/// Filter metadata in a format-independent form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonizedFilterMeta {
    pub format: ConvFormat,
    pub group: usize,
    /// Input channels per group.
    pub icpg: usize,
    /// Output channels per group.
    pub ocpg: usize,
    pub spatial_ndim: usize,
    /// Filter extent `[fh, fw]`.
    pub spatial: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    /// `(spatial - 1) * dilation + 1`
    pub dilated_spatial: [usize; 2],
    /// `true` for [`ConvMode::Convolution`].
    pub should_flip: bool,
}

impl CanonizedFilterMeta {
    /// Reads group/channel/spatial extents out of the filter layout.
    ///
    /// # Errors
    /// [`ConvError::InvalidLayout`] when the filter rank does not match the
    /// format and sparsity; [`ConvError::InvalidParam`] for a zero stride or
    /// dilation, or a dilated extent past `usize::MAX`.
    pub fn canonize(param: &ConvBiasParam, filter: &TensorLayout) -> Result<Self, ConvError> {
        let s = &filter.shape;
        let (group, ocpg, icpg, fh, fw) = match (param.format, param.sparse, s.len()) {
            (ConvFormat::Nchw, Sparse::Dense, 4) => (1, s[0], s[1], s[2], s[3]),
            (ConvFormat::Nchw, Sparse::Group, 5) => (s[0], s[1], s[2], s[3], s[4]),
            (ConvFormat::Nhwc, Sparse::Dense, 4) => (1, s[0], s[3], s[1], s[2]),
            (ConvFormat::Nhwc, Sparse::Group, 5) => (s[0], s[1], s[4], s[2], s[3]),
            _ => {
                return Err(ConvError::InvalidLayout(format!(
                    "filter {filter} does not match {:?}/{:?}",
                    param.format, param.sparse
                )));
            }
        };
        if param.stride_h == 0 || param.stride_w == 0 {
            return Err(ConvError::InvalidParam("stride must be positive".into()));
        }
        if param.dilate_h == 0 || param.dilate_w == 0 {
            return Err(ConvError::InvalidParam("dilation must be positive".into()));
        }
        if group == 0 || ocpg == 0 || icpg == 0 || fh == 0 || fw == 0 {
            return Err(ConvError::InvalidLayout(format!(
                "filter {filter} has an empty dimension"
            )));
        }
        let dilation = [param.dilate_h, param.dilate_w];
        let dilate = |f: usize, d: usize| {
            (f - 1)
                .checked_mul(d)
                .and_then(|v| v.checked_add(1))
                .ok_or_else(|| ConvError::InvalidParam(format!("dilation {d} overflows filter extent {f}")))
        };
        let dilated_spatial = [dilate(fh, dilation[0])?, dilate(fw, dilation[1])?];
        Ok(Self {
            format: param.format,
            group,
            icpg,
            ocpg,
            spatial_ndim: 2,
            spatial: [fh, fw],
            stride: [param.stride_h, param.stride_w],
            padding: [param.pad_h, param.pad_w],
            dilation,
            dilated_spatial,
            should_flip: param.mode == ConvMode::Convolution,
        })
    }

    /// Output extent along one spatial axis; 0 when the filter does not fit.
    fn out_extent(&self, axis: usize, input: usize) -> Result<usize, ConvError> {
        let padded = self.padding[axis]
            .checked_mul(2)
            .and_then(|p| p.checked_add(input))
            .ok_or_else(|| {
                ConvError::InvalidParam(format!("padding {} overflows input {input}", self.padding[axis]))
            })?;
        Ok(padded
            .checked_sub(self.dilated_spatial[axis])
            .map_or(0, |d| d / self.stride[axis] + 1))
    }
}

/// Layout-only view of a conv-bias invocation.
#[derive(Debug, Clone)]
pub struct SizeArgs {
    pub param: ConvBiasParam,
    pub src_layout: TensorLayout,
    pub filter_layout: TensorLayout,
    pub bias_layout: TensorLayout,
    pub z_layout: TensorLayout,
    pub dst_layout: TensorLayout,
    pub filter_meta: CanonizedFilterMeta,
}

impl SizeArgs {
    /// Builds and checks a problem description.
    ///
    /// `bias` and `z` may be [`TensorLayout::empty`] when absent.
    ///
    /// # Errors
    /// [`ConvError::InvalidLayout`] if the ranks, channel counts or output
    /// extents are inconsistent, [`ConvError::InvalidParam`] if padding or
    /// dilation overflow the index range.
    pub fn new(
        param: ConvBiasParam,
        src: TensorLayout,
        filter: TensorLayout,
        bias: TensorLayout,
        z: TensorLayout,
        dst: TensorLayout,
    ) -> Result<Self, ConvError> {
        let fm = CanonizedFilterMeta::canonize(&param, &filter)?;
        if src.ndim() != 4 || dst.ndim() != 4 {
            return Err(ConvError::InvalidLayout(format!(
                "src {src} and dst {dst} must be 4-dimensional"
            )));
        }
        let (c_axis, h_axis) = match param.format {
            ConvFormat::Nchw => (1, 2),
            ConvFormat::Nhwc => (3, 1),
        };
        if src.shape[c_axis] != fm.group * fm.icpg {
            return Err(ConvError::InvalidLayout(format!(
                "src {src} has {} channels, filter expects {}",
                src.shape[c_axis],
                fm.group * fm.icpg
            )));
        }
        let expected_out = [
            src.shape[0],
            fm.group * fm.ocpg,
            fm.out_extent(0, src.shape[h_axis])?,
            fm.out_extent(1, src.shape[h_axis + 1])?,
        ];
        let got_out = [
            dst.shape[0],
            dst.shape[c_axis],
            dst.shape[h_axis],
            dst.shape[h_axis + 1],
        ];
        if expected_out[2] == 0 || expected_out[3] == 0 || expected_out != got_out {
            return Err(ConvError::InvalidLayout(format!(
                "dst {dst} does not match deduced (n, c, h, w) {expected_out:?}"
            )));
        }
        if !z.is_empty() && z.shape != dst.shape {
            return Err(ConvError::InvalidLayout(format!(
                "z {z} must match dst {dst}"
            )));
        }
        Ok(Self {
            param,
            src_layout: src,
            filter_layout: filter,
            bias_layout: bias,
            z_layout: z,
            dst_layout: dst,
            filter_meta: fm,
        })
    }

    /// Nonlinearity fused after the bias add.
    #[must_use]
    pub const fn nonlinear_mode(&self) -> NonlinearMode {
        self.param.nonlinear_mode
    }
}

impl fmt::Display for SizeArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fm = &self.filter_meta;
        write!(
            f,
            "src={} filter={} bias={} z={} dst={} group={} icpg={} ocpg={} \
             pad={:?} stride={:?} dilate={:?} flip={} nonlinear={:?}",
            self.src_layout,
            self.filter_layout,
            self.bias_layout,
            self.z_layout,
            self.dst_layout,
            fm.group,
            fm.icpg,
            fm.ocpg,
            fm.padding,
            fm.stride,
            fm.dilation,
            fm.should_flip,
            self.param.nonlinear_mode
        )
    }
}

/// Flattened geometry of a channel-wise forward convolution in NCHW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelParam {
    pub batch: usize,
    pub src_chl: usize,
    pub src_h: usize,
    pub src_w: usize,
    /// Output channels produced per input channel.
    pub chl_mul: usize,
    pub flt_h: usize,
    pub flt_w: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
}

impl KernelParam {
    /// Extracts the kernel geometry from an NCHW problem.
    #[must_use]
    pub fn from_fwd_args(args: &SizeArgs) -> Self {
        let fm = &args.filter_meta;
        let src = &args.src_layout.shape;
        let dst = &args.dst_layout.shape;
        Self {
            batch: src[0],
            src_chl: src[1],
            src_h: src[2],
            src_w: src[3],
            chl_mul: fm.ocpg,
            flt_h: fm.spatial[0],
            flt_w: fm.spatial[1],
            out_h: dst[2],
            out_w: dst[3],
            pad_h: fm.padding[0],
            pad_w: fm.padding[1],
            stride_h: fm.stride[0],
            stride_w: fm.stride[1],
            dilation_h: fm.dilation[0],
            dilation_w: fm.dilation[1],
        }
    }

    /// Elements in the source tensor.
    #[must_use]
    pub const fn src_elems(&self) -> usize {
        self.batch * self.src_chl * self.src_h * self.src_w
    }

    /// Elements in the filter tensor.
    #[must_use]
    pub const fn flt_elems(&self) -> usize {
        self.src_chl * self.chl_mul * self.flt_h * self.flt_w
    }

    /// Elements in the output tensor.
    #[must_use]
    pub const fn dst_elems(&self) -> usize {
        self.batch * self.src_chl * self.chl_mul * self.out_h * self.out_w
    }
}
