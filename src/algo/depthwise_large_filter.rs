//! Depthwise convolution with large filters, for same-size outputs.
//!
//! The kernel tiles a 3-row slice of the filter and a matching source window
//! through shared memory, so it is only admitted when that tiling fits the
//! device (see [`ResourceEstimate`]). Bias and activation run as a second job
//! on the same stream.

use super::{AlgoId, ExecArgs, LaunchState, Rejection};
use crate::context::ExecContext;
use crate::dtype::{DType, DTypeCategory};
use crate::error::ConvError;
use crate::memory::{TensorND, WorkspaceBundle};
use crate::ops::dispatch;
use crate::postprocess::BiasActivation;
use crate::problem::{ComputeMode, ConvFormat, KernelParam, NonlinearMode, SizeArgs};
use crate::resource::ResourceEstimate;
use crate::stream::Stream;
use std::sync::Arc;

/// Name of this strategy in the algorithm table and in log lines.
pub const NAME: &str = "DEPTHWISE_LARGE_FILTER";

/// Scratch memory an invocation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspacePlan {
    pub byte_size: usize,
    /// Type of the un-biased conv output when it is staged in the workspace.
    pub intermediate_dtype: Option<DType>,
}

impl WorkspacePlan {
    /// No scratch memory; the kernel writes dst directly.
    pub const NONE: Self = Self {
        byte_size: 0,
        intermediate_dtype: None,
    };
}

/// Whether a kernel instantiation exists for `dtype` under `ctx`.
#[must_use]
pub fn kernel_dtype_supported(dtype: DType, ctx: &ExecContext) -> bool {
    match dtype {
        DType::Float32 => true,
        DType::Float16 => ctx.config().supports_fp16(),
        _ => false,
    }
}

/// Footprint of the kernel for `args`.
#[must_use]
pub fn resource_estimate(args: &SizeArgs) -> ResourceEstimate {
    let fm = &args.filter_meta;
    ResourceEstimate::new(fm.spatial[0], fm.spatial[1], args.dst_layout.shape[3])
}

/// Admission check naming the first precondition `args` fails.
///
/// # Errors
/// The [`Rejection`] describing why the problem is not admitted.
pub fn check_available(args: &SizeArgs, ctx: &ExecContext) -> Result<(), Rejection> {
    let verdict = admit(args, ctx);
    if let Err(why) = &verdict {
        tracing::trace!(algo = NAME, reason = %why, problem = %args, "rejected");
    }
    verdict
}

fn admit(args: &SizeArgs, ctx: &ExecContext) -> Result<(), Rejection> {
    if !args.src_layout.is_contiguous() || !args.dst_layout.is_contiguous() {
        return Err(Rejection::NotContiguous);
    }
    let src = args.src_layout.dtype;
    let filter = args.filter_layout.dtype;
    if src != filter {
        return Err(Rejection::DTypeMismatch { src, filter });
    }
    if !kernel_dtype_supported(src, ctx) {
        return Err(Rejection::UnsupportedDType(src));
    }
    if !args.z_layout.is_empty() {
        return Err(Rejection::HasZ);
    }

    let fm = &args.filter_meta;
    if fm.group <= 1 {
        return Err(Rejection::NotGrouped(fm.group));
    }
    if fm.format != ConvFormat::Nchw {
        return Err(Rejection::Format(fm.format));
    }
    // only reachable if the kernel dtype list grows past floats
    if src.category() != DTypeCategory::Float {
        return Err(Rejection::NotFloat(src));
    }
    if args.param.compute_mode != ComputeMode::Default {
        return Err(Rejection::ComputeMode(args.param.compute_mode));
    }
    if fm.spatial_ndim != 2 {
        return Err(Rejection::SpatialRank(fm.spatial_ndim));
    }
    if fm.icpg != 1 {
        return Err(Rejection::NotDepthwise { icpg: fm.icpg });
    }
    if fm.dilation != [1, 1] {
        return Err(Rejection::Dilated(fm.dilation));
    }
    if fm.should_flip {
        return Err(Rejection::Flipped);
    }

    let limits = ctx.limits();
    let geometry = &ctx.config().launch;
    let est = resource_estimate(args);
    tracing::trace!(algo = NAME, ?est, "resource estimate");
    if !est.fits_registers(limits, geometry) {
        return Err(Rejection::RegisterBudget {
            required: est.registers_per_block(geometry),
            available: limits.max_registers_per_block,
        });
    }
    if !est.fits_shared_memory(limits) {
        return Err(Rejection::SharedMemoryBudget {
            required: est.shared_memory_bytes(),
            available: limits.max_shared_memory_bytes,
        });
    }

    let k = KernelParam::from_fwd_args(args);
    if k.stride_h != 1 || k.stride_w != 1 || k.src_h != k.out_h || k.src_w != k.out_w {
        return Err(Rejection::NotSameSize {
            in_h: k.src_h,
            in_w: k.src_w,
            out_h: k.out_h,
            out_w: k.out_w,
            stride: [k.stride_h, k.stride_w],
        });
    }
    Ok(())
}

/// Whether the strategy admits `args` on the device described by `ctx`.
///
/// # Example
///
/// ```
/// use dwconv_bias::algo::depthwise_large_filter::is_available;
/// use dwconv_bias::prelude::*;
///
/// let ctx = ExecContext::with_limits(0, DeviceLimits::TYPICAL, EngineConfig::default());
/// let args = SizeArgs::new(
///     ConvBiasParam::default().group().with_padding(1, 1),
///     TensorLayout::new(vec![1, 4, 16, 16], DType::Float32),
///     TensorLayout::new(vec![4, 1, 1, 3, 3], DType::Float32),
///     TensorLayout::new(vec![1, 4, 1, 1], DType::Float32),
///     TensorLayout::empty(DType::Float32),
///     TensorLayout::new(vec![1, 4, 16, 16], DType::Float32),
/// )?;
/// assert!(is_available(&args, &ctx));
/// # Ok::<(), dwconv_bias::ConvError>(())
/// ```
#[must_use]
pub fn is_available(args: &SizeArgs, ctx: &ExecContext) -> bool {
    check_available(args, ctx).is_ok()
}

/// Stages the conv output in the workspace whenever dst and bias disagree
/// on dtype.
///
/// # Errors
/// [`ConvError::DTypeDeduce`] when no intermediate dtype can be deduced.
pub fn plan_workspace(args: &SizeArgs, ctx: &ExecContext) -> Result<WorkspacePlan, ConvError> {
    if args.dst_layout.dtype == args.bias_layout.dtype {
        return Ok(WorkspacePlan::NONE);
    }
    let dtype = ctx
        .dtype_deducer()
        .deduce_fwd(args.src_layout.dtype, args.filter_layout.dtype)?;
    Ok(WorkspacePlan {
        byte_size: args.dst_layout.with_dtype(dtype).span_bytes(),
        intermediate_dtype: Some(dtype),
    })
}

/// Bytes of scratch memory `exec` needs for `args`.
///
/// # Errors
/// As [`plan_workspace`].
pub fn get_workspace_in_bytes(args: &SizeArgs, ctx: &ExecContext) -> Result<usize, ConvError> {
    plan_workspace(args, ctx).map(|plan| plan.byte_size)
}

type KernelFn = fn(&TensorND, &TensorND, &TensorND, &KernelParam) -> Result<(), ConvError>;

/// A kernel instantiation for one element type.
#[derive(Clone, Copy)]
struct KernelEntry {
    dtype: DType,
    run: KernelFn,
}

#[cfg_attr(not(feature = "fp16"), allow(unused_variables))]
fn select_kernel(dtype: DType, ctx: &ExecContext) -> KernelEntry {
    match dtype {
        DType::Float32 => KernelEntry {
            dtype,
            run: dispatch::run_fwd_depthwise_large_filter::<f32>,
        },
        #[cfg(feature = "fp16")]
        DType::Float16 if ctx.config().supports_fp16() => KernelEntry {
            dtype,
            run: dispatch::run_fwd_depthwise_large_filter::<half::f16>,
        },
        other => panic!("{NAME}: no kernel instantiation for src dtype {other}"),
    }
}

/// Everything one launch needs, owned so it can move onto the stream.
struct PendingLaunch {
    kernel: KernelEntry,
    param: KernelParam,
    src: TensorND,
    filter: TensorND,
    conv_dst: TensorND,
    dst: TensorND,
    bias: TensorND,
    mode: NonlinearMode,
    post: Arc<dyn BiasActivation>,
}

impl PendingLaunch {
    const fn state(&self) -> LaunchState {
        LaunchState::Pending
    }

    fn launch(self, stream: &Stream) -> Result<LaunchState, ConvError> {
        tracing::debug!(
            algo = NAME,
            dtype = %self.kernel.dtype,
            stream = stream.id(),
            state = ?self.state(),
            "launching"
        );
        let Self {
            kernel,
            param,
            src,
            filter,
            conv_dst,
            dst,
            bias,
            mode,
            post,
        } = self;
        let conv_out = conv_dst.clone();
        stream.submit("depthwise_large_filter", move || {
            (kernel.run)(&conv_out, &src, &filter, &param)
        })?;
        let sequence = stream.submit("bias_activation", move || {
            post.apply(&conv_dst, &dst, &bias, mode)
        })?;
        Ok(LaunchState::Launched { sequence })
    }
}

/// Queues the convolution and the bias/activation step on `args.stream`.
///
/// # Errors
/// [`ConvError::WorkspaceTooSmall`] for an undersized workspace; validation
/// and deduction failures while binding the staging tensor; stream faults.
///
/// # Panics
/// If the src dtype has no kernel instantiation. Callers must check
/// [`is_available`] first.
pub fn exec(args: &ExecArgs<'_>, ctx: &ExecContext) -> Result<LaunchState, ConvError> {
    AlgoId::DepthwiseLargeFilter
        .entry()
        .check_workspace(args, ctx)?;
    let plan = plan_workspace(args, ctx)?;
    let conv_dst = match plan.intermediate_dtype {
        Some(dtype) => {
            let bundle = WorkspaceBundle::new(
                args.workspace.clone(),
                &[plan.byte_size],
                ctx.config().workspace_alignment,
            );
            let (buffer, offset) = bundle.get(0)?;
            tracing::debug!(
                algo = NAME,
                %dtype,
                bytes = plan.byte_size,
                "conv output staged in workspace"
            );
            TensorND::new(buffer, offset, args.dst_layout.with_dtype(dtype))?
        }
        None => args.dst.clone(),
    };

    let pending = PendingLaunch {
        kernel: select_kernel(args.src_layout.dtype, ctx),
        param: KernelParam::from_fwd_args(args),
        src: args.src.clone(),
        filter: args.filter.clone(),
        conv_dst,
        dst: args.dst.clone(),
        bias: args.bias.clone(),
        mode: args.nonlinear_mode(),
        post: ctx.bias_activation(),
    };
    pending.launch(args.stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::device::DeviceLimits;
    use crate::layout::TensorLayout;
    use crate::problem::{ConvBiasParam, ConvMode};

    fn ctx() -> ExecContext {
        ExecContext::with_limits(0, DeviceLimits::TYPICAL, EngineConfig::default())
    }

    fn layout(shape: &[usize], dtype: DType) -> TensorLayout {
        TensorLayout::new(shape.to_vec(), dtype)
    }

    fn depthwise(param: ConvBiasParam, c: usize, hw: usize, f: usize, out_hw: usize) -> SizeArgs {
        SizeArgs::new(
            param.group(),
            layout(&[1, c, hw, hw], DType::Float32),
            layout(&[c, 1, 1, f, f], DType::Float32),
            layout(&[1, c, 1, 1], DType::Float32),
            TensorLayout::empty(DType::Float32),
            layout(&[1, c, out_hw, out_hw], DType::Float32),
        )
        .unwrap()
    }

    #[test]
    fn admits_same_size_depthwise() {
        let args = depthwise(ConvBiasParam::default().with_padding(3, 3), 4, 20, 7, 20);
        assert_eq!(check_available(&args, &ctx()), Ok(()));
    }

    #[test]
    fn flipped_filter_is_rejected() {
        let param = ConvBiasParam::default()
            .with_padding(1, 1)
            .with_mode(ConvMode::Convolution);
        let args = depthwise(param, 4, 8, 3, 8);
        assert_eq!(check_available(&args, &ctx()), Err(Rejection::Flipped));
    }

    #[test]
    fn compute_mode_must_be_default() {
        let param = ConvBiasParam::default()
            .with_padding(1, 1)
            .with_compute_mode(ComputeMode::Float32);
        let args = depthwise(param, 4, 8, 3, 8);
        assert_eq!(
            check_available(&args, &ctx()),
            Err(Rejection::ComputeMode(ComputeMode::Float32))
        );
    }

    #[test]
    fn shrinking_output_is_rejected() {
        let args = depthwise(ConvBiasParam::default(), 4, 16, 5, 12);
        assert!(matches!(
            check_available(&args, &ctx()),
            Err(Rejection::NotSameSize { out_h: 12, .. })
        ));
    }

    #[test]
    fn register_budget_is_reported() {
        let tight = ExecContext::with_limits(0, DeviceLimits::new(1024, 49152), EngineConfig::default());
        let args = depthwise(ConvBiasParam::default().with_padding(2, 2), 4, 32, 5, 32);
        assert_eq!(
            check_available(&args, &tight),
            Err(Rejection::RegisterBudget {
                required: 128 * 45,
                available: 1024
            })
        );
    }

    #[test]
    fn fp16_is_gated_by_config() {
        let mk = |dtype| {
            SizeArgs::new(
                ConvBiasParam::default().group().with_padding(1, 1),
                layout(&[1, 2, 8, 8], dtype),
                layout(&[2, 1, 1, 3, 3], dtype),
                layout(&[1, 2, 1, 1], dtype),
                TensorLayout::empty(dtype),
                layout(&[1, 2, 8, 8], dtype),
            )
            .unwrap()
        };
        let args = mk(DType::Float16);
        let off = ExecContext::with_limits(0, DeviceLimits::TYPICAL, EngineConfig::default().with_fp16(false));
        assert_eq!(
            check_available(&args, &off),
            Err(Rejection::UnsupportedDType(DType::Float16))
        );
        assert_eq!(is_available(&args, &ctx()), cfg!(feature = "fp16"));
        assert_eq!(
            check_available(&mk(DType::BFloat16), &ctx()),
            Err(Rejection::UnsupportedDType(DType::BFloat16))
        );
    }

    #[test]
    fn workspace_plan_follows_bias_dtype() {
        let same = depthwise(ConvBiasParam::default().with_padding(1, 1), 4, 8, 3, 8);
        assert_eq!(plan_workspace(&same, &ctx()).unwrap(), WorkspacePlan::NONE);

        let mut mixed = same.clone();
        mixed.dst_layout = mixed.dst_layout.with_dtype(DType::Float16);
        let plan = plan_workspace(&mixed, &ctx()).unwrap();
        assert_eq!(plan.intermediate_dtype, Some(DType::Float32));
        assert_eq!(plan.byte_size, 4 * 8 * 8 * 4);
    }

    #[test]
    fn failed_deduction_is_an_error() {
        let mut args = depthwise(ConvBiasParam::default().with_padding(1, 1), 4, 8, 3, 8);
        args.src_layout.dtype = DType::Float16;
        args.bias_layout.dtype = DType::Int32;
        assert!(matches!(
            get_workspace_in_bytes(&args, &ctx()),
            Err(ConvError::DTypeDeduce { .. })
        ));
    }
}
