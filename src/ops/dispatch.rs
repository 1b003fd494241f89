//! Kernel dispatch across compute backends.
//!
//! The entry points here are what the algorithm table binds per dtype. Each
//! one moves tensor contents to the host, runs the kernel on the active
//! [`Backend`], and writes the raw result back:
//! 1. `Wgpu` (if enabled and a device can be opened)
//! 2. Falls back to `Cpu`

use super::cpu::{self, KernelElement};
use crate::backend::{Backend, get_backend};
use crate::error::ConvError;
use crate::memory::TensorND;
use crate::problem::KernelParam;

/// Runs the depthwise large-filter kernel: `dst = src (*) flt`, no bias.
///
/// `dst` may have a different dtype than `T`; the `f32` accumulators are
/// converted on write.
///
/// # Errors
/// [`ConvError::UnsupportedDType`] if `src` or `flt` are not `T`, and
/// [`ConvError::InvalidLayout`] if any tensor disagrees with `param`.
pub fn run_fwd_depthwise_large_filter<T: KernelElement>(
    dst: &TensorND,
    src: &TensorND,
    flt: &TensorND,
    param: &KernelParam,
) -> Result<(), ConvError> {
    for t in [src, flt] {
        if t.layout.dtype != T::DTYPE {
            return Err(ConvError::UnsupportedDType(t.layout.dtype));
        }
    }
    let expect = [
        (src, param.src_elems()),
        (flt, param.flt_elems()),
        (dst, param.dst_elems()),
    ];
    for (t, elems) in expect {
        if t.layout.total_nr_elems() != elems {
            return Err(ConvError::InvalidLayout(format!(
                "{} does not hold the {elems} elements of {param:?}",
                t.layout
            )));
        }
    }

    let src_data = src.read_vec::<T>()?;
    let flt_data = flt.read_vec::<T>()?;
    let out = depthwise_large_filter(&src_data, &flt_data, param);
    dst.write_f32(&out)
}

fn depthwise_large_filter<T: KernelElement>(src: &[T], flt: &[T], param: &KernelParam) -> Vec<f32> {
    if get_backend() == Backend::Wgpu {
        #[cfg(feature = "wgpu")]
        {
            let src32: Vec<f32> = src.iter().map(|&v| v.to_f32()).collect();
            let flt32: Vec<f32> = flt.iter().map(|&v| v.to_f32()).collect();
            match super::wgpu::wgpu_depthwise_large_filter(&src32, &flt32, param) {
                Ok(out) => return out,
                Err(err) => tracing::debug!(error = %err, "wgpu kernel failed, using cpu"),
            }
        }
    }

    cpu::depthwise_large_filter(src, flt, param)
}
