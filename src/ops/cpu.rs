//! Parallel CPU rendition of the device kernels.
//!
//! Each output plane is an independent rayon task. Within a plane the
//! columns are walked in strips of [`ResourceEstimate::MAX_OUT_TILE_WIDTH`],
//! the same strips one thread block covers on the device, and every output
//! accumulates in `f32`.

use crate::dtype::DType;
use crate::problem::KernelParam;
use crate::resource::ResourceEstimate;
use bytemuck::Pod;
use rayon::prelude::*;

/// Element types with a kernel instantiation.
pub trait KernelElement: Pod + Send + Sync {
    const DTYPE: DType;

    fn to_f32(self) -> f32;
}

impl KernelElement for f32 {
    const DTYPE: DType = DType::Float32;

    fn to_f32(self) -> f32 {
        self
    }
}

#[cfg(feature = "fp16")]
impl KernelElement for half::f16 {
    const DTYPE: DType = DType::Float16;

    fn to_f32(self) -> f32 {
        half::f16::to_f32(self)
    }
}

/// Channel-wise cross-correlation of NCHW `src` with `[C * chl_mul, FH, FW]`
/// filters. Output channel `c * chl_mul + m` reads input channel `c`.
///
/// Returns `param.dst_elems()` un-biased outputs in NCHW order.
///
/// # Panics
/// If `src` or `flt` are shorter than `param` describes.
pub fn depthwise_large_filter<T: KernelElement>(src: &[T], flt: &[T], param: &KernelParam) -> Vec<f32> {
    let p = *param;
    let plane = p.out_h * p.out_w;
    let mut out = vec![0.0f32; p.dst_elems()];
    if plane == 0 {
        return out;
    }
    let out_chl = p.src_chl * p.chl_mul;
    let src_plane = p.src_h * p.src_w;
    let flt_plane = p.flt_h * p.flt_w;

    out.par_chunks_mut(plane).enumerate().for_each(|(idx, dst)| {
        let n = idx / out_chl;
        let oc = idx % out_chl;
        let ic = oc / p.chl_mul;
        let s = &src[(n * p.src_chl + ic) * src_plane..][..src_plane];
        let f = &flt[oc * flt_plane..][..flt_plane];

        for tile in (0..p.out_w).step_by(ResourceEstimate::MAX_OUT_TILE_WIDTH) {
            let tile_end = (tile + ResourceEstimate::MAX_OUT_TILE_WIDTH).min(p.out_w);
            for oh in 0..p.out_h {
                for ow in tile..tile_end {
                    let mut acc = 0.0f32;
                    for fh in 0..p.flt_h {
                        let Some(ih) = (oh * p.stride_h + fh * p.dilation_h).checked_sub(p.pad_h) else {
                            continue;
                        };
                        if ih >= p.src_h {
                            continue;
                        }
                        let row = &s[ih * p.src_w..][..p.src_w];
                        for fw in 0..p.flt_w {
                            let Some(iw) = (ow * p.stride_w + fw * p.dilation_w).checked_sub(p.pad_w) else {
                                continue;
                            };
                            if iw < p.src_w {
                                acc += row[iw].to_f32() * f[fh * p.flt_w + fw].to_f32();
                            }
                        }
                    }
                    dst[oh * p.out_w + ow] = acc;
                }
            }
        }
    });
    out
}
