#![allow(dead_code)]

use dwconv_bias::prelude::*;
use rand::{Rng, SeedableRng, rngs::StdRng};

pub fn ctx() -> ExecContext {
    ExecContext::with_limits(0, DeviceLimits::TYPICAL, EngineConfig::default())
}

pub fn layout(shape: &[usize], dtype: DType) -> TensorLayout {
    TensorLayout::new(shape.to_vec(), dtype)
}

/// Same-size depthwise problem: `c` channels of `hw x hw`, `f x f` filters,
/// one output channel per input channel.
pub fn depthwise_args(c: usize, hw: usize, f: usize, dtype: DType) -> SizeArgs {
    let pad = f / 2;
    SizeArgs::new(
        ConvBiasParam::default().group().with_padding(pad, pad),
        layout(&[1, c, hw, hw], dtype),
        layout(&[c, 1, 1, f, f], dtype),
        layout(&[1, c, 1, 1], dtype),
        TensorLayout::empty(dtype),
        layout(&[1, c, hw, hw], dtype),
    )
    .unwrap()
}

pub fn random_vec(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.random_range(-1.0f32..1.0)).collect()
}

pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Plain NCHW channel-wise cross-correlation plus per-channel bias, in f64.
#[allow(clippy::too_many_arguments)]
pub fn reference_conv_bias(
    src: &[f32],
    flt: &[f32],
    bias: &[f32],
    [n, c, h, w]: [usize; 4],
    chl_mul: usize,
    [fh, fw]: [usize; 2],
    [ph, pw]: [usize; 2],
    [sh, sw]: [usize; 2],
) -> Vec<f32> {
    let oh = (h + 2 * ph - fh) / sh + 1;
    let ow = (w + 2 * pw - fw) / sw + 1;
    let oc_total = c * chl_mul;
    let mut out = vec![0.0f32; n * oc_total * oh * ow];
    for b in 0..n {
        for oc in 0..oc_total {
            let ic = oc / chl_mul;
            for y in 0..oh {
                for x in 0..ow {
                    let mut acc = 0.0f64;
                    for ky in 0..fh {
                        for kx in 0..fw {
                            let iy = (y * sh + ky) as isize - ph as isize;
                            let ix = (x * sw + kx) as isize - pw as isize;
                            if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                continue;
                            }
                            let s = src[((b * c + ic) * h + iy as usize) * w + ix as usize];
                            let k = flt[(oc * fh + ky) * fw + kx];
                            acc += f64::from(s) * f64::from(k);
                        }
                    }
                    let bias_v = bias.get(oc).copied().unwrap_or(0.0);
                    out[((b * oc_total + oc) * oh + y) * ow + x] = (acc + f64::from(bias_v)) as f32;
                }
            }
        }
    }
    out
}
