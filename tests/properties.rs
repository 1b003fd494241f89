mod common;

use common::{ctx, layout, reference_conv_bias};
use dwconv_bias::algo::depthwise_large_filter::{check_available, resource_estimate};
use dwconv_bias::approx::{F32_AVG_ERROR, all_close};
use dwconv_bias::ops::cpu;
use dwconv_bias::prelude::*;
use dwconv_bias::problem::KernelParam;
use dwconv_bias::resource::{LaunchGeometry, ResourceEstimate};
use dwconv_bias::Rejection;
use proptest::prelude::*;

fn same_size(c: usize, h: usize, w: usize, f: usize) -> SizeArgs {
    SizeArgs::new(
        ConvBiasParam::default().group().with_padding(f / 2, f / 2),
        layout(&[1, c, h, w], DType::Float32),
        layout(&[c, 1, 1, f, f], DType::Float32),
        layout(&[1, c, 1, 1], DType::Float32),
        TensorLayout::empty(DType::Float32),
        layout(&[1, c, h, w], DType::Float32),
    )
    .unwrap()
}

proptest! {
    #[test]
    fn estimate_is_pure_and_caps_output_width(fh in 1usize..64, fw in 1usize..300, ow in 1usize..512) {
        let a = ResourceEstimate::new(fh, fw, ow);
        prop_assert_eq!(a, ResourceEstimate::new(fh, fw, ow));
        prop_assert_eq!(a, ResourceEstimate::new(fh, fw, ow.min(64)));
        prop_assert!(a.effective_out_width <= 64);
        prop_assert_eq!(a.filter_tile_width % 4, 0);
        prop_assert_eq!(a.output_regs_per_thread % 4, 0);
    }

    #[test]
    fn single_group_is_never_admitted(c in 1usize..16, hw in 4usize..40, half in 0usize..4) {
        let f = 2 * half + 1;
        let args = SizeArgs::new(
            ConvBiasParam::default().with_padding(half, half),
            layout(&[1, c, hw, hw], DType::Float32),
            layout(&[c, c, f, f], DType::Float32),
            layout(&[1, c, 1, 1], DType::Float32),
            TensorLayout::empty(DType::Float32),
            layout(&[1, c, hw, hw], DType::Float32),
        ).unwrap();
        prop_assert!(!AlgoId::DepthwiseLargeFilter.entry().is_available(&args, &ctx()));
    }

    #[test]
    fn strided_problems_are_never_admitted(c in 2usize..16, hw in 8usize..40, half in 0usize..4, stride in 2usize..4) {
        let f = 2 * half + 1;
        let out = (hw + 2 * half - f) / stride + 1;
        let args = SizeArgs::new(
            ConvBiasParam::default().group().with_padding(half, half).with_stride(stride, stride),
            layout(&[1, c, hw, hw], DType::Float32),
            layout(&[c, 1, 1, f, f], DType::Float32),
            layout(&[1, c, 1, 1], DType::Float32),
            TensorLayout::empty(DType::Float32),
            layout(&[1, c, out, out], DType::Float32),
        ).unwrap();
        let admitted = AlgoId::DepthwiseLargeFilter.entry().is_available(&args, &ctx());
        prop_assert!(!admitted);
    }

    #[test]
    fn admission_agrees_with_the_estimate(
        c in 2usize..8,
        h in 1usize..24,
        w in 1usize..200,
        half in 0usize..20,
        regs in 1024usize..65536,
        smem in 64usize..8192,
    ) {
        let args = same_size(c, h, w, 2 * half + 1);
        let ctx = ExecContext::with_limits(0, DeviceLimits::new(regs, smem), EngineConfig::default());
        let est = resource_estimate(&args);
        let fits = est.registers_per_block(&LaunchGeometry::DEFAULT) <= regs
            && est.shared_memory_bytes() <= smem;
        match check_available(&args, &ctx) {
            Ok(()) => prop_assert!(fits),
            Err(Rejection::RegisterBudget { .. } | Rejection::SharedMemoryBudget { .. }) => prop_assert!(!fits),
            Err(other) => prop_assert!(false, "unexpected rejection {}", other),
        }
    }

    #[test]
    fn workspace_is_zero_or_the_full_dst_span(c in 2usize..8, hw in 1usize..32, half in 0usize..3, mixed in any::<bool>()) {
        let mut args = same_size(c, hw, hw, 2 * half + 1);
        if mixed {
            args.dst_layout.dtype = DType::Float16;
        }
        let bytes = AlgoId::DepthwiseLargeFilter.entry().get_workspace_in_bytes(&args, &ctx()).unwrap();
        let expected = if mixed { c * hw * hw * 4 } else { 0 };
        prop_assert_eq!(bytes, expected);
    }

    #[test]
    fn host_kernel_matches_reference(
        c in 1usize..4,
        mul in 1usize..3,
        h in 1usize..12,
        w in 1usize..80,
        fh in 1usize..6,
        fw in 1usize..6,
        seed in any::<u64>(),
    ) {
        let (ph, pw) = (fh / 2, fw / 2);
        let param = KernelParam {
            batch: 1,
            src_chl: c,
            src_h: h,
            src_w: w,
            chl_mul: mul,
            flt_h: fh,
            flt_w: fw,
            out_h: h + 2 * ph + 1 - fh,
            out_w: w + 2 * pw + 1 - fw,
            pad_h: ph,
            pad_w: pw,
            stride_h: 1,
            stride_w: 1,
            dilation_h: 1,
            dilation_w: 1,
        };
        let mut rng = common::seeded(seed);
        let src = common::random_vec(&mut rng, param.src_elems());
        let flt = common::random_vec(&mut rng, param.flt_elems());
        let got = cpu::depthwise_large_filter(&src, &flt, &param);
        let want = reference_conv_bias(&src, &flt, &[], [1, c, h, w], mul, [fh, fw], [ph, pw], [1, 1]);
        prop_assert!(all_close(&got, &want, F32_AVG_ERROR));
    }
}
