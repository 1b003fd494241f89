mod common;

use common::{ctx, depthwise_args, random_vec, reference_conv_bias, seeded};
use dwconv_bias::approx::{F16_MAX_ERROR, F32_AVG_ERROR, first_mismatch};
use dwconv_bias::prelude::*;
use dwconv_bias::{BiasActivation, ConvError};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Tensors for one problem, filled with seeded random values.
struct Problem {
    args: SizeArgs,
    src: TensorND,
    filter: TensorND,
    bias: TensorND,
    z: TensorND,
    dst: TensorND,
    src_data: Vec<f32>,
    flt_data: Vec<f32>,
    bias_data: Vec<f32>,
}

impl Problem {
    fn new(args: SizeArgs, seed: u64) -> Self {
        let mut rng = seeded(seed);
        let mut fill = |layout: &TensorLayout| {
            let t = TensorND::zeroed(layout.clone());
            t.write_f32(&random_vec(&mut rng, layout.total_nr_elems())).unwrap();
            t
        };
        let src = fill(&args.src_layout);
        let filter = fill(&args.filter_layout);
        let bias = fill(&args.bias_layout);
        // read back so half-precision inputs are compared as stored
        Self {
            src_data: src.read_f32().unwrap(),
            flt_data: filter.read_f32().unwrap(),
            bias_data: bias.read_f32().unwrap(),
            z: TensorND::absent(args.src_layout.dtype),
            dst: TensorND::zeroed(args.dst_layout.clone()),
            args,
            src,
            filter,
            bias,
        }
    }

    fn tensors(&self) -> ExecTensors<'_> {
        ExecTensors {
            src: &self.src,
            filter: &self.filter,
            bias: &self.bias,
            z: &self.z,
            dst: &self.dst,
        }
    }

    fn run(&self, ctx: &ExecContext, stream: &Stream) -> Result<LaunchState, ConvError> {
        let algo = AlgoId::DepthwiseLargeFilter.entry();
        let workspace = Workspace::alloc(algo.get_workspace_in_bytes(&self.args, ctx)?);
        let exec = ExecArgs::new(self.args.param, self.tensors(), &workspace, stream)?;
        let state = algo.exec(&exec, ctx)?;
        stream.synchronize()?;
        Ok(state)
    }

    fn reference(&self) -> Vec<f32> {
        let s = &self.args.src_layout.shape;
        let fm = &self.args.filter_meta;
        reference_conv_bias(
            &self.src_data,
            &self.flt_data,
            &self.bias_data,
            [s[0], s[1], s[2], s[3]],
            fm.ocpg,
            fm.spatial,
            fm.padding,
            fm.stride,
        )
    }
}

#[test]
fn test_scenario_matches_reference_conv_bias() {
    let p = Problem::new(depthwise_args(8, 32, 5, DType::Float32), 1);
    let stream = Stream::new().unwrap();
    let state = p.run(&ctx(), &stream).unwrap();
    assert!(state.is_launched());

    let got = p.dst.read_vec::<f32>().unwrap();
    let want = p.reference();
    assert_eq!(first_mismatch(&got, &want, F32_AVG_ERROR), None);
}

#[test]
fn test_relu_is_fused() {
    let mut args = depthwise_args(4, 16, 7, DType::Float32);
    args.param = args.param.with_nonlinear(NonlinearMode::Relu);
    let p = Problem::new(args, 2);
    p.run(&ctx(), &Stream::new().unwrap()).unwrap();

    let want: Vec<f32> = p.reference().into_iter().map(|v| v.max(0.0)).collect();
    let got = p.dst.read_vec::<f32>().unwrap();
    assert!(got.iter().all(|&v| v >= 0.0));
    assert_eq!(first_mismatch(&got, &want, F32_AVG_ERROR), None);
}

#[test]
fn test_channel_multiplier() {
    let args = SizeArgs::new(
        ConvBiasParam::default().group().with_padding(3, 3),
        TensorLayout::new(vec![2, 4, 12, 12], DType::Float32),
        TensorLayout::new(vec![4, 2, 1, 7, 7], DType::Float32),
        TensorLayout::new(vec![1, 8, 1, 1], DType::Float32),
        TensorLayout::empty(DType::Float32),
        TensorLayout::new(vec![2, 8, 12, 12], DType::Float32),
    )
    .unwrap();
    assert!(AlgoId::DepthwiseLargeFilter.entry().is_available(&args, &ctx()));
    let p = Problem::new(args, 3);
    p.run(&ctx(), &Stream::new().unwrap()).unwrap();
    let got = p.dst.read_vec::<f32>().unwrap();
    assert_eq!(first_mismatch(&got, &p.reference(), F32_AVG_ERROR), None);
}

#[test]
fn test_half_dst_with_float_bias_goes_through_workspace() {
    let mut args = depthwise_args(8, 32, 5, DType::Float32);
    args.dst_layout.dtype = DType::Float16;
    let p = Problem::new(args, 4);
    let algo = AlgoId::DepthwiseLargeFilter.entry();
    assert_eq!(algo.get_workspace_in_bytes(&p.args, &ctx()).unwrap(), 8 * 32 * 32 * 4);

    p.run(&ctx(), &Stream::new().unwrap()).unwrap();
    let got = p.dst.read_f32().unwrap();
    assert_eq!(first_mismatch(&got, &p.reference(), F16_MAX_ERROR), None);
}

#[cfg(feature = "fp16")]
#[test]
fn test_half_src_uses_half_kernel() {
    let p = Problem::new(depthwise_args(4, 20, 9, DType::Float16), 5);
    assert!(AlgoId::DepthwiseLargeFilter.entry().is_available(&p.args, &ctx()));
    p.run(&ctx(), &Stream::new().unwrap()).unwrap();
    let got = p.dst.read_f32().unwrap();
    assert_eq!(first_mismatch(&got, &p.reference(), F16_MAX_ERROR), None);
}

#[test]
fn test_launches_are_ordered_on_the_stream() {
    let args = depthwise_args(2, 8, 3, DType::Float32);
    let first = Problem::new(args.clone(), 6);
    let stream = Stream::new().unwrap();
    let algo = AlgoId::DepthwiseLargeFilter.entry();
    let workspace = Workspace::empty();

    // second launch reads what the first one writes
    let out = TensorND::zeroed(args.dst_layout.clone());
    let a = ExecArgs::new(args.param, first.tensors(), &workspace, &stream).unwrap();
    let b_tensors = ExecTensors {
        src: &first.dst,
        dst: &out,
        ..first.tensors()
    };
    let b = ExecArgs::new(args.param, b_tensors, &workspace, &stream).unwrap();

    let sa = algo.exec(&a, &ctx()).unwrap();
    let sb = algo.exec(&b, &ctx()).unwrap();
    assert_eq!(sa, LaunchState::Launched { sequence: 1 });
    assert_eq!(sb, LaunchState::Launched { sequence: 3 });
    stream.synchronize().unwrap();
    assert_eq!(stream.completed(), 4);

    let mid = first.dst.read_vec::<f32>().unwrap();
    let want = reference_conv_bias(
        &mid,
        &first.flt_data,
        &first.bias_data,
        [1, 2, 8, 8],
        1,
        [3, 3],
        [1, 1],
        [1, 1],
    );
    assert_eq!(first_mismatch(&out.read_vec::<f32>().unwrap(), &want, F32_AVG_ERROR), None);
}

#[test]
#[should_panic(expected = "no kernel instantiation")]
fn test_bfloat16_src_is_a_contract_violation() {
    let args = depthwise_args(2, 8, 3, DType::BFloat16);
    assert!(!AlgoId::DepthwiseLargeFilter.entry().is_available(&args, &ctx()));
    let p = Problem::new(args, 7);
    let stream = Stream::new().unwrap();
    let _ = p.run(&ctx(), &stream);
}

struct CountingPost(AtomicUsize);

impl BiasActivation for CountingPost {
    fn apply(&self, conv_out: &TensorND, dst: &TensorND, _bias: &TensorND, mode: NonlinearMode) -> Result<(), ConvError> {
        assert_eq!(mode, NonlinearMode::Sigmoid);
        self.0.fetch_add(1, Ordering::SeqCst);
        let raw = conv_out.read_f32()?;
        dst.write_f32(&raw)
    }
}

#[test]
fn test_injected_bias_activation_receives_raw_output() {
    let mut args = depthwise_args(2, 8, 3, DType::Float32);
    args.param = args.param.with_nonlinear(NonlinearMode::Sigmoid);
    let p = Problem::new(args, 8);
    let post = Arc::new(CountingPost(AtomicUsize::new(0)));
    let ctx = ctx().with_bias_activation(post.clone());
    p.run(&ctx, &Stream::new().unwrap()).unwrap();
    assert_eq!(post.0.load(Ordering::SeqCst), 1);

    let no_bias = reference_conv_bias(&p.src_data, &p.flt_data, &[], [1, 2, 8, 8], 1, [3, 3], [1, 1], [1, 1]);
    assert_eq!(first_mismatch(&p.dst.read_vec::<f32>().unwrap(), &no_bias, F32_AVG_ERROR), None);
}

#[cfg(feature = "fp16")]
struct WidenHalf;

#[cfg(feature = "fp16")]
impl dwconv_bias::DTypeDeducer for WidenHalf {
    fn deduce_fwd(&self, _src: DType, _filter: DType) -> Result<DType, ConvError> {
        Ok(DType::Float32)
    }
}

#[cfg(feature = "fp16")]
#[test]
fn test_injected_deducer_sizes_the_workspace() {
    let mut args = depthwise_args(4, 16, 5, DType::Float16);
    args.bias_layout.dtype = DType::Float32;
    let ctx = ctx().with_dtype_deducer(Arc::new(WidenHalf));
    let algo = AlgoId::DepthwiseLargeFilter.entry();
    assert_eq!(algo.get_workspace_in_bytes(&args, &ctx).unwrap(), 4 * 16 * 16 * 4);

    let p = Problem::new(args, 9);
    p.run(&ctx, &Stream::new().unwrap()).unwrap();
    let got = p.dst.read_f32().unwrap();
    assert_eq!(first_mismatch(&got, &p.reference(), F16_MAX_ERROR), None);
}

#[test]
fn test_failing_post_step_surfaces_on_synchronize() {
    struct Failing;
    impl BiasActivation for Failing {
        fn apply(&self, _: &TensorND, _: &TensorND, _: &TensorND, _: NonlinearMode) -> Result<(), ConvError> {
            Err(ConvError::InvalidLayout("stub".into()))
        }
    }
    let p = Problem::new(depthwise_args(2, 8, 3, DType::Float32), 10);
    let ctx = ctx().with_bias_activation(Arc::new(Failing));
    assert!(matches!(p.run(&ctx, &Stream::new().unwrap()), Err(ConvError::InvalidLayout(_))));
}
