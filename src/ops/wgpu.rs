//! GPU rendition of the device kernels using WGPU.
//!
//! The GPU context and the compiled pipeline are created once through
//! `lazy_static` and reused for every launch. A failure to open a device or
//! compile the shader is remembered and reported on each call, which lets
//! [`dispatch`](super::dispatch) fall back to the CPU kernel.
//!
//! Data moves as `f32` both ways; half-precision inputs are widened on the
//! host before upload.

use crate::device::{DeviceCapabilityQuery, DeviceId, DeviceLimits};
use crate::error::ConvError;
use crate::problem::KernelParam;
use briny::prelude::*;
use bytemuck::{Pod, Zeroable};
use std::sync::mpsc;
use wgpu::util::DeviceExt;

const DEPTHWISE_LARGE_FILTER: &str = include_str!("shaders/depthwise_large_filter.wgsl");

/// Output columns per workgroup, matching `@workgroup_size` in the shader.
const WORKGROUP_WIDTH: u32 = 64;

/// Ways the GPU path fails.
///
/// A failure to open the device is cached next to the context and cloned
/// out on every later call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GpuFailure {
    #[error("no wgpu adapter: {0}")]
    Adapter(String),
    #[error("wgpu device request failed: {0}")]
    Device(String),
    #[error("shader source or launch parameters failed validation")]
    Validation,
    #[error("{rows} rows x {groups} column groups exceed the dispatch limit {limit}")]
    DispatchLimit { rows: u32, groups: u32, limit: u32 },
    #[error("readback failed: {0}")]
    Readback(String),
}

impl From<wgpu::RequestAdapterError> for GpuFailure {
    fn from(err: wgpu::RequestAdapterError) -> Self {
        Self::Adapter(err.to_string())
    }
}

impl From<wgpu::RequestDeviceError> for GpuFailure {
    fn from(err: wgpu::RequestDeviceError) -> Self {
        Self::Device(err.to_string())
    }
}

impl From<ValidationError> for GpuFailure {
    fn from(_: ValidationError) -> Self {
        Self::Validation
    }
}

impl From<GpuFailure> for ConvError {
    fn from(err: GpuFailure) -> Self {
        Self::Gpu(err.to_string())
    }
}

/// The WGPU adapter, device and queue used for every launch.
pub struct GpuContext {
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Opens the default adapter and requests a device with default limits.
    ///
    /// # Errors
    /// [`GpuFailure::Adapter`] or [`GpuFailure::Device`] if nothing can be opened.
    pub fn new() -> Result<Self, GpuFailure> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("dwconv_bias"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))?;
        Ok(Self {
            adapter,
            device,
            queue,
        })
    }
}

/// WGSL source awaiting validation.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;
        if src.len() > 65536 || !src.contains("fn main") {
            return Err(ValidationError);
        }
        let forbidden = ["import", "#include", "asm", "unsafe", "ptr", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Validates `source` and compiles it on `device`.
///
/// # Errors
/// [`GpuFailure`] if the source fails validation.
pub fn load_shader(device: &wgpu::Device, label: &str, source: &str) -> Result<wgpu::ShaderModule, GpuFailure> {
    WgslSource(source).validate()?;
    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }))
}

struct KernelPipeline {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn build_pipeline(ctx: &GpuContext) -> Result<KernelPipeline, GpuFailure> {
    let module = load_shader(&ctx.device, "depthwise_large_filter", DEPTHWISE_LARGE_FILTER)?;
    let bind_group_layout = ctx.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("depthwise_large_filter_bgl"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            storage_entry(1, true),
            storage_entry(2, true),
            storage_entry(3, false),
        ],
    });
    let layout = ctx.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("depthwise_large_filter_pipeline_layout"),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });
    let pipeline = ctx.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some("depthwise_large_filter_pipeline"),
        layout: Some(&layout),
        module: &module,
        entry_point: Some("main"),
        cache: None,
        compilation_options: wgpu::PipelineCompilationOptions::default(),
    });
    Ok(KernelPipeline {
        bind_group_layout,
        pipeline,
    })
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: Result<GpuContext, GpuFailure> = GpuContext::new();
    static ref DEPTHWISE_PIPELINE: Result<KernelPipeline, GpuFailure> = match &*GPU_CONTEXT {
        Ok(ctx) => build_pipeline(ctx),
        Err(e) => Err(e.clone()),
    };
}

fn gpu() -> Result<&'static GpuContext, GpuFailure> {
    GPU_CONTEXT.as_ref().map_err(Clone::clone)
}

/// Uniform block of the shader; field order matches `Params` in WGSL.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Params {
    batch: u32,
    src_chl: u32,
    src_h: u32,
    src_w: u32,
    chl_mul: u32,
    flt_h: u32,
    flt_w: u32,
    out_h: u32,
    out_w: u32,
    pad_h: u32,
    pad_w: u32,
    stride_h: u32,
    stride_w: u32,
    dilation_h: u32,
    dilation_w: u32,
    _pad0: u32,
}

impl TryFrom<&KernelParam> for Params {
    type Error = GpuFailure;

    fn try_from(p: &KernelParam) -> Result<Self, GpuFailure> {
        let cvt = |v: usize| u32::try_from(v).map_err(|_| ValidationError);
        Ok(Self {
            batch: cvt(p.batch)?,
            src_chl: cvt(p.src_chl)?,
            src_h: cvt(p.src_h)?,
            src_w: cvt(p.src_w)?,
            chl_mul: cvt(p.chl_mul)?,
            flt_h: cvt(p.flt_h)?,
            flt_w: cvt(p.flt_w)?,
            out_h: cvt(p.out_h)?,
            out_w: cvt(p.out_w)?,
            pad_h: cvt(p.pad_h)?,
            pad_w: cvt(p.pad_w)?,
            stride_h: cvt(p.stride_h)?,
            stride_w: cvt(p.stride_w)?,
            dilation_h: cvt(p.dilation_h)?,
            dilation_w: cvt(p.dilation_w)?,
            _pad0: 0,
        })
    }
}

/// Runs the depthwise large-filter kernel on the GPU.
///
/// Returns `param.dst_elems()` un-biased outputs in NCHW order.
///
/// # Errors
/// [`GpuFailure`] if no device is available, the launch exceeds the device's
/// dispatch limits, or the readback fails.
pub fn wgpu_depthwise_large_filter(src: &[f32], flt: &[f32], param: &KernelParam) -> Result<Vec<f32>, GpuFailure> {
    let ctx = gpu()?;
    let kernel = DEPTHWISE_PIPELINE.as_ref().map_err(Clone::clone)?;
    let params = Params::try_from(param)?;
    let rows = u32::try_from(param.batch * param.src_chl * param.chl_mul * param.out_h).map_err(|_| ValidationError)?;
    let max_groups = ctx.device.limits().max_compute_workgroups_per_dimension;
    let groups_x = params.out_w.div_ceil(WORKGROUP_WIDTH);
    if rows > max_groups || groups_x > max_groups {
        return Err(GpuFailure::DispatchLimit {
            rows,
            groups: groups_x,
            limit: max_groups,
        });
    }

    let device = &ctx.device;
    let out_bytes = (param.dst_elems() * size_of::<f32>()) as u64;

    let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("params"),
        contents: bytemuck::bytes_of(&params),
        usage: wgpu::BufferUsages::UNIFORM,
    });
    let src_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("src"),
        contents: bytemuck::cast_slice(src),
        usage: wgpu::BufferUsages::STORAGE,
    });
    let flt_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("flt"),
        contents: bytemuck::cast_slice(flt),
        usage: wgpu::BufferUsages::STORAGE,
    });
    let dst_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("dst"),
        size: out_bytes,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });
    let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("staging"),
        size: out_bytes,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("depthwise_large_filter_bind_group"),
        layout: &kernel.bind_group_layout,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: params_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: src_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: flt_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: dst_buffer.as_entire_binding(),
            },
        ],
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("depthwise_large_filter_encoder"),
    });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("depthwise_large_filter_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernel.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups_x, rows, 1);
    }
    encoder.copy_buffer_to_buffer(&dst_buffer, 0, &staging_buffer, 0, out_bytes);
    ctx.queue.submit(Some(encoder.finish()));

    let slice = staging_buffer.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device
        .poll(wgpu::PollType::Wait)
        .map_err(|e| GpuFailure::Readback(format!("poll: {e}")))?;
    rx.recv()
        .map_err(|_| GpuFailure::Readback("map callback dropped".into()))?
        .map_err(|e| GpuFailure::Readback(e.to_string()))?;

    let out = {
        let data = slice.get_mapped_range();
        bytemuck::try_cast_slice::<u8, f32>(&data[..])
            .map_err(|_| ValidationError)?
            .to_vec()
    };
    staging_buffer.unmap();
    Ok(out)
}

/// Capability query backed by the default wgpu adapter.
///
/// WGPU exposes workgroup storage but not the register file, so registers
/// are reported as [`DeviceLimits::TYPICAL`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WgpuCapabilities {
    id: DeviceId,
}

impl WgpuCapabilities {
    #[must_use]
    pub const fn new(id: DeviceId) -> Self {
        Self { id }
    }
}

impl DeviceCapabilityQuery for WgpuCapabilities {
    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn query_limits(&self) -> Result<DeviceLimits, ConvError> {
        let ctx = gpu().map_err(|e| ConvError::DeviceQuery {
            device: self.id,
            msg: e.to_string(),
        })?;
        let limits = ctx.adapter.limits();
        Ok(DeviceLimits::new(
            DeviceLimits::TYPICAL.max_registers_per_block,
            limits.max_compute_workgroup_storage_size as usize,
        ))
    }
}
