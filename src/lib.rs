//! dwconv_bias: a resource-checked depthwise large-filter conv + bias +
//! activation algorithm.
//!
//! Given a problem shape the crate decides whether the depthwise
//! large-filter strategy is legal and fits the device's register and
//! shared-memory budget, sizes the scratch memory it needs, and queues the
//! convolution followed by the fused bias/activation step on a stream.
//!
//! # Flow
//!
//! 1. Build a [`SizeArgs`] from layouts and a [`ConvBiasParam`].
//! 2. Ask an [`AlgoEntry`] (or [`algo::first_available`]) whether it admits
//!    the problem under an [`ExecContext`].
//! 3. Allocate `get_workspace_in_bytes` of scratch as a [`Workspace`].
//! 4. Bind device tensors into [`ExecArgs`] and call `exec`; the work runs
//!    on the [`Stream`] in submission order.
//!
//! # Modules
//!
//! - [`algo`] — algorithm table and the depthwise large-filter strategy.
//! - [`resource`] — analytic register / shared-memory estimate.
//! - [`problem`], [`layout`], [`dtype`] — problem description.
//! - [`memory`], [`stream`] — device buffers, workspaces and the in-order stream.
//! - [`ops`] — kernel renditions (rayon host kernels, optional `wgpu`).
//! - [`postprocess`] — bias add and nonlinearity.
//! - [`device`], [`context`], [`config`], [`backend`] — execution environment.
//!
//! # Example
//!
//! ```rust
//! use dwconv_bias::prelude::*;
//!
//! let ctx = ExecContext::with_limits(0, DeviceLimits::TYPICAL, EngineConfig::default());
//! let param = ConvBiasParam::default().group().with_padding(2, 2);
//! let args = SizeArgs::new(
//!     param,
//!     TensorLayout::new(vec![1, 8, 32, 32], DType::Float32),
//!     TensorLayout::new(vec![8, 1, 1, 5, 5], DType::Float32),
//!     TensorLayout::new(vec![1, 8, 1, 1], DType::Float32),
//!     TensorLayout::empty(DType::Float32),
//!     TensorLayout::new(vec![1, 8, 32, 32], DType::Float32),
//! )?;
//! let algo = AlgoId::DepthwiseLargeFilter.entry();
//! assert!(algo.is_available(&args, &ctx));
//! assert_eq!(algo.get_workspace_in_bytes(&args, &ctx)?, 0);
//! # Ok::<(), dwconv_bias::error::ConvError>(())
//! ```

pub mod algo;
pub mod approx;
pub mod backend;
pub mod config;
pub mod context;
pub mod device;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod memory;
pub mod ops;
pub mod postprocess;
pub mod problem;
pub mod resource;
pub mod stream;

pub use algo::{AlgoAttribute, AlgoEntry, AlgoId, ExecArgs, ExecTensors, LaunchState, Rejection};
pub use config::EngineConfig;
pub use context::ExecContext;
pub use device::{DeviceCapabilityQuery, DeviceLimits, LimitsCache, StaticDevice};
pub use dtype::{DType, DTypeDeducer};
pub use error::ConvError;
pub use layout::TensorLayout;
pub use memory::{DeviceBuffer, TensorND, Workspace};
pub use postprocess::{BiasActivation, HostBiasActivation};
pub use problem::{ConvBiasParam, NonlinearMode, SizeArgs};
pub use stream::Stream;

/// Everything needed to describe and run a problem.
pub mod prelude {
    pub use crate::algo::{self, AlgoAttribute, AlgoEntry, AlgoId, ExecArgs, ExecTensors, LaunchState};
    pub use crate::config::EngineConfig;
    pub use crate::context::ExecContext;
    pub use crate::device::{DeviceLimits, LimitsCache, StaticDevice};
    pub use crate::dtype::DType;
    pub use crate::layout::TensorLayout;
    pub use crate::memory::{TensorND, Workspace};
    pub use crate::problem::{ConvBiasParam, ConvFormat, NonlinearMode, SizeArgs};
    pub use crate::stream::Stream;
}
