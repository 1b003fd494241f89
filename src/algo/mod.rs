//! Algorithm contract and the static algorithm table.
//!
//! Every strategy is a row of [`ALGOS`]: a name, an attribute set and three
//! plain function pointers. Selection walks the table in order.

pub mod depthwise_large_filter;

use crate::context::ExecContext;
use crate::dtype::DType;
use crate::error::ConvError;
use crate::memory::{TensorND, Workspace};
use crate::problem::{ComputeMode, ConvBiasParam, ConvFormat, SizeArgs};
use crate::stream::Stream;
use core::fmt;
use core::ops::{BitOr, Deref};

/// Identity of a strategy in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgoId {
    /// Depthwise conv with large filters, same-size output only.
    DepthwiseLargeFilter,
}

impl AlgoId {
    /// Every id, in table order.
    pub const ALL: [Self; 1] = [Self::DepthwiseLargeFilter];

    /// Table row of this id.
    #[must_use]
    pub fn entry(self) -> &'static AlgoEntry {
        match self {
            Self::DepthwiseLargeFilter => &ALGOS[0],
        }
    }

    /// Table name, e.g. `"DEPTHWISE_LARGE_FILTER"`.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.entry().name
    }

    /// Looks an id up by its algorithm name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        ALGOS.iter().find(|a| a.name == name).map(|a| a.id)
    }
}

impl fmt::Display for AlgoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Properties a strategy guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlgoAttribute(u32);

impl AlgoAttribute {
    /// No guarantees.
    pub const DEFAULT: Self = Self(0);
    /// Bitwise identical results across runs.
    pub const REPRODUCIBLE: Self = Self(1);
    /// Availability depends on the exact problem shape.
    pub const USABLE_DEPEND_ON_SHAPE: Self = Self(1 << 1);

    /// Bits set in either.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// All bits of `other` are set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set in `self`.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Raw bit pattern.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for AlgoAttribute {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Progress of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    /// Validated and bound to a kernel, nothing queued yet.
    Pending,
    /// Queued on the stream; `sequence` is the stream position of the last job.
    Launched { sequence: u64 },
}

impl LaunchState {
    /// Work has been queued on the stream.
    #[must_use]
    pub const fn is_launched(&self) -> bool {
        matches!(self, Self::Launched { .. })
    }
}

/// First precondition a problem failed during admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("src or dst is not contiguous")]
    NotContiguous,
    #[error("src dtype {src} differs from filter dtype {filter}")]
    DTypeMismatch { src: DType, filter: DType },
    #[error("no kernel for dtype {0}")]
    UnsupportedDType(DType),
    #[error("a z tensor is attached")]
    HasZ,
    #[error("group {0} is not greater than 1")]
    NotGrouped(usize),
    #[error("format {0:?} is not NCHW")]
    Format(ConvFormat),
    #[error("dtype {0} is not floating point")]
    NotFloat(DType),
    #[error("compute mode {0:?} is not DEFAULT")]
    ComputeMode(ComputeMode),
    #[error("spatial rank {0} is not 2")]
    SpatialRank(usize),
    #[error("{icpg} input channels per group, expected 1")]
    NotDepthwise { icpg: usize },
    #[error("dilation {0:?} is not (1, 1)")]
    Dilated([usize; 2]),
    #[error("filter flip (convolution mode) is not supported")]
    Flipped,
    #[error("needs {required} registers per block, device has {available}")]
    RegisterBudget { required: usize, available: usize },
    #[error("needs {required} shared memory per block, device has {available}")]
    SharedMemoryBudget { required: usize, available: usize },
    #[error("output {out_h}x{out_w} with stride {stride:?} does not match input {in_h}x{in_w}")]
    NotSameSize {
        in_h: usize,
        in_w: usize,
        out_h: usize,
        out_w: usize,
        stride: [usize; 2],
    },
}

/// Device tensors of one invocation. Absent bias or z use an empty layout.
#[derive(Debug, Clone, Copy)]
pub struct ExecTensors<'a> {
    pub src: &'a TensorND,
    pub filter: &'a TensorND,
    pub bias: &'a TensorND,
    pub z: &'a TensorND,
    pub dst: &'a TensorND,
}

/// A problem bound to device memory, scratch space and a stream.
#[derive(Debug)]
pub struct ExecArgs<'a> {
    pub size: SizeArgs,
    pub src: &'a TensorND,
    pub filter: &'a TensorND,
    pub bias: &'a TensorND,
    pub z: &'a TensorND,
    pub dst: &'a TensorND,
    pub workspace: &'a Workspace,
    pub stream: &'a Stream,
}

impl<'a> ExecArgs<'a> {
    /// Derives the layout view from the tensors.
    ///
    /// # Errors
    /// As [`SizeArgs::new`].
    pub fn new(
        param: ConvBiasParam,
        tensors: ExecTensors<'a>,
        workspace: &'a Workspace,
        stream: &'a Stream,
    ) -> Result<Self, ConvError> {
        let size = SizeArgs::new(
            param,
            tensors.src.layout.clone(),
            tensors.filter.layout.clone(),
            tensors.bias.layout.clone(),
            tensors.z.layout.clone(),
            tensors.dst.layout.clone(),
        )?;
        Ok(Self {
            size,
            src: tensors.src,
            filter: tensors.filter,
            bias: tensors.bias,
            z: tensors.z,
            dst: tensors.dst,
            workspace,
            stream,
        })
    }
}

impl Deref for ExecArgs<'_> {
    type Target = SizeArgs;

    fn deref(&self) -> &SizeArgs {
        &self.size
    }
}

/// One row of the algorithm table.
#[derive(Debug)]
pub struct AlgoEntry {
    pub id: AlgoId,
    pub name: &'static str,
    pub attribute: AlgoAttribute,
    pub is_available: fn(&SizeArgs, &ExecContext) -> bool,
    pub get_workspace_in_bytes: fn(&SizeArgs, &ExecContext) -> Result<usize, ConvError>,
    pub exec: fn(&ExecArgs<'_>, &ExecContext) -> Result<LaunchState, ConvError>,
}

impl AlgoEntry {
    /// Whether this strategy admits `args`.
    #[must_use]
    pub fn is_available(&self, args: &SizeArgs, ctx: &ExecContext) -> bool {
        (self.is_available)(args, ctx)
    }

    /// Scratch bytes `exec` needs.
    ///
    /// # Errors
    /// Propagates dtype deduction failures.
    pub fn get_workspace_in_bytes(&self, args: &SizeArgs, ctx: &ExecContext) -> Result<usize, ConvError> {
        (self.get_workspace_in_bytes)(args, ctx)
    }

    /// Queues the work on `args.stream`.
    ///
    /// # Errors
    /// See the strategy's `exec`.
    pub fn exec(&self, args: &ExecArgs<'_>, ctx: &ExecContext) -> Result<LaunchState, ConvError> {
        (self.exec)(args, ctx)
    }

    /// Available and needs at most `limit` workspace bytes.
    #[must_use]
    pub fn is_available_wk(&self, args: &SizeArgs, ctx: &ExecContext, limit: usize) -> bool {
        self.is_available(args, ctx)
            && self
                .get_workspace_in_bytes(args, ctx)
                .is_ok_and(|bytes| bytes <= limit)
    }

    /// Carries every `positive` attribute, none of `negative`, and is
    /// available within `limit` workspace bytes.
    #[must_use]
    pub fn is_available_attribute(
        &self,
        args: &SizeArgs,
        ctx: &ExecContext,
        positive: AlgoAttribute,
        negative: AlgoAttribute,
        limit: usize,
    ) -> bool {
        self.attribute.contains(positive)
            && !self.attribute.intersects(negative)
            && self.is_available_wk(args, ctx, limit)
    }

    /// Carries [`AlgoAttribute::REPRODUCIBLE`].
    #[must_use]
    pub const fn is_reproducible(&self) -> bool {
        self.attribute.contains(AlgoAttribute::REPRODUCIBLE)
    }

    /// Fails if the provided workspace is smaller than required.
    ///
    /// # Errors
    /// [`ConvError::WorkspaceTooSmall`], or a deduction failure.
    pub fn check_workspace(&self, args: &ExecArgs<'_>, ctx: &ExecContext) -> Result<(), ConvError> {
        let required = self.get_workspace_in_bytes(args, ctx)?;
        if args.workspace.size < required {
            return Err(ConvError::WorkspaceTooSmall {
                algo: self.name,
                required,
                got: args.workspace.size,
            });
        }
        Ok(())
    }
}

/// The algorithm table.
pub static ALGOS: [AlgoEntry; 1] = [AlgoEntry {
    id: AlgoId::DepthwiseLargeFilter,
    name: depthwise_large_filter::NAME,
    attribute: AlgoAttribute::REPRODUCIBLE.union(AlgoAttribute::USABLE_DEPEND_ON_SHAPE),
    is_available: depthwise_large_filter::is_available,
    get_workspace_in_bytes: depthwise_large_filter::get_workspace_in_bytes,
    exec: depthwise_large_filter::exec,
}];

/// Every table entry, in selection order.
#[must_use]
pub fn all_algos() -> &'static [AlgoEntry] {
    &ALGOS
}

/// First table entry available for `args` within `workspace_limit` bytes.
#[must_use]
pub fn first_available(
    args: &SizeArgs,
    ctx: &ExecContext,
    workspace_limit: usize,
) -> Option<&'static AlgoEntry> {
    let found = ALGOS
        .iter()
        .find(|algo| algo.is_available_wk(args, ctx, workspace_limit));
    tracing::trace!(algo = found.map(|a| a.name), problem = %args, "algorithm lookup");
    found
}
