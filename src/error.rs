//! Error type shared by every fallible operation in the crate.
//!
//! Inadmissible problem shapes are *not* errors: the admission check answers
//! them with `false` (or a [`Rejection`](crate::algo::Rejection)). `ConvError`
//! covers malformed inputs, undersized workspaces, collaborator failures and
//! device/stream faults.

use crate::dtype::DType;
use briny::prelude::ValidationError;

/// Errors raised while describing, planning or executing a convolution.
#[derive(Debug, thiserror::Error)]
pub enum ConvError {
    /// A tensor layout is malformed or inconsistent with the others.
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    /// A convolution parameter is out of range (zero stride, zero dilation, ...).
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// The dtype-inference rule could not deduce an accumulator type.
    #[error("cannot deduce conv output dtype from src {src} and filter {filter}")]
    DTypeDeduce {
        /// Source element type.
        src: DType,
        /// Filter element type.
        filter: DType,
    },

    /// A dtype has no host representation for the requested operation.
    #[error("unsupported dtype {0} for this operation")]
    UnsupportedDType(DType),

    /// The caller-provided workspace cannot hold what the algorithm needs.
    #[error("algo {algo}: required workspace {required} bytes, got {got}")]
    WorkspaceTooSmall {
        /// Algorithm name.
        algo: &'static str,
        /// Bytes required.
        required: usize,
        /// Bytes provided.
        got: usize,
    },

    /// A tensor addresses bytes outside of its buffer, or is misaligned.
    #[error("tensor validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The device capability query failed.
    #[error("device {device}: capability query failed: {msg}")]
    DeviceQuery {
        /// Device ordinal.
        device: usize,
        /// Reason reported by the query.
        msg: String,
    },

    /// The stream worker is gone or a queued job failed unexpectedly.
    #[error("stream error: {0}")]
    Stream(String),

    /// The GPU backend failed.
    #[error("gpu error: {0}")]
    Gpu(String),
}
