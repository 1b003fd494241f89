//! Backend selection module.
//!
//! The device kernels have two renditions: a rayon-parallel host version
//! (always available) and a `wgpu` compute shader (with the `wgpu` feature).
//! The active one is process-global and stored in an `AtomicU8`, so it can be
//! switched at runtime without touching any [`ExecContext`].
//!
//! # Supported Backends
//!
//! - `Cpu` — host emulation of the kernels (default).
//! - `Wgpu` — GPU compute shaders; falls back to `Cpu` when no adapter can be
//!   opened or the feature is disabled.
//!
//! [`ExecContext`]: crate::context::ExecContext

use core::sync::atomic::{AtomicU8, Ordering};

/// Enumeration of supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Backend {
    /// Host kernels on the rayon pool (default).
    #[default]
    Cpu = 0,
    /// GPU kernels through `wgpu`.
    Wgpu = 1,
}

impl TryFrom<u8> for Backend {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            other => Err(other),
        }
    }
}

/// Raw [`Backend`] discriminant.
static GLOBAL_DEFAULT_BACKEND: AtomicU8 = AtomicU8::new(Backend::Cpu as u8);

/// Sets the backend later kernel launches run on.
///
/// Jobs already queued on a stream read the backend when they start.
///
/// # Example
///
/// ```
/// use dwconv_bias::backend::{set_backend, get_backend, Backend};
/// set_backend(Backend::Cpu);
/// assert_eq!(get_backend(), Backend::Cpu);
/// ```
pub fn set_backend(b: Backend) {
    GLOBAL_DEFAULT_BACKEND.store(b as u8, Ordering::Release);
}

/// Returns the active backend; an invalid stored value reads as [`Backend::Cpu`].
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_DEFAULT_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}
