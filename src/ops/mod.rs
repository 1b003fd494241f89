//! # Kernel Layer
//!
//! Renditions of the device kernels and the dispatch between them.
//!
//! ## Submodules
//!
//! - [`cpu`] — rayon-parallel host kernels (always available, fallback)
//! - [`wgpu`] *(opt-in)* — compute shader pipelines using `wgpu`
//! - [`dispatch`] — typed entry points bound by the algorithm table; picks
//!   the backend from [`crate::backend::get_backend`]
//!
//! ## Feature Flags
//!
//! - `wgpu` — enables the `wgpu` backend
//! - `fp16` — enables the half-precision kernel instantiation

pub mod cpu;
pub mod dispatch;
#[cfg(feature = "wgpu")]
pub mod wgpu;
