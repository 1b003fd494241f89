//! Engine configuration.

use crate::memory::WorkspaceBundle;
use crate::resource::LaunchGeometry;

/// Tunables shared by every invocation made through one
/// [`ExecContext`](crate::context::ExecContext).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Block shape the kernel is launched with.
    pub launch: LaunchGeometry,
    /// Whether half-precision kernels may be selected. Only honored when the
    /// crate is built with the `fp16` feature.
    pub fp16: bool,
    /// Alignment of workspace chunks in bytes.
    pub workspace_alignment: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            launch: LaunchGeometry::DEFAULT,
            fp16: cfg!(feature = "fp16"),
            workspace_alignment: WorkspaceBundle::DEFAULT_ALIGN,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub const fn with_launch(mut self, launch: LaunchGeometry) -> Self {
        self.launch = launch;
        self
    }

    #[must_use]
    pub const fn with_fp16(mut self, fp16: bool) -> Self {
        self.fp16 = fp16;
        self
    }

    #[must_use]
    pub const fn with_workspace_alignment(mut self, align: usize) -> Self {
        self.workspace_alignment = align;
        self
    }

    /// Float16 kernels are compiled in and enabled.
    #[must_use]
    pub const fn supports_fp16(&self) -> bool {
        cfg!(feature = "fp16") && self.fp16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fp16_needs_feature_and_flag() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.supports_fp16(), cfg!(feature = "fp16"));
        assert!(!cfg.with_fp16(false).supports_fp16());
    }

    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.launch.threads_per_block(), 128);
        assert_eq!(cfg.workspace_alignment, 512);
    }
}
