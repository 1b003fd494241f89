//! Analytic register and shared-memory estimate of the depthwise large-filter kernel.
//!
//! The kernel stages a `3 x round_up(fw, 4)` filter slice and a matching
//! source window in shared memory and keeps per-thread filter, source and
//! output fragments in registers. Everything here is a pure function of
//! `(filter_height, filter_width, output_width)`; no device is touched.

use crate::device::DeviceLimits;

/// Thread-block shape the kernel is launched with.
///
/// The register budget is `warp_size * warps_per_block * regs_per_thread`.
/// A launcher that changes the block shape must supply matching values here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    /// Threads per warp.
    pub warp_size: usize,
    /// Warps per thread block.
    pub warps_per_block: usize,
}

impl LaunchGeometry {
    /// 32-wide warps, 4 warps per block.
    pub const DEFAULT: Self = Self {
        warp_size: 32,
        warps_per_block: 4,
    };

    /// Threads in one block.
    #[must_use]
    pub const fn threads_per_block(&self) -> usize {
        self.warp_size * self.warps_per_block
    }
}

impl Default for LaunchGeometry {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Tile sizes and per-thread register counts for one problem geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceEstimate {
    pub filter_tile_width: usize,
    pub filter_tile_height: usize,
    pub source_tile_width: usize,
    pub source_tile_height: usize,
    /// Output columns handled by one block, capped at [`Self::MAX_OUT_TILE_WIDTH`].
    pub effective_out_width: usize,
    pub filter_regs_per_thread: usize,
    pub source_regs_per_thread: usize,
    pub output_regs_per_thread: usize,
}

impl ResourceEstimate {
    /// Filter rows staged per pass.
    pub const FILTER_TILE_HEIGHT: usize = 3;
    /// Widest output strip a block computes.
    pub const MAX_OUT_TILE_WIDTH: usize = 64;

    /// Estimates the footprint for a `filter_height x filter_width` filter
    /// producing rows `output_width` wide.
    #[must_use]
    pub fn new(filter_height: usize, filter_width: usize, output_width: usize) -> Self {
        let filter_tile_width = round_up(filter_width, 4);
        let filter_tile_height = Self::FILTER_TILE_HEIGHT;
        let filter_regs_per_thread = if filter_tile_width > 32 {
            filter_tile_width.div_ceil(32)
        } else {
            1 + filter_tile_width / 4
        };

        let effective_out_width = output_width.min(Self::MAX_OUT_TILE_WIDTH);
        let source_tile_width = (effective_out_width + filter_tile_width).saturating_sub(1);
        let source_tile_height = filter_tile_height + filter_height.saturating_sub(1);

        // the wide branch is sized by the filter tile, not the source tile
        let source_regs_per_thread = if source_tile_width > 128 {
            filter_tile_width.div_ceil(128)
        } else {
            (1 + effective_out_width.div_ceil(4) + filter_tile_width / 4).saturating_sub(1)
        };
        let output_regs_per_thread = round_up(effective_out_width, 4);

        Self {
            filter_tile_width,
            filter_tile_height,
            source_tile_width,
            source_tile_height,
            effective_out_width,
            filter_regs_per_thread,
            source_regs_per_thread,
            output_regs_per_thread,
        }
    }

    /// Registers one thread needs.
    #[must_use]
    pub const fn registers_per_thread(&self) -> usize {
        self.filter_regs_per_thread + self.source_regs_per_thread + self.output_regs_per_thread
    }

    /// Registers one block needs under `geometry`.
    #[must_use]
    pub const fn registers_per_block(&self, geometry: &LaunchGeometry) -> usize {
        geometry.threads_per_block() * self.registers_per_thread()
    }

    /// Shared-memory units staged per block.
    ///
    /// Counted in elements and compared against the byte limit as-is.
    #[must_use]
    pub const fn shared_memory_bytes(&self) -> usize {
        self.filter_tile_width * self.filter_tile_height
            + self.source_tile_width * self.source_tile_height
    }

    /// Whether the register file has room for one block.
    #[must_use]
    pub const fn fits_registers(&self, limits: &DeviceLimits, geometry: &LaunchGeometry) -> bool {
        self.registers_per_block(geometry) <= limits.max_registers_per_block
    }

    /// Whether shared memory has room for one block.
    #[must_use]
    pub const fn fits_shared_memory(&self, limits: &DeviceLimits) -> bool {
        self.shared_memory_bytes() <= limits.max_shared_memory_bytes
    }

    /// Both budgets hold.
    #[must_use]
    pub const fn fits(&self, limits: &DeviceLimits, geometry: &LaunchGeometry) -> bool {
        self.fits_registers(limits, geometry) && self.fits_shared_memory(limits)
    }
}

/// Rounds `x` up to a multiple of `m`.
#[must_use]
pub const fn round_up(x: usize, m: usize) -> usize {
    x.div_ceil(m) * m
}
