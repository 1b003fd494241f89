//! Device capability queries and the per-device limits cache.
//!
//! Limits are resolved once (see [`LimitsCache`]) and then travel inside an
//! [`ExecContext`](crate::context::ExecContext) by value, so admission checks
//! never reach for global state.

use crate::error::ConvError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Ordinal identifying a device within the process.
pub type DeviceId = usize;

/// Per-block resource limits of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// 32-bit registers available to one thread block.
    pub max_registers_per_block: usize,
    /// Shared memory available to one thread block, in bytes.
    pub max_shared_memory_bytes: usize,
}

impl DeviceLimits {
    /// 64K registers and 48 KiB of shared memory per block, the common
    /// configuration of current discrete GPUs.
    pub const TYPICAL: Self = Self::new(65536, 48 * 1024);

    #[must_use]
    pub const fn new(max_registers_per_block: usize, max_shared_memory_bytes: usize) -> Self {
        Self {
            max_registers_per_block,
            max_shared_memory_bytes,
        }
    }
}

/// Reports the limits of one device.
pub trait DeviceCapabilityQuery: Send + Sync {
    /// Identity used as the cache key.
    fn device_id(&self) -> DeviceId;

    /// Queries the device.
    ///
    /// # Errors
    /// [`ConvError::DeviceQuery`] when the device cannot be inspected.
    fn query_limits(&self) -> Result<DeviceLimits, ConvError>;
}

/// A device whose limits are known up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticDevice {
    id: DeviceId,
    limits: DeviceLimits,
}

impl StaticDevice {
    #[must_use]
    pub const fn new(id: DeviceId, limits: DeviceLimits) -> Self {
        Self { id, limits }
    }
}

impl DeviceCapabilityQuery for StaticDevice {
    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn query_limits(&self) -> Result<DeviceLimits, ConvError> {
        Ok(self.limits)
    }
}

/// Memoizes [`DeviceLimits`] per device id.
#[derive(Debug, Default)]
pub struct LimitsCache {
    entries: Mutex<HashMap<DeviceId, DeviceLimits>>,
}

static GLOBAL_LIMITS: OnceLock<LimitsCache> = OnceLock::new();

impl LimitsCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache, used by [`ExecContext::for_device`](crate::context::ExecContext::for_device).
    #[must_use]
    pub fn global() -> &'static Self {
        GLOBAL_LIMITS.get_or_init(Self::new)
    }

    /// Returns the cached limits of `query`'s device, querying it on first use.
    ///
    /// # Errors
    /// Propagates the query error; failures are not cached.
    pub fn resolve(&self, query: &dyn DeviceCapabilityQuery) -> Result<DeviceLimits, ConvError> {
        let id = query.device_id();
        if let Some(limits) = self.entries.lock().get(&id) {
            return Ok(*limits);
        }
        let limits = query.query_limits()?;
        tracing::info!(
            device = id,
            registers = limits.max_registers_per_block,
            shared_memory = limits.max_shared_memory_bytes,
            "resolved device limits"
        );
        Ok(*self.entries.lock().entry(id).or_insert(limits))
    }

    /// Drops the cached entry of `id`.
    pub fn invalidate(&self, id: DeviceId) -> Option<DeviceLimits> {
        self.entries.lock().remove(&id)
    }

    /// Number of cached devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
