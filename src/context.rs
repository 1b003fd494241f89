//! Per-device execution context.

use crate::config::EngineConfig;
use crate::device::{DeviceCapabilityQuery, DeviceId, DeviceLimits, LimitsCache};
use crate::dtype::{DTypeDeducer, DefaultDTypeDeducer};
use crate::error::ConvError;
use crate::postprocess::{BiasActivation, HostBiasActivation};
use std::sync::Arc;

/// Everything an algorithm needs besides the problem itself: resolved device
/// limits, configuration and the injected collaborators.
#[derive(Clone)]
pub struct ExecContext {
    device_id: DeviceId,
    limits: DeviceLimits,
    config: EngineConfig,
    deducer: Arc<dyn DTypeDeducer>,
    post: Arc<dyn BiasActivation>,
}

impl ExecContext {
    /// Resolves the limits of `query`'s device through `cache`.
    ///
    /// # Errors
    /// Propagates the device query failure.
    pub fn new(
        query: &dyn DeviceCapabilityQuery,
        cache: &LimitsCache,
        config: EngineConfig,
    ) -> Result<Self, ConvError> {
        let limits = cache.resolve(query)?;
        Ok(Self::with_limits(query.device_id(), limits, config))
    }

    /// Resolves the limits of `query`'s device through [`LimitsCache::global`].
    ///
    /// # Errors
    /// Propagates the device query failure.
    pub fn for_device(query: &dyn DeviceCapabilityQuery, config: EngineConfig) -> Result<Self, ConvError> {
        Self::new(query, LimitsCache::global(), config)
    }

    /// Context over already known limits.
    #[must_use]
    pub fn with_limits(device_id: DeviceId, limits: DeviceLimits, config: EngineConfig) -> Self {
        Self {
            device_id,
            limits,
            config,
            deducer: Arc::new(DefaultDTypeDeducer),
            post: Arc::new(HostBiasActivation::default()),
        }
    }

    /// Replaces the dtype inference rule.
    #[must_use]
    pub fn with_dtype_deducer(mut self, deducer: Arc<dyn DTypeDeducer>) -> Self {
        self.deducer = deducer;
        self
    }

    /// Replaces the bias/activation step.
    #[must_use]
    pub fn with_bias_activation(mut self, post: Arc<dyn BiasActivation>) -> Self {
        self.post = post;
        self
    }

    #[must_use]
    pub const fn device_id(&self) -> DeviceId {
        self.device_id
    }

    #[must_use]
    pub const fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn dtype_deducer(&self) -> &dyn DTypeDeducer {
        self.deducer.as_ref()
    }

    /// Shared handle, for work that outlives the borrow.
    #[must_use]
    pub fn bias_activation(&self) -> Arc<dyn BiasActivation> {
        Arc::clone(&self.post)
    }
}

impl core::fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecContext")
            .field("device_id", &self.device_id)
            .field("limits", &self.limits)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
