//! Explicit transport context.
//!
//! There is no process-wide state: every segment is created or acquired
//! through a context carrying its configuration and the probed wait
//! strategy, so any number of segments with different settings can live in
//! one process.

use crate::config::SegmentConfig;
use crate::wait::{BoundedWait, TimedWaitSupport};

#[derive(Debug, Clone)]
pub struct TransportContext {
    config: SegmentConfig,
    wait: BoundedWait,
}

impl TransportContext {
    /// Probe the platform's timed-wait support and bind it to `config`.
    pub fn new(config: SegmentConfig) -> Self {
        let support = TimedWaitSupport::probe();
        tracing::debug!(?support, interval = ?config.wait_interval, "transport context");
        Self::with_support(config, support)
    }

    /// Skip the probe and use a known strategy.
    pub fn with_support(config: SegmentConfig, support: TimedWaitSupport) -> Self {
        let wait = BoundedWait::new(support, config.wait_interval);
        Self { config, wait }
    }

    /// Configuration from `SHMIF_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(SegmentConfig::from_env())
    }

    #[inline]
    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    #[inline]
    pub fn bounded_wait(&self) -> BoundedWait {
        self.wait
    }
}

impl Default for TransportContext {
    fn default() -> Self {
        Self::new(SegmentConfig::default())
    }
}
