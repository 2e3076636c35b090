//! Pool configuration.

use std::time::Duration;

/// Capacity and reclamation settings for an [`crate::InstancePool`].
///
/// Fixed at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of Excel instances alive at once. Default: 4.
    pub max_instances: usize,
    /// An instance unused for this long is shut down. Default: 60 seconds.
    pub idle_timeout: Duration,
    /// How long a caller waits for a free instance slot before failing with
    /// [`crate::Error::CapacityExceeded`]. Default: 5 seconds.
    pub admission_wait: Duration,
    /// Interval between idle scans. Default: 10 seconds.
    pub reclaim_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 4,
            idle_timeout: Duration::from_secs(60),
            admission_wait: Duration::from_secs(5),
            reclaim_interval: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    pub fn with_max_instances(mut self, max_instances: usize) -> Self {
        self.max_instances = max_instances.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_admission_wait(mut self, admission_wait: Duration) -> Self {
        self.admission_wait = admission_wait;
        self
    }

    pub fn with_reclaim_interval(mut self, reclaim_interval: Duration) -> Self {
        self.reclaim_interval = reclaim_interval;
        self
    }
}
