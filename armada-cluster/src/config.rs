//! Fleet configuration.

use crate::error::ClusterError;
use std::path::PathBuf;
use std::time::Duration;

/// Options for a single command or query dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Deadline for one RPC attempt.
    pub timeout: Duration,
    /// Number of additional attempts after the first.
    pub retry: u32,
    /// Sleep between attempts.
    pub retry_interval: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            retry: 3,
            retry_interval: Duration::from_millis(1000),
        }
    }
}

/// Configuration for a fleet node.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Manager reconciliation tick period.
    pub balancing_interval: Duration,

    /// Leader-cache refresh period.
    pub leader_cache_refresh_interval: Duration,

    /// How long a node may stay unhealthy before it is purged.
    pub node_purge_failure_time_window: Duration,

    /// Health-probe and reconnect period of the purge controller.
    pub node_purge_reconnect_interval: Duration,

    /// Failing-replica count above which a node is marked unhealthy
    /// (strictly greater triggers).
    pub node_purge_threshold_failing_members: u32,

    /// When set, a group `g` persists under `<parent>/<g>`.
    pub persistence_dir_parent: Option<PathBuf>,

    /// How long a removed group stays tombstoned.
    pub tombstone_ttl: Duration,

    /// Dispatch options for the node's own cluster-group traffic
    /// (reconciliation, purging, bootstrap).
    pub internal_call: CallOptions,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            balancing_interval: Duration::from_millis(60_000),
            leader_cache_refresh_interval: Duration::from_millis(300_000),
            node_purge_failure_time_window: Duration::from_millis(600_000),
            node_purge_reconnect_interval: Duration::from_millis(60_000),
            node_purge_threshold_failing_members: 2,
            persistence_dir_parent: None,
            tombstone_ttl: Duration::from_millis(300_000),
            internal_call: CallOptions::default(),
        }
    }
}

impl FleetConfig {
    /// Create a new configuration builder.
    pub fn builder() -> FleetConfigBuilder {
        FleetConfigBuilder::default()
    }

    /// Shortened intervals for tests and single-process experiments.
    ///
    /// Production and test runs share every code path; only the timing
    /// profile differs.
    #[must_use]
    pub fn test_profile() -> Self {
        Self {
            balancing_interval: Duration::from_millis(50),
            leader_cache_refresh_interval: Duration::from_millis(100),
            node_purge_failure_time_window: Duration::from_millis(300),
            node_purge_reconnect_interval: Duration::from_millis(50),
            node_purge_threshold_failing_members: 0,
            persistence_dir_parent: None,
            tombstone_ttl: Duration::from_millis(200),
            internal_call: CallOptions {
                timeout: Duration::from_millis(200),
                retry: 3,
                retry_interval: Duration::from_millis(25),
            },
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.balancing_interval.is_zero() {
            return Err(ClusterError::Config(
                "balancing_interval must be non-zero".to_string(),
            ));
        }
        if self.leader_cache_refresh_interval.is_zero() {
            return Err(ClusterError::Config(
                "leader_cache_refresh_interval must be non-zero".to_string(),
            ));
        }
        if self.node_purge_reconnect_interval.is_zero() {
            return Err(ClusterError::Config(
                "node_purge_reconnect_interval must be non-zero".to_string(),
            ));
        }
        if self.node_purge_failure_time_window < self.node_purge_reconnect_interval {
            return Err(ClusterError::Config(format!(
                "node_purge_failure_time_window ({:?}) must cover at least one \
                 reconnect interval ({:?})",
                self.node_purge_failure_time_window, self.node_purge_reconnect_interval
            )));
        }
        if self.internal_call.timeout.is_zero() {
            return Err(ClusterError::Config(
                "internal_call.timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`FleetConfig`].
#[derive(Debug, Default)]
pub struct FleetConfigBuilder {
    config: FleetConfig,
}

impl FleetConfigBuilder {
    /// Set the manager tick period.
    pub fn balancing_interval(mut self, interval: Duration) -> Self {
        self.config.balancing_interval = interval;
        self
    }

    /// Set the leader-cache refresh period.
    pub fn leader_cache_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.leader_cache_refresh_interval = interval;
        self
    }

    /// Set the unhealthy duration before purge.
    pub fn node_purge_failure_time_window(mut self, window: Duration) -> Self {
        self.config.node_purge_failure_time_window = window;
        self
    }

    /// Set the health-probe period.
    pub fn node_purge_reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.node_purge_reconnect_interval = interval;
        self
    }

    /// Set the failing-replica threshold.
    pub fn node_purge_threshold_failing_members(mut self, threshold: u32) -> Self {
        self.config.node_purge_threshold_failing_members = threshold;
        self
    }

    /// Set the persistence parent directory.
    pub fn persistence_dir_parent(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.persistence_dir_parent = Some(dir.into());
        self
    }

    /// Set the tombstone time-to-live.
    pub fn tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.config.tombstone_ttl = ttl;
        self
    }

    /// Set the dispatch options for internal cluster-group traffic.
    pub fn internal_call(mut self, options: CallOptions) -> Self {
        self.config.internal_call = options;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<FleetConfig, ClusterError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
