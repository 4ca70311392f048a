//! Node controller configuration

use std::time::Duration;

use crate::queue::BackoffConfig;

/// Default heartbeat staleness threshold
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default number of parallel reconciliation workers
pub const DEFAULT_WORKERS: usize = 3;

/// Consecutive failures of one node key before a Warning Event is published
pub const DEFAULT_FAILURE_EVENT_THRESHOLD: u32 = 5;

/// Runtime configuration of the node controller
#[derive(Clone, Debug)]
pub struct NodeControllerConfig {
    /// A node whose heartbeat is older than this is unresponsive
    pub heartbeat_timeout: Duration,
    /// Number of workers pulling node keys from the queue
    pub workers: usize,
    /// Restrict VM and pod lists to one namespace (None = all namespaces)
    pub namespace: Option<String>,
    /// Publish a Warning Event after this many consecutive failures of a node key
    pub failure_event_threshold: u32,
    /// Retry backoff for failed cycles
    pub backoff: BackoffConfig,
}

impl Default for NodeControllerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            workers: DEFAULT_WORKERS,
            namespace: None,
            failure_event_threshold: DEFAULT_FAILURE_EVENT_THRESHOLD,
            backoff: BackoffConfig::default(),
        }
    }
}

impl NodeControllerConfig {
    /// Number of workers, never less than one
    pub fn effective_workers(&self) -> usize {
        self.workers.max(1)
    }

    /// Whether repeated failures are reported as Kubernetes Events
    pub fn events_enabled(&self) -> bool {
        self.failure_event_threshold > 0
    }
}
