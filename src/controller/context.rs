use crate::cluster::ClusterClient;
use crate::server::SharedMetrics;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(600);

/// Timing of the drain convergence wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainSettings {
    /// Delay between pod listings while waiting for the node to empty
    pub poll_interval: Duration,
    /// Total budget for the wait, measured from its first listing
    pub timeout: Duration,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Everything a drain or uncordon needs, shared by all in-flight actions
pub struct Context {
    pub cluster: Arc<dyn ClusterClient>,
    pub drain: DrainSettings,
    /// Optional controller metrics for Prometheus
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        drain: DrainSettings,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            cluster,
            drain,
            metrics,
        }
    }

    /// Context over a mock cluster with default timings and no metrics
    #[cfg(test)]
    pub fn new_mock(cluster: Arc<crate::cluster::mock::MockClusterClient>) -> Self {
        Self::new(cluster, DrainSettings::default(), None)
    }
}
