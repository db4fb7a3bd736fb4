//! Drain engine
//!
//! Cordons a node, evicts every pod that a daemon-set does not own, then
//! polls until the node is empty or the drain budget runs out.
//!
//! A drain is safe to re-enter: an already-cordoned node is not written
//! again, and a later watch notification simply runs the whole sequence once
//! more. Nothing is retried inside a single drain.

use super::context::Context;
use crate::cluster::ClusterError;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("Failed to read node {node}: {source}")]
    ReadNode {
        node: String,
        #[source]
        source: ClusterError,
    },

    #[error("Failed to cordon node {node}: {source}")]
    Cordon {
        node: String,
        #[source]
        source: ClusterError,
    },

    #[error("Failed to list pods on node {node}: {source}")]
    ListPods {
        node: String,
        #[source]
        source: ClusterError,
    },

    #[error("Failed to list daemon-sets: {0}")]
    ListDaemonSets(#[source] ClusterError),

    #[error(
        "Timed out after {waited:?} waiting for {} pod(s) to leave node {node}",
        .remaining.len()
    )]
    Timeout {
        node: String,
        waited: Duration,
        remaining: Vec<PodKey>,
    },
}

impl DrainError {
    /// Metric label: `timeout` for an exhausted budget, `error` otherwise
    pub fn outcome(&self) -> &'static str {
        match self {
            DrainError::Timeout { .. } => "timeout",
            _ => "error",
        }
    }
}

/// Result of one drain: success, timeout or error
pub type DrainOutcome = Result<DrainReport, DrainError>;

/// Metric label for a drain outcome
pub fn outcome_label(outcome: &DrainOutcome) -> &'static str {
    match outcome {
        Ok(_) => "success",
        Err(e) => e.outcome(),
    }
}

/// Namespace and name of a pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_pod(pod: &Pod) -> Self {
        Self::new(pod.namespace().unwrap_or_default(), pod.name_any())
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionFailure {
    pub pod: PodKey,
    pub reason: String,
}

/// What a successful drain did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub node: String,
    /// False when the node was already cordoned before this drain
    pub cordoned: bool,
    pub evicted: Vec<PodKey>,
    /// Evictions the API refused; the pods left anyway before the budget ran out
    pub eviction_failures: Vec<EvictionFailure>,
    /// Daemon-set pods left running on the node
    pub daemon_set_pods: usize,
    pub elapsed: Duration,
}

/// Daemon-sets in the cluster, keyed by namespace
///
/// Owner references never cross namespaces, so a pod is daemon-set owned only
/// when the daemon-set named in its owner reference exists in the pod's own
/// namespace.
#[derive(Debug, Default)]
pub struct DaemonSetIndex {
    by_namespace: HashMap<String, HashSet<String>>,
}

impl DaemonSetIndex {
    pub fn new(daemon_sets: &[DaemonSet]) -> Self {
        let mut by_namespace: HashMap<String, HashSet<String>> = HashMap::new();
        for ds in daemon_sets {
            by_namespace
                .entry(ds.namespace().unwrap_or_default())
                .or_default()
                .insert(ds.name_any());
        }
        Self { by_namespace }
    }

    pub fn owns(&self, pod: &Pod) -> bool {
        let Some(names) = self.by_namespace.get(&pod.namespace().unwrap_or_default()) else {
            return false;
        };
        pod.owner_references()
            .iter()
            .any(|owner| owner.kind == "DaemonSet" && names.contains(&owner.name))
    }
}

/// Pods on the node split into those to evict and those to leave resident
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    pub evictable: Vec<PodKey>,
    /// The daemon-set owned set for this drain
    pub resident: HashSet<PodKey>,
}

impl EvictionPlan {
    /// Pods reported on a different node are ignored entirely
    pub fn new(node_name: &str, pods: &[Pod], daemon_sets: &DaemonSetIndex) -> Self {
        let mut plan = Self::default();
        for pod in pods.iter().filter(|p| is_on_node(p, node_name)) {
            let key = PodKey::from_pod(pod);
            if daemon_sets.owns(pod) {
                plan.resident.insert(key);
            } else {
                plan.evictable.push(key);
            }
        }
        plan
    }
}

fn is_on_node(pod: &Pod, node_name: &str) -> bool {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name)
}

pub(crate) fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false)
}

/// Drain a node: cordon, evict, wait for evacuation
pub async fn drain_node(ctx: &Context, node_name: &str) -> DrainOutcome {
    let start = Instant::now();
    info!(node = %node_name, "Starting drain");

    let cordoned = cordon(ctx, node_name).await?;

    let pods = ctx
        .cluster
        .list_pods_on_node(node_name)
        .await
        .map_err(|source| DrainError::ListPods {
            node: node_name.to_string(),
            source,
        })?;
    let daemon_sets = ctx
        .cluster
        .list_daemon_sets()
        .await
        .map_err(DrainError::ListDaemonSets)?;
    let index = DaemonSetIndex::new(&daemon_sets);
    let plan = EvictionPlan::new(node_name, &pods, &index);

    debug!(
        node = %node_name,
        evictable = plan.evictable.len(),
        daemon_set_pods = plan.resident.len(),
        "Computed eviction plan"
    );

    let mut report = DrainReport {
        node: node_name.to_string(),
        cordoned,
        evicted: Vec::with_capacity(plan.evictable.len()),
        eviction_failures: Vec::new(),
        daemon_set_pods: plan.resident.len(),
        elapsed: Duration::ZERO,
    };

    for pod in plan.evictable {
        let result = ctx.cluster.evict(&pod.namespace, &pod.name).await;
        if let Some(ref metrics) = ctx.metrics {
            metrics.record_eviction(result.is_ok());
        }
        match result {
            Ok(()) => {
                info!(node = %node_name, pod = %pod, "Evicted pod");
                report.evicted.push(pod);
            }
            Err(e) => {
                // Best effort: the convergence wait decides whether the drain succeeds
                warn!(node = %node_name, pod = %pod, error = %e, "Failed to evict pod");
                report.eviction_failures.push(EvictionFailure {
                    pod,
                    reason: e.to_string(),
                });
            }
        }
    }

    wait_for_evacuation(ctx, node_name, &index).await?;

    report.elapsed = start.elapsed();
    info!(
        node = %node_name,
        evicted = report.evicted.len(),
        eviction_failures = report.eviction_failures.len(),
        elapsed = ?report.elapsed,
        "All non-daemon-set pods have left the node"
    );
    Ok(report)
}

/// Mark the node unschedulable unless it already is
///
/// Returns whether this call wrote the flag.
async fn cordon(ctx: &Context, node_name: &str) -> Result<bool, DrainError> {
    let mut node = ctx
        .cluster
        .get_node(node_name)
        .await
        .map_err(|source| DrainError::ReadNode {
            node: node_name.to_string(),
            source,
        })?;

    if is_unschedulable(&node) {
        info!(node = %node_name, "Node already cordoned, continuing with drain");
        return Ok(false);
    }

    node.spec.get_or_insert_with(Default::default).unschedulable = Some(true);
    ctx.cluster
        .update_node(&node)
        .await
        .map_err(|source| DrainError::Cordon {
            node: node_name.to_string(),
            source,
        })?;

    info!(node = %node_name, "Cordoned node");
    Ok(true)
}

/// Poll the node's pods until no pod outside a daemon-set remains
///
/// The first listing happens immediately; the last one lands exactly on the
/// budget, so a timeout is reported after `timeout` and never later.
async fn wait_for_evacuation(
    ctx: &Context,
    node_name: &str,
    daemon_sets: &DaemonSetIndex,
) -> Result<(), DrainError> {
    let start = Instant::now();

    loop {
        let pods = ctx
            .cluster
            .list_pods_on_node(node_name)
            .await
            .map_err(|source| DrainError::ListPods {
                node: node_name.to_string(),
                source,
            })?;

        let remaining: Vec<PodKey> = pods
            .iter()
            .filter(|p| is_on_node(p, node_name) && !daemon_sets.owns(p))
            .map(PodKey::from_pod)
            .collect();
        if remaining.is_empty() {
            return Ok(());
        }

        let waited = start.elapsed();
        if waited >= ctx.drain.timeout {
            return Err(DrainError::Timeout {
                node: node_name.to_string(),
                waited,
                remaining,
            });
        }

        debug!(node = %node_name, remaining = remaining.len(), "Waiting for pods to leave node");
        tokio::time::sleep(ctx.drain.poll_interval.min(ctx.drain.timeout - waited)).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "drain_test.rs"]
mod tests;
