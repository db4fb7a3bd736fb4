//! Event dispatcher
//!
//! Two loops turn cluster notifications into [`Trigger`]s for the work queue:
//!
//! - node-status loop: `Modified` nodes whose Ready condition is `False` or
//!   `Unknown` are drained, `True` ones are uncordoned
//! - cluster-event loop: `Shutdown` and `NodeNotReady` events about a node
//!   drain that node
//!
//! The loops never deduplicate against each other. A node that goes NotReady
//! usually produces one trigger from each loop, and the drain runs twice; the
//! second run finds the node cordoned and empty.

use super::context::Context;
use super::watch::{event_subscription, node_subscription, ChangeKind, ResumableWatch};
use crate::cluster::ClusterError;
use crate::server::{SharedMetrics, ShutdownSignal};
use k8s_openapi::api::core::v1::{Event, Node};
use kube::ResourceExt;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Event reasons that mean a node is going away
pub const DRAIN_EVENT_REASONS: [&str; 2] = ["Shutdown", "NodeNotReady"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeAction {
    Drain,
    Uncordon,
}

impl NodeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeAction::Drain => "drain",
            NodeAction::Uncordon => "uncordon",
        }
    }
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSource {
    NodeStatus,
    ClusterEvent { reason: String },
}

impl TriggerSource {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            TriggerSource::NodeStatus => "node_status",
            TriggerSource::ClusterEvent { .. } => "cluster_event",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::NodeStatus => f.write_str("node status"),
            TriggerSource::ClusterEvent { reason } => write!(f, "{reason} event"),
        }
    }
}

/// A request to drain or uncordon one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub node: String,
    pub action: NodeAction,
    pub source: TriggerSource,
}

/// Status of the node's Ready condition, if it reports one
pub fn ready_status(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Ready")
        .map(|c| c.status.as_str())
}

pub fn classify_node(node: &Node) -> Option<NodeAction> {
    match ready_status(node)? {
        "False" | "Unknown" => Some(NodeAction::Drain),
        "True" => Some(NodeAction::Uncordon),
        _ => None,
    }
}

pub fn classify_event(event: &Event) -> Option<Trigger> {
    if event.involved_object.kind.as_deref() != Some("Node") {
        return None;
    }
    let reason = event.reason.as_deref()?;
    if !DRAIN_EVENT_REASONS.contains(&reason) {
        return None;
    }
    let node = event.involved_object.name.clone().filter(|n| !n.is_empty())?;
    Some(Trigger {
        node,
        action: NodeAction::Drain,
        source: TriggerSource::ClusterEvent {
            reason: reason.to_string(),
        },
    })
}

/// Handle on the two running watch loops
pub struct Dispatcher {
    loops: JoinSet<&'static str>,
}

impl Dispatcher {
    /// Establish both watches, then spawn their loops
    ///
    /// Returns an error if either subscription cannot be opened; nothing is
    /// spawned in that case.
    pub async fn start(
        ctx: &Context,
        triggers: mpsc::Sender<Trigger>,
        backoff_max: Duration,
        shutdown: ShutdownSignal,
    ) -> Result<Self, ClusterError> {
        let nodes = ResumableWatch::establish(
            "nodes",
            node_subscription(ctx.cluster.clone()),
            backoff_max,
            ctx.metrics.clone(),
        )
        .await?;
        let events = ResumableWatch::establish(
            "events",
            event_subscription(ctx.cluster.clone()),
            backoff_max,
            ctx.metrics.clone(),
        )
        .await?;

        let mut loops = JoinSet::new();
        loops.spawn(node_status_loop(
            nodes,
            triggers.clone(),
            ctx.metrics.clone(),
            shutdown.clone(),
        ));
        loops.spawn(cluster_event_loop(
            events,
            triggers,
            ctx.metrics.clone(),
            shutdown,
        ));

        info!("Event dispatcher started");
        Ok(Self { loops })
    }

    /// Resolve as soon as either loop stops
    pub async fn wait(&mut self) {
        match self.loops.join_next().await {
            Some(Ok(name)) => info!(watch_loop = name, "Watch loop stopped"),
            Some(Err(e)) => warn!(error = %e, "Watch loop failed"),
            None => {}
        }
    }

    /// Wait for every remaining loop to stop
    pub async fn join(mut self) {
        while let Some(result) = self.loops.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Watch loop failed");
            }
        }
    }
}

async fn node_status_loop(
    mut watch: ResumableWatch<Node>,
    triggers: mpsc::Sender<Trigger>,
    metrics: Option<SharedMetrics>,
    mut shutdown: ShutdownSignal,
) -> &'static str {
    loop {
        let change = tokio::select! {
            _ = shutdown.wait() => break,
            change = watch.next() => change,
        };
        // Added replays startup state and Deleted has nothing left to drain
        if change.kind != ChangeKind::Modified {
            continue;
        }
        let Some(action) = classify_node(&change.object) else {
            continue;
        };
        let trigger = Trigger {
            node: change.object.name_any(),
            action,
            source: TriggerSource::NodeStatus,
        };
        if !dispatch(&triggers, trigger, metrics.as_ref(), &mut shutdown).await {
            break;
        }
    }
    "nodes"
}

async fn cluster_event_loop(
    mut watch: ResumableWatch<Event>,
    triggers: mpsc::Sender<Trigger>,
    metrics: Option<SharedMetrics>,
    mut shutdown: ShutdownSignal,
) -> &'static str {
    loop {
        let change = tokio::select! {
            _ = shutdown.wait() => break,
            change = watch.next() => change,
        };
        if change.kind == ChangeKind::Deleted {
            continue;
        }
        let Some(trigger) = classify_event(&change.object) else {
            continue;
        };
        if !dispatch(&triggers, trigger, metrics.as_ref(), &mut shutdown).await {
            break;
        }
    }
    "events"
}

/// Hand a trigger to the work queue; false means the loop should stop
async fn dispatch(
    triggers: &mpsc::Sender<Trigger>,
    trigger: Trigger,
    metrics: Option<&SharedMetrics>,
    shutdown: &mut ShutdownSignal,
) -> bool {
    if let Some(metrics) = metrics {
        metrics.record_trigger(trigger.source.label(), trigger.action.as_str());
    }
    debug!(
        node = %trigger.node,
        action = %trigger.action,
        source = %trigger.source,
        "Dispatching trigger"
    );

    tokio::select! {
        _ = shutdown.wait() => false,
        sent = triggers.send(trigger) => {
            if sent.is_err() {
                warn!("Work queue is gone, stopping watch loop");
            }
            sent.is_ok()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "dispatcher_test.rs"]
mod tests;
