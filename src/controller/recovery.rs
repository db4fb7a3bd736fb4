//! Recovery engine: return a healthy node to scheduling

use super::context::Context;
use super::drain::is_unschedulable;
use crate::cluster::ClusterError;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UncordonOutcome {
    /// The unschedulable flag was cleared by this call
    Uncordoned,
    /// The node was already schedulable; nothing was written
    AlreadySchedulable,
}

impl UncordonOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UncordonOutcome::Uncordoned => "uncordoned",
            UncordonOutcome::AlreadySchedulable => "noop",
        }
    }
}

#[derive(Debug, Error)]
pub enum UncordonError {
    #[error("Failed to read node {node}: {source}")]
    ReadNode {
        node: String,
        #[source]
        source: ClusterError,
    },

    #[error("Failed to uncordon node {node}: {source}")]
    Uncordon {
        node: String,
        #[source]
        source: ClusterError,
    },
}

/// Clear the unschedulable flag on a node
///
/// Pods are never moved back; the scheduler places new work on the node once
/// it accepts pods again.
pub async fn uncordon_node(
    ctx: &Context,
    node_name: &str,
) -> Result<UncordonOutcome, UncordonError> {
    let mut node = ctx
        .cluster
        .get_node(node_name)
        .await
        .map_err(|source| UncordonError::ReadNode {
            node: node_name.to_string(),
            source,
        })?;

    if !is_unschedulable(&node) {
        debug!(node = %node_name, "Node already schedulable");
        return Ok(UncordonOutcome::AlreadySchedulable);
    }

    if let Some(spec) = node.spec.as_mut() {
        spec.unschedulable = Some(false);
    }
    ctx.cluster
        .update_node(&node)
        .await
        .map_err(|source| UncordonError::Uncordon {
            node: node_name.to_string(),
            source,
        })?;

    info!(node = %node_name, "Uncordoned node");
    Ok(UncordonOutcome::Uncordoned)
}
