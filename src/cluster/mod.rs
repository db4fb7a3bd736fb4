//! Cluster client capability
//!
//! The controller only talks to the cluster through [`ClusterClient`]:
//! - `KubeClusterClient` talks to a real API server through kube-rs
//! - `mock::MockClusterClient` keeps an in-memory cluster for tests

mod kube_client;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test helper - panicking is acceptable
pub mod mock;

pub use kube_client::KubeClusterClient;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use kube::api::WatchEvent;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("Conflict writing {kind} {name}: {message}")]
    Conflict {
        kind: &'static str,
        name: String,
        message: String,
    },

    #[error("API request failed ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl ClusterError {
    /// Classify a kube error for an object of the given kind and name
    pub(crate) fn from_kube(err: kube::Error, kind: &'static str, name: &str) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound {
                kind,
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 => ClusterError::Conflict {
                kind,
                name: name.to_string(),
                message: resp.message,
            },
            kube::Error::Api(resp) => ClusterError::Api {
                code: resp.code,
                message: resp.message,
            },
            other => ClusterError::Kube(other),
        }
    }
}

/// Raw watch notifications for one subscription
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, ClusterError>>;

/// An open watch and the resource version it starts after
///
/// For a subscription opened from "now" this is the collection resource
/// version read when it was opened. Resuming from it misses nothing even if
/// the stream closes before delivering anything.
pub struct WatchSubscription<K> {
    pub resource_version: String,
    pub stream: WatchStream<K>,
}

/// Narrow interface the drain controller needs from the cluster
///
/// Node writes use optimistic concurrency: `update_node` fails with
/// `ClusterError::Conflict` if the node changed since it was read.
///
/// `resume_from` on the watch calls is the last resource version the caller
/// observed. `None` starts the subscription from the current state of the
/// collection, without replaying existing objects.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;

    async fn update_node(&self, node: &Node) -> Result<(), ClusterError>;

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, ClusterError>;

    async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>, ClusterError>;

    /// Submit an eviction for a pod (policy/v1 Eviction, honours disruption budgets)
    async fn evict(&self, namespace: &str, pod_name: &str) -> Result<(), ClusterError>;

    async fn watch_nodes(
        &self,
        resume_from: Option<&str>,
    ) -> Result<WatchSubscription<Node>, ClusterError>;

    async fn watch_events(
        &self,
        resume_from: Option<&str>,
    ) -> Result<WatchSubscription<Event>, ClusterError>;
}
