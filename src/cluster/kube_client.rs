use super::{ClusterClient, ClusterError, WatchSubscription};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use kube::api::{Api, EvictParams, ListParams, PostParams, WatchParams};
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::debug;

/// Server-side filter for the cluster event stream
const NODE_EVENT_SELECTOR: &str = "involvedObject.kind=Node";

/// Production cluster client backed by kube-rs
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Open a watch on `api`, starting either from `resume_from` or from the
    /// collection's current resource version
    async fn watch<K>(
        api: Api<K>,
        field_selector: Option<&str>,
        resume_from: Option<&str>,
    ) -> Result<WatchSubscription<K>, ClusterError>
    where
        K: Clone + DeserializeOwned + Debug + Send + 'static,
    {
        let resource_version = match resume_from {
            Some(version) => version.to_string(),
            None => {
                let mut lp = ListParams::default().limit(1);
                if let Some(selector) = field_selector {
                    lp = lp.fields(selector);
                }
                let list = api.list(&lp).await?;
                list.metadata
                    .resource_version
                    .unwrap_or_else(|| "0".to_string())
            }
        };

        let mut wp = WatchParams::default();
        if let Some(selector) = field_selector {
            wp = wp.fields(selector);
        }

        debug!(resource_version = %resource_version, "Opening watch");
        let stream = api.watch(&wp, &resource_version).await?;
        Ok(WatchSubscription {
            resource_version,
            stream: stream.map_err(ClusterError::from).boxed(),
        })
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .get(name)
            .await
            .map_err(|e| ClusterError::from_kube(e, "Node", name))
    }

    async fn update_node(&self, node: &Node) -> Result<(), ClusterError> {
        let name = node.name_any();
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .replace(&name, &PostParams::default(), node)
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube(e, "Node", &name))
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, ClusterError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        Ok(pods.list(&lp).await?.items)
    }

    async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>, ClusterError> {
        let daemon_sets: Api<DaemonSet> = Api::all(self.client.clone());
        Ok(daemon_sets.list(&ListParams::default()).await?.items)
    }

    async fn evict(&self, namespace: &str, pod_name: &str) -> Result<(), ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.evict(pod_name, &EvictParams::default())
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube(e, "Pod", &format!("{namespace}/{pod_name}")))
    }

    async fn watch_nodes(
        &self,
        resume_from: Option<&str>,
    ) -> Result<WatchSubscription<Node>, ClusterError> {
        Self::watch(Api::<Node>::all(self.client.clone()), None, resume_from).await
    }

    async fn watch_events(
        &self,
        resume_from: Option<&str>,
    ) -> Result<WatchSubscription<Event>, ClusterError> {
        Self::watch(
            Api::<Event>::all(self.client.clone()),
            Some(NODE_EVENT_SELECTOR),
            resume_from,
        )
        .await
    }
}
