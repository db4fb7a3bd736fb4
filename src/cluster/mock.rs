//! In-memory cluster for controller tests
//!
//! Records every node read, node write, eviction and watch subscription so
//! tests can assert on the calls the controller made.

use super::{ClusterClient, ClusterError, WatchStream, WatchSubscription};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{
    Event, Node, NodeCondition, NodeSpec, NodeStatus, ObjectReference, Pod, PodSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ObjectMeta, WatchEvent};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct MockState {
    nodes: HashMap<String, Node>,
    pods: Vec<Pod>,
    daemon_sets: Vec<DaemonSet>,

    node_reads: Vec<String>,
    node_updates: Vec<Node>,
    evictions: Vec<(String, String)>,
    pod_lists: usize,

    evict_removes_pods: bool,
    evacuate_after_lists: Option<usize>,
    fail_get_node: bool,
    conflict_on_update: bool,
    fail_list_daemon_sets: bool,
    fail_pod_list_after: Option<usize>,
    eviction_failures: HashSet<(String, String)>,

    node_watches: VecDeque<Vec<WatchEvent<Node>>>,
    event_watches: VecDeque<Vec<WatchEvent<Event>>>,
    node_watch_resumes: Vec<Option<String>>,
    event_watch_resumes: Vec<Option<String>>,
    fail_watch_subscribe: bool,
    /// Collection resource version handed to subscriptions opened from now
    collection_version: Option<String>,
}

/// Mock cluster client - stores objects and calls in memory
#[derive(Default)]
pub struct MockClusterClient {
    state: Mutex<MockState>,
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("MockClusterClient lock poisoned")
    }

    pub fn with_node(self, node: Node) -> Self {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.lock().nodes.insert(name, node);
        self
    }

    pub fn with_pod(self, pod: Pod) -> Self {
        self.lock().pods.push(pod);
        self
    }

    pub fn with_daemon_set(self, daemon_set: DaemonSet) -> Self {
        self.lock().daemon_sets.push(daemon_set);
        self
    }

    /// Successful evictions remove the pod immediately
    pub fn evict_removes_pods(self) -> Self {
        self.lock().evict_removes_pods = true;
        self
    }

    /// Once more than `lists` pod listings have been served, every pod that
    /// is not owned by a DaemonSet disappears
    pub fn evacuate_after_lists(self, lists: usize) -> Self {
        self.lock().evacuate_after_lists = Some(lists);
        self
    }

    pub fn fail_get_node(self) -> Self {
        self.lock().fail_get_node = true;
        self
    }

    pub fn conflict_on_update(self) -> Self {
        self.lock().conflict_on_update = true;
        self
    }

    pub fn fail_list_daemon_sets(self) -> Self {
        self.lock().fail_list_daemon_sets = true;
        self
    }

    /// Serve `lists` pod listings, then fail every following one
    pub fn fail_pod_list_after(self, lists: usize) -> Self {
        self.lock().fail_pod_list_after = Some(lists);
        self
    }

    pub fn fail_eviction(self, namespace: &str, name: &str) -> Self {
        self.lock()
            .eviction_failures
            .insert((namespace.to_string(), name.to_string()));
        self
    }

    /// Queue the notifications delivered by the next node subscription;
    /// the stream closes after the last one
    pub fn script_node_watch(self, events: Vec<WatchEvent<Node>>) -> Self {
        self.lock().node_watches.push_back(events);
        self
    }

    pub fn script_event_watch(self, events: Vec<WatchEvent<Event>>) -> Self {
        self.lock().event_watches.push_back(events);
        self
    }

    /// Resource version a subscription opened from now starts after ("1" unless set)
    pub fn with_collection_version(self, resource_version: &str) -> Self {
        self.lock().collection_version = Some(resource_version.to_string());
        self
    }

    pub fn fail_watch_subscribe(self) -> Self {
        self.lock().fail_watch_subscribe = true;
        self
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.lock().nodes.get(name).cloned()
    }

    pub fn node_reads(&self, name: &str) -> usize {
        self.lock().node_reads.iter().filter(|n| *n == name).count()
    }

    pub fn node_updates(&self) -> Vec<Node> {
        self.lock().node_updates.clone()
    }

    pub fn evictions(&self) -> Vec<(String, String)> {
        self.lock().evictions.clone()
    }

    pub fn pod_lists(&self) -> usize {
        self.lock().pod_lists
    }

    pub fn node_watch_resumes(&self) -> Vec<Option<String>> {
        self.lock().node_watch_resumes.clone()
    }

    pub fn event_watch_resumes(&self) -> Vec<Option<String>> {
        self.lock().event_watch_resumes.clone()
    }
}

fn scripted<K: Send + 'static>(script: Option<Vec<WatchEvent<K>>>) -> WatchStream<K> {
    match script {
        Some(events) => futures::stream::iter(events.into_iter().map(Ok)).boxed(),
        // Nothing scripted: stay subscribed without delivering anything
        None => futures::stream::pending().boxed(),
    }
}

impl MockState {
    fn start_version(&self, resume_from: Option<&str>) -> String {
        resume_from
            .or(self.collection_version.as_deref())
            .unwrap_or("1")
            .to_string()
    }
}

fn watch_unavailable() -> ClusterError {
    ClusterError::Api {
        code: 503,
        message: "watch unavailable".to_string(),
    }
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        let mut state = self.lock();
        state.node_reads.push(name.to_string());
        if state.fail_get_node {
            return Err(ClusterError::NotFound {
                kind: "Node",
                name: name.to_string(),
            });
        }
        state
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "Node",
                name: name.to_string(),
            })
    }

    async fn update_node(&self, node: &Node) -> Result<(), ClusterError> {
        let mut state = self.lock();
        let name = node.metadata.name.clone().unwrap_or_default();
        if state.conflict_on_update {
            return Err(ClusterError::Conflict {
                kind: "Node",
                name,
                message: "the object has been modified".to_string(),
            });
        }
        state.nodes.insert(name, node.clone());
        state.node_updates.push(node.clone());
        Ok(())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, ClusterError> {
        let mut state = self.lock();
        state.pod_lists += 1;
        if let Some(limit) = state.fail_pod_list_after {
            if state.pod_lists > limit {
                return Err(ClusterError::Api {
                    code: 500,
                    message: "etcdserver: request timed out".to_string(),
                });
            }
        }
        if let Some(lists) = state.evacuate_after_lists {
            if state.pod_lists > lists {
                state.pods.retain(has_daemon_set_owner);
            }
        }
        Ok(state
            .pods
            .iter()
            .filter(|p| p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name))
            .cloned()
            .collect())
    }

    async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>, ClusterError> {
        let state = self.lock();
        if state.fail_list_daemon_sets {
            return Err(ClusterError::Api {
                code: 403,
                message: "daemonsets.apps is forbidden".to_string(),
            });
        }
        Ok(state.daemon_sets.clone())
    }

    async fn evict(&self, namespace: &str, pod_name: &str) -> Result<(), ClusterError> {
        let mut state = self.lock();
        let key = (namespace.to_string(), pod_name.to_string());
        state.evictions.push(key.clone());
        if state.eviction_failures.contains(&key) {
            return Err(ClusterError::Api {
                code: 429,
                message: "Cannot evict pod as it would violate the pod's disruption budget."
                    .to_string(),
            });
        }
        if state.evict_removes_pods {
            state.pods.retain(|p| {
                p.metadata.namespace.as_deref() != Some(namespace)
                    || p.metadata.name.as_deref() != Some(pod_name)
            });
        }
        Ok(())
    }

    async fn watch_nodes(
        &self,
        resume_from: Option<&str>,
    ) -> Result<WatchSubscription<Node>, ClusterError> {
        let mut state = self.lock();
        state.node_watch_resumes.push(resume_from.map(String::from));
        if state.fail_watch_subscribe {
            return Err(watch_unavailable());
        }
        Ok(WatchSubscription {
            resource_version: state.start_version(resume_from),
            stream: scripted(state.node_watches.pop_front()),
        })
    }

    async fn watch_events(
        &self,
        resume_from: Option<&str>,
    ) -> Result<WatchSubscription<Event>, ClusterError> {
        let mut state = self.lock();
        state.event_watch_resumes.push(resume_from.map(String::from));
        if state.fail_watch_subscribe {
            return Err(watch_unavailable());
        }
        Ok(WatchSubscription {
            resource_version: state.start_version(resume_from),
            stream: scripted(state.event_watches.pop_front()),
        })
    }
}

fn has_daemon_set_owner(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|o| o.kind == "DaemonSet"))
}

/// Node with an optional Ready condition status ("True", "False", "Unknown")
pub fn node(name: &str, ready: Option<&str>, unschedulable: bool) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            unschedulable: unschedulable.then_some(true),
            ..Default::default()
        }),
        status: Some(NodeStatus {
            conditions: ready.map(|status| {
                vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }),
    }
}

pub fn with_resource_version(mut node: Node, resource_version: &str) -> Node {
    node.metadata.resource_version = Some(resource_version.to_string());
    node
}

/// Pod scheduled on `node_name`, owned by a ReplicaSet
pub fn pod(namespace: &str, name: &str, node_name: &str) -> Pod {
    owned_pod(namespace, name, node_name, "ReplicaSet", &format!("{name}-rs"))
}

pub fn daemon_set_pod(namespace: &str, name: &str, node_name: &str, daemon_set: &str) -> Pod {
    owned_pod(namespace, name, node_name, "DaemonSet", daemon_set)
}

fn owned_pod(namespace: &str, name: &str, node_name: &str, kind: &str, owner: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            owner_references: Some(vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: kind.to_string(),
                name: owner.to_string(),
                uid: format!("uid-{owner}"),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn daemon_set(namespace: &str, name: &str) -> DaemonSet {
    DaemonSet {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Cluster event about an object of `kind`
pub fn event(kind: &str, name: &str, reason: &str) -> Event {
    Event {
        metadata: ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some(format!("{name}.{reason}")),
            ..Default::default()
        },
        involved_object: ObjectReference {
            kind: Some(kind.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        reason: Some(reason.to_string()),
        ..Default::default()
    }
}
