//! Resumable watch subscriptions
//!
//! A raw watch ends whenever the API server closes it (timeouts, restarts,
//! compaction). [`ResumableWatch`] hides that: it remembers the last resource
//! version it saw and re-subscribes from there after an exponential backoff,
//! so callers only ever see object changes.

use crate::cluster::{ClusterClient, ClusterError, WatchStream, WatchSubscription};
use crate::server::SharedMetrics;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::{Event, Node};
use kube::api::WatchEvent;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Exponential reconnect delay: doubles per attempt up to `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// One object change delivered by a watch
#[derive(Debug, Clone)]
pub struct Change<K> {
    pub kind: ChangeKind,
    pub object: K,
}

type SubscribeFuture<K> = BoxFuture<'static, Result<WatchSubscription<K>, ClusterError>>;

/// Opens a watch from a resource version (`None` = from now)
pub type Subscribe<K> = Box<dyn Fn(Option<String>) -> SubscribeFuture<K> + Send + Sync>;

pub fn node_subscription(cluster: Arc<dyn ClusterClient>) -> Subscribe<Node> {
    Box::new(move |resume_from| {
        let cluster = cluster.clone();
        async move { cluster.watch_nodes(resume_from.as_deref()).await }.boxed()
    })
}

pub fn event_subscription(cluster: Arc<dyn ClusterClient>) -> Subscribe<Event> {
    Box::new(move |resume_from| {
        let cluster = cluster.clone();
        async move { cluster.watch_events(resume_from.as_deref()).await }.boxed()
    })
}

pub struct ResumableWatch<K> {
    name: &'static str,
    subscribe: Subscribe<K>,
    stream: Option<WatchStream<K>>,
    resource_version: Option<String>,
    backoff: Backoff,
    metrics: Option<SharedMetrics>,
}

impl<K> ResumableWatch<K>
where
    K: Resource + Send + 'static,
{
    /// Open the first subscription
    ///
    /// Unlike later reconnects, a failure here is returned to the caller.
    pub async fn establish(
        name: &'static str,
        subscribe: Subscribe<K>,
        backoff_max: Duration,
        metrics: Option<SharedMetrics>,
    ) -> Result<Self, ClusterError> {
        let subscription = subscribe(None).await?;
        info!(
            stream = name,
            resource_version = %subscription.resource_version,
            "Watch established"
        );
        Ok(Self {
            name,
            subscribe,
            stream: Some(subscription.stream),
            resource_version: Some(subscription.resource_version),
            backoff: Backoff::new(INITIAL_BACKOFF, backoff_max),
            metrics,
        })
    }

    /// Last resource version observed on this watch
    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    /// Wait for the next object change, reconnecting as often as needed
    pub async fn next(&mut self) -> Change<K> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                self.reconnect().await;
                continue;
            };

            let (kind, object) = match stream.next().await {
                Some(Ok(WatchEvent::Added(obj))) => (ChangeKind::Added, obj),
                Some(Ok(WatchEvent::Modified(obj))) => (ChangeKind::Modified, obj),
                Some(Ok(WatchEvent::Deleted(obj))) => (ChangeKind::Deleted, obj),
                Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                    debug!(
                        stream = self.name,
                        resource_version = %bookmark.metadata.resource_version,
                        "Watch bookmark"
                    );
                    self.resource_version = Some(bookmark.metadata.resource_version);
                    self.backoff.reset();
                    continue;
                }
                Some(Ok(WatchEvent::Error(status))) => {
                    if status.code == 410 {
                        info!(
                            stream = self.name,
                            "Resource version expired, resubscribing from current state"
                        );
                        self.resource_version = None;
                    } else {
                        warn!(
                            stream = self.name,
                            code = status.code,
                            message = %status.message,
                            "Watch returned an error status"
                        );
                    }
                    self.stream = None;
                    continue;
                }
                Some(Err(e)) => {
                    warn!(stream = self.name, error = %e, "Watch stream failed");
                    self.stream = None;
                    continue;
                }
                None => {
                    info!(stream = self.name, "Watch stream closed by server");
                    self.stream = None;
                    continue;
                }
            };

            if let Some(rv) = object.resource_version() {
                self.resource_version = Some(rv);
            }
            self.backoff.reset();
            return Change { kind, object };
        }
    }

    async fn reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        if let Some(ref metrics) = self.metrics {
            metrics.record_watch_restart(self.name);
        }
        info!(
            stream = self.name,
            delay = ?delay,
            resume_from = ?self.resource_version,
            "Reconnecting watch"
        );
        tokio::time::sleep(delay).await;

        match (self.subscribe)(self.resource_version.clone()).await {
            Ok(subscription) => {
                self.resource_version = Some(subscription.resource_version);
                self.stream = Some(subscription.stream);
            }
            Err(e) => warn!(stream = self.name, error = %e, "Failed to resubscribe watch"),
        }
    }
}
