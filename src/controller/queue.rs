//! Work queue between the dispatcher and the node actions
//!
//! Triggers are executed with bounded parallelism. Per node they run one at a
//! time and in arrival order. A trigger identical to the last one still waiting
//! for its node, source included, is folded into it. Triggers from different
//! sources are kept apart, and an action that has already started is never
//! used for that comparison, so a drain arriving mid-drain still runs.

use super::dispatcher::Trigger;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::server::ShutdownSignal;

/// Executes one trigger to completion
#[async_trait]
pub trait TriggerHandler: Send + Sync + 'static {
    async fn handle(&self, trigger: Trigger);
}

pub struct WorkQueue {
    receiver: mpsc::Receiver<Trigger>,
    max_concurrent: usize,
    /// Waiting triggers per node, oldest first
    pending: HashMap<String, VecDeque<Trigger>>,
    /// Nodes with pending work and nothing in flight, in the order they became runnable
    ready: VecDeque<String>,
    in_flight: HashSet<String>,
    tasks: JoinSet<String>,
}

impl WorkQueue {
    pub fn new(receiver: mpsc::Receiver<Trigger>, max_concurrent: usize) -> Self {
        Self {
            receiver,
            max_concurrent: max_concurrent.max(1),
            pending: HashMap::new(),
            ready: VecDeque::new(),
            in_flight: HashSet::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Run until shutdown or until the trigger channel closes
    ///
    /// On shutdown in-flight actions are aborted and pending ones dropped.
    /// When the channel closes, everything already queued is still executed.
    pub async fn run(mut self, handler: Arc<dyn TriggerHandler>, mut shutdown: ShutdownSignal) {
        let mut receiving = true;
        info!(max_concurrent = self.max_concurrent, "Work queue started");

        loop {
            self.start_ready(&handler);
            if !receiving && self.tasks.is_empty() {
                info!("Trigger channel closed and all work finished");
                break;
            }

            tokio::select! {
                _ = shutdown.wait() => {
                    let dropped: usize = self.pending.values().map(VecDeque::len).sum();
                    info!(
                        in_flight = self.in_flight.len(),
                        pending = dropped,
                        "Shutting down work queue"
                    );
                    self.tasks.shutdown().await;
                    break;
                }
                received = self.receiver.recv(), if receiving => match received {
                    Some(trigger) => self.enqueue(trigger),
                    None => receiving = false,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.finish(joined);
                }
            }
        }
    }

    fn enqueue(&mut self, trigger: Trigger) {
        let queue = self.pending.entry(trigger.node.clone()).or_default();
        if queue.back().is_some_and(|last| last == &trigger) {
            debug!(
                node = %trigger.node,
                action = %trigger.action,
                source = %trigger.source,
                "Coalesced trigger into pending action"
            );
            return;
        }

        let runnable = queue.is_empty() && !self.in_flight.contains(&trigger.node);
        if runnable {
            self.ready.push_back(trigger.node.clone());
        }
        queue.push_back(trigger);
    }

    fn start_ready(&mut self, handler: &Arc<dyn TriggerHandler>) {
        while self.tasks.len() < self.max_concurrent {
            let Some(node) = self.ready.pop_front() else {
                return;
            };
            let Some(trigger) = self.take_pending(&node) else {
                continue;
            };

            self.in_flight.insert(node.clone());
            let handler = handler.clone();
            self.tasks.spawn(async move {
                if AssertUnwindSafe(handler.handle(trigger))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    error!(node = %node, "Node action panicked");
                }
                node
            });
        }
    }

    fn take_pending(&mut self, node: &str) -> Option<Trigger> {
        let queue = self.pending.get_mut(node)?;
        let trigger = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(node);
        }
        trigger
    }

    fn finish(&mut self, joined: Result<String, JoinError>) {
        match joined {
            Ok(node) => {
                self.in_flight.remove(&node);
                if self.pending.contains_key(&node) {
                    self.ready.push_back(node);
                }
            }
            // Panics are caught inside the task, so this is a cancellation
            Err(e) => warn!(error = %e, "Node action did not complete"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "queue_test.rs"]
mod tests;
