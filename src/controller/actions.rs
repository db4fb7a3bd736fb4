use super::context::Context;
use super::dispatcher::{NodeAction, Trigger};
use super::drain::{drain_node, outcome_label};
use super::queue::TriggerHandler;
use super::recovery::uncordon_node;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Runs drains and uncordons for the work queue
///
/// Failures end here: they are logged and counted, and the next trigger for
/// the node runs the operation again.
pub struct NodeActions {
    ctx: Arc<Context>,
}

impl NodeActions {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn drain(&self, trigger: &Trigger) {
        let start = Instant::now();
        let outcome = drain_node(&self.ctx, &trigger.node).await;

        if let Some(ref metrics) = self.ctx.metrics {
            metrics.record_drain(outcome_label(&outcome), start.elapsed().as_secs_f64());
        }

        match outcome {
            Ok(report) => info!(
                node = %trigger.node,
                source = %trigger.source,
                evicted = report.evicted.len(),
                elapsed = ?report.elapsed,
                "Drain completed"
            ),
            Err(e) => warn!(
                node = %trigger.node,
                source = %trigger.source,
                outcome = e.outcome(),
                error = %e,
                "Drain failed"
            ),
        }
    }

    async fn uncordon(&self, trigger: &Trigger) {
        let result = uncordon_node(&self.ctx, &trigger.node).await;

        if let Some(ref metrics) = self.ctx.metrics {
            let label = match &result {
                Ok(outcome) => outcome.as_str(),
                Err(_) => "error",
            };
            metrics.record_uncordon(label);
        }

        if let Err(e) = result {
            warn!(node = %trigger.node, error = %e, "Uncordon failed");
        }
    }
}

#[async_trait]
impl TriggerHandler for NodeActions {
    async fn handle(&self, trigger: Trigger) {
        match trigger.action {
            NodeAction::Drain => self.drain(&trigger).await,
            NodeAction::Uncordon => self.uncordon(&trigger).await,
        }
    }
}
