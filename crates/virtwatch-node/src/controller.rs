//! Worker pool pulling node keys from the queue
//!
//! Each worker takes one key, runs a full cycle for it and reports the result
//! back to the queue before taking the next one. The queue guarantees a key is
//! held by one worker at a time, so mutations for a node are serialized while
//! distinct nodes are processed in parallel.

use std::sync::Arc;

use futures::future::join_all;
use kube::runtime::events::EventType;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use virtwatch_common::events::{actions, node_reference, reasons, EventPublisher};
use virtwatch_common::metrics::ReconcileTimer;

use crate::config::DEFAULT_FAILURE_EVENT_THRESHOLD;
use crate::queue::WorkQueue;
use crate::reconcile::{reconcile, Context};

/// Drives reconciliation cycles from the work queue
pub struct NodeController {
    ctx: Arc<Context>,
    queue: Arc<dyn WorkQueue>,
    events: Arc<dyn EventPublisher>,
    failure_event_threshold: u32,
}

impl NodeController {
    /// Create a controller over `queue`
    pub fn new(
        ctx: Arc<Context>,
        queue: Arc<dyn WorkQueue>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            ctx,
            queue,
            events,
            failure_event_threshold: DEFAULT_FAILURE_EVENT_THRESHOLD,
        }
    }

    /// Publish a Warning Event when a node key reaches this many failures in a
    /// row. Zero disables the event.
    pub fn with_failure_event_threshold(mut self, threshold: u32) -> Self {
        self.failure_event_threshold = threshold;
        self
    }

    /// Queue the controller consumes
    pub fn queue(&self) -> Arc<dyn WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Process exactly one key.
    ///
    /// Waits for a key, runs a cycle for it and reports done or failed to the
    /// queue. Returns `false` once the queue is shut down.
    pub async fn execute(&self) -> bool {
        match self.queue.dequeue().await {
            Some(key) => {
                self.process(&key).await;
                true
            }
            None => false,
        }
    }

    /// Run `workers` workers until `shutdown` is cancelled.
    ///
    /// Cancellation stops workers from taking new keys; cycles already running
    /// complete before this returns.
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: CancellationToken) {
        let workers = workers.max(1);
        info!(workers, "starting node controller workers");

        let stopper = {
            let queue = self.queue();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                queue.shut_down();
            })
        };

        let handles = (0..workers).map(|id| {
            let this = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { this.worker(id, shutdown).await })
        });

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "node controller worker panicked");
            }
        }
        // Workers only exit on cancellation or queue shutdown
        stopper.abort();
        self.queue.shut_down();
        info!("node controller stopped");
    }

    async fn worker(&self, id: usize, shutdown: CancellationToken) {
        debug!(worker = id, "worker started");
        loop {
            let key = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                key = self.queue.dequeue() => key,
            };
            let Some(key) = key else {
                break;
            };
            self.process(&key).await;
        }
        debug!(worker = id, "worker stopped");
    }

    async fn process(&self, key: &str) {
        let timer = ReconcileTimer::start();
        let result = reconcile(key, &self.ctx)
            .await
            .and_then(|outcome| outcome.into_result());

        match result {
            Ok(()) => {
                timer.success();
                self.queue.mark_done(key);
                debug!(node = %key, "node reconciled");
            }
            Err(e) => {
                timer.error(e.kind());
                self.queue.mark_failed_and_retry(key);
                let failures = self.queue.num_requeues(key);
                warn!(node = %key, error = %e, failures, "node reconciliation failed, retrying");

                // Published once per failure streak; later retries only log
                if self.failure_event_threshold > 0 && failures == self.failure_event_threshold {
                    self.events
                        .publish(
                            &node_reference(key),
                            EventType::Warning,
                            reasons::NODE_RECONCILE_FAILING,
                            actions::RECONCILE,
                            Some(format!("{} consecutive failures: {}", failures, e)),
                        )
                        .await;
                }
            }
        }
    }
}
