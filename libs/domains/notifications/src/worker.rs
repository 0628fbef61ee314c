//! Delivery worker pool.
//!
//! Each worker pulls a task from the [`DispatchQueue`], owns it through one
//! transport attempt and then either records a terminal outcome or hands it
//! back to the queue with a retry timestamp. Backoff is never slept inside a
//! worker. A task only becomes `InFlight` once it holds a send permit and the
//! queue confirms its request was not cancelled in the meantime.
//!
//! ```text
//!  Pending ──► InFlight ──► Delivered
//!     ▲            │
//!     │            ├──► RetryScheduled ──(backoff elapsed)──► Pending
//!     │            │
//!     └────────────┴──► Abandoned / Failed
//! ```

use crate::models::{DeliveryFailure, DeliveryState, DeliveryTask, FailureKind, OutcomeState};
use crate::queue::{DispatchQueue, Requeue};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::tracker::OutcomeTracker;
use crate::transport::{MailTransport, TransportOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Result of one transport attempt, including engine-side failures.
#[derive(Debug)]
enum Attempt {
    Delivered(Option<String>),
    Transient(String),
    Permanent(String),
    /// The transport panicked or could not be invoked.
    Crashed(String),
}

/// Everything a worker needs to deliver a task.
pub(crate) struct Delivery {
    pub queue: Arc<DispatchQueue>,
    pub tracker: Arc<OutcomeTracker>,
    pub transport: Arc<dyn MailTransport>,
    pub retry: RetryPolicy,
    pub send_permits: Arc<Semaphore>,
    pub send_timeout: Duration,
}

impl Delivery {
    async fn process(&self, worker_id: usize, mut task: DeliveryTask) {
        let permit = self.send_permits.clone().acquire_owned().await;
        let started = self.queue.begin_attempt(&task.request_id).await;

        let permit = match permit {
            Ok(permit) => permit,
            Err(_) => {
                let failure = DeliveryFailure::new(FailureKind::Internal, "send permits closed");
                self.finish(task, OutcomeState::Failed, Some(failure)).await;
                return;
            }
        };
        if !started {
            debug!(
                worker_id,
                request_id = %task.request_id,
                recipient = %task.recipient,
                "Request cancelled before sending"
            );
            drop(permit);
            let failure = DeliveryFailure::new(FailureKind::Cancelled, "request cancelled");
            self.finish(task, OutcomeState::Abandoned, Some(failure)).await;
            return;
        }

        task.state = DeliveryState::InFlight;
        task.attempts += 1;

        debug!(
            worker_id,
            request_id = %task.request_id,
            recipient = %task.recipient,
            attempt = task.attempts,
            "Delivering"
        );

        match self.attempt(&task, permit).await {
            Attempt::Delivered(message_id) => {
                info!(
                    request_id = %task.request_id,
                    recipient = %task.recipient,
                    attempts = task.attempts,
                    message_id = ?message_id,
                    "Delivered"
                );
                self.finish(task, OutcomeState::Delivered, None).await;
            }
            Attempt::Permanent(reason) => {
                warn!(
                    request_id = %task.request_id,
                    recipient = %task.recipient,
                    %reason,
                    "Permanent delivery failure"
                );
                let failure = DeliveryFailure::new(FailureKind::Permanent, reason);
                self.finish(task, OutcomeState::Abandoned, Some(failure)).await;
            }
            Attempt::Crashed(reason) => {
                error!(
                    request_id = %task.request_id,
                    recipient = %task.recipient,
                    %reason,
                    "Transport crashed"
                );
                let failure = DeliveryFailure::new(FailureKind::Internal, reason);
                self.finish(task, OutcomeState::Failed, Some(failure)).await;
            }
            Attempt::Transient(reason) => self.retry_or_abandon(task, reason).await,
        }
    }

    async fn retry_or_abandon(&self, mut task: DeliveryTask, reason: String) {
        let elapsed = task.enqueued_at.elapsed();
        match self.retry.next_delay(task.attempts, elapsed) {
            RetryDecision::GiveUp(why) => {
                warn!(
                    request_id = %task.request_id,
                    recipient = %task.recipient,
                    attempts = task.attempts,
                    %reason,
                    "Giving up: {why}"
                );
                let failure =
                    DeliveryFailure::new(FailureKind::Transient, format!("{why}: {reason}"));
                self.finish(task, OutcomeState::Abandoned, Some(failure)).await;
            }
            RetryDecision::RetryAfter(delay) => {
                debug!(
                    request_id = %task.request_id,
                    recipient = %task.recipient,
                    attempt = task.attempts,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "Scheduling retry"
                );
                task.last_error = Some(DeliveryFailure::new(FailureKind::Transient, reason));
                task.next_attempt_at = Instant::now() + delay;

                match self.queue.reschedule(task).await {
                    Requeue::Scheduled => {}
                    Requeue::Cancelled(task) => {
                        let failure =
                            DeliveryFailure::new(FailureKind::Cancelled, "request cancelled");
                        self.finish(task, OutcomeState::Abandoned, Some(failure)).await;
                    }
                    Requeue::Closed(task) => {
                        let failure =
                            DeliveryFailure::new(FailureKind::Internal, "engine shut down");
                        self.finish(task, OutcomeState::Abandoned, Some(failure)).await;
                    }
                }
            }
        }
    }

    /// One transport invocation holding a send permit, bounded by the send timeout.
    async fn attempt(&self, task: &DeliveryTask, permit: OwnedSemaphorePermit) -> Attempt {
        let transport = Arc::clone(&self.transport);
        let recipient = task.recipient.clone();
        let message = Arc::clone(&task.message);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            transport.send(&recipient, &message).await
        });
        let abort = handle.abort_handle();

        match tokio::time::timeout(self.send_timeout, handle).await {
            Ok(Ok(TransportOutcome::Delivered { message_id })) => Attempt::Delivered(message_id),
            Ok(Ok(TransportOutcome::TransientFailure(reason))) => Attempt::Transient(reason),
            Ok(Ok(TransportOutcome::PermanentFailure(reason))) => Attempt::Permanent(reason),
            Ok(Err(join_error)) => Attempt::Crashed(join_error.to_string()),
            Err(_) => {
                abort.abort();
                Attempt::Transient(format!(
                    "send timed out after {}ms",
                    self.send_timeout.as_millis()
                ))
            }
        }
    }

    /// Record a terminal outcome, then free the recipient's lane.
    async fn finish(
        &self,
        mut task: DeliveryTask,
        state: OutcomeState,
        failure: Option<DeliveryFailure>,
    ) {
        self.record(&mut task, state, failure).await;
        self.queue.release(&task.recipient).await;
    }

    /// Record a terminal outcome for a task that holds no lane.
    pub(crate) async fn record(
        &self,
        task: &mut DeliveryTask,
        state: OutcomeState,
        failure: Option<DeliveryFailure>,
    ) {
        let outcome = task.conclude(state, failure);
        if let Err(violation) = self.tracker.record_outcome(&task.request_id, outcome).await {
            error!(
                request_id = %task.request_id,
                recipient = %task.recipient,
                error = %violation,
                "Invariant violation while recording outcome"
            );
        }

        if self.tracker.query_status(&task.request_id).await.is_terminal() {
            self.queue.forget_cancelled(&task.request_id).await;
        }
    }
}

/// Fixed-size pool of delivery workers.
pub struct WorkerPool {
    workers: JoinSet<()>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub(crate) fn start(delivery: Arc<Delivery>, size: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut workers = JoinSet::new();

        for worker_id in 0..size {
            let delivery = Arc::clone(&delivery);
            let shutdown = shutdown.subscribe();
            workers.spawn(run_worker(worker_id, delivery, shutdown));
        }

        info!(workers = size, "Delivery worker pool started");
        Self { workers, shutdown }
    }

    /// Stop pulling new tasks and wait for in-flight attempts to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Delivery worker terminated abnormally");
            }
        }
        info!("Delivery worker pool stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    delivery: Arc<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "Starting delivery worker");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let task = tokio::select! {
            task = delivery.queue.next_task() => match task {
                Some(task) => task,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };

        delivery.process(worker_id, task).await;
    }

    debug!(worker_id, "Delivery worker stopped");
}
