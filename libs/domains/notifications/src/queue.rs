//! Dispatch queue with per-recipient FIFO lanes.
//!
//! Every recipient address (case-insensitive) owns a lane. Only the head of a
//! lane is ever handed out, and a lane stays busy while its head is in flight,
//! so two tasks for the same recipient are never delivered out of submission
//! order or concurrently. A task waiting out a retry backoff goes back to the
//! head of its lane with a future `next_attempt_at`, which holds back the
//! tasks queued behind it.
//!
//! Among lane heads that are eligible, the one admitted first (lowest `seq`)
//! is handed out first.
//!
//! A task handed to a worker is *starting* until the worker calls
//! [`DispatchQueue::begin_attempt`]. Cancellation and the start of an attempt
//! are decided under the same lock, so a cancelled request never reaches the
//! transport through a task that had not started yet.

use crate::error::{DispatchError, DispatchResult};
use crate::models::{DeliveryState, DeliveryTask, RequestId};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct Lane {
    tasks: VecDeque<DeliveryTask>,
    busy: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    lanes: HashMap<String, Lane>,
    queued: usize,
    next_seq: u64,
    /// Tasks handed out per request whose transport attempt has not begun.
    starting: HashMap<RequestId, usize>,
    cancelled: HashSet<RequestId>,
    closed: bool,
}

impl QueueState {
    /// Pop the eligible lane head with the lowest sequence number.
    ///
    /// Returns the earliest future eligibility instant when nothing is ready.
    fn take_eligible(&mut self, now: Instant) -> Result<DeliveryTask, Option<Instant>> {
        let mut best: Option<(&String, u64)> = None;
        let mut earliest: Option<Instant> = None;

        for (key, lane) in &self.lanes {
            if lane.busy {
                continue;
            }
            let Some(head) = lane.tasks.front() else {
                continue;
            };
            if head.next_attempt_at <= now {
                if best.is_none_or(|(_, seq)| head.seq < seq) {
                    best = Some((key, head.seq));
                }
            } else if earliest.is_none_or(|e| head.next_attempt_at < e) {
                earliest = Some(head.next_attempt_at);
            }
        }

        let Some(key) = best.map(|(key, _)| key.clone()) else {
            return Err(earliest);
        };
        let lane = self.lanes.get_mut(&key).ok_or(earliest)?;
        let task = lane.tasks.pop_front().ok_or(earliest)?;
        lane.busy = true;
        self.queued -= 1;
        *self.starting.entry(task.request_id.clone()).or_default() += 1;
        Ok(task)
    }

    fn prune(&mut self, key: &str) {
        if self
            .lanes
            .get(key)
            .is_some_and(|lane| !lane.busy && lane.tasks.is_empty())
        {
            self.lanes.remove(key);
        }
    }
}

/// Result of handing a task back for retry.
#[derive(Debug)]
pub enum Requeue {
    Scheduled,
    /// The request was cancelled; the task must not be retried.
    Cancelled(DeliveryTask),
    /// The queue is closed.
    Closed(DeliveryTask),
}

/// Result of cancelling a request in the queue.
#[derive(Debug)]
pub enum Cancellation {
    /// Queued tasks were removed and tasks not yet started will be abandoned.
    Stopped {
        removed: Vec<DeliveryTask>,
        not_started: usize,
    },
    /// Every remaining task already reached the transport; nothing was changed.
    AlreadyStarted,
}

/// Lane key for a recipient address.
pub fn lane_key(recipient: &str) -> String {
    recipient.to_lowercase()
}

/// Shared queue of delivery tasks.
#[derive(Debug)]
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl DispatchQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Admit all tasks of one request, or none of them.
    pub async fn enqueue_batch(&self, tasks: Vec<DeliveryTask>) -> DispatchResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(DispatchError::ShutDown);
        }
        if state.queued + tasks.len() > self.capacity {
            return Err(DispatchError::QueueFull {
                capacity: self.capacity,
                requested: tasks.len(),
            });
        }

        let now = Instant::now();
        let count = tasks.len();
        for mut task in tasks {
            task.seq = state.next_seq;
            state.next_seq += 1;
            task.state = DeliveryState::Pending;
            task.enqueued_at = now;
            task.next_attempt_at = now;
            state
                .lanes
                .entry(lane_key(&task.recipient))
                .or_default()
                .tasks
                .push_back(task);
        }
        state.queued += count;
        drop(state);

        debug!(count, "Enqueued delivery tasks");
        self.notify.notify_waiters();
        Ok(())
    }

    /// Wait for the next eligible task and mark its lane busy.
    ///
    /// Returns `None` once the queue is closed. Cancel-safe: a task is only
    /// removed from its lane when the future completes.
    pub async fn next_task(&self) -> Option<DeliveryTask> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                match state.take_eligible(Instant::now()) {
                    Ok(task) => return Some(task),
                    Err(wake_at) => wake_at,
                }
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Put a task back at the head of its lane to retry at `task.next_attempt_at`.
    ///
    /// Hands the task back when its request was cancelled or the queue is closed.
    pub async fn reschedule(&self, mut task: DeliveryTask) -> Requeue {
        let mut state = self.state.lock().await;
        if state.cancelled.contains(&task.request_id) {
            return Requeue::Cancelled(task);
        }
        if state.closed {
            return Requeue::Closed(task);
        }

        task.state = DeliveryState::RetryScheduled;
        let lane = state.lanes.entry(lane_key(&task.recipient)).or_default();
        lane.busy = false;
        lane.tasks.push_front(task);
        state.queued += 1;
        drop(state);

        self.notify.notify_waiters();
        Requeue::Scheduled
    }

    /// Free the lane of a task that reached a terminal state.
    pub async fn release(&self, recipient: &str) {
        let key = lane_key(recipient);
        let mut state = self.state.lock().await;
        if let Some(lane) = state.lanes.get_mut(&key) {
            lane.busy = false;
        }
        state.prune(&key);
        drop(state);

        self.notify.notify_waiters();
    }

    /// Mark a handed-out task as entering its transport attempt.
    ///
    /// Returns `false` when the request was cancelled first; the task must
    /// then be abandoned without invoking the transport.
    pub async fn begin_attempt(&self, request_id: &RequestId) -> bool {
        let mut state = self.state.lock().await;
        if let Some(count) = state.starting.get_mut(request_id) {
            *count -= 1;
            if *count == 0 {
                state.starting.remove(request_id);
            }
        }
        !state.cancelled.contains(request_id)
    }

    /// Remove every queued task of `request_id` and suppress its future retries.
    ///
    /// When nothing is queued and no handed-out task is still waiting to
    /// start, the request is left untouched.
    pub async fn cancel(&self, request_id: &RequestId) -> Cancellation {
        let mut state = self.state.lock().await;

        let mut removed = Vec::new();
        let mut touched = Vec::new();
        for (key, lane) in state.lanes.iter_mut() {
            let before = lane.tasks.len();
            let (cancelled, kept): (Vec<_>, Vec<_>) = lane
                .tasks
                .drain(..)
                .partition(|t| &t.request_id == request_id);
            lane.tasks = kept.into();
            if lane.tasks.len() != before {
                touched.push(key.clone());
                removed.extend(cancelled);
            }
        }
        let not_started = state.starting.get(request_id).copied().unwrap_or(0);
        if removed.is_empty() && not_started == 0 {
            return Cancellation::AlreadyStarted;
        }

        state.cancelled.insert(request_id.clone());
        state.queued -= removed.len();
        for key in touched {
            state.prune(&key);
        }
        drop(state);

        if !removed.is_empty() {
            self.notify.notify_waiters();
        }
        removed.sort_by_key(|t| t.seq);
        Cancellation::Stopped {
            removed,
            not_started,
        }
    }

    /// Drop the cancellation marker of a request that has fully terminated.
    pub async fn forget_cancelled(&self, request_id: &RequestId) {
        self.state.lock().await.cancelled.remove(request_id);
    }

    /// Close the queue and hand back everything still queued.
    pub async fn drain(&self) -> Vec<DeliveryTask> {
        let mut state = self.state.lock().await;
        state.closed = true;
        let mut drained = Vec::with_capacity(state.queued);
        for lane in state.lanes.values_mut() {
            drained.extend(lane.tasks.drain(..));
        }
        state.queued = 0;
        state.lanes.retain(|_, lane| lane.busy);
        drop(state);

        self.notify.notify_waiters();
        drained.sort_by_key(|t| t.seq);
        drained
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Number of queued tasks, in-flight tasks excluded.
    pub async fn len(&self) -> usize {
        self.state.lock().await.queued
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
