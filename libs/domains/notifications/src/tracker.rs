//! Outcome tracker: terminal per-recipient results keyed by request id.

use crate::error::{InvariantViolation, ValidationError};
use crate::models::{AggregateStatus, DeliveryOutcome, OutcomeState, RequestId};
use crate::queue::lane_key;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::debug;

/// What `record_outcome` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// First terminal outcome for the recipient.
    New,
    /// Same terminal state already recorded; nothing changed.
    Duplicate,
}

#[derive(Debug)]
struct RequestRecord {
    /// Accepted recipients in submission order.
    recipients: Vec<String>,
    outcomes: HashMap<String, DeliveryOutcome>,
    completed_at: Option<Instant>,
}

impl RequestRecord {
    fn status(&self) -> AggregateStatus {
        if self.outcomes.len() < self.recipients.len() {
            AggregateStatus::InProgress
        } else if self
            .outcomes
            .values()
            .all(|o| o.state == OutcomeState::Delivered)
        {
            AggregateStatus::Complete
        } else {
            AggregateStatus::PartialFailure
        }
    }
}

#[derive(Debug)]
pub struct OutcomeTracker {
    records: RwLock<HashMap<RequestId, RequestRecord>>,
    changed: Notify,
    retention: Option<Duration>,
}

impl OutcomeTracker {
    /// `retention` bounds how long completed requests stay queryable; `None` keeps them.
    pub fn new(retention: Option<Duration>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            changed: Notify::new(),
            retention,
        }
    }

    /// Start tracking a request and its accepted recipients.
    pub async fn register(
        &self,
        request_id: &RequestId,
        recipients: &[String],
    ) -> Result<(), ValidationError> {
        self.purge_expired().await;

        let mut records = self.records.write().await;
        if records.contains_key(request_id) {
            return Err(ValidationError::DuplicateRequestId(request_id.clone()));
        }
        records.insert(
            request_id.clone(),
            RequestRecord {
                recipients: recipients.to_vec(),
                outcomes: HashMap::with_capacity(recipients.len()),
                completed_at: None,
            },
        );
        Ok(())
    }

    /// Forget a request whose tasks never made it into the queue.
    pub async fn unregister(&self, request_id: &RequestId) {
        self.records.write().await.remove(request_id);
    }

    pub async fn contains(&self, request_id: &RequestId) -> bool {
        self.records.read().await.contains_key(request_id)
    }

    /// Record the terminal outcome of one recipient.
    ///
    /// Recording the same terminal state again is a no-op. A different state
    /// for an already recorded recipient is an invariant violation.
    pub async fn record_outcome(
        &self,
        request_id: &RequestId,
        outcome: DeliveryOutcome,
    ) -> Result<Recorded, InvariantViolation> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(request_id)
            .ok_or_else(|| InvariantViolation::UnknownRequest(request_id.clone()))?;

        let key = lane_key(&outcome.recipient);
        if !record.recipients.iter().any(|r| lane_key(r) == key) {
            return Err(InvariantViolation::UnknownRecipient {
                request_id: request_id.clone(),
                recipient: outcome.recipient,
            });
        }

        if let Some(existing) = record.outcomes.get(&key) {
            return if existing.state == outcome.state {
                Ok(Recorded::Duplicate)
            } else {
                Err(InvariantViolation::ConflictingOutcome {
                    request_id: request_id.clone(),
                    recipient: outcome.recipient,
                    recorded: existing.state,
                    attempted: outcome.state,
                })
            };
        }

        debug!(
            request_id = %request_id,
            recipient = %outcome.recipient,
            state = ?outcome.state,
            attempts = outcome.attempts,
            "Recorded delivery outcome"
        );
        record.outcomes.insert(key, outcome);
        if record.status().is_terminal() {
            record.completed_at = Some(Instant::now());
        }
        drop(records);

        self.changed.notify_waiters();
        Ok(Recorded::New)
    }

    pub async fn query_status(&self, request_id: &RequestId) -> AggregateStatus {
        self.records
            .read()
            .await
            .get(request_id)
            .map_or(AggregateStatus::Unknown, RequestRecord::status)
    }

    /// Recorded outcomes in submission order of the recipients.
    pub async fn outcomes(&self, request_id: &RequestId) -> Option<Vec<DeliveryOutcome>> {
        let records = self.records.read().await;
        let record = records.get(request_id)?;
        Some(
            record
                .recipients
                .iter()
                .filter_map(|r| record.outcomes.get(&lane_key(r)).cloned())
                .collect(),
        )
    }

    /// Wait until the request is terminal, or report `Unknown` if it does not exist.
    pub async fn wait_for_terminal(&self, request_id: &RequestId) -> AggregateStatus {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let status = self.query_status(request_id).await;
            if status != AggregateStatus::InProgress {
                return status;
            }
            notified.await;
        }
    }

    /// Drop completed requests older than the retention window. Returns how many went.
    pub async fn purge_expired(&self) -> usize {
        let Some(retention) = self.retention else {
            return 0;
        };
        let now = Instant::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| {
            record
                .completed_at
                .is_none_or(|done| now.duration_since(done) < retention)
        });
        let purged = before - records.len();
        if purged > 0 {
            debug!(purged, "Purged expired outcome records");
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeliveryFailure, FailureKind};
    use chrono::Utc;

    fn outcome(recipient: &str, state: OutcomeState) -> DeliveryOutcome {
        DeliveryOutcome {
            recipient: recipient.to_string(),
            state,
            attempts: 1,
            last_error: (state != OutcomeState::Delivered)
                .then(|| DeliveryFailure::new(FailureKind::Permanent, "550")),
            completed_at: Utc::now(),
        }
    }

    async fn tracker_with(id: &RequestId, recipients: &[&str]) -> OutcomeTracker {
        let tracker = OutcomeTracker::new(None);
        let recipients: Vec<String> = recipients.iter().map(|r| r.to_string()).collect();
        tracker.register(id, &recipients).await.unwrap();
        tracker
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let id = RequestId::new("r1");
        let tracker = tracker_with(&id, &["a@x", "b@x"]).await;
        assert_eq!(tracker.query_status(&id).await, AggregateStatus::InProgress);

        tracker
            .record_outcome(&id, outcome("a@x", OutcomeState::Delivered))
            .await
            .unwrap();
        assert_eq!(tracker.query_status(&id).await, AggregateStatus::InProgress);

        tracker
            .record_outcome(&id, outcome("b@x", OutcomeState::Delivered))
            .await
            .unwrap();
        assert_eq!(tracker.query_status(&id).await, AggregateStatus::Complete);
    }

    #[tokio::test]
    async fn test_partial_failure() {
        let id = RequestId::new("r1");
        let tracker = tracker_with(&id, &["a@x", "b@x"]).await;
        tracker
            .record_outcome(&id, outcome("a@x", OutcomeState::Delivered))
            .await
            .unwrap();
        tracker
            .record_outcome(&id, outcome("b@x", OutcomeState::Abandoned))
            .await
            .unwrap();

        assert_eq!(tracker.query_status(&id).await, AggregateStatus::PartialFailure);
        let outcomes = tracker.outcomes(&id).await.unwrap();
        assert_eq!(outcomes[0].recipient, "a@x");
        assert_eq!(outcomes[1].state, OutcomeState::Abandoned);
    }

    #[tokio::test]
    async fn test_duplicate_record_is_noop() {
        let id = RequestId::new("r1");
        let tracker = tracker_with(&id, &["a@x"]).await;
        let first = outcome("a@x", OutcomeState::Delivered);

        assert_eq!(tracker.record_outcome(&id, first.clone()).await, Ok(Recorded::New));
        let mut again = first.clone();
        again.attempts = 7;
        assert_eq!(tracker.record_outcome(&id, again).await, Ok(Recorded::Duplicate));

        assert_eq!(tracker.outcomes(&id).await.unwrap(), vec![first]);
        assert_eq!(tracker.query_status(&id).await, AggregateStatus::Complete);
    }

    #[tokio::test]
    async fn test_conflicting_record_is_invariant_violation() {
        let id = RequestId::new("r1");
        let tracker = tracker_with(&id, &["a@x"]).await;
        tracker
            .record_outcome(&id, outcome("a@x", OutcomeState::Delivered))
            .await
            .unwrap();

        let err = tracker
            .record_outcome(&id, outcome("A@X", OutcomeState::Failed))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            InvariantViolation::ConflictingOutcome {
                recorded: OutcomeState::Delivered,
                attempted: OutcomeState::Failed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_request_and_recipient() {
        let id = RequestId::new("r1");
        let tracker = tracker_with(&id, &["a@x"]).await;

        assert_eq!(tracker.query_status(&RequestId::new("nope")).await, AggregateStatus::Unknown);
        assert!(matches!(
            tracker
                .record_outcome(&RequestId::new("nope"), outcome("a@x", OutcomeState::Delivered))
                .await,
            Err(InvariantViolation::UnknownRequest(_))
        ));
        assert!(matches!(
            tracker
                .record_outcome(&id, outcome("z@x", OutcomeState::Delivered))
                .await,
            Err(InvariantViolation::UnknownRecipient { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let id = RequestId::new("r1");
        let tracker = tracker_with(&id, &["a@x"]).await;
        let err = tracker.register(&id, &["b@x".to_string()]).await.unwrap_err();
        assert_eq!(err, ValidationError::DuplicateRequestId(id));
    }

    #[tokio::test]
    async fn test_wait_for_terminal() {
        let id = RequestId::new("r1");
        let tracker = std::sync::Arc::new(tracker_with(&id, &["a@x"]).await);

        let waiter = {
            let tracker = tracker.clone();
            let id = id.clone();
            tokio::spawn(async move { tracker.wait_for_terminal(&id).await })
        };
        tokio::task::yield_now().await;
        tracker
            .record_outcome(&id, outcome("a@x", OutcomeState::Delivered))
            .await
            .unwrap();

        assert_eq!(waiter.await.unwrap(), AggregateStatus::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_purges_completed_requests_only() {
        let tracker = OutcomeTracker::new(Some(Duration::from_secs(60)));
        let done = RequestId::new("done");
        let open = RequestId::new("open");
        tracker.register(&done, &["a@x".to_string()]).await.unwrap();
        tracker.register(&open, &["b@x".to_string()]).await.unwrap();
        tracker
            .record_outcome(&done, outcome("a@x", OutcomeState::Delivered))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(tracker.purge_expired().await, 1);
        assert_eq!(tracker.query_status(&done).await, AggregateStatus::Unknown);
        assert_eq!(tracker.query_status(&open).await, AggregateStatus::InProgress);
    }
}
