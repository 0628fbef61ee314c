//! Data models for the dispatch engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

// ============================================================================
// Requests
// ============================================================================

/// Identifier of a submitted notification request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Time-ordered generated id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Scalar value of the template data context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        ContextValue::Text(v.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        ContextValue::Text(v)
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        ContextValue::Integer(v)
    }
}

impl From<i32> for ContextValue {
    fn from(v: i32) -> Self {
        ContextValue::Integer(v.into())
    }
}

impl From<f64> for ContextValue {
    fn from(v: f64) -> Self {
        ContextValue::Float(v)
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        ContextValue::Bool(v)
    }
}

impl From<&ContextValue> for serde_json::Value {
    fn from(v: &ContextValue) -> Self {
        match v {
            ContextValue::Bool(b) => serde_json::Value::Bool(*b),
            ContextValue::Integer(i) => serde_json::Value::from(*i),
            ContextValue::Float(f) => serde_json::Value::from(*f),
            ContextValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// Request to fetch supplementary context from the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentDirective {
    /// Remote resource identifier.
    pub source: String,
    /// Query parameters passed to the remote API.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// A required directive fails the submission when the fetch fails.
    #[serde(default)]
    pub required: bool,
    /// Overrides the engine's default enrichment timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl EnrichmentDirective {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            params: BTreeMap::new(),
            required: false,
            timeout: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A notification to render and deliver to a list of recipients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Caller-supplied id; generated on submit when absent.
    pub id: Option<RequestId>,
    /// Registered template name.
    pub template: String,
    /// Variables available to the template.
    #[serde(default)]
    pub context: BTreeMap<String, ContextValue>,
    /// Raw recipient addresses, validated on submit.
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<EnrichmentDirective>,
}

impl NotificationRequest {
    pub fn new<I, S>(template: impl Into<String>, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: None,
            template: template.into(),
            context: BTreeMap::new(),
            recipients: recipients.into_iter().map(Into::into).collect(),
            enrichment: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_enrichment(mut self, directive: EnrichmentDirective) -> Self {
        self.enrichment = Some(directive);
        self
    }
}

/// Rendered content, computed once per request and shared by all its tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub subject: String,
    pub text_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_body: Option<String>,
}

/// Result of a successful `submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub request_id: RequestId,
    /// Normalized recipients that got a delivery task, in input order.
    pub accepted: Vec<String>,
    /// Recipients dropped by validation.
    pub rejected: Vec<crate::recipients::RejectedRecipient>,
}

// ============================================================================
// Delivery
// ============================================================================

/// Lifecycle of a delivery task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InFlight,
    RetryScheduled,
    Delivered,
    Failed,
    Abandoned,
}

/// One (request, recipient) pair moving through the queue and the workers.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    pub request_id: RequestId,
    pub recipient: String,
    pub message: Arc<RenderedMessage>,
    /// Transport invocations so far. Never decreases.
    pub attempts: u32,
    /// Earliest instant the task may be handed to a worker.
    pub next_attempt_at: Instant,
    /// When the task entered the queue; the retry budget counts from here.
    pub enqueued_at: Instant,
    /// Queue admission order, used for FIFO among eligible tasks.
    pub seq: u64,
    pub state: DeliveryState,
    pub last_error: Option<DeliveryFailure>,
}

impl DeliveryTask {
    pub fn new(request_id: RequestId, recipient: String, message: Arc<RenderedMessage>) -> Self {
        let now = Instant::now();
        Self {
            request_id,
            recipient,
            message,
            attempts: 0,
            next_attempt_at: now,
            enqueued_at: now,
            seq: 0,
            state: DeliveryState::Pending,
            last_error: None,
        }
    }

    /// Move the task into a terminal state and build its outcome.
    pub fn conclude(
        &mut self,
        state: OutcomeState,
        failure: Option<DeliveryFailure>,
    ) -> DeliveryOutcome {
        self.state = state.into();
        self.last_error = failure;
        DeliveryOutcome {
            recipient: self.recipient.clone(),
            state,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            completed_at: Utc::now(),
        }
    }
}

/// Terminal state stored by the outcome tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeState {
    Delivered,
    Failed,
    Abandoned,
}

impl From<OutcomeState> for DeliveryState {
    fn from(state: OutcomeState) -> Self {
        match state {
            OutcomeState::Delivered => DeliveryState::Delivered,
            OutcomeState::Failed => DeliveryState::Failed,
            OutcomeState::Abandoned => DeliveryState::Abandoned,
        }
    }
}

/// Classification of the last delivery error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retryable transport error, retries exhausted.
    Transient,
    /// Rejected by the mail server, never retried.
    Permanent,
    /// Request cancelled before delivery.
    Cancelled,
    /// Transport crashed or the engine shut down.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl DeliveryFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Final per-recipient record. Append-only, keyed by (request id, recipient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub recipient: String,
    pub state: OutcomeState,
    pub attempts: u32,
    pub last_error: Option<DeliveryFailure>,
    pub completed_at: DateTime<Utc>,
}

/// Aggregate status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    /// Every recipient delivered.
    Complete,
    /// Every recipient terminal, at least one not delivered.
    PartialFailure,
    /// Some recipient not yet terminal.
    InProgress,
    /// No such request.
    Unknown,
}

impl AggregateStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AggregateStatus::Complete | AggregateStatus::PartialFailure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    TooLateToCancel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = NotificationRequest::new("welcome", ["a@x.io", "b@x.io"])
            .with_id("req-1")
            .with_var("name", "Ada")
            .with_var("count", 3)
            .with_enrichment(EnrichmentDirective::new("profile").with_param("user", "42"));

        assert_eq!(request.id, Some(RequestId::new("req-1")));
        assert_eq!(request.recipients.len(), 2);
        assert_eq!(request.context["count"], ContextValue::Integer(3));
        let directive = request.enrichment.unwrap();
        assert!(!directive.required);
        assert_eq!(directive.params["user"], "42");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(RequestId::generate(), RequestId::generate());
    }

    #[test]
    fn test_context_value_deserializes_untagged() {
        let ctx: BTreeMap<String, ContextValue> =
            serde_json::from_str(r#"{"a":"x","b":2,"c":1.5,"d":true}"#).unwrap();
        assert_eq!(ctx["a"], ContextValue::Text("x".into()));
        assert_eq!(ctx["b"], ContextValue::Integer(2));
        assert_eq!(ctx["c"], ContextValue::Float(1.5));
        assert_eq!(ctx["d"], ContextValue::Bool(true));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!AggregateStatus::InProgress.is_terminal());
        assert!(AggregateStatus::PartialFailure.is_terminal());
    }

    #[test]
    fn test_conclude_replaces_retry_error() {
        let message = Arc::new(RenderedMessage {
            subject: "s".into(),
            text_body: "b".into(),
            html_body: None,
        });
        let mut task = DeliveryTask::new(RequestId::new("r1"), "a@x.io".into(), message);
        task.attempts = 2;
        task.state = DeliveryState::RetryScheduled;
        task.last_error = Some(DeliveryFailure::new(FailureKind::Transient, "421"));

        let outcome = task.conclude(OutcomeState::Delivered, None);

        assert_eq!(task.state, DeliveryState::Delivered);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.last_error.is_none());
    }
}
