//! Error types for the dispatch engine.
//!
//! Only the synchronous failures of `submit` surface as `DispatchError`.
//! Delivery failures never escape the worker pool; they end up as
//! [`DeliveryOutcome`](crate::models::DeliveryOutcome)s in the tracker.

use crate::models::{OutcomeState, RequestId};
use thiserror::Error;

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Malformed request, rejected before any task exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Request id must not be empty")]
    EmptyRequestId,

    #[error("Request id already submitted: {0}")]
    DuplicateRequestId(RequestId),

    #[error("Template reference must not be empty")]
    EmptyTemplate,

    #[error("Context key '{0}' is reserved")]
    ReservedContextKey(String),

    #[error("No valid recipients ({rejected} rejected)")]
    NoValidRecipients { rejected: usize },
}

/// Template lookup or rendering failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template '{template}' references missing variable '{variable}'")]
    MissingVariable { template: String, variable: String },

    #[error("Template '{template}' is invalid: {details}")]
    InvalidTemplate { template: String, details: String },

    #[error("Template '{template}' failed to render: {details}")]
    Render { template: String, details: String },
}

/// Failure of the remote API collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Remote API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Remote API request failed: {0}")]
    Transport(String),

    #[error("Remote API response is not valid JSON: {0}")]
    Decode(String),

    #[error("Remote API is not configured: {0}")]
    Config(String),
}

/// Reason a required enrichment could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnrichmentError {
    #[error("Enrichment '{source_id}' timed out after {timeout_ms}ms")]
    Timeout { source_id: String, timeout_ms: u64 },

    #[error("Enrichment '{source_id}' failed: {error}")]
    Api { source_id: String, error: ApiError },

    #[error("Enrichment requested but no API client is configured")]
    NoClient,
}

/// A broken internal invariant. Fatal to the operation that hit it, never to the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error(
        "Conflicting outcome for {request_id}/{recipient}: recorded {recorded:?}, got {attempted:?}"
    )]
    ConflictingOutcome {
        request_id: RequestId,
        recipient: String,
        recorded: OutcomeState,
        attempted: OutcomeState,
    },

    #[error("Outcome recorded for unknown request {0}")]
    UnknownRequest(RequestId),

    #[error("Outcome recorded for {recipient}, not a recipient of {request_id}")]
    UnknownRecipient {
        request_id: RequestId,
        recipient: String,
    },
}

/// Verification code flow errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("Template '{0}' has no verification_code placeholder")]
    MissingCodePlaceholder(String),
}

/// Errors returned by the caller-facing API.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Enrichment failed: {0}")]
    EnrichmentFailed(#[from] EnrichmentError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error("Unknown request: {0}")]
    UnknownRequest(RequestId),

    #[error("Dispatch queue is full (capacity {capacity}, requested {requested})")]
    QueueFull { capacity: usize, requested: usize },

    #[error("Dispatch engine is shut down")]
    ShutDown,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<core_config::ConfigError> for DispatchError {
    fn from(err: core_config::ConfigError) -> Self {
        DispatchError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}
