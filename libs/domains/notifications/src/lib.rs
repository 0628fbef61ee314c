//! Monkey: notification dispatch engine
//!
//! Composes, validates, queues and reliably delivers templated email
//! notifications, optionally enriched with data fetched from a remote API.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │     Caller      │  ← submit / query_status / cancel
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐     ┌─────────────────┐
//! │ NotificationSvc │ ──► │ Enricher + API  │  ← optional, before rendering
//! └────────┬────────┘     └─────────────────┘
//!          │  validate recipients, render once
//! ┌────────▼────────┐
//! │  DispatchQueue  │  ← one task per recipient, FIFO per recipient
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   WorkerPool    │  ← retry with backoff, global send cap
//! └───┬─────────┬───┘
//!     │         │
//! ┌───▼───┐ ┌───▼────────────┐
//! │ Mail  │ │ OutcomeTracker │  ← per-recipient terminal state
//! │ Trans.│ └────────────────┘
//! └───────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use monkey::{NotificationRequest, NotificationService, transport::RecordingTransport};
//! use std::sync::Arc;
//!
//! let service = NotificationService::builder()
//!     .transport(Arc::new(RecordingTransport::new()))
//!     .start()?;
//!
//! let submission = service
//!     .submit(
//!         NotificationRequest::new("notice", ["ada@example.com"])
//!             .with_var("subject", "Maintenance")
//!             .with_var("body", "We will be down at noon."),
//!     )
//!     .await?;
//!
//! let status = service.wait_for_completion(&submission.request_id).await;
//! ```

pub mod config;
pub mod enrichment;
pub mod error;
pub mod models;
pub mod queue;
pub mod recipients;
pub mod retry;
pub mod service;
pub mod templates;
pub mod tracker;
pub mod transport;
pub mod verification;
mod worker;

pub use config::DispatchConfig;
pub use enrichment::{ApiClient, HttpApiClient, HttpApiConfig};
pub use error::{
    ApiError, DispatchError, DispatchResult, EnrichmentError, InvariantViolation, RenderError,
    ValidationError, VerificationError,
};
pub use models::{
    AggregateStatus, CancelOutcome, ContextValue, DeliveryFailure, DeliveryOutcome, DeliveryState,
    EnrichmentDirective, FailureKind, NotificationRequest, OutcomeState, RenderedMessage, RequestId,
    Submission,
};
pub use recipients::{RecipientValidator, RejectedRecipient, RejectionReason};
pub use retry::RetryPolicy;
pub use service::{NotificationService, NotificationServiceBuilder};
pub use templates::{BrandTheme, MessageTemplate, TemplateRegistry};
pub use transport::{MailTransport, SmtpConfig, SmtpTransport, TransportOutcome};
pub use verification::{CodeKind, CodeValidity, CodeVerifier, VerificationOutcome};
pub use worker::WorkerPool;
