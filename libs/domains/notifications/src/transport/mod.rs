//! Mail transport collaborator.
//!
//! The engine only needs to know whether a send succeeded and, if not,
//! whether retrying can help. Protocol details stay behind this trait.

mod mock;
mod smtp;

pub use mock::{RecordingTransport, SentMessage};
pub use smtp::{SmtpConfig, SmtpTransport};

use crate::models::RenderedMessage;
use async_trait::async_trait;

/// Result of a single transport invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    Delivered { message_id: Option<String> },
    /// Worth retrying: timeouts, temporary rejections, SMTP 4xx.
    TransientFailure(String),
    /// Retrying cannot help: invalid recipient, SMTP 5xx, malformed message.
    PermanentFailure(String),
}

impl TransportOutcome {
    pub fn delivered() -> Self {
        TransportOutcome::Delivered { message_id: None }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        TransportOutcome::TransientFailure(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        TransportOutcome::PermanentFailure(reason.into())
    }
}

/// Sends one rendered message to one recipient.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, recipient: &str, message: &RenderedMessage) -> TransportOutcome;

    /// Transport name for logging.
    fn name(&self) -> &'static str;
}
