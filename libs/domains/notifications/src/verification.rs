//! Verification codes sent by email.
//!
//! A code is generated per `send_code` call, placed in the template context
//! as `verification_code` and remembered for every accepted recipient until it
//! is verified or expires.

use crate::error::{DispatchResult, VerificationError};
use crate::models::{NotificationRequest, Submission};
use crate::queue::lane_key;
use crate::service::NotificationService;
use rand::distr::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// Context key the generated code is exposed under.
pub const CODE_PLACEHOLDER: &str = "verification_code";
/// Number of characters in a generated code.
pub const CODE_LENGTH: usize = 6;

const LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Character set of generated codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodeKind {
    #[default]
    Numeric,
    Alphabetic,
    Alphanumeric,
}

impl CodeKind {
    pub fn generate(self) -> String {
        let mut rng = rand::rng();
        match self {
            CodeKind::Numeric => (0..CODE_LENGTH)
                .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
                .collect(),
            CodeKind::Alphabetic => (0..CODE_LENGTH)
                .map(|_| char::from(LETTERS[rng.random_range(0..LETTERS.len())]))
                .collect(),
            CodeKind::Alphanumeric => (0..CODE_LENGTH)
                .map(|_| char::from(rng.sample(Alphanumeric)))
                .collect(),
        }
    }
}

/// How long an issued code stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodeValidity {
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    #[default]
    Always,
}

impl CodeValidity {
    pub fn duration(self) -> Option<Duration> {
        match self {
            CodeValidity::FiveMinutes => Some(Duration::from_secs(5 * 60)),
            CodeValidity::FifteenMinutes => Some(Duration::from_secs(15 * 60)),
            CodeValidity::ThirtyMinutes => Some(Duration::from_secs(30 * 60)),
            CodeValidity::OneHour => Some(Duration::from_secs(60 * 60)),
            CodeValidity::Always => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified,
    Rejected,
}

#[derive(Debug, Clone)]
struct IssuedCode {
    code: String,
    issued_at: Instant,
}

/// Sends verification codes through a [`NotificationService`] and checks them.
pub struct CodeVerifier {
    service: Arc<NotificationService>,
    kind: CodeKind,
    validity: CodeValidity,
    issued: Mutex<HashMap<String, IssuedCode>>,
}

impl CodeVerifier {
    pub fn new(service: Arc<NotificationService>, kind: CodeKind, validity: CodeValidity) -> Self {
        Self {
            service,
            kind,
            validity,
            issued: Mutex::new(HashMap::new()),
        }
    }

    /// Generate a code, submit `request` with it and remember it for each accepted recipient.
    ///
    /// Fails with `MissingCodePlaceholder` if the template never references
    /// `verification_code`. A newer code replaces an older one for the same address.
    pub async fn send_code(&self, mut request: NotificationRequest) -> DispatchResult<Submission> {
        if self.service.templates().contains(&request.template)
            && !self.service.templates().mentions(&request.template, CODE_PLACEHOLDER)
        {
            return Err(VerificationError::MissingCodePlaceholder(request.template).into());
        }

        let code = self.kind.generate();
        request.context.insert(CODE_PLACEHOLDER.to_string(), code.clone().into());

        let submission = self.service.submit(request).await?;

        let issued_at = Instant::now();
        let mut issued = self.issued.lock().await;
        for address in &submission.accepted {
            issued.insert(
                lane_key(address),
                IssuedCode {
                    code: code.clone(),
                    issued_at,
                },
            );
        }
        info!(
            request_id = %submission.request_id,
            recipients = submission.accepted.len(),
            "Verification code issued"
        );

        Ok(submission)
    }

    /// Check `code` against the one issued to `address`. A match consumes the code.
    pub async fn verify(&self, address: &str, code: &str) -> VerificationOutcome {
        let mut issued = self.issued.lock().await;
        self.purge_expired(&mut issued);

        let key = lane_key(address.trim());
        match issued.get(&key) {
            Some(entry) if entry.code == code.trim() => {
                issued.remove(&key);
                debug!(address = %address, "Verification code accepted");
                VerificationOutcome::Verified
            }
            _ => VerificationOutcome::Rejected,
        }
    }

    /// Number of codes still awaiting verification.
    pub async fn outstanding(&self) -> usize {
        let mut issued = self.issued.lock().await;
        self.purge_expired(&mut issued);
        issued.len()
    }

    fn purge_expired(&self, issued: &mut HashMap<String, IssuedCode>) {
        let Some(validity) = self.validity.duration() else {
            return;
        };
        let now = Instant::now();
        issued.retain(|_, entry| now.duration_since(entry.issued_at) < validity);
    }
}
