//! Enrichment of the template context with data from a remote API.

mod http;

pub use http::{HttpApiClient, HttpApiConfig};

use crate::error::{ApiError, EnrichmentError};
use crate::models::EnrichmentDirective;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Context key the fetched fragment is stored under.
pub const ENRICHMENT_KEY: &str = "enrichment";

/// Remote API collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn fetch(&self, directive: &EnrichmentDirective) -> Result<Value, ApiError>;
}

/// Runs enrichment directives against an optional [`ApiClient`] with a timeout.
#[derive(Clone)]
pub struct Enricher {
    client: Option<Arc<dyn ApiClient>>,
    default_timeout: Duration,
}

impl Enricher {
    pub fn new(client: Option<Arc<dyn ApiClient>>, default_timeout: Duration) -> Self {
        Self { client, default_timeout }
    }

    /// Fetch the fragment for `directive`.
    ///
    /// `Ok(None)` means an optional directive failed and the request goes on
    /// without enrichment.
    pub async fn fetch(
        &self,
        directive: &EnrichmentDirective,
    ) -> Result<Option<Value>, EnrichmentError> {
        let result = self.try_fetch(directive).await;
        match result {
            Ok(value) => {
                debug!(source = %directive.source, "Enrichment fetched");
                Ok(Some(value))
            }
            Err(err) if !directive.required => {
                warn!(source = %directive.source, error = %err, "Optional enrichment skipped");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn try_fetch(&self, directive: &EnrichmentDirective) -> Result<Value, EnrichmentError> {
        let client = self.client.as_ref().ok_or(EnrichmentError::NoClient)?;
        let timeout = directive.timeout.unwrap_or(self.default_timeout);

        match tokio::time::timeout(timeout, client.fetch(directive)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(EnrichmentError::Api {
                source_id: directive.source.clone(),
                error,
            }),
            Err(_) => Err(EnrichmentError::Timeout {
                source_id: directive.source.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Insert the fragment under the reserved key.
pub fn merge(context: &mut Map<String, Value>, fragment: Value) {
    context.insert(ENRICHMENT_KEY.to_string(), fragment);
}
