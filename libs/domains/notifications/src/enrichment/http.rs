//! HTTP implementation of the remote API collaborator.

use super::ApiClient;
use crate::error::ApiError;
use crate::models::EnrichmentDirective;
use async_trait::async_trait;
use core_config::{env_parse, env_required, ConfigError, FromEnv};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Remote API configuration.
#[derive(Debug, Clone)]
pub struct HttpApiConfig {
    /// Base URL, directive sources are appended as path segments.
    pub base_url: String,
    /// Optional bearer token.
    pub token: Option<String>,
    /// Connect + read timeout of the underlying client.
    pub request_timeout: Duration,
}

impl HttpApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl FromEnv for HttpApiConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: env_required("MONKEY_API_BASE_URL")?,
            token: std::env::var("MONKEY_API_TOKEN").ok().filter(|t| !t.is_empty()),
            request_timeout: Duration::from_secs(env_parse("MONKEY_API_TIMEOUT_SECS", 10u64)?),
        })
    }
}

/// `GET {base_url}/{source}?{params}` returning a JSON document.
#[derive(Clone)]
pub struct HttpApiClient {
    client: Client,
    config: HttpApiConfig,
}

impl HttpApiClient {
    pub fn new(config: HttpApiConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Config(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, source: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            source.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn fetch(&self, directive: &EnrichmentDirective) -> Result<Value, ApiError> {
        let url = self.url(&directive.source);
        debug!(%url, params = directive.params.len(), "Fetching enrichment");

        let mut request = self.client.get(&url).query(&directive.params);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
