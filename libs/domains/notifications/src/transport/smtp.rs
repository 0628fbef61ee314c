//! SMTP transport using lettre.

use super::{MailTransport, TransportOutcome};
use crate::models::RenderedMessage;
use async_trait::async_trait;
use core_config::{env_flag, env_or_default, env_parse, ConfigError, FromEnv};
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Well-known SMTP port, used when `SMTP_PORT` is unset.
pub const DEFAULT_SMTP_PORT: u16 = 25;

/// SMTP configuration.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Sender email address.
    pub from_email: String,
    /// Sender display name.
    pub from_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Use an implicit-TLS relay instead of a plain connection.
    pub use_tls: bool,
}

impl SmtpConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        from_email: impl Into<String>,
        from_name: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            from_email: from_email.into(),
            from_name: from_name.into(),
            username: None,
            password: None,
            use_tls: false,
        }
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    fn sender(&self) -> Result<Mailbox, String> {
        let raw = if self.from_name.is_empty() {
            self.from_email.clone()
        } else {
            format!("{} <{}>", self.from_name, self.from_email)
        };
        raw.parse().map_err(|e| format!("Invalid from address: {e}"))
    }
}

impl FromEnv for SmtpConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or_default("SMTP_HOST", "localhost"),
            port: env_parse("SMTP_PORT", DEFAULT_SMTP_PORT)?,
            from_email: env_or_default("SMTP_FROM_EMAIL", "noreply@localhost"),
            from_name: env_or_default("SMTP_FROM_NAME", "Monkey"),
            username: std::env::var("SMTP_USERNAME").ok(),
            password: std::env::var("SMTP_PASSWORD").ok(),
            use_tls: env_flag("SMTP_USE_TLS", false),
        })
    }
}

/// Mail transport backed by an async lettre SMTP connection pool.
pub struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    config: Arc<SmtpConfig>,
}

impl SmtpTransport {
    pub fn new(config: SmtpConfig) -> Result<Self, ConfigError> {
        let transport = Self::build_transport(&config)?;
        Ok(Self {
            transport,
            config: Arc::new(config),
        })
    }

    fn build_transport(
        config: &SmtpConfig,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, ConfigError> {
        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host).map_err(|e| {
                ConfigError::ParseError {
                    key: "SMTP_HOST".to_string(),
                    details: e.to_string(),
                }
            })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        }
        .port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder.build())
    }

    fn build_message(&self, recipient: &str, message: &RenderedMessage) -> Result<Message, String> {
        let from = self.config.sender()?;
        let to: Mailbox = recipient
            .parse()
            .map_err(|e| format!("Invalid recipient address '{recipient}': {e}"))?;

        let builder = Message::builder().from(from).to(to).subject(&message.subject);

        let built = match &message.html_body {
            Some(html) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(message.text_body.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html.clone()),
                    ),
            ),
            None => builder
                .header(ContentType::TEXT_PLAIN)
                .body(message.text_body.clone()),
        };

        built.map_err(|e| format!("Failed to build message: {e}"))
    }

    /// Open and close a connection to the server.
    pub async fn health_check(&self) -> bool {
        self.transport.test_connection().await.unwrap_or(false)
    }
}

/// Map a lettre SMTP error onto the retry taxonomy. Only 5xx replies are permanent.
fn classify(err: &lettre::transport::smtp::Error) -> TransportOutcome {
    if err.is_permanent() {
        TransportOutcome::permanent(err.to_string())
    } else {
        TransportOutcome::transient(err.to_string())
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(&self, recipient: &str, message: &RenderedMessage) -> TransportOutcome {
        debug!(
            to = %recipient,
            subject = %message.subject,
            host = %self.config.host,
            port = %self.config.port,
            "Sending email via SMTP"
        );

        let email = match self.build_message(recipient, message) {
            Ok(email) => email,
            Err(reason) => {
                warn!(to = %recipient, %reason, "Message rejected before sending");
                return TransportOutcome::permanent(reason);
            }
        };

        match self.transport.send(email).await {
            Ok(response) => {
                let message_id = response.message().next().map(str::to_string);
                info!(to = %recipient, message_id = ?message_id, "Email accepted by SMTP server");
                TransportOutcome::Delivered { message_id }
            }
            Err(e) => {
                warn!(
                    to = %recipient,
                    error = %e,
                    permanent = e.is_permanent(),
                    "SMTP send failed"
                );
                classify(&e)
            }
        }
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}
