//! Monkey Notify
//!
//! Sends a single templated notification from the command line using the
//! SMTP settings from the environment, then waits for every recipient to
//! reach a terminal state. Exits non-zero unless all deliveries succeeded.

use clap::Parser;
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{env_parse_opt, Environment, FromEnv};
use eyre::{eyre, Result, WrapErr};
use monkey::transport::RecordingTransport;
use monkey::{
    AggregateStatus, BrandTheme, DispatchConfig, EnrichmentDirective, HttpApiClient, HttpApiConfig,
    MailTransport, NotificationRequest, NotificationService, SmtpConfig, SmtpTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "monkey-notify")]
#[command(about = "Send a templated email notification and wait for delivery")]
pub struct Cli {
    /// Template to render
    #[arg(short, long, default_value = "notice")]
    pub template: String,

    /// Recipient address (repeatable)
    #[arg(long = "to", required = true)]
    pub recipients: Vec<String>,

    /// Template variable as key=value (repeatable)
    #[arg(short, long = "var", value_parser = parse_key_val)]
    pub vars: Vec<(String, String)>,

    /// Enrichment source fetched from MONKEY_API_BASE_URL
    #[arg(short, long)]
    pub enrich: Option<String>,

    /// Enrichment query parameter as key=value (repeatable)
    #[arg(short, long = "param", value_parser = parse_key_val)]
    pub params: Vec<(String, String)>,

    /// Fail the request if enrichment fails
    #[arg(long)]
    pub required: bool,

    /// Fill in the default brand theme variables
    #[arg(long)]
    pub themed: bool,

    /// Seconds to wait for delivery before giving up
    #[arg(short, long, default_value_t = 120)]
    pub wait_secs: u64,

    /// Record messages instead of sending them
    #[arg(long)]
    pub dry_run: bool,
}

impl Cli {
    pub fn request(&self) -> NotificationRequest {
        let mut request = NotificationRequest::new(&self.template, self.recipients.iter());
        for (key, value) in &self.vars {
            request = request.with_var(key, value.as_str());
        }
        if let Some(source) = &self.enrich {
            let mut directive = EnrichmentDirective::new(source);
            for (key, value) in &self.params {
                directive = directive.with_param(key, value);
            }
            if self.required {
                directive = directive.required();
            }
            request = request.with_enrichment(directive);
        }
        if self.themed {
            request = BrandTheme::default().apply(request);
        }
        request
    }
}

/// Parse a `key=value` argument.
pub fn parse_key_val(arg: &str) -> Result<(String, String), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{arg}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in `{arg}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

pub async fn run() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);

    let cli = Cli::parse();
    let config = DispatchConfig::from_env().wrap_err("Invalid dispatch configuration")?;

    let transport: Arc<dyn MailTransport> = if cli.dry_run {
        info!("Dry run: messages are recorded, not sent");
        Arc::new(RecordingTransport::new())
    } else {
        let smtp = SmtpTransport::new(SmtpConfig::from_env()?)?;
        if !smtp.health_check().await {
            warn!("SMTP server did not answer the health check");
        }
        Arc::new(smtp)
    };

    let mut builder = NotificationService::builder()
        .transport(transport)
        .config(config);
    if env_parse_opt::<String>("MONKEY_API_BASE_URL")?.is_some() {
        let api = HttpApiClient::new(HttpApiConfig::from_env()?)?;
        builder = builder.api_client(Arc::new(api));
    }
    let service = builder.start()?;

    let submission = service.submit(cli.request()).await?;
    for rejected in &submission.rejected {
        warn!(address = %rejected.address, reason = ?rejected.reason, "Recipient rejected");
    }
    info!(
        request_id = %submission.request_id,
        recipients = submission.accepted.len(),
        "Submitted"
    );

    let status = match tokio::time::timeout(
        Duration::from_secs(cli.wait_secs),
        service.wait_for_completion(&submission.request_id),
    )
    .await
    {
        Ok(status) => status,
        Err(_) => {
            warn!(wait_secs = cli.wait_secs, "Timed out waiting for delivery");
            service.query_status(&submission.request_id).await
        }
    };

    service.shutdown().await;

    if let Some(outcomes) = service.outcomes(&submission.request_id).await {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    }

    match status {
        AggregateStatus::Complete => {
            info!(request_id = %submission.request_id, "All notifications delivered");
            Ok(())
        }
        other => Err(eyre!(
            "request {} finished as {:?}",
            submission.request_id,
            other
        )),
    }
}
