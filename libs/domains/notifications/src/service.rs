//! Caller-facing dispatch service.

use crate::config::DispatchConfig;
use crate::enrichment::{merge, ApiClient, Enricher, ENRICHMENT_KEY};
use crate::error::{DispatchError, DispatchResult, RenderError, ValidationError};
use crate::models::{
    AggregateStatus, CancelOutcome, DeliveryFailure, DeliveryOutcome, DeliveryState, DeliveryTask,
    FailureKind, NotificationRequest, OutcomeState, RequestId, Submission,
};
use crate::queue::{Cancellation, DispatchQueue};
use crate::recipients::RecipientValidator;
use crate::templates::TemplateRegistry;
use crate::tracker::OutcomeTracker;
use crate::transport::MailTransport;
use crate::worker::{Delivery, WorkerPool};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Builder for [`NotificationService`].
#[derive(Default)]
pub struct NotificationServiceBuilder {
    transport: Option<Arc<dyn MailTransport>>,
    templates: Option<TemplateRegistry>,
    api_client: Option<Arc<dyn ApiClient>>,
    config: DispatchConfig,
}

impl NotificationServiceBuilder {
    pub fn transport(mut self, transport: Arc<dyn MailTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Templates to render from. Defaults to the built-in templates only.
    pub fn templates(mut self, templates: TemplateRegistry) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn api_client(mut self, client: Arc<dyn ApiClient>) -> Self {
        self.api_client = Some(client);
        self
    }

    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the service and spawn its worker pool. Must run inside a tokio runtime.
    pub fn start(self) -> DispatchResult<NotificationService> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| DispatchError::Config("no mail transport configured".to_string()))?;
        let templates = match self.templates {
            Some(templates) => templates,
            None => TemplateRegistry::with_builtins()?,
        };

        let config = self.config;
        let delivery = Arc::new(Delivery {
            queue: Arc::new(DispatchQueue::new(config.queue_capacity)),
            tracker: Arc::new(OutcomeTracker::new(config.outcome_retention)),
            transport: Arc::clone(&transport),
            retry: config.retry.clone(),
            send_permits: Arc::new(Semaphore::new(config.max_concurrent_sends)),
            send_timeout: config.send_timeout,
        });
        let pool = WorkerPool::start(Arc::clone(&delivery), config.workers);

        info!(
            transport = transport.name(),
            workers = config.workers,
            max_concurrent_sends = config.max_concurrent_sends,
            max_attempts = config.retry.max_attempts,
            "Notification service started"
        );

        Ok(NotificationService {
            templates: Arc::new(templates),
            validator: RecipientValidator::new().with_denied_domains(&config.denied_domains),
            enricher: Enricher::new(self.api_client, config.enrichment_timeout),
            delivery,
            admission: Mutex::new(()),
            pool: Mutex::new(Some(pool)),
            config,
        })
    }
}

/// Dispatch engine: validates, renders, queues and tracks notifications.
pub struct NotificationService {
    templates: Arc<TemplateRegistry>,
    validator: RecipientValidator,
    enricher: Enricher,
    delivery: Arc<Delivery>,
    /// Held while a request is registered and queued, and while cancelling.
    admission: Mutex<()>,
    pool: Mutex<Option<WorkerPool>>,
    config: DispatchConfig,
}

impl NotificationService {
    pub fn builder() -> NotificationServiceBuilder {
        NotificationServiceBuilder::default()
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Validate, enrich, render and enqueue a request.
    ///
    /// Either one delivery task per accepted recipient enters the queue, or
    /// the call fails and nothing does.
    pub async fn submit(&self, request: NotificationRequest) -> DispatchResult<Submission> {
        let NotificationRequest {
            id,
            template,
            context,
            recipients,
            enrichment,
        } = request;

        let request_id = id.unwrap_or_else(RequestId::generate);
        if request_id.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyRequestId.into());
        }
        if template.trim().is_empty() {
            return Err(ValidationError::EmptyTemplate.into());
        }
        if context.contains_key(ENRICHMENT_KEY) {
            return Err(ValidationError::ReservedContextKey(ENRICHMENT_KEY.to_string()).into());
        }
        if self.delivery.tracker.contains(&request_id).await {
            return Err(ValidationError::DuplicateRequestId(request_id).into());
        }
        if self.delivery.queue.is_closed().await {
            return Err(DispatchError::ShutDown);
        }

        let report = self.validator.validate(&recipients);
        if !report.rejected.is_empty() {
            warn!(
                request_id = %request_id,
                rejected = report.rejected.len(),
                "Dropped invalid recipients"
            );
        }
        if report.valid.is_empty() {
            return Err(ValidationError::NoValidRecipients {
                rejected: report.rejected.len(),
            }
            .into());
        }
        if !self.templates.contains(&template) {
            return Err(RenderError::TemplateNotFound(template).into());
        }

        let mut data: Map<String, Value> = context
            .iter()
            .map(|(key, value)| (key.clone(), Value::from(value)))
            .collect();
        if let Some(directive) = &enrichment {
            if let Some(fragment) = self.enricher.fetch(directive).await? {
                merge(&mut data, fragment);
            }
        }

        let message = Arc::new(self.templates.render(&template, &Value::Object(data))?);
        let tasks = report
            .valid
            .iter()
            .map(|recipient| {
                DeliveryTask::new(request_id.clone(), recipient.clone(), Arc::clone(&message))
            })
            .collect();

        let admission = self.admission.lock().await;
        self.delivery.tracker.register(&request_id, &report.valid).await?;
        if let Err(err) = self.delivery.queue.enqueue_batch(tasks).await {
            self.delivery.tracker.unregister(&request_id).await;
            return Err(err);
        }
        drop(admission);

        info!(
            request_id = %request_id,
            template = %template,
            recipients = report.valid.len(),
            duplicates = report.duplicates,
            "Notification accepted"
        );

        Ok(Submission {
            request_id,
            accepted: report.valid,
            rejected: report.rejected,
        })
    }

    pub async fn query_status(&self, request_id: &RequestId) -> AggregateStatus {
        self.delivery.tracker.query_status(request_id).await
    }

    /// Per-recipient outcomes recorded so far, `None` for unknown requests.
    pub async fn outcomes(&self, request_id: &RequestId) -> Option<Vec<DeliveryOutcome>> {
        self.delivery.tracker.outcomes(request_id).await
    }

    /// Wait until every task of the request is terminal.
    pub async fn wait_for_completion(&self, request_id: &RequestId) -> AggregateStatus {
        self.delivery.tracker.wait_for_terminal(request_id).await
    }

    /// Cancel the tasks of a request that have not reached the transport.
    ///
    /// Queued tasks, and tasks handed to a worker that has not started
    /// sending, become `Abandoned` without touching the transport. Tasks
    /// already in flight finish their attempt but are not retried. A request
    /// that is terminal, or whose remaining tasks have all reached the
    /// transport, is `TooLateToCancel` and left untouched.
    pub async fn cancel(&self, request_id: &RequestId) -> DispatchResult<CancelOutcome> {
        let _admission = self.admission.lock().await;

        match self.query_status(request_id).await {
            AggregateStatus::Unknown => {
                return Err(DispatchError::UnknownRequest(request_id.clone()));
            }
            AggregateStatus::Complete | AggregateStatus::PartialFailure => {
                return Ok(CancelOutcome::TooLateToCancel);
            }
            AggregateStatus::InProgress => {}
        }

        let (removed, not_started) = match self.delivery.queue.cancel(request_id).await {
            Cancellation::Stopped {
                removed,
                not_started,
            } => (removed, not_started),
            Cancellation::AlreadyStarted => {
                debug!(request_id = %request_id, "Every remaining task already in flight");
                return Ok(CancelOutcome::TooLateToCancel);
            }
        };

        let removed_count = removed.len();
        for mut task in removed {
            let reason = match (&task.state, &task.last_error) {
                (DeliveryState::RetryScheduled, Some(previous)) => {
                    format!("request cancelled while waiting to retry: {}", previous.reason)
                }
                _ => "request cancelled".to_string(),
            };
            let failure = DeliveryFailure::new(FailureKind::Cancelled, reason);
            self.delivery
                .record(&mut task, OutcomeState::Abandoned, Some(failure))
                .await;
        }

        info!(
            request_id = %request_id,
            removed = removed_count,
            not_started,
            "Request cancelled"
        );
        Ok(CancelOutcome::Cancelled)
    }

    /// Number of tasks waiting in the queue.
    pub async fn queued_tasks(&self) -> usize {
        self.delivery.queue.len().await
    }

    /// Drop outcome records past the retention window.
    pub async fn purge_expired(&self) -> usize {
        self.delivery.tracker.purge_expired().await
    }

    /// Stop the workers, let in-flight attempts finish and abandon what is still queued.
    pub async fn shutdown(&self) {
        let Some(pool) = self.pool.lock().await.take() else {
            debug!("Notification service already shut down");
            return;
        };
        pool.shutdown().await;

        let drained = self.delivery.queue.drain().await;
        let abandoned = drained.len();
        for mut task in drained {
            let failure = DeliveryFailure::new(FailureKind::Internal, "engine shut down");
            self.delivery
                .record(&mut task, OutcomeState::Abandoned, Some(failure))
                .await;
        }
        info!(abandoned, "Notification service stopped");
    }
}
