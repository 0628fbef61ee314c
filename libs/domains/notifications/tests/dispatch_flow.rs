//! End-to-end dispatch scenarios against the recording transport.

use monkey::transport::RecordingTransport;
use monkey::{
    AggregateStatus, CancelOutcome, DispatchConfig, DispatchError, FailureKind, MessageTemplate,
    NotificationRequest, NotificationService, OutcomeState, RenderError, RetryPolicy,
    TemplateRegistry, TransportOutcome,
};
use std::sync::Arc;
use std::time::Duration;

fn registry() -> TemplateRegistry {
    let mut registry = TemplateRegistry::with_builtins().unwrap();
    registry
        .register(
            MessageTemplate::new(
                "welcome",
                "Welcome, {{name}}",
                "Hello {{name}}, thanks for joining.",
            )
            .with_html("<p>Hello <b>{{name}}</b></p>"),
        )
        .unwrap();
    registry
}

fn config() -> DispatchConfig {
    DispatchConfig::default().with_retry(
        RetryPolicy::default()
            .with_max_attempts(3)
            .with_backoff(Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(false),
    )
}

fn start(transport: Arc<RecordingTransport>, config: DispatchConfig) -> NotificationService {
    NotificationService::builder()
        .transport(transport)
        .templates(registry())
        .config(config)
        .start()
        .unwrap()
}

fn notice(subject: &str, recipients: &[&str]) -> NotificationRequest {
    NotificationRequest::new("notice", recipients.iter().copied())
        .with_var("subject", subject)
        .with_var("body", "body")
}

mod delivery {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_every_recipient_reaches_terminal_state() {
        let transport = Arc::new(RecordingTransport::new());
        let service = start(Arc::clone(&transport), config());

        let submission = service
            .submit(notice("Hi", &["a@x.io", "b@x.io", "c@x.io"]))
            .await
            .unwrap();

        assert_eq!(submission.accepted.len(), 3);
        assert_eq!(
            service.wait_for_completion(&submission.request_id).await,
            AggregateStatus::Complete
        );
        let outcomes = service.outcomes(&submission.request_id).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.state == OutcomeState::Delivered && o.attempts == 1));
        assert_eq!(transport.call_count().await, 3);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_recipients_are_sent_once() {
        let transport = Arc::new(RecordingTransport::new());
        let service = start(Arc::clone(&transport), config());

        let submission = service
            .submit(notice("Hi", &["a@x.io", "A@X.io", "b@x.io"]))
            .await
            .unwrap();
        service.wait_for_completion(&submission.request_id).await;

        assert_eq!(submission.accepted, vec!["a@x.io", "b@x.io"]);
        assert_eq!(transport.call_count().await, 2);
        assert_eq!(transport.calls_to("a@x.io").await, 1);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_recipients_are_reported_not_sent() {
        let transport = Arc::new(RecordingTransport::new());
        let service = start(Arc::clone(&transport), config());

        let submission = service
            .submit(notice("Hi", &["a@x.io", "not-an-address"]))
            .await
            .unwrap();
        service.wait_for_completion(&submission.request_id).await;

        assert_eq!(submission.rejected.len(), 1);
        assert_eq!(submission.rejected[0].address, "not-an-address");
        assert_eq!(transport.call_count().await, 1);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_send_cap_is_respected() {
        let transport =
            Arc::new(RecordingTransport::new().with_latency(Duration::from_millis(100)));
        let service = start(
            Arc::clone(&transport),
            config().with_workers(8).with_max_concurrent_sends(2),
        );

        let submission = service
            .submit(notice(
                "Hi",
                &["a@x.io", "b@x.io", "c@x.io", "d@x.io", "e@x.io", "f@x.io"],
            ))
            .await
            .unwrap();
        service.wait_for_completion(&submission.request_id).await;

        assert_eq!(transport.call_count().await, 6);
        assert_eq!(transport.peak_concurrency(), 2);
        service.shutdown().await;
    }
}

mod retries {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried_then_delivered() {
        let transport = Arc::new(RecordingTransport::new().with_script(
            "a@x.io",
            vec![
                TransportOutcome::transient("421 try later"),
                TransportOutcome::transient("421 try later"),
            ],
        ));
        let service = start(Arc::clone(&transport), config());

        let submission = service.submit(notice("Hi", &["a@x.io"])).await.unwrap();

        assert_eq!(
            service.wait_for_completion(&submission.request_id).await,
            AggregateStatus::Complete
        );
        let outcomes = service.outcomes(&submission.request_id).await.unwrap();
        assert_eq!(outcomes[0].attempts, 3);
        assert!(outcomes[0].last_error.is_none());
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_transient_failure_is_abandoned_after_max_attempts() {
        let transport = Arc::new(
            RecordingTransport::new().always("a@x.io", TransportOutcome::transient("mailbox busy")),
        );
        let service = start(Arc::clone(&transport), config());

        let submission = service
            .submit(notice("Hi", &["a@x.io", "b@x.io"]))
            .await
            .unwrap();

        assert_eq!(
            service.wait_for_completion(&submission.request_id).await,
            AggregateStatus::PartialFailure
        );
        assert_eq!(transport.calls_to("a@x.io").await, 3);
        let outcomes = service.outcomes(&submission.request_id).await.unwrap();
        let failed = outcomes.iter().find(|o| o.recipient == "a@x.io").unwrap();
        assert_eq!(failed.state, OutcomeState::Abandoned);
        assert_eq!(failed.attempts, 3);
        assert_eq!(failed.last_error.as_ref().unwrap().kind, FailureKind::Transient);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_does_not_block_other_recipients() {
        let transport = Arc::new(
            RecordingTransport::new()
                .always("bad@x.io", TransportOutcome::permanent("550 no such user")),
        );
        let service = start(Arc::clone(&transport), config());

        let submission = service
            .submit(notice("Hi", &["bad@x.io", "good@x.io"]))
            .await
            .unwrap();

        assert_eq!(
            service.wait_for_completion(&submission.request_id).await,
            AggregateStatus::PartialFailure
        );
        assert_eq!(transport.calls_to("bad@x.io").await, 1);
        let outcomes = service.outcomes(&submission.request_id).await.unwrap();
        let bad = outcomes.iter().find(|o| o.recipient == "bad@x.io").unwrap();
        let good = outcomes.iter().find(|o| o.recipient == "good@x.io").unwrap();
        assert_eq!(bad.state, OutcomeState::Abandoned);
        assert_eq!(bad.last_error.as_ref().unwrap().kind, FailureKind::Permanent);
        assert_eq!(good.state, OutcomeState::Delivered);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_crash_is_recorded_as_failed() {
        let transport = Arc::new(RecordingTransport::new().panicking("boom@x.io"));
        let service = start(Arc::clone(&transport), config());

        let submission = service
            .submit(notice("Hi", &["boom@x.io", "ok@x.io"]))
            .await
            .unwrap();

        assert_eq!(
            service.wait_for_completion(&submission.request_id).await,
            AggregateStatus::PartialFailure
        );
        let outcomes = service.outcomes(&submission.request_id).await.unwrap();
        let crashed = outcomes.iter().find(|o| o.recipient == "boom@x.io").unwrap();
        assert_eq!(crashed.state, OutcomeState::Failed);
        assert_eq!(crashed.last_error.as_ref().unwrap().kind, FailureKind::Internal);
        assert_eq!(transport.calls_to("boom@x.io").await, 1);
        service.shutdown().await;
    }
}

mod ordering {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_same_recipient_is_delivered_in_submission_order() {
        let transport = Arc::new(RecordingTransport::new().with_script(
            "a@x.io",
            vec![TransportOutcome::transient("421 try later")],
        ));
        let service = start(Arc::clone(&transport), config().with_workers(4));

        let first = service.submit(notice("first", &["a@x.io"])).await.unwrap();
        let second = service.submit(notice("second", &["A@x.io"])).await.unwrap();
        service.wait_for_completion(&first.request_id).await;
        service.wait_for_completion(&second.request_id).await;

        let subjects: Vec<String> = transport
            .calls()
            .await
            .into_iter()
            .filter(|c| c.recipient.eq_ignore_ascii_case("a@x.io"))
            .map(|c| c.subject)
            .collect();
        assert_eq!(subjects, vec!["first", "first", "second"]);
        service.shutdown().await;
    }
}

mod rendering {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_missing_variable_rejects_whole_request() {
        let transport = Arc::new(RecordingTransport::new());
        let service = start(Arc::clone(&transport), config());

        let err = service
            .submit(NotificationRequest::new("welcome", ["a@x.io", "b@x.io"]).with_id("w-1"))
            .await
            .unwrap_err();

        match err {
            DispatchError::Render(RenderError::MissingVariable { template, variable }) => {
                assert_eq!(template, "welcome");
                assert_eq!(variable, "name");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(service.queued_tasks().await, 0);
        assert_eq!(
            service.query_status(&"w-1".into()).await,
            AggregateStatus::Unknown
        );
        service.shutdown().await;
        assert_eq!(transport.call_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_recipient_gets_the_same_rendering() {
        let transport = Arc::new(RecordingTransport::new());
        let service = start(Arc::clone(&transport), config());

        let submission = service
            .submit(
                NotificationRequest::new("welcome", ["a@x.io", "b@x.io"]).with_var("name", "Ada"),
            )
            .await
            .unwrap();
        service.wait_for_completion(&submission.request_id).await;

        let calls = transport.calls().await;
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.subject == "Welcome, Ada"));
        assert!(calls.iter().all(|c| c.text_body == "Hello Ada, thanks for joining."));
        service.shutdown().await;
    }
}

mod lifecycle {
    use super::*;

    /// One worker, slow sends: the first request occupies the worker while
    /// later requests wait in the queue.
    async fn occupy_worker(service: &NotificationService) {
        service.submit(notice("blocker", &["slow@x.io"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_dispatch_sends_nothing() {
        let transport = Arc::new(RecordingTransport::new().with_latency(Duration::from_secs(1)));
        let service = start(Arc::clone(&transport), config().with_workers(1));
        occupy_worker(&service).await;

        let submission = service
            .submit(notice("cancel me", &["c@x.io", "d@x.io"]))
            .await
            .unwrap();
        let outcome = service.cancel(&submission.request_id).await.unwrap();

        assert_eq!(outcome, CancelOutcome::Cancelled);
        assert_eq!(
            service.wait_for_completion(&submission.request_id).await,
            AggregateStatus::PartialFailure
        );
        let outcomes = service.outcomes(&submission.request_id).await.unwrap();
        assert!(outcomes.iter().all(|o| o.state == OutcomeState::Abandoned
            && o.attempts == 0
            && o.last_error.as_ref().unwrap().kind == FailureKind::Cancelled));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.calls_to("c@x.io").await, 0);
        assert_eq!(transport.calls_to("d@x.io").await, 0);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_send_permit() {
        let transport = Arc::new(RecordingTransport::new().with_latency(Duration::from_secs(1)));
        let service = start(
            Arc::clone(&transport),
            config().with_workers(2).with_max_concurrent_sends(1),
        );
        occupy_worker(&service).await;

        // The second worker holds this task but cannot get a permit yet.
        let submission = service.submit(notice("queued", &["c@x.io"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            service.cancel(&submission.request_id).await.unwrap(),
            CancelOutcome::Cancelled
        );
        assert_eq!(
            service.wait_for_completion(&submission.request_id).await,
            AggregateStatus::PartialFailure
        );
        let outcomes = service.outcomes(&submission.request_id).await.unwrap();
        assert_eq!(outcomes[0].state, OutcomeState::Abandoned);
        assert_eq!(outcomes[0].attempts, 0);
        assert_eq!(outcomes[0].last_error.as_ref().unwrap().kind, FailureKind::Cancelled);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.calls_to("c@x.io").await, 0);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_send_stops_retries() {
        let transport = Arc::new(
            RecordingTransport::new()
                .with_latency(Duration::from_secs(1))
                .with_script("a@x.io", vec![TransportOutcome::transient("busy")]),
        );
        let service = start(Arc::clone(&transport), config().with_workers(1));

        let submission = service
            .submit(notice("Hi", &["a@x.io", "b@x.io"]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            service.cancel(&submission.request_id).await.unwrap(),
            CancelOutcome::Cancelled
        );
        assert_eq!(
            service.wait_for_completion(&submission.request_id).await,
            AggregateStatus::PartialFailure
        );

        let outcomes = service.outcomes(&submission.request_id).await.unwrap();
        let a = outcomes.iter().find(|o| o.recipient == "a@x.io").unwrap();
        assert_eq!(a.state, OutcomeState::Abandoned);
        assert_eq!(a.attempts, 1);
        assert_eq!(a.last_error.as_ref().unwrap().kind, FailureKind::Cancelled);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.calls_to("a@x.io").await, 1);
        assert_eq!(transport.calls_to("b@x.io").await, 0);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_with_every_task_sending_is_too_late() {
        let transport = Arc::new(RecordingTransport::new().with_latency(Duration::from_secs(1)));
        let service = start(Arc::clone(&transport), config().with_workers(1));

        let submission = service.submit(notice("Hi", &["a@x.io"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            service.cancel(&submission.request_id).await.unwrap(),
            CancelOutcome::TooLateToCancel
        );
        assert_eq!(
            service.wait_for_completion(&submission.request_id).await,
            AggregateStatus::Complete
        );
        assert_eq!(transport.calls_to("a@x.io").await, 1);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_completion_is_too_late() {
        let transport = Arc::new(RecordingTransport::new());
        let service = start(Arc::clone(&transport), config());

        let submission = service.submit(notice("Hi", &["a@x.io"])).await.unwrap();
        service.wait_for_completion(&submission.request_id).await;

        assert_eq!(
            service.cancel(&submission.request_id).await.unwrap(),
            CancelOutcome::TooLateToCancel
        );
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_queued_tasks() {
        let transport = Arc::new(RecordingTransport::new().with_latency(Duration::from_secs(1)));
        let service = start(Arc::clone(&transport), config().with_workers(1));
        occupy_worker(&service).await;

        let submission = service
            .submit(notice("late", &["c@x.io", "d@x.io"]))
            .await
            .unwrap();
        service.shutdown().await;

        assert_eq!(transport.calls_to("slow@x.io").await, 1);
        assert_eq!(transport.calls_to("c@x.io").await, 0);
        assert_eq!(
            service.query_status(&submission.request_id).await,
            AggregateStatus::PartialFailure
        );
        let outcomes = service.outcomes(&submission.request_id).await.unwrap();
        assert!(outcomes.iter().all(|o| o.state == OutcomeState::Abandoned
            && o.last_error.as_ref().unwrap().kind == FailureKind::Internal));

        let err = service.submit(notice("after", &["e@x.io"])).await.unwrap_err();
        assert!(matches!(err, DispatchError::ShutDown));
    }
}
