//! Scriptable in-memory transport for tests and dry runs.

use super::{MailTransport, TransportOutcome};
use crate::models::RenderedMessage;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// One recorded transport invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub recipient: String,
    pub subject: String,
    pub text_body: String,
    pub outcome: TransportOutcome,
}

/// Transport that records every call and replays scripted outcomes per recipient.
///
/// Recipients without a script are delivered. A script is consumed in order;
/// once exhausted the recipient's fallback applies (see [`RecordingTransport::always`]).
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<SentMessage>>,
    scripts: Mutex<HashMap<String, VecDeque<TransportOutcome>>>,
    fallbacks: HashMap<String, TransportOutcome>,
    panicking: HashSet<String>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outcomes returned for the next calls to `recipient`, in order.
    pub fn with_script(mut self, recipient: &str, outcomes: Vec<TransportOutcome>) -> Self {
        self.scripts
            .get_mut()
            .insert(recipient.to_lowercase(), outcomes.into());
        self
    }

    /// Outcome for every call to `recipient` once its script is used up.
    pub fn always(mut self, recipient: &str, outcome: TransportOutcome) -> Self {
        self.fallbacks.insert(recipient.to_lowercase(), outcome);
        self
    }

    /// Panic when sending to `recipient`.
    pub fn panicking(mut self, recipient: &str) -> Self {
        self.panicking.insert(recipient.to_lowercase());
        self
    }

    /// Simulated time spent inside each send.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// All recorded calls in invocation order.
    pub async fn calls(&self) -> Vec<SentMessage> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// Number of calls made for `recipient`.
    pub async fn calls_to(&self, recipient: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.recipient.eq_ignore_ascii_case(recipient))
            .count()
    }

    /// Highest number of overlapping sends observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Sends currently inside the transport.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn next_outcome(&self, key: &str) -> TransportOutcome {
        let scripted = self
            .scripts
            .lock()
            .await
            .get_mut(key)
            .and_then(VecDeque::pop_front);
        scripted
            .or_else(|| self.fallbacks.get(key).cloned())
            .unwrap_or_else(TransportOutcome::delivered)
    }
}

/// Leaves the in-flight count when the send returns or its future is dropped.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let current = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(current, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, recipient: &str, message: &RenderedMessage) -> TransportOutcome {
        let guard = InFlightGuard::enter(&self.in_flight, &self.peak_in_flight);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let key = recipient.to_lowercase();
        let outcome = self.next_outcome(&key).await;
        self.calls.lock().await.push(SentMessage {
            recipient: recipient.to_string(),
            subject: message.subject.clone(),
            text_body: message.text_body.clone(),
            outcome: outcome.clone(),
        });
        drop(guard);

        if self.panicking.contains(&key) {
            panic!("simulated transport crash for {recipient}");
        }

        outcome
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> RenderedMessage {
        RenderedMessage {
            subject: "Hi".into(),
            text_body: "Body".into(),
            html_body: None,
        }
    }

    #[tokio::test]
    async fn test_unscripted_recipient_is_delivered() {
        let transport = RecordingTransport::new();

        let outcome = transport.send("a@x.io", &message()).await;

        assert_eq!(outcome, TransportOutcome::delivered());
        assert_eq!(transport.call_count().await, 1);
        assert_eq!(transport.calls().await[0].subject, "Hi");
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let transport = RecordingTransport::new()
            .with_script("a@x.io", vec![TransportOutcome::transient("busy")])
            .always("a@x.io", TransportOutcome::permanent("550"));

        assert_eq!(
            transport.send("A@x.io", &message()).await,
            TransportOutcome::transient("busy")
        );
        assert_eq!(
            transport.send("a@x.io", &message()).await,
            TransportOutcome::permanent("550")
        );
        assert_eq!(transport.calls_to("a@x.io").await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_send_leaves_in_flight_count() {
        let transport = RecordingTransport::new().with_latency(Duration::from_secs(1));

        let aborted =
            tokio::time::timeout(Duration::from_millis(10), transport.send("a@x.io", &message()))
                .await;
        assert!(aborted.is_err());
        assert_eq!(transport.in_flight(), 0);
        assert_eq!(transport.call_count().await, 0);

        let m = message();
        tokio::join!(transport.send("b@x.io", &m), transport.send("c@x.io", &m));

        assert_eq!(transport.peak_concurrency(), 2);
        assert_eq!(transport.in_flight(), 0);
    }
}
