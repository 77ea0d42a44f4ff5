//! Single delivery attempt: sign, send, record.
//!
//! [`DeliveryWorker::deliver`] is the only code path that mutates a delivery
//! after creation. Each call applies the lifecycle transition in memory and
//! then stores the attempt row and the delivery row in one atomic write, so
//! a persistence failure leaves neither row changed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hookline_core::{
    AttemptId, AttemptOutcome, Clock, Delivery, DeliveryAttempt, DeliveryId, Subscription,
    Transition,
};
use tracing::{debug, error, info, warn};

use crate::{
    client::{DeliveryClient, DeliveryRequest},
    error::{DeliveryError, ErrorCategory, Result},
    retry::RetryPolicy,
    signing::sign_payload,
    storage::DeliveryStorage,
};

/// What happened during one network attempt.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    /// Audit record of the attempt.
    pub attempt: DeliveryAttempt,

    /// Lifecycle transition, or the persistence error that prevented it.
    pub persisted: Result<Transition>,
}

impl AttemptReport {
    /// Whether the subscriber answered with a 2xx status.
    pub fn succeeded(&self) -> bool {
        self.attempt.success
    }

    /// When the attempt finished.
    pub fn finished_at(&self) -> DateTime<Utc> {
        self.attempt.created_at
    }
}

/// Executes delivery attempts against the record store.
pub struct DeliveryWorker {
    storage: Arc<dyn DeliveryStorage>,
    client: DeliveryClient,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a worker sharing the given store, client and clock.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        client: DeliveryClient,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, client, policy, clock }
    }

    /// Makes one attempt for `delivery` and records it.
    ///
    /// The stored record is re-read first. Returns `Ok(None)` without any
    /// network traffic when it is already terminal or its retry is not yet
    /// due, which happens when a queued snapshot went stale.
    ///
    /// # Errors
    ///
    /// Returns an error only when no network attempt was made: the record
    /// could not be read or the payload could not be signed. Failures after
    /// the request was sent are reported through
    /// [`AttemptReport::persisted`].
    pub async fn deliver(
        &self,
        delivery_id: DeliveryId,
        subscription: &Subscription,
    ) -> Result<Option<AttemptReport>> {
        let Some(delivery) = self.storage.find_delivery(delivery_id).await? else {
            return Err(DeliveryError::persistence(format!("delivery {delivery_id} not found")));
        };

        let now = self.clock.now_utc();
        if delivery.status.is_terminal() {
            debug!(delivery_id = %delivery.id, status = %delivery.status, "skipping terminal delivery");
            return Ok(None);
        }
        if delivery.next_retry_at.is_some_and(|due| due > now) {
            debug!(delivery_id = %delivery.id, "skipping delivery that is not yet due");
            return Ok(None);
        }

        let attempt_number = delivery.next_attempt_number();
        let request = DeliveryRequest {
            delivery_id: delivery.id,
            event_id: delivery.event_id,
            event_type: delivery.event_type.clone(),
            url: subscription.target_url.clone(),
            body: delivery.event_payload.clone(),
            signature: sign_payload(&delivery.event_payload, &subscription.secret)?,
            attempt_number,
        };

        let started = self.clock.now();
        let result = self.client.deliver(request).await;
        let duration_ms = u64::try_from(self.clock.now().duration_since(started).as_millis())
            .unwrap_or(u64::MAX);
        let finished_at = self.clock.now_utc();

        let (outcome, response_status, response_body) = match result {
            Ok(response) if response.is_success() => {
                (AttemptOutcome::Succeeded, response.status_code, response.body)
            },
            Ok(response) => {
                let error = DeliveryError::http_status(response.status_code, response.body.clone());
                (AttemptOutcome::failed(error.to_string()), response.status_code, response.body)
            },
            Err(error) => (AttemptOutcome::failed(error.to_string()), 0, String::new()),
        };

        let attempt = DeliveryAttempt {
            id: AttemptId::new(),
            delivery_id: delivery.id,
            attempt_number,
            request_url: subscription.target_url.clone(),
            response_status,
            response_body,
            success: outcome.is_success(),
            error: match &outcome {
                AttemptOutcome::Succeeded => None,
                AttemptOutcome::Failed { error } => Some(error.clone()),
            },
            duration_ms,
            created_at: finished_at,
        };

        let persisted = self.record(&delivery, &attempt, &outcome, finished_at).await;
        Ok(Some(AttemptReport { attempt, persisted }))
    }

    /// Applies the transition and stores it together with the attempt row.
    async fn record(
        &self,
        delivery: &Delivery,
        attempt: &DeliveryAttempt,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let policy = &self.policy;
        let mut updated = delivery.clone();
        let transition = updated
            .apply_attempt(outcome, policy.max_retries, now, |count| {
                policy.compute_next_retry(count, now)
            })
            .map_err(DeliveryError::from)?;

        if let Err(e) = self.storage.record_attempt(attempt.clone(), updated).await {
            let error = DeliveryError::persistence(format!(
                "failed to record attempt {} for delivery {}: {e}",
                attempt.attempt_number, delivery.id
            ));
            error!(
                delivery_id = %delivery.id,
                attempt = attempt.attempt_number,
                category = %ErrorCategory::from(&error),
                error = %error,
                "attempt not recorded, delivery left unchanged"
            );
            return Err(error);
        }

        match transition {
            Transition::Succeeded => info!(
                delivery_id = %delivery.id,
                subscription_id = %delivery.subscription_id,
                attempt = attempt.attempt_number,
                status_code = attempt.response_status,
                duration_ms = attempt.duration_ms,
                "webhook delivered"
            ),
            Transition::Rescheduled { next_retry_at } => warn!(
                delivery_id = %delivery.id,
                subscription_id = %delivery.subscription_id,
                attempt = attempt.attempt_number,
                status_code = attempt.response_status,
                error = attempt.error.as_deref().unwrap_or_default(),
                next_retry_at = %next_retry_at,
                "delivery attempt failed, retry scheduled"
            ),
            Transition::Exhausted => error!(
                delivery_id = %delivery.id,
                subscription_id = %delivery.subscription_id,
                attempt = attempt.attempt_number,
                status_code = attempt.response_status,
                error = attempt.error.as_deref().unwrap_or_default(),
                "delivery failed permanently, retries exhausted"
            ),
        }

        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use hookline_core::{DeliveryStatus, EventId, TestClock};
    use wiremock::{
        matchers::{header, header_exists, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{client::ClientConfig, signing::verify_signature, storage::memory::InMemoryStorage};

    struct Fixture {
        store: InMemoryStorage,
        clock: TestClock,
        worker: DeliveryWorker,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let store = InMemoryStorage::new();
        let clock = TestClock::at(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let client = DeliveryClient::new(ClientConfig {
            timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        })
        .unwrap();
        let policy = RetryPolicy { max_retries, ..RetryPolicy::default() };
        let worker =
            DeliveryWorker::new(Arc::new(store.clone()), client, policy, Arc::new(clock.clone()));
        Fixture { store, clock, worker }
    }

    async fn seed(fixture: &Fixture, url: &str) -> (Delivery, Subscription) {
        let now = fixture.clock.now_utc();
        let subscription = Subscription::new(url, "whsec_test", ["order.*"], now);
        let delivery = Delivery::new(
            subscription.id,
            EventId::new(),
            "order.created",
            r#"{"order":1}"#,
            now,
        );
        fixture.store.create_delivery(delivery.clone()).await.unwrap();
        (delivery, subscription)
    }

    #[tokio::test]
    async fn successful_attempt_signs_and_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("X-Webhook-Event", "order.created"))
            .and(header("X-Webhook-Attempt", "1"))
            .and(header_exists("X-Webhook-Signature"))
            .respond_with(ResponseTemplate::new(200).set_body_string("thanks"))
            .expect(1)
            .mount(&server)
            .await;

        let fixture = fixture(3);
        let (delivery, subscription) = seed(&fixture, &format!("{}/hook", server.uri())).await;

        let report = fixture.worker.deliver(delivery.id, &subscription).await.unwrap().unwrap();

        assert!(report.succeeded());
        assert_eq!(report.persisted.unwrap(), Transition::Succeeded);
        assert_eq!(report.attempt.response_body, "thanks");

        let stored = fixture.store.find_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Success);
        assert_eq!(stored.attempt_count, 1);

        let requests = server.received_requests().await.unwrap();
        let signature = requests[0].headers.get("X-Webhook-Signature").unwrap().to_str().unwrap();
        assert!(verify_signature(&requests[0].body, "whsec_test", signature));
        assert_eq!(requests[0].body, br#"{"order":1}"#);
    }

    #[tokio::test]
    async fn server_error_schedules_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let fixture = fixture(3);
        let (delivery, subscription) = seed(&fixture, &server.uri()).await;

        let report = fixture.worker.deliver(delivery.id, &subscription).await.unwrap().unwrap();

        let now = fixture.clock.now_utc();
        assert!(!report.succeeded());
        assert_eq!(
            report.persisted.unwrap(),
            Transition::Rescheduled { next_retry_at: now + chrono::Duration::minutes(1) }
        );
        assert_eq!(report.attempt.response_status, 503);
        assert_eq!(report.attempt.error.as_deref(), Some("HTTP 503"));

        let stored = fixture.store.find_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Retrying);
        assert_eq!(stored.last_error.as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn connection_failure_records_zero_status() {
        let fixture = fixture(3);
        // Port 9 (discard) is not listening on loopback
        let (delivery, subscription) = seed(&fixture, "http://127.0.0.1:9/hook").await;

        let report = fixture.worker.deliver(delivery.id, &subscription).await.unwrap().unwrap();

        assert_eq!(report.attempt.response_status, 0);
        assert!(report.attempt.error.is_some());
        assert!(matches!(report.persisted, Ok(Transition::Rescheduled { .. })));
    }

    #[tokio::test]
    async fn failed_attempt_write_leaves_delivery_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

        let fixture = fixture(3);
        let (delivery, subscription) = seed(&fixture, &server.uri()).await;
        fixture.store.fail_next_attempt_write("disk full").await;

        let report = fixture.worker.deliver(delivery.id, &subscription).await.unwrap().unwrap();

        assert!(matches!(report.persisted, Err(DeliveryError::Persistence { .. })));
        let stored = fixture.store.find_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(stored, delivery);
        assert!(fixture.store.find_attempts(delivery.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_update_records_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let fixture = fixture(3);
        let (delivery, subscription) = seed(&fixture, &server.uri()).await;
        fixture.store.fail_next_update("connection reset").await;

        let report = fixture.worker.deliver(delivery.id, &subscription).await.unwrap().unwrap();

        assert!(matches!(report.persisted, Err(DeliveryError::Persistence { .. })));
        assert_eq!(fixture.store.find_delivery(delivery.id).await.unwrap().unwrap(), delivery);
        assert!(fixture.store.find_attempts(delivery.id).await.unwrap().is_empty());

        // Nothing half-written blocks the next attempt from reusing number 1
        let retry = fixture.worker.deliver(delivery.id, &subscription).await.unwrap().unwrap();
        assert_eq!(retry.attempt.attempt_number, 1);
        assert!(matches!(retry.persisted, Ok(Transition::Rescheduled { .. })));
        let attempts = fixture.store.find_attempts(delivery.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        let stored = fixture.store.find_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.status, DeliveryStatus::Retrying);
    }

    #[tokio::test]
    async fn terminal_delivery_skipped_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let fixture = fixture(3);
        let (delivery, subscription) = seed(&fixture, &server.uri()).await;

        fixture.worker.deliver(delivery.id, &subscription).await.unwrap().unwrap();
        let second = fixture.worker.deliver(delivery.id, &subscription).await.unwrap();

        assert!(second.is_none());
    }
}
