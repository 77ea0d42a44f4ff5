//! HTTP client for webhook delivery with configurable timeouts.
//!
//! Builds the signed POST for one attempt, sends it, and captures status,
//! truncated body and duration. Transport failures come back as errors;
//! any HTTP response, 2xx or not, comes back as a [`DeliveryResponse`].

use std::time::{Duration, Instant};

use bytes::Bytes;
use hookline_core::{DeliveryId, EventId};
use tracing::{info_span, Instrument};

use crate::{
    error::{DeliveryError, Result},
    signing::SIGNATURE_HEADER,
};

/// Header naming the event type.
pub const EVENT_HEADER: &str = "X-Webhook-Event";
/// Header carrying the event ID.
pub const EVENT_ID_HEADER: &str = "X-Webhook-Event-Id";
/// Header carrying the delivery ID, stable across retries.
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";
/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

/// Maximum response body bytes kept for the audit trail.
pub const MAX_AUDIT_BODY_BYTES: usize = 1024;

/// Default user agent sent with every request.
pub const DEFAULT_USER_AGENT: &str = "Hookline-Webhook-Delivery/1.0";

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout for a whole request, connect to last body byte.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), user_agent: DEFAULT_USER_AGENT.to_string() }
    }
}

/// One signed webhook request.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Delivery being attempted.
    pub delivery_id: DeliveryId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Event type, sent in `X-Webhook-Event`.
    pub event_type: String,
    /// Subscriber endpoint.
    pub url: String,
    /// Raw event payload.
    pub body: Bytes,
    /// Hex HMAC-SHA256 of `body`.
    pub signature: String,
    /// Attempt number for this request.
    pub attempt_number: u32,
}

/// Response captured from a subscriber.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body truncated to [`MAX_AUDIT_BODY_BYTES`].
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
}

impl DeliveryResponse {
    /// Whether the subscriber answered with a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// HTTP client shared by all dispatch workers.
///
/// Wraps a pooled `reqwest::Client`; cloning shares the connection pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built from the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            // A 3xx is the subscriber's answer; following it would turn the POST into a GET
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Sends one webhook request.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when the request exceeds the configured timeout and
    /// `NetworkError` for any other transport failure. Non-2xx responses are
    /// not errors at this layer.
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "webhook_delivery",
            delivery_id = %request.delivery_id,
            event_id = %request.event_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            let start = Instant::now();
            tracing::debug!("sending webhook");

            let send_result = self
                .client
                .post(&request.url)
                .header("content-type", "application/json")
                .header(SIGNATURE_HEADER, &request.signature)
                .header(EVENT_HEADER, &request.event_type)
                .header(EVENT_ID_HEADER, request.event_id.to_string())
                .header(DELIVERY_HEADER, request.delivery_id.to_string())
                .header(ATTEMPT_HEADER, request.attempt_number.to_string())
                .body(request.body)
                .send()
                .await;

            let response = match send_result {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(
                        duration_ms = start.elapsed().as_millis(),
                        error = %e,
                        "request failed"
                    );
                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let status_code = response.status().as_u16();
            let body = match read_capped(response).await {
                Ok(bytes) => truncate_body(&bytes),
                Err(e) if e.is_timeout() => {
                    return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                },
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read response body");
                    String::new()
                },
            };
            let duration = start.elapsed();

            tracing::debug!(
                status_code,
                duration_ms = duration.as_millis(),
                "received response"
            );

            Ok(DeliveryResponse { status_code, body, duration })
        }
        .instrument(span)
        .await
    }
}

/// Reads the response body chunk by chunk, stopping once
/// [`MAX_AUDIT_BODY_BYTES`] are buffered. The rest is never downloaded.
async fn read_capped(mut response: reqwest::Response) -> reqwest::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    while buffer.len() < MAX_AUDIT_BODY_BYTES {
        let Some(chunk) = response.chunk().await? else {
            break;
        };
        let take = chunk.len().min(MAX_AUDIT_BODY_BYTES - buffer.len());
        buffer.extend_from_slice(&chunk[..take]);
    }
    Ok(buffer)
}

/// Decodes at most [`MAX_AUDIT_BODY_BYTES`] of a response body.
///
/// Invalid UTF-8 is replaced and the result never splits a character.
pub fn truncate_body(bytes: &[u8]) -> String {
    let limit = bytes.len().min(MAX_AUDIT_BODY_BYTES);
    let mut body = String::from_utf8_lossy(&bytes[..limit]).into_owned();
    if body.len() > MAX_AUDIT_BODY_BYTES {
        let mut end = MAX_AUDIT_BODY_BYTES;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_product_user_agent() {
        let config = ClientConfig::default();
        assert_eq!(config.user_agent, "Hookline-Webhook-Delivery/1.0");
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn short_body_kept_whole() {
        assert_eq!(truncate_body(b"ok"), "ok");
    }

    #[test]
    fn long_body_truncated_to_limit() {
        let body = vec![b'x'; 5000];
        assert_eq!(truncate_body(&body).len(), MAX_AUDIT_BODY_BYTES);
    }

    #[test]
    fn truncation_never_splits_characters() {
        // 3-byte characters straddle the 1024-byte boundary
        let body = "€".repeat(400);
        let truncated = truncate_body(body.as_bytes());

        assert!(truncated.len() <= MAX_AUDIT_BODY_BYTES);
        assert!(truncated.chars().all(|c| c == '€' || c == char::REPLACEMENT_CHARACTER));
    }

    #[test]
    fn success_means_2xx() {
        let response =
            |status_code| DeliveryResponse { status_code, body: String::new(), duration: Duration::ZERO };

        assert!(response(200).is_success());
        assert!(response(204).is_success());
        assert!(!response(301).is_success());
        assert!(!response(500).is_success());
    }

    fn request_to(url: String) -> DeliveryRequest {
        DeliveryRequest {
            delivery_id: DeliveryId::new(),
            event_id: EventId::new(),
            event_type: "order.created".to_string(),
            url,
            body: Bytes::from_static(b"{}"),
            signature: "00".to_string(),
            attempt_number: 1,
        }
    }

    #[tokio::test]
    async fn redirect_is_reported_not_followed() {
        use wiremock::{
            matchers::{method, path},
            Mock, MockServer, ResponseTemplate,
        };

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/a"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", format!("{}/b", server.uri())),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(path("/b")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(request_to(format!("{}/a", server.uri()))).await.unwrap();

        assert_eq!(response.status_code, 302);
        assert!(!response.is_success());
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn large_response_body_is_capped() {
        use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'y'; 256 * 1024]))
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(request_to(server.uri())).await.unwrap();

        assert!(response.is_success());
        assert_eq!(response.body.len(), MAX_AUDIT_BODY_BYTES);
        assert!(response.body.bytes().all(|b| b == b'y'));
    }
}
