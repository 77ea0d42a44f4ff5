//! JSON-lines event adapter.
//!
//! Each input line is one event:
//!
//! ```text
//! {"event_type": "blog.post.created", "payload": {"id": 1}}
//! {"event_id": "6f1c…", "event_type": "user.deleted", "payload": {"id": 9}}
//! ```
//!
//! A missing `event_id` gets a fresh one. The payload is forwarded to
//! subscribers as its compact JSON encoding.

use anyhow::{Context, Result};
use bytes::Bytes;
use hookline_core::EventId;
use hookline_delivery::DeliveryEngine;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub payload: Bytes,
}

#[derive(Deserialize)]
struct EventLine {
    #[serde(default)]
    event_id: Option<EventId>,
    event_type: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<InboundEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let parsed: EventLine = serde_json::from_str(line).context("Invalid event line")?;
    if parsed.event_type.trim().is_empty() {
        anyhow::bail!("event_type must not be empty");
    }

    let payload = serde_json::to_vec(&parsed.payload).context("Failed to encode payload")?;
    Ok(Some(InboundEvent {
        event_id: parsed.event_id.unwrap_or_default(),
        event_type: parsed.event_type,
        payload: Bytes::from(payload),
    }))
}

/// Feeds every event read from `reader` into the engine until end of input.
///
/// Malformed lines are logged and skipped. Returns the number of events
/// ingested.
pub async fn run<R>(reader: R, engine: &DeliveryEngine) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut ingested = 0;

    while let Some(line) = lines.next_line().await.context("Failed to read event input")? {
        let event = match parse_line(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "skipping malformed event line");
                continue;
            },
        };

        let report = engine
            .ingest_event(event.event_id, &event.event_type, event.payload)
            .await
            .with_context(|| format!("Failed to ingest event {}", event.event_id))?;
        debug!(
            event_id = %event.event_id,
            matched = report.matched,
            queue_full = report.queue_full,
            "event line processed"
        );
        ingested += 1;
    }

    Ok(ingested)
}
