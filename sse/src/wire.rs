//! Wire-level SSE framing.
//!
//! The framed text emitted here is the transport's actual contract with the
//! browser's `EventSource` implementation, so it is produced by hand rather
//! than through a response builder: the byte layout (field order, single
//! trailing blank line, single-line JSON data) must not drift.

use crate::error::{Error, Result};
use events::Event;
use serde_json::{Map, Value};

/// Serializes an event into one SSE frame:
///
/// ```text
/// event: <type>\n
/// id: <id>\n
/// retry: <milliseconds>\n      (only when a retry hint is present)
/// data: <single-line json>\n
/// \n
/// ```
///
/// The data payload is the event payload with the event's `id` and
/// `timestamp` merged in, so clients can deduplicate and order without
/// parsing SSE metadata fields.
pub fn frame_event(event: &Event) -> Result<String> {
    validate_field("event type", &event.event_type)?;
    validate_field("event id", &event.id)?;

    let data = serde_json::to_string(&data_object(event))?;
    // serde_json never emits raw newlines, but the framing invariant is
    // load-bearing enough to check rather than assume.
    if data.contains('\n') || data.contains('\r') {
        return Err(Error::invalid_payload(
            "event payload serialized to multi-line JSON",
        ));
    }

    let mut frame = String::with_capacity(data.len() + 64);
    frame.push_str("event: ");
    frame.push_str(&event.event_type);
    frame.push('\n');
    frame.push_str("id: ");
    frame.push_str(&event.id);
    frame.push('\n');
    if let Some(retry_ms) = event.retry_ms {
        frame.push_str("retry: ");
        frame.push_str(&retry_ms.to_string());
        frame.push('\n');
    }
    frame.push_str("data: ");
    frame.push_str(&data);
    frame.push_str("\n\n");
    Ok(frame)
}

/// Merges event identity into the payload. Non-object payloads are wrapped so
/// the id always travels with the data.
fn data_object(event: &Event) -> Value {
    let mut map = match &event.payload {
        Value::Object(fields) => fields.clone(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other.clone());
            map
        }
    };
    map.insert("id".to_string(), Value::String(event.id.clone()));
    map.insert(
        "timestamp".to_string(),
        Value::String(event.timestamp.to_rfc3339()),
    );
    Value::Object(map)
}

fn validate_field(label: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid_payload(format!("{label} is empty")));
    }
    if value.contains('\n') || value.contains('\r') {
        return Err(Error::invalid_payload(format!(
            "{label} contains a line break"
        )));
    }
    Ok(())
}
