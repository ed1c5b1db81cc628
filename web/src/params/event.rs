use events::{Event, SendOptions};
use serde::Deserialize;
use serde_json::Value;

/// Body accepted by the event dispatch endpoints.
#[derive(Debug, Deserialize)]
pub(crate) struct EventParams {
    /// Event type name as delivered on the wire, e.g. "notification".
    #[serde(rename = "type")]
    pub event_type: String,
    /// Arbitrary JSON payload forwarded to clients verbatim.
    #[serde(default)]
    pub payload: Value,
    /// Deliver to this instance's connections only, skipping cross-instance
    /// fan-out. Used by callers that have already fanned out themselves.
    #[serde(default)]
    pub local_only: bool,
}

impl EventParams {
    pub(crate) fn send_options(&self) -> SendOptions {
        if self.local_only {
            SendOptions::local_only()
        } else {
            SendOptions::default()
        }
    }

    pub(crate) fn into_event(self) -> Event {
        Event::new(self.event_type, self.payload)
    }
}
