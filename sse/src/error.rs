//! Error types for the `sse` layer.
use std::error::Error as StdError;
use std::fmt;

/// Top-level error type for the event distribution subsystem.
///
/// Mirrors the layering convention used elsewhere in the platform: a root
/// `Error` holding an `ErrorKind` plus the original source error, so the web
/// layer can translate kinds to HTTP statuses without depending on redis or
/// serde_json directly.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// The kinds of failure the subsystem distinguishes. Each maps to a distinct
/// recovery policy (see the handler and selector modules) and to a metrics
/// label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A write to one connection's transport failed. Non-fatal; the
    /// connection is left registered for the lifecycle sweep.
    TransportWrite,
    /// The shared store (broker) is unreachable. Triggers fail-over to a
    /// lower-preference backend.
    StoreUnavailable,
    /// The broker subscription dropped. Retried with capped backoff.
    Subscription,
    /// A fan-out publish failed after local delivery already succeeded.
    /// Logged and swallowed.
    Publish,
    /// A backend candidate did not initialize within the configured timeout.
    InitializationTimeout,
    /// The event could not be framed for the wire (embedded newline or
    /// unserializable payload). Rejected before queueing or fan-out.
    InvalidPayload,
    Config,
    Other(String),
}

impl ErrorKind {
    /// Stable label used for the errors-by-kind metric counters.
    pub fn metric_label(&self) -> &'static str {
        match self {
            ErrorKind::TransportWrite => "transport-write-failure",
            ErrorKind::StoreUnavailable => "shared-store-unavailable",
            ErrorKind::Subscription => "subscription-failure",
            ErrorKind::Publish => "publish-failure",
            ErrorKind::InitializationTimeout => "initialization-timeout",
            ErrorKind::InvalidPayload => "invalid-event-payload",
            ErrorKind::Config => "config",
            ErrorKind::Other(_) => "other",
        }
    }
}

impl Error {
    pub fn new(error_kind: ErrorKind) -> Self {
        Self {
            source: None,
            error_kind,
        }
    }

    pub fn with_source(
        error_kind: ErrorKind,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            source: Some(Box::new(source)),
            error_kind,
        }
    }

    pub fn invalid_payload(detail: impl Into<String>) -> Self {
        Self {
            source: None,
            error_kind: ErrorKind::InvalidPayload,
        }
        .with_detail(detail)
    }

    pub fn other(detail: impl Into<String>) -> Self {
        Self {
            source: None,
            error_kind: ErrorKind::Other(detail.into()),
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        if self.source.is_none() {
            self.source = Some(detail.into().into());
        }
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SSE Error: {self:?}")
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

// Redis errors surface at the store boundary. Connection-level failures mean
// the shared store is unreachable; everything else is reported as-is so the
// caller can decide (publish vs subscription context).
impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        let error_kind = if err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
            || err.is_io_error()
        {
            ErrorKind::StoreUnavailable
        } else {
            ErrorKind::Other(err.category().to_string())
        };
        Error {
            source: Some(Box::new(err)),
            error_kind,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::InvalidPayload,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_labels_are_stable() {
        assert_eq!(
            ErrorKind::TransportWrite.metric_label(),
            "transport-write-failure"
        );
        assert_eq!(
            ErrorKind::StoreUnavailable.metric_label(),
            "shared-store-unavailable"
        );
        assert_eq!(ErrorKind::Publish.metric_label(), "publish-failure");
        assert_eq!(
            ErrorKind::InvalidPayload.metric_label(),
            "invalid-event-payload"
        );
    }

    #[test]
    fn test_serde_json_error_maps_to_invalid_payload() {
        let err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let error: Error = err.into();
        assert_eq!(error.error_kind, ErrorKind::InvalidPayload);
        assert!(error.source.is_some());
    }
}
