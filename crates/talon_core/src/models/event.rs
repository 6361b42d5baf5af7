//! Push events received on the event stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::timestamp::flexible_option;

/// Raw frame envelope: `{type, payload, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event kind, e.g. `hunt_progress`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Server time of the event.
    #[serde(default, with = "flexible_option")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Hunt progress update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HuntProgress {
    /// Hunt identifier
    pub hunt_id: String,
    /// Completion fraction in `[0, 1]`
    pub progress: f64,
}

/// Hunt finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HuntCompleted {
    /// Hunt identifier
    pub hunt_id: String,
    /// Number of clients that returned results
    #[serde(default)]
    pub total_results: Option<u64>,
}

/// A client came online or went offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientPresence {
    /// Client identifier
    pub client_id: String,
    /// Reported hostname
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Flow collection progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowProgress {
    /// Client identifier
    pub client_id: String,
    /// Flow identifier
    pub flow_id: String,
    /// Bytes uploaded so far
    #[serde(default)]
    pub total_uploaded_bytes: u64,
    /// Rows collected so far
    #[serde(default)]
    pub total_collected_rows: u64,
}

/// Flow finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowCompleted {
    /// Client identifier
    pub client_id: String,
    /// Flow identifier
    pub flow_id: String,
    /// Final flow state, e.g. `FINISHED` or `ERROR`
    #[serde(default)]
    pub state: Option<String>,
}

/// Free-form notification for the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Short title
    #[serde(default)]
    pub title: String,
    /// Body text
    pub message: String,
    /// Severity label
    #[serde(default)]
    pub level: Option<String>,
}

/// Error reported by the server over the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamError {
    /// Error text
    pub message: String,
    /// Optional machine-readable code
    #[serde(default)]
    pub code: Option<String>,
}

/// A decoded event of a known kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// `hunt_progress`
    HuntProgress(HuntProgress),
    /// `hunt_completed`
    HuntCompleted(HuntCompleted),
    /// `client_connected`
    ClientConnected(ClientPresence),
    /// `client_disconnected`
    ClientDisconnected(ClientPresence),
    /// `flow_progress`
    FlowProgress(FlowProgress),
    /// `flow_completed`
    FlowCompleted(FlowCompleted),
    /// `notification`
    Notification(Notification),
    /// `error`
    Error(StreamError),
}

/// Outcome of decoding an envelope.
#[derive(Debug)]
pub enum DecodedEvent {
    /// A known kind with a well-formed payload.
    Known(ServerEvent),
    /// The kind is not part of the catalog.
    Unknown(String),
    /// The kind is known but its payload did not match.
    Malformed {
        /// Event kind
        kind: String,
        /// Decode failure
        error: serde_json::Error,
    },
}

impl ServerEvent {
    /// Decode the envelope payload by kind.
    pub fn decode(envelope: &EventEnvelope) -> DecodedEvent {
        fn payload<T: serde::de::DeserializeOwned>(
            envelope: &EventEnvelope,
            wrap: fn(T) -> ServerEvent,
        ) -> DecodedEvent {
            match serde_json::from_value::<T>(envelope.payload.clone()) {
                Ok(value) => DecodedEvent::Known(wrap(value)),
                Err(error) => DecodedEvent::Malformed { kind: envelope.kind.clone(), error },
            }
        }

        match envelope.kind.as_str() {
            "hunt_progress" => payload(envelope, ServerEvent::HuntProgress),
            "hunt_completed" => payload(envelope, ServerEvent::HuntCompleted),
            "client_connected" => payload(envelope, ServerEvent::ClientConnected),
            "client_disconnected" => payload(envelope, ServerEvent::ClientDisconnected),
            "flow_progress" => payload(envelope, ServerEvent::FlowProgress),
            "flow_completed" => payload(envelope, ServerEvent::FlowCompleted),
            "notification" => payload(envelope, ServerEvent::Notification),
            "error" => payload(envelope, ServerEvent::Error),
            other => DecodedEvent::Unknown(other.to_string()),
        }
    }

    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HuntProgress(_) => "hunt_progress",
            Self::HuntCompleted(_) => "hunt_completed",
            Self::ClientConnected(_) => "client_connected",
            Self::ClientDisconnected(_) => "client_disconnected",
            Self::FlowProgress(_) => "flow_progress",
            Self::FlowCompleted(_) => "flow_completed",
            Self::Notification(_) => "notification",
            Self::Error(_) => "error",
        }
    }

    /// One-line description for the activity feed.
    pub fn summary(&self) -> String {
        match self {
            Self::HuntProgress(p) => format!("Hunt {} at {:.0}%", p.hunt_id, p.progress * 100.0),
            Self::HuntCompleted(c) => format!("Hunt {} completed", c.hunt_id),
            Self::ClientConnected(c) => format!("Client {} connected", c.client_id),
            Self::ClientDisconnected(c) => format!("Client {} disconnected", c.client_id),
            Self::FlowProgress(p) => {
                format!("Flow {} on {}: {} rows", p.flow_id, p.client_id, p.total_collected_rows)
            }
            Self::FlowCompleted(c) => format!("Flow {} on {} completed", c.flow_id, c.client_id),
            Self::Notification(n) if n.title.is_empty() => n.message.clone(),
            Self::Notification(n) => format!("{}: {}", n.title, n.message),
            Self::Error(e) => format!("Server error: {}", e.message),
        }
    }
}

/// Entry in the bounded recent-activity feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    /// Local identifier
    pub id: Uuid,
    /// Event kind
    pub kind: &'static str,
    /// Human-readable summary
    pub summary: String,
    /// Server timestamp if present, otherwise local receive time
    pub occurred_at: DateTime<Utc>,
}

impl ActivityRecord {
    /// Build a record for a decoded event.
    pub fn from_event(event: &ServerEvent, timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: event.kind(),
            summary: event.summary(),
            occurred_at: timestamp.unwrap_or_else(Utc::now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(text: &str) -> EventEnvelope {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn test_decode_hunt_progress() {
        let env = envelope(
            r#"{"type":"hunt_progress","payload":{"hunt_id":"H.1","progress":0.5},"timestamp":1709296245}"#,
        );
        assert!(env.timestamp.is_some());
        match ServerEvent::decode(&env) {
            DecodedEvent::Known(ServerEvent::HuntProgress(p)) => {
                assert_eq!(p, HuntProgress { hunt_id: "H.1".to_string(), progress: 0.5 });
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_kind() {
        let env = envelope(r#"{"type":"label_added","payload":{}}"#);
        assert!(matches!(ServerEvent::decode(&env), DecodedEvent::Unknown(kind) if kind == "label_added"));
    }

    #[test]
    fn test_decode_malformed_payload() {
        let env = envelope(r#"{"type":"flow_completed","payload":{"flow_id":7}}"#);
        assert!(matches!(ServerEvent::decode(&env), DecodedEvent::Malformed { .. }));
    }

    #[test]
    fn test_activity_summary() {
        let event = ServerEvent::HuntProgress(HuntProgress { hunt_id: "H.9".into(), progress: 0.25 });
        let record = ActivityRecord::from_event(&event, None);
        assert_eq!(record.kind, "hunt_progress");
        assert_eq!(record.summary, "Hunt H.9 at 25%");
    }
}
