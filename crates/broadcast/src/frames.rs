//! Wire frames exchanged with live subscribers (framed JSON).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use opspulse_core::{Event, Incident};

/// The sentinel channel matching every service.
pub const CHANNEL_ALL: &str = "all";

/// What happened to an incident, from the subscriber's point of view.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentAction {
    Created,
    Updated,
    SummaryUpdated,
    Resolved,
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connection {
        message: String,
        timestamp: DateTime<Utc>,
    },
    Event {
        data: Box<Event>,
        timestamp: DateTime<Utc>,
    },
    Incident {
        action: IncidentAction,
        data: Box<Incident>,
        timestamp: DateTime<Utc>,
    },
    Subscribed {
        channels: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn event(event: Event) -> Self {
        Self::Event {
            data: Box::new(event),
            timestamp: Utc::now(),
        }
    }

    pub fn incident(incident: Incident, action: IncidentAction) -> Self {
        Self::Incident {
            action,
            data: Box::new(incident),
            timestamp: Utc::now(),
        }
    }

    pub fn subscribed(channels: Vec<String>) -> Self {
        Self::Subscribed {
            channels,
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Client → server control frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        #[serde(default)]
        channels: Vec<String>,
    },
    Ping,
    Pause {
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    Resume,
}

/// What a session's transport pulls off its outbound channel.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(ServerFrame),
    /// Transport-level liveness probe (maps to a WebSocket ping).
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_frames_are_tagged_by_type() {
        let frame = ServerFrame::pong();
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "pong");
        assert!(value["timestamp"].is_string());

        let err = serde_json::to_value(ServerFrame::error("nope")).unwrap();
        assert_eq!(err, json!({"type": "error", "message": "nope"}));
    }

    #[test]
    fn client_frames_parse_with_defaults() {
        let subscribe: ClientFrame =
            serde_json::from_value(json!({"type": "subscribe"})).unwrap();
        assert!(matches!(subscribe, ClientFrame::Subscribe { channels } if channels.is_empty()));

        let pause: ClientFrame = serde_json::from_value(json!({"type": "pause"})).unwrap();
        assert!(matches!(pause, ClientFrame::Pause { timestamp: None }));

        assert!(serde_json::from_value::<ClientFrame>(json!({"type": "dance"})).is_err());
    }
}
