//! Observe lifecycle events published to the host application.
//!
//! These are informational only. The registry stays the source of truth;
//! a slow or absent reader never blocks the server, it only loses events.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::message::{SessionId, Token};
use crate::resource::ResourceId;

use super::reliability::EvictionReason;

/// Something that happened to an observer relationship.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserveEvent {
    Established {
        resource: ResourceId,
        session: SessionId,
        token: Token,
        sequence: u32,
        replaced: bool,
    },
    Cancelled {
        resource: ResourceId,
        session: SessionId,
        token: Token,
    },
    /// Removed without a cancel request from the client.
    Evicted {
        resource: ResourceId,
        session: SessionId,
        token: Token,
        reason: EvictionReason,
    },
    SessionClosed {
        session: SessionId,
        removed: usize,
    },
    /// The resource stopped accepting observers or was removed.
    ObservationEnded {
        resource: ResourceId,
        removed: usize,
    },
}

/// An event with the time it was published.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimestampedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ObserveEvent,
}

impl TimestampedEvent {
    /// Stamps `event` with the current time.
    #[must_use]
    pub fn now(event: ObserveEvent) -> Self {
        Self { at: Utc::now(), event }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = TimestampedEvent::now(ObserveEvent::Evicted {
            resource: ResourceId::new(),
            session: SessionId::new("192.0.2.1:5683"),
            token: Token::new(vec![0x01]).unwrap(),
            reason: EvictionReason::Exhausted,
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "evicted");
        assert_eq!(json["reason"], "exhausted");
        assert_eq!(json["token"], serde_json::json!([1]));
        assert!(json.get("at").is_some());
    }
}
