//! Transport collaborator contract.
//!
//! The Observe core never touches sockets or retransmission timers. It hands
//! assembled notifications to a [`Transport`] and later learns how each
//! confirmable one fared, either through a direct call on the server or
//! through the bounded outcome channel returned by
//! `ObserveServer::outcome_reporter`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::message::{OutgoingMessage, SessionId};

/// Transport-assigned identity of one sent message (e.g. its message ID
/// combined with the endpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryHandle(u64);

impl DeliveryHandle {
    /// Wraps a transport-assigned identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The transport-assigned identifier.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the transport learned about a confirmable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// The peer acknowledged the message.
    Acknowledged,
    /// The ACK timeout fired and the message was retransmitted.
    TimedOutRetry,
    /// The retransmission budget is spent without an ACK.
    TimedOutExhausted,
    /// The peer answered with a Reset.
    Reset,
}

/// Outbound side of the CoAP transport.
pub trait Transport: Send + Sync {
    /// Starts delivery of `message` to `session`. Must not wait for the peer.
    fn send(&self, session: &SessionId, message: OutgoingMessage) -> Result<DeliveryHandle, TransportError>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, session: &SessionId, message: OutgoingMessage) -> Result<DeliveryHandle, TransportError> {
        (**self).send(session, message)
    }
}
