//! The server-side record of one observer relationship.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{SessionId, Token};

/// Unique identifier for one establish of a subscription.
///
/// Re-establishing the same (session, token) pair yields a new id, so delivery
/// outcomes for the replaced record can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry key: one subscription per (session, token) within a resource.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberKey {
    pub session: SessionId,
    pub token: Token,
}

impl SubscriberKey {
    /// Builds a key from its parts.
    #[must_use]
    pub fn new(session: SessionId, token: Token) -> Self {
        Self { session, token }
    }
}

/// One client's observation of one resource.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub session: SessionId,
    pub token: Token,
    /// Exact-match filter against the query of a change signal.
    pub query: Option<String>,
    /// Observe value of the last notification handed to the transport.
    pub last_sequence: u32,
    /// CON notifications sent and not yet acknowledged.
    pub pending_confirmations: u32,
    /// NON notifications sent since the last CON.
    pub non_since_confirmable: u32,
    pub last_confirmable_at: Option<DateTime<Utc>>,
    pub established_at: DateTime<Utc>,
}

impl Subscription {
    /// A fresh record for an establish request answered with `sequence`.
    #[must_use]
    pub fn new(session: SessionId, token: Token, query: Option<String>, sequence: u32) -> Self {
        Self {
            id: SubscriptionId::new(),
            session,
            token,
            query,
            last_sequence: sequence,
            pending_confirmations: 0,
            non_since_confirmable: 0,
            last_confirmable_at: None,
            established_at: Utc::now(),
        }
    }

    /// The registry key of this record.
    #[must_use]
    pub fn key(&self) -> SubscriberKey {
        SubscriberKey::new(self.session.clone(), self.token.clone())
    }

    /// Whether a change signalled with `trigger` reaches this subscriber.
    ///
    /// Filter-less subscriptions match everything. A filtered subscription
    /// matches only a trigger carrying the identical query; a trigger with no
    /// query does not reach it.
    #[must_use]
    pub fn matches(&self, trigger: Option<&str>) -> bool {
        match (self.query.as_deref(), trigger) {
            (None, _) => true,
            (Some(filter), Some(q)) => filter == q,
            (Some(_), None) => false,
        }
    }
}
