//! Reliability Supervisor for confirmable notifications.
//!
//! Each CON notification handed to the transport is tracked from `Sent`
//! until it is acknowledged or given up on. Giving up (retry budget spent,
//! or a Reset from the peer) is the only way an unresponsive observer is
//! pruned without an explicit cancel. NON notifications are never tracked.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{SessionId, Token};
use crate::resource::ResourceId;
use crate::transport::{DeliveryHandle, DeliveryOutcome};

use super::subscription::SubscriptionId;

/// Delivery state of one in-flight confirmable notification.
///
/// The terminal states (acknowledged, exhausted, reset) are not stored: the
/// entry is dropped and the outcome is reported as a [`Verdict`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryState {
    Sent,
    Retransmitting { attempts: u32 },
}

/// Why a subscriber was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// No acknowledgement within the retransmission budget.
    Exhausted,
    /// The peer rejected the notification with a Reset.
    Reset,
    /// The resource answered a notification with a non-2.xx code, which ends
    /// the observation.
    ErrorResponse,
}

/// The subscription a tracked notification was sent for.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub resource: ResourceId,
    pub session: SessionId,
    pub token: Token,
    pub subscription: SubscriptionId,
}

#[derive(Debug, Clone)]
struct InFlight {
    target: DeliveryTarget,
    sequence: u32,
    state: DeliveryState,
    sent_at: DateTime<Utc>,
}

/// What the caller must do after an outcome is applied.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The handle is not tracked (NON, already settled, or forgotten).
    Unknown,
    /// Still waiting; the transport retransmitted.
    Retrying { target: DeliveryTarget, attempts: u32 },
    /// Acknowledged; one fewer pending confirmation for the target.
    Delivered { target: DeliveryTarget, sequence: u32 },
    /// The target subscription must be removed.
    Evict { target: DeliveryTarget, reason: EvictionReason },
}

/// Tracks in-flight CON notifications and turns transport outcomes into verdicts.
#[derive(Debug)]
pub struct ReliabilitySupervisor {
    max_retransmit: u32,
    in_flight: HashMap<DeliveryHandle, InFlight>,
}

impl ReliabilitySupervisor {
    /// Creates a supervisor allowing `max_retransmit` retransmissions per CON.
    #[must_use]
    pub fn new(max_retransmit: u32) -> Self {
        Self {
            max_retransmit,
            in_flight: HashMap::new(),
        }
    }

    /// Starts tracking a CON notification in state `Sent`.
    pub fn track(&mut self, handle: DeliveryHandle, target: DeliveryTarget, sequence: u32) {
        self.in_flight.insert(
            handle,
            InFlight {
                target,
                sequence,
                state: DeliveryState::Sent,
                sent_at: Utc::now(),
            },
        );
    }

    /// Applies a transport outcome for `handle`.
    ///
    /// Settled entries (acknowledged, exhausted, reset) stop being tracked.
    pub fn on_outcome(&mut self, handle: DeliveryHandle, outcome: DeliveryOutcome) -> Verdict {
        let Some(entry) = self.in_flight.get_mut(&handle) else {
            return Verdict::Unknown;
        };

        let reason = match outcome {
            DeliveryOutcome::Acknowledged => {
                let sequence = entry.sequence;
                return match self.in_flight.remove(&handle) {
                    Some(settled) => Verdict::Delivered {
                        target: settled.target,
                        sequence,
                    },
                    None => Verdict::Unknown,
                };
            }
            DeliveryOutcome::TimedOutRetry => {
                let attempts = match entry.state {
                    DeliveryState::Retransmitting { attempts } => attempts.saturating_add(1),
                    DeliveryState::Sent => 1,
                };
                if attempts <= self.max_retransmit {
                    entry.state = DeliveryState::Retransmitting { attempts };
                    return Verdict::Retrying {
                        target: entry.target.clone(),
                        attempts,
                    };
                }
                EvictionReason::Exhausted
            }
            DeliveryOutcome::TimedOutExhausted => EvictionReason::Exhausted,
            DeliveryOutcome::Reset => EvictionReason::Reset,
        };

        match self.in_flight.remove(&handle) {
            Some(settled) => Verdict::Evict {
                target: settled.target,
                reason,
            },
            None => Verdict::Unknown,
        }
    }

    /// Current state of a tracked notification.
    #[must_use]
    pub fn state(&self, handle: DeliveryHandle) -> Option<DeliveryState> {
        self.in_flight.get(&handle).map(|entry| entry.state)
    }

    /// When a tracked notification was first sent.
    #[must_use]
    pub fn sent_at(&self, handle: DeliveryHandle) -> Option<DateTime<Utc>> {
        self.in_flight.get(&handle).map(|entry| entry.sent_at)
    }

    /// Number of CON notifications awaiting an outcome.
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Stops tracking everything sent to `session`. Returns how many entries were dropped.
    pub fn forget_session(&mut self, session: &SessionId) -> usize {
        let before = self.in_flight.len();
        self.in_flight.retain(|_, entry| &entry.target.session != session);
        before - self.in_flight.len()
    }

    /// Stops tracking everything sent for `resource`.
    pub fn forget_resource(&mut self, resource: ResourceId) -> usize {
        let before = self.in_flight.len();
        self.in_flight.retain(|_, entry| entry.target.resource != resource);
        before - self.in_flight.len()
    }

    /// Stops tracking everything sent for one subscription of `resource`.
    pub fn forget_subscriber(&mut self, resource: ResourceId, session: &SessionId, token: &Token) -> usize {
        let before = self.in_flight.len();
        self.in_flight.retain(|_, entry| {
            !(entry.target.resource == resource && &entry.target.session == session && &entry.target.token == token)
        });
        before - self.in_flight.len()
    }
}
