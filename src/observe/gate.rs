//! Registration Gate: interprets the Observe option on incoming requests.
//!
//! All registry changes happen synchronously while the triggering request is
//! handled; there is no deferred registration queue.

use tracing::{debug, warn};

use crate::message::{Method, ObserveAction, Request, ResponseCode};
use crate::resource::Resource;

use super::subscription::{Subscription, SubscriptionId};

/// Outcome of running a request through the gate.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Serve the request normally; observation state is untouched.
    PassThrough,
    /// A subscription was created or replaced. The response must carry the
    /// Observe option with `sequence`.
    Established {
        subscription: SubscriptionId,
        sequence: u32,
        replaced: bool,
    },
    /// Serve normally without the Observe option. `removed` is false when
    /// there was nothing to cancel.
    Cancelled { removed: bool },
    /// Refuse the request with `code`.
    Rejected { code: ResponseCode },
}

impl GateDecision {
    /// Observe option value to attach to the response, if any.
    #[must_use]
    pub const fn observe_option(&self) -> Option<u32> {
        match self {
            Self::Established { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }

    /// True when the request must be refused.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Decides establish / cancel / pass-through for requests on one resource.
#[derive(Debug, Clone, Copy)]
pub struct RegistrationGate {
    max_subscribers: usize,
}

impl RegistrationGate {
    /// Creates a gate admitting at most `max_subscribers` per resource.
    #[must_use]
    pub const fn new(max_subscribers: usize) -> Self {
        Self { max_subscribers }
    }

    /// Applies `request` to the resource's registry.
    pub fn evaluate(&self, resource: &mut Resource, request: &Request) -> GateDecision {
        if request.method != Method::Get {
            return GateDecision::PassThrough;
        }

        match request.observe_action() {
            None => GateDecision::PassThrough,
            Some(ObserveAction::Establish) => self.establish(resource, request),
            Some(ObserveAction::Cancel) => Self::cancel(resource, request),
        }
    }

    fn establish(&self, resource: &mut Resource, request: &Request) -> GateDecision {
        if !resource.is_observable() {
            debug!(
                resource = %resource.uri_path(),
                session = %request.session,
                token = %request.token,
                "observe establish on non-observable resource"
            );
            return GateDecision::Rejected {
                code: ResponseCode::MethodNotAllowed,
            };
        }

        let exists = resource.subscribers.find(&request.session, &request.token).is_some();
        if !exists && resource.subscribers.len() >= self.max_subscribers {
            warn!(
                resource = %resource.uri_path(),
                limit = self.max_subscribers,
                "subscriber limit reached; serving without observation"
            );
            return GateDecision::PassThrough;
        }

        let sequence = resource.current_sequence();
        let sub = Subscription::new(
            request.session.clone(),
            request.token.clone(),
            request.query.clone(),
            sequence,
        );
        let subscription = sub.id;
        let replaced = resource.subscribers.insert_or_replace(sub).is_some();

        debug!(
            resource = %resource.uri_path(),
            session = %request.session,
            token = %request.token,
            sequence,
            replaced,
            "observer established"
        );

        GateDecision::Established {
            subscription,
            sequence,
            replaced,
        }
    }

    fn cancel(resource: &mut Resource, request: &Request) -> GateDecision {
        let removed = resource.subscribers.remove(&request.session, &request.token).is_some();
        if removed {
            debug!(
                resource = %resource.uri_path(),
                session = %request.session,
                token = %request.token,
                "observer cancelled"
            );
        }
        GateDecision::Cancelled { removed }
    }
}
