//! Notification Dispatcher.
//!
//! A change signal runs in three steps:
//!
//! 1. Under the resource lock: snapshot the matching subscribers and choose
//!    each one's message type.
//! 2. With no lock held: run the resource handler once per subscriber as a
//!    synthetic GET carrying the subscriber's token and query.
//! 3. Under the resource lock again: take one sequence value for the whole
//!    cycle, send to every subscriber that is still registered, and update
//!    per-record bookkeeping.
//!
//! Handlers may therefore call back into the server, including `notify` on
//! the same resource. Because the sequence value is taken in step 3, cycles
//! reach the transport in the order of their Observe values. A cancel that
//! lands between steps 1 and 3 suppresses the send.
//!
//! The supervisor lock is shared by all resources and is only taken around
//! single `track` and `forget_subscriber` calls, never across a send.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::config::{NotificationType, ObserveConfig};
use crate::error::{lock_err, ObserveResult};
use crate::message::{MessageType, OutgoingMessage, Response};
use crate::resource::{RequestContext, Resource};
use crate::transport::Transport;

use super::reliability::{DeliveryTarget, ReliabilitySupervisor};
use super::subscription::Subscription;

/// Decides when a NON-configured resource must still send a CON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmablePolicy {
    /// Force a CON after this many consecutive NONs (0 disables).
    pub max_consecutive_non: u32,
    /// Force a CON when the last one is older than this.
    pub refresh: Option<Duration>,
}

impl ConfirmablePolicy {
    /// Reads the forcing thresholds from `cfg`.
    #[must_use]
    pub fn from_config(cfg: &ObserveConfig) -> Self {
        let refresh = match cfg.confirmable_refresh_secs {
            0 => None,
            secs => Some(Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000))),
        };
        Self {
            max_consecutive_non: cfg.max_consecutive_non,
            refresh,
        }
    }

    /// Message type for the next notification to `sub`.
    #[must_use]
    pub fn message_type(&self, configured: NotificationType, sub: &Subscription, now: DateTime<Utc>) -> MessageType {
        if configured == NotificationType::Confirmable {
            return MessageType::Confirmable;
        }
        if self.max_consecutive_non > 0 && sub.non_since_confirmable >= self.max_consecutive_non {
            return MessageType::Confirmable;
        }
        if let Some(refresh) = self.refresh {
            let since = sub.last_confirmable_at.unwrap_or(sub.established_at);
            if now - since >= refresh {
                return MessageType::Confirmable;
            }
        }
        MessageType::NonConfirmable
    }
}

/// Summary of one notification cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Observe value used for the cycle; `None` when nothing was left to send.
    pub sequence: Option<u32>,
    /// Subscribers the handler ran for.
    pub matched: usize,
    /// Notifications handed to the transport.
    pub sent: usize,
    /// Of `sent`, how many were confirmable.
    pub confirmable: usize,
    /// Subscribers skipped because the handler failed.
    pub handler_failures: usize,
    /// Sends the transport refused.
    pub send_failures: usize,
    /// Subscribers cancelled or replaced while the handler ran.
    pub stale: usize,
    /// Subscriptions ended by a non-2.xx notification.
    pub ended: Vec<DeliveryTarget>,
}

impl DispatchReport {
    /// True when no subscriber matched the change.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.matched == 0
    }
}

struct Planned {
    target: DeliveryTarget,
    query: Option<String>,
    message_type: MessageType,
}

/// Fans one change signal out to a resource's matching subscribers.
pub struct NotificationDispatcher<'a> {
    transport: &'a dyn Transport,
    supervisor: &'a Mutex<ReliabilitySupervisor>,
    policy: ConfirmablePolicy,
}

impl<'a> NotificationDispatcher<'a> {
    /// Borrows the collaborators for one or more notification cycles.
    #[must_use]
    pub fn new(
        transport: &'a dyn Transport,
        supervisor: &'a Mutex<ReliabilitySupervisor>,
        policy: ConfirmablePolicy,
    ) -> Self {
        Self {
            transport,
            supervisor,
            policy,
        }
    }

    /// Notifies subscribers of `resource` whose filter is absent or equals `query`.
    ///
    /// Only initiates delivery; never waits for acknowledgements.
    pub fn notify(&self, resource: &Mutex<Resource>, query: Option<&str>) -> ObserveResult<DispatchReport> {
        let now = Utc::now();
        let mut report = DispatchReport::default();

        let (planned, handler, resource_id, uri_path) = {
            let guard = resource.lock().map_err(|_| lock_err("resource"))?;
            let configured = guard.notification_type();
            let resource_id = guard.id();

            let mut planned = Vec::new();
            let mut cursor = guard.subscribers.iterate_matching(query);
            while let Some(sub) = cursor.next(&guard.subscribers) {
                planned.push(Planned {
                    target: DeliveryTarget {
                        resource: resource_id,
                        session: sub.session.clone(),
                        token: sub.token.clone(),
                        subscription: sub.id,
                    },
                    query: sub.query.clone(),
                    message_type: self.policy.message_type(configured, sub, now),
                });
            }

            if planned.is_empty() {
                return Ok(report);
            }
            (planned, guard.handler(), resource_id, guard.uri_path().to_string())
        };

        report.matched = planned.len();

        let mut built = Vec::with_capacity(planned.len());
        for plan in planned {
            let mut response = Response::default();
            let ctx = RequestContext {
                resource: resource_id,
                uri_path: &uri_path,
                session: &plan.target.session,
                token: &plan.target.token,
                query: plan.query.as_deref(),
                is_notification: true,
            };
            if let Err(err) = handler.handle_get(&ctx, &mut response) {
                warn!(
                    resource = %uri_path,
                    session = %plan.target.session,
                    token = %plan.target.token,
                    error = %err,
                    "notification handler failed; skipping subscriber"
                );
                report.handler_failures += 1;
                continue;
            }
            built.push((plan.target, plan.message_type, response));
        }

        if built.is_empty() {
            return Ok(report);
        }

        let mut guard = resource.lock().map_err(|_| lock_err("resource"))?;
        let sequence = guard.sequence.next();
        report.sequence = Some(sequence);

        for (target, message_type, mut response) in built {
            // A non-2.xx notification carries no Observe option and ends the observation.
            let terminal = !response.code.is_success();
            response.observe = (!terminal).then_some(sequence);
            let message = OutgoingMessage::from_response(message_type, target.token.clone(), response);
            let confirmable = message.is_confirmable();

            let Some(sub) = guard
                .subscribers
                .find_current_mut(&target.session, &target.token, target.subscription)
            else {
                report.stale += 1;
                continue;
            };

            match self.transport.send(&target.session, message) {
                Ok(handle) => {
                    sub.last_sequence = sequence;
                    if confirmable {
                        sub.pending_confirmations = sub.pending_confirmations.saturating_add(1);
                        sub.non_since_confirmable = 0;
                        sub.last_confirmable_at = Some(now);
                        self.supervisor
                            .lock()
                            .map_err(|_| lock_err("supervisor"))?
                            .track(handle, target.clone(), sequence);
                        report.confirmable += 1;
                    } else {
                        sub.non_since_confirmable = sub.non_since_confirmable.saturating_add(1);
                    }
                    report.sent += 1;
                }
                Err(err) => {
                    warn!(
                        resource = %uri_path,
                        session = %target.session,
                        token = %target.token,
                        error = %err,
                        "transport refused notification"
                    );
                    report.send_failures += 1;
                }
            }

            if terminal {
                guard.subscribers.remove(&target.session, &target.token);
                self.supervisor
                    .lock()
                    .map_err(|_| lock_err("supervisor"))?
                    .forget_subscriber(target.resource, &target.session, &target.token);
                report.ended.push(target);
            }
        }

        debug!(
            resource = %uri_path,
            sequence,
            matched = report.matched,
            sent = report.sent,
            confirmable = report.confirmable,
            "notification cycle dispatched"
        );

        Ok(report)
    }
}
