//! Observe server facade.
//!
//! `ObserveServer` owns the resource table and wires the gate, dispatcher and
//! reliability supervisor together behind the operations the hosting CoAP
//! server calls. It runs no threads of its own: every entry point does its
//! work synchronously and returns, and transport outcomes are applied either
//! directly or by draining the outcome channel from the host's event loop.
//!
//! Locking: the resource table sits behind an `RwLock` that is only held long
//! enough to clone a resource handle. Each resource has its own `Mutex`, so
//! independent resources never serialize each other's notification cycles.
//! The supervisor lock is shared, so it is only held for single bookkeeping
//! calls and never across a transport send. When both are needed the
//! resource lock is taken before the supervisor lock. Handlers always run
//! with no lock held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use tracing::{debug, info};

use crate::config::{ObserveConfig, ResourceOptions};
use crate::error::{lock_err, ExecutionError, ObserveError, ObserveResult, ValidationError};
use crate::message::{OutgoingMessage, Request, Response, ResponseCode, SessionId, Token};
use crate::observe::dispatcher::{ConfirmablePolicy, DispatchReport, NotificationDispatcher};
use crate::observe::events::{ObserveEvent, TimestampedEvent};
use crate::observe::gate::{GateDecision, RegistrationGate};
use crate::observe::reliability::{EvictionReason, ReliabilitySupervisor, Verdict};
use crate::observe::subscription::Subscription;
use crate::resource::{normalize_path, RequestContext, Resource, ResourceHandler, ResourceId};
use crate::transport::{DeliveryHandle, DeliveryOutcome, Transport};

type OutcomeMsg = (DeliveryHandle, DeliveryOutcome);

/// Non-blocking handle a transport uses to report delivery outcomes.
///
/// Outcomes queue on a bounded channel and are applied when the host calls
/// [`ObserveServer::process_outcomes`]. A full queue drops the outcome and
/// counts it.
#[derive(Debug, Clone)]
pub struct OutcomeReporter {
    tx: Sender<OutcomeMsg>,
    dropped: Arc<AtomicU64>,
}

impl OutcomeReporter {
    /// Queues an outcome. Returns false if it was dropped.
    pub fn report(&self, handle: DeliveryHandle, outcome: DeliveryOutcome) -> bool {
        match self.tx.try_send((handle, outcome)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

#[derive(Debug, Default)]
struct ResourceTable {
    by_id: HashMap<ResourceId, Arc<Mutex<Resource>>>,
    by_path: HashMap<String, ResourceId>,
}

/// Server-side Observe core.
pub struct ObserveServer {
    cfg: ObserveConfig,
    gate: RegistrationGate,
    policy: ConfirmablePolicy,
    transport: Arc<dyn Transport>,
    resources: RwLock<ResourceTable>,
    supervisor: Mutex<ReliabilitySupervisor>,
    outcome_tx: Sender<OutcomeMsg>,
    outcome_rx: Receiver<OutcomeMsg>,
    dropped_outcomes: Arc<AtomicU64>,
    events_tx: Sender<TimestampedEvent>,
    events_rx: Receiver<TimestampedEvent>,
    dropped_events: AtomicU64,
}

impl std::fmt::Debug for ObserveServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserveServer")
            .field("cfg", &self.cfg)
            .field("dropped_outcomes", &self.dropped_outcomes())
            .field("dropped_events", &self.dropped_events())
            .finish_non_exhaustive()
    }
}

impl ObserveServer {
    /// Builds a server after validating `cfg`.
    pub fn new(cfg: ObserveConfig, transport: Arc<dyn Transport>) -> ObserveResult<Self> {
        cfg.validate()?;

        let (outcome_tx, outcome_rx) = bounded::<OutcomeMsg>(cfg.outcome_queue_capacity.max(1));
        let (events_tx, events_rx) = bounded::<TimestampedEvent>(cfg.event_queue_capacity.max(1));

        Ok(Self {
            gate: RegistrationGate::new(cfg.max_subscribers_per_resource),
            policy: ConfirmablePolicy::from_config(&cfg),
            supervisor: Mutex::new(ReliabilitySupervisor::new(cfg.max_retransmit)),
            cfg,
            transport,
            resources: RwLock::new(ResourceTable::default()),
            outcome_tx,
            outcome_rx,
            dropped_outcomes: Arc::new(AtomicU64::new(0)),
            events_tx,
            events_rx,
            dropped_events: AtomicU64::new(0),
        })
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ObserveConfig {
        &self.cfg
    }

    // ------------------------------------------------------------------
    // Resource table
    // ------------------------------------------------------------------

    /// Registers a resource at `uri_path`.
    pub fn add_resource(
        &self,
        uri_path: &str,
        options: ResourceOptions,
        handler: Arc<dyn ResourceHandler>,
    ) -> ObserveResult<ResourceId> {
        let resource = Resource::new(
            uri_path,
            options,
            self.cfg.default_notification_type,
            self.cfg.sequence_bits,
            handler,
        )?;
        let id = resource.id();
        let path = resource.uri_path().to_string();

        let mut table = self.resources.write().map_err(|_| lock_err("resources"))?;
        if table.by_path.contains_key(&path) {
            return Err(ValidationError::DuplicateUriPath { path }.into());
        }
        table.by_path.insert(path.clone(), id);
        table.by_id.insert(id, Arc::new(Mutex::new(resource)));

        debug!(resource = %path, observable = options.observable, "resource added");
        Ok(id)
    }

    /// Destroys a resource and its whole registry.
    ///
    /// Every remaining subscriber receives a final 4.04 without the Observe
    /// option. Returns the number of subscriptions removed.
    pub fn remove_resource(&self, id: ResourceId) -> ObserveResult<usize> {
        let handle = {
            let mut table = self.resources.write().map_err(|_| lock_err("resources"))?;
            let handle = table
                .by_id
                .remove(&id)
                .ok_or(ExecutionError::ResourceNotFound { id })?;
            table.by_path.retain(|_, v| *v != id);
            handle
        };

        let mut resource = handle.lock().map_err(|_| lock_err("resource"))?;
        let message_type = resource.notification_type().message_type();
        let removed = resource.subscribers.drain();
        for sub in &removed {
            let message =
                OutgoingMessage::from_response(message_type, sub.token.clone(), Response::with_code(ResponseCode::NotFound));
            if let Err(err) = self.transport.send(&sub.session, message) {
                debug!(session = %sub.session, error = %err, "final 4.04 not sent");
            }
        }
        self.supervisor.lock().map_err(|_| lock_err("supervisor"))?.forget_resource(id);

        info!(resource = %resource.uri_path(), removed = removed.len(), "resource removed");
        self.publish(ObserveEvent::ObservationEnded {
            resource: id,
            removed: removed.len(),
        });
        Ok(removed.len())
    }

    /// Looks up a resource handle by URI path.
    #[must_use]
    pub fn resource_by_path(&self, uri_path: &str) -> Option<ResourceId> {
        let table = self.resources.read().ok()?;
        table.by_path.get(&normalize_path(uri_path)).copied()
    }

    /// URI path of a resource, or `None` for an unknown handle.
    #[must_use]
    pub fn get_uri_path(&self, id: ResourceId) -> Option<String> {
        let handle = self.resource(id).ok()?;
        let resource = handle.lock().ok()?;
        Some(resource.uri_path().to_string())
    }

    /// Enables or disables observation. Disabling drops every subscriber.
    pub fn set_observable(&self, id: ResourceId, enabled: bool) -> ObserveResult<()> {
        let handle = self.resource(id)?;
        let mut resource = handle.lock().map_err(|_| lock_err("resource"))?;
        resource.set_observable(enabled);
        if enabled {
            return Ok(());
        }

        let removed = resource.subscribers.drain();
        self.supervisor.lock().map_err(|_| lock_err("supervisor"))?.forget_resource(id);
        if !removed.is_empty() {
            info!(resource = %resource.uri_path(), removed = removed.len(), "observation disabled");
            self.publish(ObserveEvent::ObservationEnded {
                resource: id,
                removed: removed.len(),
            });
        }
        Ok(())
    }

    /// Whether `id` currently accepts observers.
    pub fn is_observable(&self, id: ResourceId) -> ObserveResult<bool> {
        let handle = self.resource(id)?;
        let resource = handle.lock().map_err(|_| lock_err("resource"))?;
        Ok(resource.is_observable())
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// The subscription for (resource, session, token), if any.
    #[must_use]
    pub fn find_subscription(&self, id: ResourceId, session: &SessionId, token: &Token) -> Option<Subscription> {
        let handle = self.resource(id).ok()?;
        let resource = handle.lock().ok()?;
        resource.subscribers.find(session, token).cloned()
    }

    /// Number of observers of `id`.
    pub fn subscriber_count(&self, id: ResourceId) -> ObserveResult<usize> {
        let handle = self.resource(id)?;
        let resource = handle.lock().map_err(|_| lock_err("resource"))?;
        Ok(resource.subscribers.len())
    }

    /// Runs `request` through the Registration Gate only.
    pub fn admit(&self, id: ResourceId, request: &Request) -> ObserveResult<GateDecision> {
        let decision = self.evaluate_gate(id, request)?;
        self.publish_decision(id, request, decision);
        Ok(decision)
    }

    /// Serves a GET: gate, then the resource handler, then the Observe option.
    ///
    /// If the handler fails or answers with a non-2.xx code, a subscription
    /// established by this request is rolled back and no `Established` event
    /// is published for it.
    pub fn handle_get(&self, id: ResourceId, request: &Request) -> ObserveResult<Response> {
        let decision = self.evaluate_gate(id, request)?;
        if !matches!(decision, GateDecision::Established { .. }) {
            self.publish_decision(id, request, decision);
        }
        if let GateDecision::Rejected { code } = decision {
            return Ok(Response::with_code(code));
        }

        let (handler, uri_path) = {
            let handle = self.resource(id)?;
            let resource = handle.lock().map_err(|_| lock_err("resource"))?;
            (resource.handler(), resource.uri_path().to_string())
        };

        let mut response = Response::default();
        let ctx = RequestContext {
            resource: id,
            uri_path: &uri_path,
            session: &request.session,
            token: &request.token,
            query: request.query.as_deref(),
            is_notification: false,
        };
        let outcome = handler.handle_get(&ctx, &mut response);

        if let GateDecision::Established {
            subscription, replaced, ..
        } = decision
        {
            if outcome.is_err() || !response.code.is_success() {
                let handle = self.resource(id)?;
                let mut resource = handle.lock().map_err(|_| lock_err("resource"))?;
                let removed = resource
                    .subscribers
                    .remove_if_current(&request.session, &request.token, subscription);
                drop(resource);
                debug!(resource = %uri_path, token = %request.token, "establish rolled back");
                // The record this request replaced is gone as well.
                if replaced && removed.is_some() {
                    self.publish(ObserveEvent::Evicted {
                        resource: id,
                        session: request.session.clone(),
                        token: request.token.clone(),
                        reason: EvictionReason::ErrorResponse,
                    });
                }
                outcome?;
                return Ok(response);
            }
            self.publish_decision(id, request, decision);
        }

        outcome?;
        response.observe = if response.code.is_success() {
            decision.observe_option()
        } else {
            None
        };
        Ok(response)
    }

    fn evaluate_gate(&self, id: ResourceId, request: &Request) -> ObserveResult<GateDecision> {
        let handle = self.resource(id)?;
        let mut resource = handle.lock().map_err(|_| lock_err("resource"))?;
        let decision = self.gate.evaluate(&mut resource, request);
        if let GateDecision::Cancelled { removed: true } = decision {
            self.supervisor
                .lock()
                .map_err(|_| lock_err("supervisor"))?
                .forget_subscriber(id, &request.session, &request.token);
        }
        Ok(decision)
    }

    fn publish_decision(&self, id: ResourceId, request: &Request, decision: GateDecision) {
        match decision {
            GateDecision::Established { sequence, replaced, .. } => {
                self.publish(ObserveEvent::Established {
                    resource: id,
                    session: request.session.clone(),
                    token: request.token.clone(),
                    sequence,
                    replaced,
                });
            }
            GateDecision::Cancelled { removed: true } => {
                self.publish(ObserveEvent::Cancelled {
                    resource: id,
                    session: request.session.clone(),
                    token: request.token.clone(),
                });
            }
            _ => {}
        }
    }

    /// Removes every subscription held by `session` across all resources.
    pub fn session_closed(&self, session: &SessionId) -> ObserveResult<usize> {
        let handles: Vec<Arc<Mutex<Resource>>> = {
            let table = self.resources.read().map_err(|_| lock_err("resources"))?;
            table.by_id.values().cloned().collect()
        };

        let mut removed = 0;
        for handle in handles {
            let mut resource = handle.lock().map_err(|_| lock_err("resource"))?;
            removed += resource.subscribers.remove_all_for_session(session).len();
        }
        self.supervisor.lock().map_err(|_| lock_err("supervisor"))?.forget_session(session);

        debug!(session = %session, removed, "session closed");
        self.publish(ObserveEvent::SessionClosed {
            session: session.clone(),
            removed,
        });
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Fans a change of `id` out to matching subscribers.
    ///
    /// A `None` query reaches only subscribers registered without a query.
    pub fn notify(&self, id: ResourceId, query: Option<&str>) -> ObserveResult<DispatchReport> {
        let handle = self.resource(id)?;
        let dispatcher = NotificationDispatcher::new(self.transport.as_ref(), &self.supervisor, self.policy);
        let report = dispatcher.notify(&handle, query)?;

        for target in &report.ended {
            self.publish(ObserveEvent::Evicted {
                resource: target.resource,
                session: target.session.clone(),
                token: target.token.clone(),
                reason: EvictionReason::ErrorResponse,
            });
        }
        Ok(report)
    }

    /// Application entry point for "resource state changed".
    pub fn mark_changed(&self, id: ResourceId, query: Option<&str>) -> ObserveResult<DispatchReport> {
        self.notify(id, query)
    }

    // ------------------------------------------------------------------
    // Delivery outcomes
    // ------------------------------------------------------------------

    /// Applies one transport outcome.
    pub fn on_delivery_outcome(&self, handle: DeliveryHandle, outcome: DeliveryOutcome) -> ObserveResult<Verdict> {
        let verdict = self
            .supervisor
            .lock()
            .map_err(|_| lock_err("supervisor"))?
            .on_outcome(handle, outcome);
        self.apply_verdict(handle, &verdict)?;
        Ok(verdict)
    }

    fn apply_verdict(&self, handle: DeliveryHandle, verdict: &Verdict) -> ObserveResult<()> {
        match verdict {
            Verdict::Unknown => {}
            Verdict::Retrying { target, attempts } => {
                debug!(handle = %handle, session = %target.session, attempts, "notification retransmitted");
            }
            Verdict::Delivered { target, .. } => {
                // The resource may have been removed meanwhile.
                let Ok(res) = self.resource(target.resource) else {
                    return Ok(());
                };
                let mut resource = res.lock().map_err(|_| lock_err("resource"))?;
                if let Some(sub) = resource
                    .subscribers
                    .find_current_mut(&target.session, &target.token, target.subscription)
                {
                    sub.pending_confirmations = sub.pending_confirmations.saturating_sub(1);
                }
            }
            Verdict::Evict { target, reason } => {
                let Ok(res) = self.resource(target.resource) else {
                    return Ok(());
                };
                let mut resource = res.lock().map_err(|_| lock_err("resource"))?;
                let removed = resource
                    .subscribers
                    .remove_if_current(&target.session, &target.token, target.subscription);
                if removed.is_some() {
                    info!(
                        resource = %resource.uri_path(),
                        session = %target.session,
                        token = %target.token,
                        reason = ?reason,
                        "observer evicted"
                    );
                    drop(resource);
                    self.publish(ObserveEvent::Evicted {
                        resource: target.resource,
                        session: target.session.clone(),
                        token: target.token.clone(),
                        reason: *reason,
                    });
                }
            }
        }
        Ok(())
    }

    /// A reporter transports can use from their own loop.
    #[must_use]
    pub fn outcome_reporter(&self) -> OutcomeReporter {
        OutcomeReporter {
            tx: self.outcome_tx.clone(),
            dropped: Arc::clone(&self.dropped_outcomes),
        }
    }

    /// Applies every queued outcome without blocking. Returns how many were applied.
    pub fn process_outcomes(&self) -> ObserveResult<usize> {
        let mut applied = 0;
        loop {
            match self.outcome_rx.try_recv() {
                Ok((handle, outcome)) => {
                    self.on_delivery_outcome(handle, outcome)?;
                    applied += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Ok(applied),
            }
        }
    }

    /// Confirmable notifications awaiting an outcome.
    pub fn in_flight(&self) -> ObserveResult<usize> {
        Ok(self.supervisor.lock().map_err(|_| lock_err("supervisor"))?.in_flight_len())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Receiver for lifecycle events. All clones share one queue.
    #[must_use]
    pub fn events(&self) -> Receiver<TimestampedEvent> {
        self.events_rx.clone()
    }

    /// Lifecycle events dropped because the queue was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Delivery outcomes dropped because the queue was full.
    #[must_use]
    pub fn dropped_outcomes(&self) -> u64 {
        self.dropped_outcomes.load(Ordering::Relaxed)
    }

    fn publish(&self, event: ObserveEvent) {
        // Never block the caller: drop if nobody is draining.
        match self.events_tx.try_send(TimestampedEvent::now(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn resource(&self, id: ResourceId) -> ObserveResult<Arc<Mutex<Resource>>> {
        let table = self.resources.read().map_err(|_| lock_err("resources"))?;
        table
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| ObserveError::from(ExecutionError::ResourceNotFound { id }))
    }
}
