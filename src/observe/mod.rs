//! OBSERVE subsystem (RFC 7641).
//!
//! Components, leaf first: the subscription record, the per-resource
//! subscriber registry, the sequence generator, the registration gate that
//! interprets the Observe option, the notification dispatcher that fans a
//! change out as synthetic GETs, and the reliability supervisor that prunes
//! observers whose confirmable notifications go unanswered.

/// Notification fan-out.
pub mod dispatcher;
/// Lifecycle events for the host application.
pub mod events;
/// Observe option handling on incoming requests.
pub mod gate;
/// Per-resource subscriber storage.
pub mod registry;
/// CON delivery tracking and eviction.
pub mod reliability;
/// Observe sequence numbers.
pub mod sequence;
/// Subscription record types.
pub mod subscription;

pub use dispatcher::{ConfirmablePolicy, DispatchReport, NotificationDispatcher};
pub use events::{ObserveEvent, TimestampedEvent};
pub use gate::{GateDecision, RegistrationGate};
pub use registry::{MatchCursor, SubscriberRegistry};
pub use reliability::{DeliveryState, DeliveryTarget, EvictionReason, ReliabilitySupervisor, Verdict};
pub use sequence::{is_fresh, is_newer, SequenceGenerator};
pub use subscription::{SubscriberKey, Subscription, SubscriptionId};
