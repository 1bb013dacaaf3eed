//! # coap-observe - Server-side CoAP Observe core
//!
//! Lets CoAP clients subscribe to a resource and receive push notifications
//! when its state changes (RFC 7641), without re-polling. Message parsing,
//! socket I/O, retransmission timers, and request routing stay with the
//! hosting server; this crate owns the observer state in between.
//!
//! ## Core Concepts
//!
//! - **Subscription**: one client's observation of one resource, keyed by
//!   (resource, session, token)
//! - **Registration Gate**: interprets the Observe option on GET requests
//! - **Sequence Generator**: per-resource, wraparound-safe Observe values
//! - **Notification Dispatcher**: turns a change signal into one synthetic GET
//!   per matching subscriber
//! - **Reliability Supervisor**: evicts observers whose confirmable
//!   notifications are never acknowledged
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use coap_observe::{ObserveConfig, ObserveServer, Request, ResourceOptions, Token};
//!
//! let server = ObserveServer::new(ObserveConfig::default(), Arc::new(my_transport))?;
//! let time = server.add_resource("time", ResourceOptions::observable(), Arc::new(time_handler))?;
//!
//! // Incoming GET with Observe: 0
//! let response = server.handle_get(time, &Request::get(peer, Token::new(vec![0x01])?).with_observe(0))?;
//!
//! // Later, when the clock ticks
//! server.mark_changed(time, None)?;
//!
//! // From the I/O loop, after ACK/RST/timeouts were queued by the transport
//! server.process_outcomes()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod message;
pub mod observe;
pub mod resource;
pub mod server;
pub mod transport;

// Re-export primary types at crate root for convenience
pub use config::{NotificationType, ObserveConfig, ResourceOptions};
pub use error::{ExecutionError, HandlerError, ObserveError, ObserveResult, TransportError, ValidationError};
pub use message::{
	Method, MessageType, ObserveAction, OutgoingMessage, Request, Response, ResponseCode, SessionId,
	Token,
};
pub use observe::{
	DispatchReport, EvictionReason, GateDecision, ObserveEvent, SequenceGenerator, Subscription,
	SubscriptionId, TimestampedEvent, Verdict,
};
pub use resource::{RequestContext, ResourceHandler, ResourceId};
pub use server::{ObserveServer, OutcomeReporter};
pub use transport::{DeliveryHandle, DeliveryOutcome, Transport};
