//! Resources as seen by the Observe core.
//!
//! The resource tree and request routing belong to the hosting server. The
//! core only needs each resource's identity, its observe settings, the
//! handler capability used to build GET responses, and the per-resource
//! sequence counter and subscriber registry it owns.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{NotificationType, ResourceOptions};
use crate::error::{HandlerError, ValidationError};
use crate::message::{Response, SessionId, Token};
use crate::observe::registry::SubscriberRegistry;
use crate::observe::sequence::SequenceGenerator;

/// Handle to a registered resource.
///
/// Handles are never reused: re-creating a resource at the same path yields a
/// new handle and a fresh sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Creates a new random resource ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a handler sees when asked to build a GET response.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub resource: ResourceId,
    pub uri_path: &'a str,
    pub session: &'a SessionId,
    pub token: &'a Token,
    pub query: Option<&'a str>,
    /// True when the request is synthesized for a notification.
    pub is_notification: bool,
}

/// Response-generation capability of a resource.
///
/// The same implementation serves real GET requests and the synthetic GETs
/// issued for notifications, so both paths produce identical representations.
pub trait ResourceHandler: Send + Sync {
    /// Fills `response` for a GET on the resource.
    fn handle_get(&self, ctx: &RequestContext<'_>, response: &mut Response) -> Result<(), HandlerError>;
}

impl<F> ResourceHandler for F
where
    F: Fn(&RequestContext<'_>, &mut Response) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle_get(&self, ctx: &RequestContext<'_>, response: &mut Response) -> Result<(), HandlerError> {
        self(ctx, response)
    }
}

/// A resource together with its observe state.
pub struct Resource {
    id: ResourceId,
    uri_path: String,
    observable: bool,
    notification_type: NotificationType,
    handler: Arc<dyn ResourceHandler>,
    pub(crate) sequence: SequenceGenerator,
    pub(crate) subscribers: SubscriberRegistry,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("uri_path", &self.uri_path)
            .field("observable", &self.observable)
            .field("notification_type", &self.notification_type)
            .field("sequence", &self.sequence)
            .field("subscribers", &self.subscribers.len())
            .finish_non_exhaustive()
    }
}

impl Resource {
    /// Builds a resource; `default_type` applies when `options` leaves the
    /// notification type unset.
    pub fn new(
        uri_path: impl Into<String>,
        options: ResourceOptions,
        default_type: NotificationType,
        sequence_bits: u8,
        handler: Arc<dyn ResourceHandler>,
    ) -> Result<Self, ValidationError> {
        let uri_path = normalize_path(&uri_path.into());
        if uri_path.is_empty() {
            return Err(ValidationError::EmptyUriPath);
        }

        Ok(Self {
            id: ResourceId::new(),
            uri_path,
            observable: options.observable,
            notification_type: options.notification_type.unwrap_or(default_type),
            handler,
            sequence: SequenceGenerator::new(sequence_bits)?,
            subscribers: SubscriberRegistry::new(),
        })
    }

    /// Handle of this resource.
    #[must_use]
    pub const fn id(&self) -> ResourceId {
        self.id
    }

    /// Normalized URI path.
    #[must_use]
    pub fn uri_path(&self) -> &str {
        &self.uri_path
    }

    /// Whether observers may register.
    #[must_use]
    pub const fn is_observable(&self) -> bool {
        self.observable
    }

    pub(crate) fn set_observable(&mut self, enabled: bool) {
        self.observable = enabled;
    }

    /// Effective notification type.
    #[must_use]
    pub const fn notification_type(&self) -> NotificationType {
        self.notification_type
    }

    /// Shared handle to the response handler.
    #[must_use]
    pub fn handler(&self) -> Arc<dyn ResourceHandler> {
        Arc::clone(&self.handler)
    }

    /// Most recently issued Observe value.
    #[must_use]
    pub const fn current_sequence(&self) -> u32 {
        self.sequence.current()
    }

    /// Read access to the subscriber registry.
    #[must_use]
    pub fn subscribers(&self) -> &SubscriberRegistry {
        &self.subscribers
    }

    /// Runs the handler for a request on this resource.
    pub fn invoke_handler(
        &self,
        session: &SessionId,
        token: &Token,
        query: Option<&str>,
        is_notification: bool,
        response: &mut Response,
    ) -> Result<(), HandlerError> {
        let ctx = RequestContext {
            resource: self.id,
            uri_path: &self.uri_path,
            session,
            token,
            query,
            is_notification,
        };
        self.handler.handle_get(&ctx, response)
    }
}

/// Strips leading and trailing slashes so `/time` and `time` name the same resource.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    path.trim().trim_matches('/').to_string()
}
