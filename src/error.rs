//! Error types for the Observe core.
//!
//! Errors are strongly typed using thiserror and layered the same way for
//! every component: input validation, execution against server state, and
//! failures reported by the two collaborators (transport and resource
//! handlers). No error in this crate is fatal to the hosting server.

use thiserror::Error;

use crate::resource::ResourceId;

/// Validation errors that occur during input validation.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Token length {len} exceeds the maximum of 8 bytes")]
    TokenTooLong {
        len: usize,
    },

    #[error("Sequence width {bits} is outside the supported range 1..=24")]
    InvalidSequenceWidth {
        bits: u8,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("URI path cannot be empty")]
    EmptyUriPath,

    #[error("A resource is already registered at '{path}'")]
    DuplicateUriPath {
        path: String,
    },
}

/// Execution errors that occur while operating on server state.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Resource not found: {id}")]
    ResourceNotFound {
        id: ResourceId,
    },

    #[error("Lock poisoned: {context}")]
    LockPoisoned {
        context: &'static str,
    },
}

/// Failures reported by the transport collaborator when initiating a send.
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Session is closed: {session}")]
    SessionClosed {
        session: String,
    },

    #[error("Send failed: {message}")]
    SendFailed {
        message: String,
    },
}

/// Failure raised by a resource handler while building a response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Handler failed: {message}")]
pub struct HandlerError {
    /// Handler-specific description.
    pub message: String,
}

impl HandlerError {
    /// Creates a handler error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Top-level error type for the Observe core.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ObserveError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl ObserveError {
    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if the error refers to a resource handle that does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::ResourceNotFound { .. }))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if this is a handler error.
    #[must_use]
    pub const fn is_handler(&self) -> bool {
        matches!(self, Self::Handler(_))
    }
}

/// Result type alias for Observe operations.
pub type ObserveResult<T> = Result<T, ObserveError>;

pub(crate) fn lock_err(context: &'static str) -> ObserveError {
    ObserveError::Execution(ExecutionError::LockPoisoned { context })
}
