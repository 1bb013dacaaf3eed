//! Message-level types shared with the wire and transport collaborators.
//!
//! Parsing and serialization live outside this crate. These types carry only
//! what the Observe core reads from an incoming request and what it hands to
//! the transport for an outgoing notification.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Maximum token length permitted by RFC 7252.
pub const MAX_TOKEN_LEN: usize = 8;

/// Observe option value that registers an observer.
pub const OBSERVE_ESTABLISH: u32 = 0;

/// Observe option value that deregisters an observer.
pub const OBSERVE_CANCEL: u32 = 1;

/// Client-chosen request token, echoed on every notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct Token(Vec<u8>);

impl Token {
    /// Creates a token, rejecting anything longer than 8 bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, ValidationError> {
        let bytes = bytes.into();
        if bytes.len() > MAX_TOKEN_LEN {
            return Err(ValidationError::TokenTooLong { len: bytes.len() });
        }
        Ok(Self(bytes))
    }

    /// The zero-length token.
    #[must_use]
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// Raw token bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Token length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the zero-length token.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<u8>> for Token {
    type Error = ValidationError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        Self::new(bytes)
    }
}

impl From<Token> for Vec<u8> {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

/// Opaque identity of the peer endpoint a subscription belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps a transport-specific peer identity.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<SocketAddr> for SessionId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request method codes the gate needs to tell apart.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Fetch,
}

/// CoAP message type of an outgoing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Requires an acknowledgement and is retransmitted until one arrives.
    Confirmable,
    /// Fire-and-forget.
    NonConfirmable,
}

/// Response codes produced or inspected by the Observe core.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    Content,
    Valid,
    Changed,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    ServiceUnavailable,
    InternalServerError,
}

impl ResponseCode {
    /// Class and detail digits, e.g. `(2, 5)` for 2.05 Content.
    #[must_use]
    pub const fn class_detail(self) -> (u8, u8) {
        match self {
            Self::Content => (2, 5),
            Self::Valid => (2, 3),
            Self::Changed => (2, 4),
            Self::BadRequest => (4, 0),
            Self::NotFound => (4, 4),
            Self::MethodNotAllowed => (4, 5),
            Self::InternalServerError => (5, 0),
            Self::ServiceUnavailable => (5, 3),
        }
    }

    /// True for 2.xx codes.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.class_detail().0 == 2
    }
}

impl Default for ResponseCode {
    fn default() -> Self {
        Self::Content
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (class, detail) = self.class_detail();
        write!(f, "{class}.{detail:02}")
    }
}

/// Interpretation of the Observe option on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveAction {
    /// Value 0: register as an observer.
    Establish,
    /// Value 1: deregister.
    Cancel,
}

impl ObserveAction {
    /// Maps a raw Observe option value. Unknown values are ignored.
    #[must_use]
    pub const fn from_option(value: u32) -> Option<Self> {
        match value {
            OBSERVE_ESTABLISH => Some(Self::Establish),
            OBSERVE_CANCEL => Some(Self::Cancel),
            _ => None,
        }
    }
}

/// The parts of an incoming request the Registration Gate inspects.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub session: SessionId,
    pub token: Token,
    /// Raw Observe option value, if present.
    pub observe: Option<u32>,
    pub query: Option<String>,
}

impl Request {
    /// A plain GET without the Observe option.
    #[must_use]
    pub fn get(session: impl Into<SessionId>, token: Token) -> Self {
        Self {
            method: Method::Get,
            session: session.into(),
            token,
            observe: None,
            query: None,
        }
    }

    /// Sets the Observe option value.
    #[must_use]
    pub fn with_observe(mut self, value: u32) -> Self {
        self.observe = Some(value);
        self
    }

    /// Sets the query string.
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// The decoded Observe action, if any.
    #[must_use]
    pub fn observe_action(&self) -> Option<ObserveAction> {
        self.observe.and_then(ObserveAction::from_option)
    }
}

/// Response body and options produced by a resource handler.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    pub code: ResponseCode,
    pub payload: Vec<u8>,
    pub content_format: Option<u16>,
    pub max_age: Option<u32>,
    /// Observe option value to attach; set by the core, never by handlers.
    pub observe: Option<u32>,
}

impl Response {
    /// An empty response carrying `code`.
    #[must_use]
    pub fn with_code(code: ResponseCode) -> Self {
        Self {
            code,
            ..Self::default()
        }
    }
}

/// A fully assembled notification handed to the transport.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub message_type: MessageType,
    pub token: Token,
    pub code: ResponseCode,
    pub observe: Option<u32>,
    pub content_format: Option<u16>,
    pub max_age: Option<u32>,
    pub payload: Vec<u8>,
}

impl OutgoingMessage {
    /// Wraps a handler response for delivery.
    #[must_use]
    pub fn from_response(message_type: MessageType, token: Token, response: Response) -> Self {
        Self {
            message_type,
            token,
            code: response.code,
            observe: response.observe,
            content_format: response.content_format,
            max_age: response.max_age,
            payload: response.payload,
        }
    }

    /// True when the peer must acknowledge the message.
    #[must_use]
    pub const fn is_confirmable(&self) -> bool {
        matches!(self.message_type, MessageType::Confirmable)
    }
}
