//! Configuration for the Observe core.
//!
//! Every field has a default; a JSON document only needs to name the fields it
//! overrides. Values are validated once, when the server is built.

use serde::{Deserialize, Serialize};

use crate::error::{ObserveResult, ValidationError};
use crate::message::MessageType;

/// Widest sequence space the 3-byte Observe option can carry.
pub const MAX_SEQUENCE_BITS: u8 = 24;

/// How a resource delivers its notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationType {
    /// Every notification must be acknowledged (CON).
    #[serde(rename = "confirmable-notifications")]
    Confirmable,
    /// Fire-and-forget (NON).
    #[serde(rename = "non-confirmable-notifications")]
    NonConfirmable,
}

impl NotificationType {
    /// CoAP message type used for notifications of this kind.
    #[must_use]
    pub const fn message_type(self) -> MessageType {
        match self {
            Self::Confirmable => MessageType::Confirmable,
            Self::NonConfirmable => MessageType::NonConfirmable,
        }
    }
}

impl Default for NotificationType {
    fn default() -> Self {
        Self::NonConfirmable
    }
}

/// Server-wide Observe settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserveConfig {
    /// Width of the Observe sequence space in bits.
    pub sequence_bits: u8,
    /// Retransmissions allowed for a CON notification before the subscriber is evicted.
    pub max_retransmit: u32,
    /// Consecutive NON notifications to one subscriber before a CON is forced (0 disables).
    pub max_consecutive_non: u32,
    /// Maximum seconds between CON notifications to one subscriber (0 disables).
    pub confirmable_refresh_secs: u64,
    /// Establish requests beyond this count are served without observation.
    pub max_subscribers_per_resource: usize,
    /// Capacity of the delivery outcome channel.
    pub outcome_queue_capacity: usize,
    /// Capacity of the observe event channel.
    pub event_queue_capacity: usize,
    /// Notification type for resources that do not choose one.
    pub default_notification_type: NotificationType,
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self {
            sequence_bits: MAX_SEQUENCE_BITS,
            max_retransmit: 4,
            max_consecutive_non: 5,
            confirmable_refresh_secs: 24 * 60 * 60,
            max_subscribers_per_resource: 1024,
            outcome_queue_capacity: 1024,
            event_queue_capacity: 1024,
            default_notification_type: NotificationType::NonConfirmable,
        }
    }
}

impl ObserveConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json_str(json: &str) -> ObserveResult<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sequence_bits == 0 || self.sequence_bits > MAX_SEQUENCE_BITS {
            return Err(ValidationError::InvalidSequenceWidth {
                bits: self.sequence_bits,
            });
        }
        if self.max_subscribers_per_resource == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "max_subscribers_per_resource must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Per-resource settings supplied at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceOptions {
    /// Whether observers may register.
    pub observable: bool,
    /// Overrides the server default when set.
    pub notification_type: Option<NotificationType>,
}

impl ResourceOptions {
    /// Options for an observable resource using the server default notification type.
    #[must_use]
    pub const fn observable() -> Self {
        Self {
            observable: true,
            notification_type: None,
        }
    }

    /// Sets the notification type.
    #[must_use]
    pub const fn with_notification_type(mut self, notification_type: NotificationType) -> Self {
        self.notification_type = Some(notification_type);
        self
    }
}
