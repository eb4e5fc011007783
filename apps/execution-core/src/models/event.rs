//! Journal events — the append-only audit record of every mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of journal event.
///
/// The serialized string is part of the wire contract consumed by
/// downstream tooling; variants must never be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Order accepted for submission to the broker.
    OrderSubmit,
    /// Broker acknowledged the order.
    OrderAck,
    /// A fill (partial or final) was applied.
    OrderFill,
    /// Order cancelled.
    OrderCancel,
    /// Order rejected locally or by the broker.
    OrderReject,
    /// Order expired.
    OrderExpire,
    /// Position opened.
    PositionOpen,
    /// Position size or basis changed.
    PositionUpdate,
    /// Position closed, P&L realized.
    PositionClose,
    /// A protection tripped.
    ProtectionTrigger,
    /// Reconciliation found a delta against the broker.
    ReconcileDelta,
    /// The process halted.
    Halt,
}

impl EventType {
    /// Returns true if the event is keyed by a client order id.
    #[must_use]
    pub const fn is_order_event(&self) -> bool {
        matches!(
            self,
            Self::OrderSubmit
                | Self::OrderAck
                | Self::OrderFill
                | Self::OrderCancel
                | Self::OrderReject
                | Self::OrderExpire
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OrderSubmit => "ORDER_SUBMIT",
            Self::OrderAck => "ORDER_ACK",
            Self::OrderFill => "ORDER_FILL",
            Self::OrderCancel => "ORDER_CANCEL",
            Self::OrderReject => "ORDER_REJECT",
            Self::OrderExpire => "ORDER_EXPIRE",
            Self::PositionOpen => "POSITION_OPEN",
            Self::PositionUpdate => "POSITION_UPDATE",
            Self::PositionClose => "POSITION_CLOSE",
            Self::ProtectionTrigger => "PROTECTION_TRIGGER",
            Self::ReconcileDelta => "RECONCILE_DELTA",
            Self::Halt => "HALT",
        };
        write!(f, "{s}")
    }
}

/// One immutable journal record.
///
/// Order events are identified by `(event_type, client_order_id)`; all
/// other events by `(event_type, logged_at)`. One event serializes to one
/// JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Kind of event.
    pub event_type: EventType,
    /// Append timestamp (from the clock port).
    pub logged_at: DateTime<Utc>,
    /// Client order id, for order events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    /// Event-specific payload.
    pub payload: Value,
}

impl Event {
    /// Build an order event keyed by client order id.
    #[must_use]
    pub fn order(
        event_type: EventType,
        logged_at: DateTime<Utc>,
        client_order_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_type,
            logged_at,
            client_order_id: Some(client_order_id.into()),
            payload,
        }
    }

    /// Build a non-order event keyed by timestamp.
    #[must_use]
    pub const fn system(event_type: EventType, logged_at: DateTime<Utc>, payload: Value) -> Self {
        Self {
            event_type,
            logged_at,
            client_order_id: None,
            payload,
        }
    }
}
