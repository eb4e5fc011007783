//! Order model and lifecycle states.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    /// Buy to open or add.
    Buy,
    /// Sell to reduce or close.
    Sell,
}

impl OrderSide {
    /// The side that offsets this one.
    #[must_use]
    pub const fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// Execute immediately at the market.
    Market,
    /// Execute at the limit price or better.
    Limit,
    /// Becomes a market order once the stop price trades.
    Stop,
    /// Becomes a limit order once the stop price trades.
    StopLimit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::Stop => write!(f, "STOP"),
            Self::StopLimit => write!(f, "STOP_LIMIT"),
        }
    }
}

/// Order lifecycle state.
///
/// Terminal states have no outgoing transitions; the state machine in
/// `crate::orders` enforces the full transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Created locally, not yet acknowledged by the broker.
    Pending,
    /// Acknowledged by the broker, resting or working.
    Submitted,
    /// Some quantity filled, remainder still working.
    PartiallyFilled,
    /// Completely filled.
    Filled,
    /// Cancelled before completion.
    Cancelled,
    /// Rejected locally or by the broker.
    Rejected,
    /// Expired (TTL or venue session end).
    Expired,
}

impl OrderStatus {
    /// Returns true if the order is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Rejected | Self::Expired
        )
    }

    /// Returns true if the order is still working at the broker.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Submitted | Self::PartiallyFilled)
    }

    /// Returns true if the order can receive fills.
    #[must_use]
    pub const fn can_fill(&self) -> bool {
        matches!(self, Self::Submitted | Self::PartiallyFilled)
    }

    /// Returns true if the order can be cancelled.
    #[must_use]
    pub const fn is_cancelable(&self) -> bool {
        matches!(self, Self::Submitted | Self::PartiallyFilled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// An order owned by the state machine.
///
/// All other components reference orders by `client_order_id`; the state
/// machine is the single writer of every field below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Locally assigned id, unique across all time (idempotency key).
    pub client_order_id: String,
    /// Instrument symbol.
    pub symbol: String,
    /// Buy or sell.
    pub side: OrderSide,
    /// Market, limit, stop, stop-limit.
    pub order_type: OrderType,
    /// Requested quantity.
    pub requested_qty: Decimal,
    /// Limit price, for limit and stop-limit orders.
    pub limit_price: Option<Decimal>,
    /// Time-to-live for resting limit orders, in seconds.
    pub ttl_seconds: Option<u64>,
    /// Strategy that produced the order.
    pub strategy_id: String,
    /// Creation time (from the clock port).
    pub created_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: OrderStatus,
    /// Broker-assigned id, set on acknowledgment.
    pub broker_order_id: Option<String>,
    /// Cumulative filled quantity.
    pub filled_qty: Decimal,
    /// Volume-weighted average fill price.
    pub avg_fill_price: Decimal,
    /// Cumulative commission.
    pub commission: Decimal,
    /// When the broker acknowledged the order.
    pub submitted_at: Option<DateTime<Utc>>,
    /// When the order completed filling.
    pub filled_at: Option<DateTime<Utc>>,
    /// When the order was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Human-readable status detail (rejection reason, cancel reason).
    pub status_message: String,
}

impl Order {
    /// Quantity still unfilled.
    #[must_use]
    pub fn remaining_qty(&self) -> Decimal {
        self.requested_qty - self.filled_qty
    }

    /// Notional value of the requested quantity at a reference price.
    #[must_use]
    pub fn notional_at(&self, price: Decimal) -> Decimal {
        self.requested_qty * price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_order(status: OrderStatus, requested: Decimal, filled: Decimal) -> Order {
        Order {
            client_order_id: "vwap-SPY-1700000000000-abcd1234".to_string(),
            symbol: "SPY".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            requested_qty: requested,
            limit_price: Some(dec!(450.00)),
            ttl_seconds: Some(90),
            strategy_id: "vwap".to_string(),
            created_at: Utc::now(),
            status,
            broker_order_id: None,
            filled_qty: filled,
            avg_fill_price: Decimal::ZERO,
            commission: Decimal::ZERO,
            submitted_at: None,
            filled_at: None,
            cancelled_at: None,
            status_message: String::new(),
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Submitted.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
    }

    #[test]
    fn open_states() {
        assert!(OrderStatus::Submitted.is_open());
        assert!(OrderStatus::PartiallyFilled.is_open());
        assert!(!OrderStatus::Pending.is_open());
        assert!(!OrderStatus::Filled.is_open());
    }

    #[test]
    fn can_fill_states() {
        assert!(OrderStatus::Submitted.can_fill());
        assert!(OrderStatus::PartiallyFilled.can_fill());
        assert!(!OrderStatus::Pending.can_fill());
        assert!(!OrderStatus::Cancelled.can_fill());
    }

    #[test]
    fn side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn remaining_quantity() {
        let order = make_order(OrderStatus::PartiallyFilled, dec!(10), dec!(4));
        assert_eq!(order.remaining_qty(), dec!(6));
    }

    #[test]
    fn status_serde_wire_strings() {
        let json = serde_json::to_string(&OrderStatus::PartiallyFilled).unwrap();
        assert_eq!(json, "\"PARTIALLY_FILLED\"");

        let parsed: OrderStatus = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(parsed, OrderStatus::Cancelled);
    }

    #[test]
    fn status_display() {
        assert_eq!(format!("{}", OrderStatus::Pending), "PENDING");
        assert_eq!(
            format!("{}", OrderStatus::PartiallyFilled),
            "PARTIALLY_FILLED"
        );
        assert_eq!(format!("{}", OrderStatus::Expired), "EXPIRED");
    }
}
