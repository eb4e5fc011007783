//! Broker port (driven port).
//!
//! The core talks to any venue through this trait. Implementations may
//! block, fail transiently (retriable), or fail permanently; they are
//! expected to honor an externally supplied rate-limit contract. Fill and
//! status updates arrive as [`OrderUpdate`] messages on a channel drained
//! by the runtime thread, so the state machine and tracker are never
//! touched from an I/O thread.

mod mock;
mod retry;

pub use mock::MockBroker;
pub use retry::{BackoffCalculator, RetryPolicy, RetryingBroker};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Fill, OrderSide, OrderStatus, OrderType};

/// Request to submit an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSpec {
    /// Client order id (idempotency key at the venue).
    pub client_order_id: String,
    /// Instrument symbol.
    pub symbol: String,
    /// Buy or sell.
    pub side: OrderSide,
    /// Order type.
    pub order_type: OrderType,
    /// Quantity, already validated and rounded.
    pub quantity: Decimal,
    /// Limit price, for limit and stop-limit orders.
    pub limit_price: Option<Decimal>,
}

/// An order open at the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    /// Broker-assigned id.
    pub broker_order_id: String,
    /// Client order id echoed back, when the venue preserves it.
    pub client_order_id: Option<String>,
    /// Instrument symbol.
    pub symbol: String,
    /// Buy or sell.
    pub side: OrderSide,
    /// Order type.
    pub order_type: OrderType,
    /// Requested quantity.
    pub quantity: Decimal,
    /// Filled quantity so far.
    pub filled_qty: Decimal,
    /// When the venue accepted the order.
    pub created_at: DateTime<Utc>,
}

/// A position as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    /// Instrument symbol.
    pub symbol: String,
    /// Signed quantity.
    pub qty: Decimal,
    /// Average entry price.
    pub avg_entry_price: Decimal,
}

/// Account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Total equity.
    pub equity: Decimal,
    /// Settled cash.
    pub cash: Decimal,
    /// Buying power.
    pub buying_power: Decimal,
    /// Day trades used in the rolling window.
    pub day_trade_count: u32,
}

/// Fill or lifecycle update pushed by the broker adapter.
///
/// Adapters marshal these onto a channel; only the runtime thread applies
/// them.
#[derive(Debug, Clone)]
pub enum OrderUpdate {
    /// An execution against a working order.
    Fill {
        /// Client order id.
        client_order_id: String,
        /// The execution.
        fill: Fill,
    },
    /// A lifecycle change without an execution.
    Status {
        /// Client order id.
        client_order_id: String,
        /// New status.
        status: OrderStatus,
        /// Optional venue-supplied detail.
        reason: Option<String>,
    },
}

/// Broker port error taxonomy.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Transient failure (5xx, connection reset); safe to retry.
    #[error("transient broker error: {message}")]
    Transient {
        /// Failure detail.
        message: String,
    },

    /// Rate limited; safe to retry after backoff.
    #[error("rate limited by broker")]
    RateLimited,

    /// The call timed out; the request may or may not have executed.
    #[error("broker call timed out after {seconds}s")]
    Timeout {
        /// Configured timeout.
        seconds: u64,
    },

    /// Permanent failure (auth, invalid parameters, rejection).
    #[error("permanent broker error: {reason}")]
    Permanent {
        /// Failure detail.
        reason: String,
    },

    /// Order not found at the venue.
    #[error("order not found at broker: {broker_order_id}")]
    OrderNotFound {
        /// The missing id.
        broker_order_id: String,
    },
}

impl BrokerError {
    /// Returns true for errors that a retry might resolve.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::RateLimited | Self::Timeout { .. }
        )
    }

    /// Returns true when retrying a *submit* cannot double-execute.
    ///
    /// A timeout leaves the original request in an unknown state, so
    /// submits are never retried through one; reconciliation resolves the
    /// uncertainty on the next cycle.
    #[must_use]
    pub const fn is_safe_to_retry_submit(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited)
    }
}

/// Port for broker interactions.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Submit an order; returns the broker-assigned id.
    async fn submit(&self, spec: &OrderSpec) -> Result<String, BrokerError>;

    /// Cancel an order. `Ok(false)` means the order was already terminal
    /// at the venue; local state is left for reconciliation.
    async fn cancel(&self, broker_order_id: &str) -> Result<bool, BrokerError>;

    /// All orders currently open at the venue.
    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError>;

    /// All positions held at the venue.
    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    /// Account snapshot.
    async fn get_account(&self) -> Result<AccountSnapshot, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retriable() {
        assert!(BrokerError::Transient {
            message: "503".to_string()
        }
        .is_retriable());
        assert!(BrokerError::RateLimited.is_retriable());
        assert!(BrokerError::Timeout { seconds: 5 }.is_retriable());
    }

    #[test]
    fn permanent_errors_are_not_retriable() {
        assert!(!BrokerError::Permanent {
            reason: "bad auth".to_string()
        }
        .is_retriable());
        assert!(!BrokerError::OrderNotFound {
            broker_order_id: "B1".to_string()
        }
        .is_retriable());
    }

    #[test]
    fn timeouts_never_retry_submits() {
        assert!(!BrokerError::Timeout { seconds: 5 }.is_safe_to_retry_submit());
        assert!(BrokerError::RateLimited.is_safe_to_retry_submit());
        assert!(BrokerError::Transient {
            message: "reset".to_string()
        }
        .is_safe_to_retry_submit());
    }
}
