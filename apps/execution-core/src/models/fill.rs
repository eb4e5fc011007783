//! Fill events reported by the broker.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single execution against a working order.
///
/// Fills for one order are applied in broker-reported order and are never
/// reordered by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    /// When the venue executed.
    pub timestamp: DateTime<Utc>,
    /// Executed quantity.
    pub quantity: Decimal,
    /// Execution price.
    pub price: Decimal,
    /// Commission charged for this execution.
    pub commission: Decimal,
}

impl Fill {
    /// Notional value of this execution.
    #[must_use]
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// Volume-weighted average price of a fill sequence.
///
/// Returns zero for an empty sequence.
#[must_use]
pub fn weighted_avg_price(fills: &[Fill]) -> Decimal {
    let total_qty: Decimal = fills.iter().map(|f| f.quantity).sum();
    if total_qty.is_zero() {
        return Decimal::ZERO;
    }
    let total_notional: Decimal = fills.iter().map(Fill::notional).sum();
    total_notional / total_qty
}
