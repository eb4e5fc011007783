//! Positions and closed trades.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::OrderSide;

/// An open position, keyed by symbol.
///
/// The position store enforces at most one open position per symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Instrument symbol.
    pub symbol: String,
    /// Signed quantity (positive = long).
    pub quantity: Decimal,
    /// Volume-weighted average entry price.
    pub entry_vwap: Decimal,
    /// When the position was opened.
    pub opened_at: DateTime<Utc>,
    /// Strategy that opened the position.
    pub strategy_id: String,
    /// Broker id of the resting protective stop, if one exists.
    pub stop_order_id: Option<String>,
    /// Realized P&L accumulated from partial reductions.
    pub realized_pnl: Decimal,
}

impl Position {
    /// Notional value at a reference price.
    #[must_use]
    pub fn notional_at(&self, price: Decimal) -> Decimal {
        self.quantity.abs() * price
    }

    /// Unrealized P&L at a reference price.
    #[must_use]
    pub fn unrealized_pnl_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_vwap) * self.quantity
    }
}

/// A completed round trip, persisted for P&L and protection lookbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    /// Trade id (uuid).
    pub id: String,
    /// Instrument symbol.
    pub symbol: String,
    /// Side of the entry.
    pub side: OrderSide,
    /// Quantity closed.
    pub quantity: Decimal,
    /// Average entry price.
    pub entry_price: Decimal,
    /// Average exit price.
    pub exit_price: Decimal,
    /// When the position was opened.
    pub opened_at: DateTime<Utc>,
    /// When this quantity was closed.
    pub closed_at: DateTime<Utc>,
    /// Strategy that owned the trade.
    pub strategy_id: String,
    /// Realized P&L net of commission.
    pub pnl: Decimal,
}

impl ClosedTrade {
    /// Returns true if the trade lost money.
    #[must_use]
    pub fn is_loss(&self) -> bool {
        self.pnl < Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn unrealized_pnl_long() {
        let position = Position {
            symbol: "SPY".to_string(),
            quantity: dec!(10),
            entry_vwap: dec!(450.00),
            opened_at: Utc::now(),
            strategy_id: "vwap".to_string(),
            stop_order_id: None,
            realized_pnl: Decimal::ZERO,
        };
        assert_eq!(position.unrealized_pnl_at(dec!(451.00)), dec!(10.00));
        assert_eq!(position.unrealized_pnl_at(dec!(449.00)), dec!(-10.00));
    }

    #[test]
    fn notional_uses_absolute_quantity() {
        let position = Position {
            symbol: "SPY".to_string(),
            quantity: dec!(-5),
            entry_vwap: dec!(100.00),
            opened_at: Utc::now(),
            strategy_id: "vwap".to_string(),
            stop_order_id: None,
            realized_pnl: Decimal::ZERO,
        };
        assert_eq!(position.notional_at(dec!(100.00)), dec!(500.00));
    }

    #[test]
    fn closed_trade_loss_detection() {
        let trade = ClosedTrade {
            id: "t1".to_string(),
            symbol: "SPY".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(10),
            entry_price: dec!(450.00),
            exit_price: dec!(449.00),
            opened_at: Utc::now(),
            closed_at: Utc::now(),
            strategy_id: "vwap".to_string(),
            pnl: dec!(-10.00),
        };
        assert!(trade.is_loss());
    }
}
