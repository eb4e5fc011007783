//! Strategy signals — the input side of the execution pipeline.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::{OrderSide, OrderType};

/// A trade intention emitted by a strategy.
///
/// Signals are immutable inputs; the engine turns an admitted signal into
/// an order. `signal_time` is preserved through the pipeline so slippage
/// can be attributed back to the originating bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Instrument symbol.
    pub symbol: String,
    /// Buy or sell.
    pub side: OrderSide,
    /// Requested quantity.
    pub quantity: Decimal,
    /// Order type to submit.
    pub order_type: OrderType,
    /// Limit price, required for limit and stop-limit orders.
    pub limit_price: Option<Decimal>,
    /// Time-to-live for resting limit orders, in seconds.
    pub ttl_seconds: Option<u64>,
    /// Strategy that produced the signal.
    pub strategy_id: String,
    /// When the strategy decided (from the clock port).
    pub signal_time: DateTime<Utc>,
    /// Optional free-form rationale.
    pub reason: Option<String>,
}

impl Signal {
    /// A market signal with no TTL.
    #[must_use]
    pub fn market(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        strategy_id: impl Into<String>,
        signal_time: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
            ttl_seconds: None,
            strategy_id: strategy_id.into(),
            signal_time,
            reason: None,
        }
    }

    /// A limit signal with a TTL.
    #[must_use]
    pub fn limit(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        limit_price: Decimal,
        ttl_seconds: u64,
        strategy_id: impl Into<String>,
        signal_time: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Limit,
            limit_price: Some(limit_price),
            ttl_seconds: Some(ttl_seconds),
            strategy_id: strategy_id.into(),
            signal_time,
            reason: None,
        }
    }

    /// Attach a rationale.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn market_signal_has_no_ttl() {
        let signal = Signal::market("SPY", OrderSide::Buy, dec!(10), "vwap", Utc::now());
        assert_eq!(signal.order_type, OrderType::Market);
        assert!(signal.limit_price.is_none());
        assert!(signal.ttl_seconds.is_none());
    }

    #[test]
    fn limit_signal_carries_price_and_ttl() {
        let signal = Signal::limit(
            "SPY",
            OrderSide::Buy,
            dec!(5),
            dec!(449.00),
            90,
            "vwap",
            Utc::now(),
        );
        assert_eq!(signal.limit_price, Some(dec!(449.00)));
        assert_eq!(signal.ttl_seconds, Some(90));
    }

    #[test]
    fn with_reason_sets_rationale() {
        let signal = Signal::market("SPY", OrderSide::Sell, dec!(10), "vwap", Utc::now())
            .with_reason("vwap cross");
        assert_eq!(signal.reason.as_deref(), Some("vwap cross"));
    }
}
