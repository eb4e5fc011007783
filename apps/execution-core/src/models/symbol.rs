//! Symbol trading properties and order normalization.
//!
//! Tick size, lot size, and minimum notional come from an external symbol
//! directory; the engine validates and rounds every candidate order against
//! them before any broker contact.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Trading properties for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    /// Instrument symbol.
    pub symbol: String,
    /// Minimum price increment.
    pub tick_size: Decimal,
    /// Minimum quantity increment.
    pub lot_size: Decimal,
    /// Minimum order notional accepted by the venue.
    pub min_notional: Decimal,
    /// Whether the symbol is currently tradable.
    pub tradable: bool,
}

impl SymbolSpec {
    /// Equity defaults: penny ticks, unit lots.
    #[must_use]
    pub fn equity(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            tick_size: Decimal::new(1, 2),
            lot_size: Decimal::ONE,
            min_notional: Decimal::ONE,
            tradable: true,
        }
    }

    /// Round a price down to the tick grid.
    #[must_use]
    pub fn round_price(&self, price: Decimal) -> Decimal {
        round_to_increment(price, self.tick_size)
    }

    /// Round a quantity down to the lot grid.
    #[must_use]
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        round_to_increment(qty, self.lot_size)
    }
}

/// Directory of symbol trading properties (external collaborator).
pub trait SymbolDirectory: Send + Sync {
    /// Look up properties for a symbol. `None` means unknown symbol.
    fn lookup(&self, symbol: &str) -> Option<SymbolSpec>;
}

/// Static in-memory directory.
#[derive(Debug, Default)]
pub struct StaticSymbolDirectory {
    specs: std::collections::HashMap<String, SymbolSpec>,
}

impl StaticSymbolDirectory {
    /// Build from a list of specs.
    #[must_use]
    pub fn new(specs: impl IntoIterator<Item = SymbolSpec>) -> Self {
        Self {
            specs: specs
                .into_iter()
                .map(|s| (s.symbol.clone(), s))
                .collect(),
        }
    }
}

impl SymbolDirectory for StaticSymbolDirectory {
    fn lookup(&self, symbol: &str) -> Option<SymbolSpec> {
        self.specs.get(symbol).cloned()
    }
}

/// Validation failures for a candidate order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolValidationError {
    /// Symbol is not in the directory.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Symbol is known but not currently tradable.
    #[error("symbol not tradable: {0}")]
    NotTradable(String),

    /// Quantity rounded to zero lots.
    #[error("quantity below one lot for {symbol}")]
    QuantityTooSmall {
        /// Offending symbol.
        symbol: String,
    },

    /// Order notional below the venue minimum.
    #[error("notional below minimum for {symbol}: {notional} < {min_notional}")]
    NotionalTooSmall {
        /// Offending symbol.
        symbol: String,
        /// Proposed notional.
        notional: Decimal,
        /// Venue minimum.
        min_notional: Decimal,
    },
}

fn round_to_increment(value: Decimal, increment: Decimal) -> Decimal {
    if increment.is_zero() {
        return value;
    }
    (value / increment).floor() * increment
}
