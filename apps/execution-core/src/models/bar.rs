//! Market data bar consumed by the runtime.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One aggregated bar for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    /// Instrument symbol.
    pub symbol: String,
    /// Bar open.
    pub open: Decimal,
    /// Bar high.
    pub high: Decimal,
    /// Bar low.
    pub low: Decimal,
    /// Bar close.
    pub close: Decimal,
    /// Traded volume.
    pub volume: Decimal,
    /// Bar end timestamp.
    pub timestamp: DateTime<Utc>,
}
