//! Trading mode.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Paper or live trading.
///
/// The mode decides two behaviors: reconciliation healing (paper heals,
/// live halts above tolerance) and fail-open policy for non-safety lookup
/// errors in the risk gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// Simulated account; discrepancies are healed from broker truth.
    #[default]
    Paper,
    /// Real money; discrepancies above tolerance halt the process.
    Live,
}

impl TradingMode {
    /// Returns true in live mode.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_paper() {
        assert_eq!(TradingMode::default(), TradingMode::Paper);
        assert!(!TradingMode::default().is_live());
    }

    #[test]
    fn serde_lowercase() {
        let parsed: TradingMode = serde_json::from_str("\"live\"").unwrap();
        assert!(parsed.is_live());
        assert_eq!(serde_json::to_string(&TradingMode::Paper).unwrap(), "\"paper\"");
    }
}
