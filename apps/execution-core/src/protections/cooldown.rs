//! Cooldown after a large single-trade loss.

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Protection, ProtectionContext, Verdict};

/// Configuration for the loss cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    /// Participate in admission decisions.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Absolute loss that triggers the pause.
    #[serde(default = "default_loss_threshold")]
    pub loss_threshold: Decimal,
    /// Pause duration in minutes.
    #[serde(default = "default_pause_minutes")]
    pub pause_minutes: i64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            loss_threshold: default_loss_threshold(),
            pause_minutes: default_pause_minutes(),
        }
    }
}

const fn default_enabled() -> bool {
    true
}

fn default_loss_threshold() -> Decimal {
    Decimal::new(200, 0)
}

const fn default_pause_minutes() -> i64 {
    15
}

/// Pauses trading after any single trade loses more than the threshold.
///
/// The pause is anchored to the losing trade's close time.
#[derive(Debug)]
pub struct CooldownPeriod {
    config: CooldownConfig,
}

impl CooldownPeriod {
    /// Build from config.
    #[must_use]
    pub const fn new(config: CooldownConfig) -> Self {
        Self { config }
    }
}

impl Protection for CooldownPeriod {
    fn name(&self) -> &'static str {
        "cooldown"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn evaluate(&self, ctx: &ProtectionContext<'_>) -> Verdict {
        let pause = Duration::minutes(self.config.pause_minutes);
        let breach = ctx
            .closed_trades
            .iter()
            .filter(|t| t.pnl <= -self.config.loss_threshold)
            .map(|t| t.closed_at)
            .max();

        match breach {
            Some(closed_at) if closed_at + pause > ctx.now => Verdict::Block {
                until: closed_at + pause,
                reason: "cooldown_active".to_string(),
            },
            _ => Verdict::Allow,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClosedTrade, OrderSide};
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn trade(closed_at: DateTime<Utc>, pnl: Decimal) -> ClosedTrade {
        ClosedTrade {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: "SPY".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(10),
            entry_price: dec!(450.00),
            exit_price: dec!(430.00),
            opened_at: closed_at,
            closed_at,
            strategy_id: "vwap".to_string(),
            pnl,
        }
    }

    fn ctx<'a>(now: DateTime<Utc>, trades: &'a [ClosedTrade]) -> ProtectionContext<'a> {
        ProtectionContext {
            now,
            symbol: "SPY",
            closed_trades: trades,
            equity_curve: &[],
            recent_closes: &[],
        }
    }

    #[test]
    fn small_loss_allows() {
        let cooldown = CooldownPeriod::new(CooldownConfig::default());
        let trades = vec![trade(at("2026-03-02T14:00:00Z"), dec!(-50))];
        assert_eq!(
            cooldown.evaluate(&ctx(at("2026-03-02T14:05:00Z"), &trades)),
            Verdict::Allow
        );
    }

    #[test]
    fn large_loss_blocks_for_pause() {
        let cooldown = CooldownPeriod::new(CooldownConfig::default());
        let trades = vec![trade(at("2026-03-02T14:00:00Z"), dec!(-250))];
        let verdict = cooldown.evaluate(&ctx(at("2026-03-02T14:05:00Z"), &trades));
        assert_eq!(
            verdict,
            Verdict::Block {
                until: at("2026-03-02T14:15:00Z"),
                reason: "cooldown_active".to_string(),
            }
        );
    }

    #[test]
    fn pause_expires() {
        let cooldown = CooldownPeriod::new(CooldownConfig::default());
        let trades = vec![trade(at("2026-03-02T14:00:00Z"), dec!(-250))];
        assert_eq!(
            cooldown.evaluate(&ctx(at("2026-03-02T14:20:00Z"), &trades)),
            Verdict::Allow
        );
    }

    #[test]
    fn threshold_is_inclusive() {
        let cooldown = CooldownPeriod::new(CooldownConfig::default());
        let trades = vec![trade(at("2026-03-02T14:00:00Z"), dec!(-200))];
        assert!(matches!(
            cooldown.evaluate(&ctx(at("2026-03-02T14:01:00Z"), &trades)),
            Verdict::Block { .. }
        ));
    }
}
