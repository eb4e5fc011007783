//! Stoploss guard — consecutive-loss circuit breaker.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::{Protection, ProtectionContext, Verdict};

/// Configuration for the stoploss guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoplossGuardConfig {
    /// Participate in admission decisions.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Losing trades within the window required to trigger.
    #[serde(default = "default_max_losses")]
    pub max_losses: u32,
    /// Lookback window in minutes.
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
    /// Cooldown after triggering, in minutes.
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
}

impl Default for StoplossGuardConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_losses: default_max_losses(),
            window_minutes: default_window_minutes(),
            cooldown_minutes: default_cooldown_minutes(),
        }
    }
}

const fn default_enabled() -> bool {
    true
}

const fn default_max_losses() -> u32 {
    3
}

const fn default_window_minutes() -> i64 {
    60
}

const fn default_cooldown_minutes() -> i64 {
    60
}

/// Blocks submissions after too many losing trades in a window.
///
/// The cooldown is anchored to the most recent loss, so a guard evaluated
/// late still clears at the same wall-clock instant.
#[derive(Debug)]
pub struct StoplossGuard {
    config: StoplossGuardConfig,
}

impl StoplossGuard {
    /// Build from config.
    #[must_use]
    pub const fn new(config: StoplossGuardConfig) -> Self {
        Self { config }
    }
}

impl Protection for StoplossGuard {
    fn name(&self) -> &'static str {
        "stoploss_guard"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn evaluate(&self, ctx: &ProtectionContext<'_>) -> Verdict {
        let window_start = ctx.now - Duration::minutes(self.config.window_minutes);
        let losses: Vec<_> = ctx
            .closed_trades
            .iter()
            .filter(|t| t.is_loss() && t.closed_at >= window_start && t.closed_at <= ctx.now)
            .collect();

        if losses.len() < self.config.max_losses as usize {
            return Verdict::Allow;
        }

        let newest_loss = losses
            .iter()
            .map(|t| t.closed_at)
            .max()
            .unwrap_or(ctx.now);
        let until = newest_loss + Duration::minutes(self.config.cooldown_minutes);
        if until <= ctx.now {
            return Verdict::Allow;
        }
        Verdict::Block {
            until,
            reason: "stoploss_guard_active".to_string(),
        }
    }
}
