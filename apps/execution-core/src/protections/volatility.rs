//! Realized-volatility halt.

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Protection, ProtectionContext, Verdict};

/// Configuration for the volatility halt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilityHaltConfig {
    /// Participate in admission decisions.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-bar return standard deviation (percent) that triggers.
    #[serde(default = "default_threshold_pct")]
    pub threshold_pct: Decimal,
    /// Pause duration in minutes.
    #[serde(default = "default_pause_minutes")]
    pub pause_minutes: i64,
    /// Minimum number of closes required to evaluate.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

impl Default for VolatilityHaltConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            threshold_pct: default_threshold_pct(),
            pause_minutes: default_pause_minutes(),
            min_samples: default_min_samples(),
        }
    }
}

const fn default_enabled() -> bool {
    true
}

fn default_threshold_pct() -> Decimal {
    Decimal::new(2, 0)
}

const fn default_pause_minutes() -> i64 {
    30
}

const fn default_min_samples() -> usize {
    10
}

/// Pauses a symbol when its realized per-bar volatility exceeds the
/// threshold.
///
/// The comparison is done on variances so no decimal square root is
/// needed: `stdev > t  <=>  var > t^2`.
#[derive(Debug)]
pub struct VolatilityHalt {
    config: VolatilityHaltConfig,
}

impl VolatilityHalt {
    /// Build from config.
    #[must_use]
    pub const fn new(config: VolatilityHaltConfig) -> Self {
        Self { config }
    }

    /// Sample variance of simple per-bar returns, in percent squared.
    fn return_variance_pct_sq(closes: &[Decimal]) -> Option<Decimal> {
        if closes.len() < 2 {
            return None;
        }
        let returns: Vec<Decimal> = closes
            .windows(2)
            .filter(|w| !w[0].is_zero())
            .map(|w| (w[1] - w[0]) / w[0] * Decimal::ONE_HUNDRED)
            .collect();
        if returns.len() < 2 {
            return None;
        }
        let n = Decimal::from(returns.len());
        let mean: Decimal = returns.iter().sum::<Decimal>() / n;
        let sum_sq: Decimal = returns.iter().map(|r| (*r - mean) * (*r - mean)).sum();
        Some(sum_sq / (n - Decimal::ONE))
    }
}

impl Protection for VolatilityHalt {
    fn name(&self) -> &'static str {
        "volatility_halt"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn evaluate(&self, ctx: &ProtectionContext<'_>) -> Verdict {
        if ctx.recent_closes.len() < self.config.min_samples {
            return Verdict::Allow;
        }
        let Some(variance) = Self::return_variance_pct_sq(ctx.recent_closes) else {
            return Verdict::Allow;
        };
        let threshold_sq = self.config.threshold_pct * self.config.threshold_pct;
        if variance > threshold_sq {
            Verdict::Block {
                until: ctx.now + Duration::minutes(self.config.pause_minutes),
                reason: "volatility_halt_active".to_string(),
            }
        } else {
            Verdict::Allow
        }
    }
}
