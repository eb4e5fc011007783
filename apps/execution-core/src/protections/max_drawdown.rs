//! Max drawdown halt.

use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Protection, ProtectionContext, Verdict};

/// Configuration for the drawdown halt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxDrawdownConfig {
    /// Participate in admission decisions.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Peak-to-trough drawdown percentage that triggers.
    #[serde(default = "default_pct")]
    pub pct: Decimal,
    /// Equity lookback window in minutes.
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
    /// Halt duration in hours.
    #[serde(default = "default_halt_hours")]
    pub halt_hours: i64,
}

impl Default for MaxDrawdownConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            pct: default_pct(),
            window_minutes: default_window_minutes(),
            halt_hours: default_halt_hours(),
        }
    }
}

const fn default_enabled() -> bool {
    true
}

fn default_pct() -> Decimal {
    Decimal::new(10, 0)
}

const fn default_window_minutes() -> i64 {
    24 * 60
}

const fn default_halt_hours() -> i64 {
    4
}

/// Halts trading when the equity curve draws down too far from its peak
/// within the lookback window.
#[derive(Debug)]
pub struct MaxDrawdown {
    config: MaxDrawdownConfig,
}

impl MaxDrawdown {
    /// Build from config.
    #[must_use]
    pub const fn new(config: MaxDrawdownConfig) -> Self {
        Self { config }
    }

    /// Peak-to-trough drawdown percentage over the samples, where the
    /// trough must follow the peak.
    fn drawdown_pct(samples: &[Decimal]) -> Decimal {
        let mut peak = Decimal::MIN;
        let mut worst = Decimal::ZERO;
        for &equity in samples {
            if equity > peak {
                peak = equity;
            } else if peak > Decimal::ZERO {
                let dd = (peak - equity) / peak * Decimal::ONE_HUNDRED;
                if dd > worst {
                    worst = dd;
                }
            }
        }
        worst
    }
}

impl Protection for MaxDrawdown {
    fn name(&self) -> &'static str {
        "max_drawdown"
    }

    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn evaluate(&self, ctx: &ProtectionContext<'_>) -> Verdict {
        let window_start = ctx.now - Duration::minutes(self.config.window_minutes);
        let samples: Vec<Decimal> = ctx
            .equity_curve
            .iter()
            .filter(|(at, _)| *at >= window_start && *at <= ctx.now)
            .map(|(_, equity)| *equity)
            .collect();
        if samples.len() < 2 {
            return Verdict::Allow;
        }

        let drawdown = Self::drawdown_pct(&samples);
        if drawdown >= self.config.pct {
            Verdict::Block {
                until: ctx.now + Duration::hours(self.config.halt_hours),
                reason: "max_drawdown_active".to_string(),
            }
        } else {
            Verdict::Allow
        }
    }
}
