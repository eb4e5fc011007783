//! Trading session window.

use chrono::{Duration, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use super::{Protection, ProtectionContext, Verdict};

/// Configuration for the session window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingWindowConfig {
    /// Participate in admission decisions.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Session open, UTC `HH:MM`.
    #[serde(default = "default_open")]
    pub open: String,
    /// Session close, UTC `HH:MM`.
    #[serde(default = "default_close")]
    pub close: String,
}

impl Default for TradingWindowConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            open: default_open(),
            close: default_close(),
        }
    }
}

const fn default_enabled() -> bool {
    true
}

fn default_open() -> String {
    "14:30".to_string()
}

fn default_close() -> String {
    "21:00".to_string()
}

/// Blocks submissions outside the configured UTC session.
///
/// Open is inclusive, close is exclusive. A malformed config falls back to
/// the defaults rather than silently allowing around-the-clock trading.
#[derive(Debug)]
pub struct TradingWindow {
    enabled: bool,
    open: NaiveTime,
    close: NaiveTime,
}

impl TradingWindow {
    /// Build from config.
    #[must_use]
    pub fn new(config: TradingWindowConfig) -> Self {
        Self {
            enabled: config.enabled,
            open: parse_hhmm(&config.open)
                .unwrap_or_else(|| NaiveTime::from_hms_opt(14, 30, 0).unwrap_or_default()),
            close: parse_hhmm(&config.close)
                .unwrap_or_else(|| NaiveTime::from_hms_opt(21, 0, 0).unwrap_or_default()),
        }
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

impl Protection for TradingWindow {
    fn name(&self) -> &'static str {
        "trading_window"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn evaluate(&self, ctx: &ProtectionContext<'_>) -> Verdict {
        let time_of_day = ctx.now.time();
        if time_of_day >= self.open && time_of_day < self.close {
            return Verdict::Allow;
        }

        // Next session open: today if before the open, tomorrow otherwise.
        let today_open = ctx
            .now
            .with_hour(self.open.hour())
            .and_then(|t| t.with_minute(self.open.minute()))
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(ctx.now);
        let until = if time_of_day < self.open {
            today_open
        } else {
            today_open + Duration::days(1)
        };
        Verdict::Block {
            until,
            reason: "outside_trading_window".to_string(),
        }
    }
}
