//! Trading protections — dynamic circuit breakers for order admission.
//!
//! Each protection is an independently configured rule that can block new
//! submissions until a time-bounded condition clears. The manager evaluates
//! every enabled protection on each admission decision; its aggregate
//! answer is blocked if any protection is active (`now < active_until`).
//! Rising edges are journaled as `PROTECTION_TRIGGER` events.

mod cooldown;
mod max_drawdown;
mod stoploss_guard;
mod trading_window;
mod volatility;

pub use cooldown::{CooldownConfig, CooldownPeriod};
pub use max_drawdown::{MaxDrawdown, MaxDrawdownConfig};
pub use stoploss_guard::{StoplossGuard, StoplossGuardConfig};
pub use trading_window::{TradingWindow, TradingWindowConfig};
pub use volatility::{VolatilityHalt, VolatilityHaltConfig};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::journal::TransactionLog;
use crate::models::{ClosedTrade, Event, EventType};

/// Inputs for one protection evaluation.
///
/// The runtime builds one context per admission decision so all
/// protections see a consistent snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ProtectionContext<'a> {
    /// Evaluation time (from the clock port).
    pub now: DateTime<Utc>,
    /// Symbol of the candidate signal.
    pub symbol: &'a str,
    /// Recently closed trades, oldest first.
    pub closed_trades: &'a [ClosedTrade],
    /// Recent equity samples, oldest first.
    pub equity_curve: &'a [(DateTime<Utc>, Decimal)],
    /// Recent close prices for the candidate symbol, oldest first.
    pub recent_closes: &'a [Decimal],
}

/// Outcome of one protection evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No objection.
    Allow,
    /// Block submissions until the given instant.
    Block {
        /// When the protection clears.
        until: DateTime<Utc>,
        /// Stable reason code.
        reason: String,
    },
}

/// A circuit breaker rule.
pub trait Protection: Send + Sync {
    /// Stable name, used in status reporting and journal events.
    fn name(&self) -> &'static str;

    /// Whether the protection participates in admission decisions.
    fn enabled(&self) -> bool;

    /// Evaluate against a snapshot.
    fn evaluate(&self, ctx: &ProtectionContext<'_>) -> Verdict;
}

/// Observable state of one protection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionStatus {
    /// Protection name.
    pub name: String,
    /// Enabled flag.
    pub enabled: bool,
    /// Currently triggered.
    pub triggered: bool,
    /// When the block clears, if triggered.
    pub active_until: Option<DateTime<Utc>>,
    /// Reason code of the last trigger.
    pub reason: Option<String>,
    /// Last evaluation time.
    pub last_evaluated_at: Option<DateTime<Utc>>,
}

/// Aggregate admission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// All protections allow.
    Allowed,
    /// At least one protection is active.
    Blocked {
        /// Name of the blocking protection.
        protection: String,
        /// When the block clears.
        until: DateTime<Utc>,
        /// Stable reason code.
        reason: String,
    },
}

impl AdmissionDecision {
    /// Returns true when submissions may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Configuration for all built-in protections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtectionsConfig {
    /// Consecutive-loss guard.
    #[serde(default)]
    pub stoploss_guard: StoplossGuardConfig,
    /// Equity drawdown halt.
    #[serde(default)]
    pub max_drawdown: MaxDrawdownConfig,
    /// Single-loss cooldown.
    #[serde(default)]
    pub cooldown: CooldownConfig,
    /// Session/blackout windows.
    #[serde(default)]
    pub trading_window: TradingWindowConfig,
    /// Realized-volatility halt.
    #[serde(default)]
    pub volatility: VolatilityHaltConfig,
}

/// Evaluates all protections and owns their trigger state.
pub struct ProtectionManager {
    clock: Arc<dyn Clock>,
    journal: Arc<dyn TransactionLog>,
    protections: Vec<Box<dyn Protection>>,
    statuses: Mutex<HashMap<&'static str, ProtectionStatus>>,
}

impl ProtectionManager {
    /// Build the manager with the built-in protection set.
    pub fn new(
        config: ProtectionsConfig,
        clock: Arc<dyn Clock>,
        journal: Arc<dyn TransactionLog>,
    ) -> Self {
        let protections: Vec<Box<dyn Protection>> = vec![
            Box::new(StoplossGuard::new(config.stoploss_guard)),
            Box::new(MaxDrawdown::new(config.max_drawdown)),
            Box::new(CooldownPeriod::new(config.cooldown)),
            Box::new(TradingWindow::new(config.trading_window)),
            Box::new(VolatilityHalt::new(config.volatility)),
        ];
        Self::with_protections(protections, clock, journal)
    }

    /// Build the manager with an explicit protection set.
    pub fn with_protections(
        protections: Vec<Box<dyn Protection>>,
        clock: Arc<dyn Clock>,
        journal: Arc<dyn TransactionLog>,
    ) -> Self {
        let statuses = protections
            .iter()
            .map(|p| {
                (
                    p.name(),
                    ProtectionStatus {
                        name: p.name().to_string(),
                        enabled: p.enabled(),
                        triggered: false,
                        active_until: None,
                        reason: None,
                        last_evaluated_at: None,
                    },
                )
            })
            .collect();
        Self {
            clock,
            journal,
            protections,
            statuses: Mutex::new(statuses),
        }
    }

    /// Evaluate all enabled protections for a candidate signal.
    ///
    /// Returns the first blocking protection, if any. A protection already
    /// in cooldown blocks without re-evaluation; expired cooldowns clear
    /// on the way through.
    pub fn check(&self, ctx: &ProtectionContext<'_>) -> AdmissionDecision {
        let now = ctx.now;
        let mut statuses = self.lock_statuses();

        for protection in &self.protections {
            if !protection.enabled() {
                continue;
            }
            let name = protection.name();
            let status = statuses.get_mut(name);
            let Some(status) = status else { continue };
            status.last_evaluated_at = Some(now);

            // Still inside an earlier trigger window.
            if let Some(until) = status.active_until {
                if now < until {
                    return AdmissionDecision::Blocked {
                        protection: name.to_string(),
                        until,
                        reason: status
                            .reason
                            .clone()
                            .unwrap_or_else(|| format!("{name}_active")),
                    };
                }
                // Window passed; clear.
                debug!(protection = name, "protection cleared");
                status.triggered = false;
                status.active_until = None;
                status.reason = None;
            }

            match protection.evaluate(ctx) {
                Verdict::Allow => {}
                Verdict::Block { until, reason } => {
                    status.triggered = true;
                    status.active_until = Some(until);
                    status.reason = Some(reason.clone());
                    warn!(
                        protection = name,
                        until = %until,
                        reason = %reason,
                        "protection triggered"
                    );
                    if let Err(e) = self.journal.append(&Event::system(
                        EventType::ProtectionTrigger,
                        self.clock.now(),
                        json!({
                            "protection": name,
                            "reason": reason,
                            "active_until": until,
                            "symbol": ctx.symbol,
                        }),
                    )) {
                        warn!(error = %e, "failed to journal protection trigger");
                    }
                    return AdmissionDecision::Blocked {
                        protection: name.to_string(),
                        until,
                        reason,
                    };
                }
            }
        }
        AdmissionDecision::Allowed
    }

    /// Snapshot of every protection's status.
    #[must_use]
    pub fn statuses(&self) -> Vec<ProtectionStatus> {
        let mut all: Vec<_> = self.lock_statuses().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    fn lock_statuses(
        &self,
    ) -> MutexGuard<'_, HashMap<&'static str, ProtectionStatus>> {
        match self.statuses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::journal::MemoryJournal;
    use crate::models::OrderSide;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn start_time() -> DateTime<Utc> {
        "2026-03-02T14:00:00Z".parse().unwrap()
    }

    fn losing_trade(closed_at: DateTime<Utc>, pnl: Decimal) -> ClosedTrade {
        ClosedTrade {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: "SPY".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(10),
            entry_price: dec!(450.00),
            exit_price: dec!(449.00),
            opened_at: closed_at - Duration::minutes(10),
            closed_at,
            strategy_id: "vwap".to_string(),
            pnl,
        }
    }

    fn empty_ctx(now: DateTime<Utc>) -> ProtectionContext<'static> {
        ProtectionContext {
            now,
            symbol: "SPY",
            closed_trades: &[],
            equity_curve: &[],
            recent_closes: &[],
        }
    }

    fn make_manager(config: ProtectionsConfig) -> (ProtectionManager, Arc<MemoryJournal>) {
        let clock = Arc::new(SimulatedClock::new(start_time()));
        let journal = Arc::new(MemoryJournal::new());
        (
            ProtectionManager::new(config, clock, journal.clone()),
            journal,
        )
    }

    fn lenient_config() -> ProtectionsConfig {
        // Only the stoploss guard armed; others disabled for isolation.
        ProtectionsConfig {
            stoploss_guard: StoplossGuardConfig {
                enabled: true,
                max_losses: 3,
                window_minutes: 60,
                cooldown_minutes: 60,
            },
            max_drawdown: MaxDrawdownConfig {
                enabled: false,
                ..Default::default()
            },
            cooldown: CooldownConfig {
                enabled: false,
                ..Default::default()
            },
            trading_window: TradingWindowConfig {
                enabled: false,
                ..Default::default()
            },
            volatility: VolatilityHaltConfig {
                enabled: false,
                ..Default::default()
            },
        }
    }

    #[test]
    fn allows_when_nothing_triggers() {
        let (manager, _journal) = make_manager(lenient_config());
        let decision = manager.check(&empty_ctx(start_time()));
        assert!(decision.is_allowed());
    }

    #[test]
    fn three_losses_trip_the_stoploss_guard() {
        let (manager, journal) = make_manager(lenient_config());

        let trades: Vec<ClosedTrade> = (0..3)
            .map(|i| losing_trade(start_time() - Duration::minutes(10 - i), dec!(-25)))
            .collect();
        let now = start_time() + Duration::minutes(30);
        let ctx = ProtectionContext {
            closed_trades: &trades,
            ..empty_ctx(now)
        };

        let decision = manager.check(&ctx);
        let AdmissionDecision::Blocked { protection, reason, .. } = decision else {
            panic!("expected blocked decision");
        };
        assert_eq!(protection, "stoploss_guard");
        assert_eq!(reason, "stoploss_guard_active");

        let triggers = journal
            .replay(&|e| e.event_type == EventType::ProtectionTrigger)
            .unwrap();
        assert_eq!(triggers.len(), 1);
    }

    #[test]
    fn trigger_journaled_once_per_episode() {
        let (manager, journal) = make_manager(lenient_config());

        let trades: Vec<ClosedTrade> = (0..3)
            .map(|i| losing_trade(start_time() - Duration::minutes(10 - i), dec!(-25)))
            .collect();
        let ctx = ProtectionContext {
            closed_trades: &trades,
            ..empty_ctx(start_time())
        };

        assert!(!manager.check(&ctx).is_allowed());
        // Second check inside the cooldown: still blocked, no new event.
        assert!(!manager.check(&ctx).is_allowed());

        let triggers = journal
            .replay(&|e| e.event_type == EventType::ProtectionTrigger)
            .unwrap();
        assert_eq!(triggers.len(), 1);
    }

    #[test]
    fn block_clears_after_active_until() {
        let (manager, _journal) = make_manager(lenient_config());

        let trades: Vec<ClosedTrade> = (0..3)
            .map(|i| losing_trade(start_time() - Duration::minutes(10 - i), dec!(-25)))
            .collect();
        let ctx = ProtectionContext {
            closed_trades: &trades,
            ..empty_ctx(start_time())
        };
        assert!(!manager.check(&ctx).is_allowed());

        // Past the cooldown, and the losses have aged out of the window.
        let later = start_time() + Duration::minutes(120);
        let ctx = ProtectionContext {
            closed_trades: &trades,
            ..empty_ctx(later)
        };
        assert!(manager.check(&ctx).is_allowed());

        let statuses = manager.statuses();
        let guard = statuses
            .iter()
            .find(|s| s.name == "stoploss_guard")
            .unwrap();
        assert!(!guard.triggered);
        assert!(guard.active_until.is_none());
    }

    #[test]
    fn statuses_report_all_protections() {
        let (manager, _journal) = make_manager(ProtectionsConfig::default());
        let statuses = manager.statuses();
        let names: Vec<_> = statuses.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "cooldown",
                "max_drawdown",
                "stoploss_guard",
                "trading_window",
                "volatility_halt"
            ]
        );
    }
}
