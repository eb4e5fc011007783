//! Pre-trade risk gate — synchronous admission control.
//!
//! Six ordered checks run against a consistent snapshot, failing fast on
//! the first rejection: daily loss limit, duplicate client order id,
//! pattern-day-trader guard, per-symbol notional cap, portfolio notional
//! cap, and the single-position-per-symbol invariant. Caps are notional-
//! based so a small account can never overtrade an expensive symbol.
//!
//! A rejection is an expected outcome, not an error: the signal is
//! dropped, the local order becomes REJECTED, and the reason code is
//! journaled.

use std::collections::HashSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{OrderSide, Position, Signal, TradingMode};

/// Stable rejection reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskReasonCode {
    /// Daily realized loss at or beyond the configured limit.
    DailyLossLimit,
    /// Daily order budget exhausted.
    OrdersPerDayExceeded,
    /// Client order id already submitted (this session or replayed).
    DuplicateClientOrderId,
    /// Pattern-day-trader rule for small accounts.
    PdtLimit,
    /// Proposed position notional above the per-symbol cap.
    PositionNotionalExceeded,
    /// Resulting portfolio notional above the cap.
    PortfolioNotionalExceeded,
    /// A long position already exists for the symbol.
    PositionExists,
    /// SELL with no open position to reduce.
    NoPosition,
    /// A required lookup failed and the gate is fail-closed.
    LookupFailed,
}

impl RiskReasonCode {
    /// Wire string for the reason code.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::DailyLossLimit => "DAILY_LOSS_LIMIT",
            Self::OrdersPerDayExceeded => "ORDERS_PER_DAY_EXCEEDED",
            Self::DuplicateClientOrderId => "DUPLICATE_CLIENT_ORDER_ID",
            Self::PdtLimit => "PDT_LIMIT",
            Self::PositionNotionalExceeded => "POSITION_NOTIONAL_EXCEEDED",
            Self::PortfolioNotionalExceeded => "PORTFOLIO_NOTIONAL_EXCEEDED",
            Self::PositionExists => "POSITION_EXISTS",
            Self::NoPosition => "NO_POSITION",
            Self::LookupFailed => "LOOKUP_FAILED",
        }
    }
}

impl std::fmt::Display for RiskReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

/// A structured admission rejection.
#[derive(Debug, Clone, Error)]
#[error("[{code}] {message}")]
pub struct RiskRejection {
    /// Stable reason code.
    pub code: RiskReasonCode,
    /// Human-readable detail.
    pub message: String,
    /// Observed value that failed the check.
    pub observed: String,
    /// Configured limit.
    pub limit: String,
}

impl RiskRejection {
    fn new(
        code: RiskReasonCode,
        message: impl Into<String>,
        observed: impl Into<String>,
        limit: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            observed: observed.into(),
            limit: limit.into(),
        }
    }
}

/// Risk gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum daily realized loss before new entries stop.
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: Decimal,
    /// Per-symbol position notional cap.
    #[serde(default = "default_max_position_notional")]
    pub max_position_notional: Decimal,
    /// Portfolio notional cap as percent of equity.
    #[serde(default = "default_max_portfolio_notional_pct")]
    pub max_portfolio_notional_pct: Decimal,
    /// Enforce the pattern-day-trader rule for small accounts.
    #[serde(default = "default_enable_pdt_protection")]
    pub enable_pdt_protection: bool,
    /// Daily order budget.
    #[serde(default = "default_max_orders_per_day")]
    pub max_orders_per_day: u32,
    /// In paper mode, allow submissions when a non-safety lookup fails.
    #[serde(default = "default_fail_open_on_lookup_error")]
    pub fail_open_on_lookup_error: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            daily_loss_limit: default_daily_loss_limit(),
            max_position_notional: default_max_position_notional(),
            max_portfolio_notional_pct: default_max_portfolio_notional_pct(),
            enable_pdt_protection: default_enable_pdt_protection(),
            max_orders_per_day: default_max_orders_per_day(),
            fail_open_on_lookup_error: default_fail_open_on_lookup_error(),
        }
    }
}

fn default_daily_loss_limit() -> Decimal {
    Decimal::new(1_000, 0)
}

fn default_max_position_notional() -> Decimal {
    Decimal::new(25_000, 0)
}

fn default_max_portfolio_notional_pct() -> Decimal {
    Decimal::ONE_HUNDRED
}

const fn default_enable_pdt_protection() -> bool {
    true
}

const fn default_max_orders_per_day() -> u32 {
    100
}

const fn default_fail_open_on_lookup_error() -> bool {
    true
}

/// PDT equity threshold (FINRA Rule 4210).
const PDT_EQUITY_THRESHOLD: Decimal = Decimal::from_parts(25_000, 0, 0, false, 0);

/// Day trades allowed in a rolling window for restricted accounts.
const PDT_MAX_DAY_TRADES: u32 = 3;

/// Consistent snapshot the gate evaluates against.
///
/// The caller assembles the view once per signal so every check sees the
/// same positions, trades, and clock.
#[derive(Debug, Clone)]
pub struct RiskView<'a> {
    /// Paper or live.
    pub mode: TradingMode,
    /// Realized P&L since session start (negative = loss).
    pub daily_realized_pnl: Decimal,
    /// Account equity.
    pub account_equity: Decimal,
    /// Day trades used in the rolling window.
    pub day_trade_count: u32,
    /// Orders submitted today.
    pub orders_submitted_today: u32,
    /// All open positions.
    pub open_positions: &'a [Position],
    /// Symbols whose position was opened today (PDT bookkeeping).
    pub opened_today: &'a HashSet<String>,
    /// Reference price for notional computation (limit price or last trade).
    pub reference_price: Decimal,
}

/// Gate outcome: the admitted quantity, possibly capped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskApproval {
    /// Quantity the engine may submit.
    pub quantity: Decimal,
    /// True when a SELL was capped to the open position size.
    pub capped: bool,
}

/// Synchronous pre-trade admission gate.
#[derive(Debug, Clone)]
pub struct PreTradeRiskGate {
    config: RiskConfig,
}

impl PreTradeRiskGate {
    /// Build from config.
    #[must_use]
    pub const fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Access the configuration.
    #[must_use]
    pub const fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Run all checks in order, failing fast on the first rejection.
    pub fn evaluate(
        &self,
        signal: &Signal,
        client_order_id: &str,
        submitted_ids: &HashSet<String>,
        view: &RiskView<'_>,
    ) -> Result<RiskApproval, RiskRejection> {
        self.check_daily_loss(view)?;
        self.check_order_budget(view)?;
        Self::check_duplicate(client_order_id, submitted_ids)?;
        self.check_pdt(signal, view)?;
        self.check_position_notional(signal, signal.quantity, view)?;
        self.check_portfolio_notional(signal, signal.quantity, view)?;
        self.check_single_position(signal, view)
    }

    /// Policy for a failed non-safety lookup while assembling the view:
    /// paper mode may proceed (fail-open) when configured; live mode is
    /// always fail-closed.
    pub fn on_lookup_error(
        &self,
        mode: TradingMode,
        detail: &str,
    ) -> Result<(), RiskRejection> {
        if mode == TradingMode::Paper && self.config.fail_open_on_lookup_error {
            return Ok(());
        }
        Err(RiskRejection::new(
            RiskReasonCode::LookupFailed,
            format!("lookup failed in {mode} mode: {detail}"),
            detail.to_string(),
            "fail-closed".to_string(),
        ))
    }

    fn check_daily_loss(&self, view: &RiskView<'_>) -> Result<(), RiskRejection> {
        if view.daily_realized_pnl <= -self.config.daily_loss_limit {
            return Err(RiskRejection::new(
                RiskReasonCode::DailyLossLimit,
                "daily loss limit reached",
                view.daily_realized_pnl.to_string(),
                self.config.daily_loss_limit.to_string(),
            ));
        }
        Ok(())
    }

    fn check_order_budget(&self, view: &RiskView<'_>) -> Result<(), RiskRejection> {
        if view.orders_submitted_today >= self.config.max_orders_per_day {
            return Err(RiskRejection::new(
                RiskReasonCode::OrdersPerDayExceeded,
                "daily order budget exhausted",
                view.orders_submitted_today.to_string(),
                self.config.max_orders_per_day.to_string(),
            ));
        }
        Ok(())
    }

    fn check_duplicate(
        client_order_id: &str,
        submitted_ids: &HashSet<String>,
    ) -> Result<(), RiskRejection> {
        if submitted_ids.contains(client_order_id) {
            return Err(RiskRejection::new(
                RiskReasonCode::DuplicateClientOrderId,
                format!("client order id already submitted: {client_order_id}"),
                client_order_id.to_string(),
                "unique".to_string(),
            ));
        }
        Ok(())
    }

    fn check_pdt(&self, signal: &Signal, view: &RiskView<'_>) -> Result<(), RiskRejection> {
        if !self.config.enable_pdt_protection {
            return Ok(());
        }
        if view.account_equity >= PDT_EQUITY_THRESHOLD {
            return Ok(());
        }
        // Only closing a position opened today creates a day trade.
        let would_day_trade =
            signal.side == OrderSide::Sell && view.opened_today.contains(&signal.symbol);
        if would_day_trade && view.day_trade_count >= PDT_MAX_DAY_TRADES {
            return Err(RiskRejection::new(
                RiskReasonCode::PdtLimit,
                format!(
                    "day trade budget exhausted for account under {PDT_EQUITY_THRESHOLD}"
                ),
                view.day_trade_count.to_string(),
                PDT_MAX_DAY_TRADES.to_string(),
            ));
        }
        Ok(())
    }

    fn check_single_position(
        &self,
        signal: &Signal,
        view: &RiskView<'_>,
    ) -> Result<RiskApproval, RiskRejection> {
        let existing = view
            .open_positions
            .iter()
            .find(|p| p.symbol == signal.symbol);
        match signal.side {
            OrderSide::Buy => {
                if existing.is_some() {
                    return Err(RiskRejection::new(
                        RiskReasonCode::PositionExists,
                        format!("open position already exists for {}", signal.symbol),
                        "1".to_string(),
                        "1 position per symbol".to_string(),
                    ));
                }
                Ok(RiskApproval {
                    quantity: signal.quantity,
                    capped: false,
                })
            }
            OrderSide::Sell => {
                let Some(position) = existing else {
                    return Err(RiskRejection::new(
                        RiskReasonCode::NoPosition,
                        format!("no open position to sell for {}", signal.symbol),
                        "0".to_string(),
                        "open position required".to_string(),
                    ));
                };
                if signal.quantity > position.quantity {
                    Ok(RiskApproval {
                        quantity: position.quantity,
                        capped: true,
                    })
                } else {
                    Ok(RiskApproval {
                        quantity: signal.quantity,
                        capped: false,
                    })
                }
            }
        }
    }

    fn check_position_notional(
        &self,
        signal: &Signal,
        quantity: Decimal,
        view: &RiskView<'_>,
    ) -> Result<(), RiskRejection> {
        if signal.side == OrderSide::Sell {
            // Reductions never add exposure.
            return Ok(());
        }
        let proposed = quantity * view.reference_price;
        if proposed > self.config.max_position_notional {
            return Err(RiskRejection::new(
                RiskReasonCode::PositionNotionalExceeded,
                format!("proposed {} notional above per-symbol cap", signal.symbol),
                proposed.to_string(),
                self.config.max_position_notional.to_string(),
            ));
        }
        Ok(())
    }

    fn check_portfolio_notional(
        &self,
        signal: &Signal,
        quantity: Decimal,
        view: &RiskView<'_>,
    ) -> Result<(), RiskRejection> {
        if signal.side == OrderSide::Sell {
            return Ok(());
        }
        let open_notional: Decimal = view
            .open_positions
            .iter()
            .map(|p| p.quantity.abs() * p.entry_vwap)
            .sum();
        let resulting = open_notional + quantity * view.reference_price;
        let cap = view.account_equity * self.config.max_portfolio_notional_pct
            / Decimal::ONE_HUNDRED;
        if resulting > cap {
            return Err(RiskRejection::new(
                RiskReasonCode::PortfolioNotionalExceeded,
                "resulting portfolio notional above cap",
                resulting.to_string(),
                cap.to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn make_signal(side: OrderSide, qty: Decimal) -> Signal {
        Signal::market("SPY", side, qty, "vwap", Utc::now())
    }

    fn make_position(symbol: &str, qty: Decimal, vwap: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            quantity: qty,
            entry_vwap: vwap,
            opened_at: Utc::now(),
            strategy_id: "vwap".to_string(),
            stop_order_id: None,
            realized_pnl: Decimal::ZERO,
        }
    }

    struct ViewFixture {
        positions: Vec<Position>,
        opened_today: HashSet<String>,
    }

    impl ViewFixture {
        fn new() -> Self {
            Self {
                positions: vec![],
                opened_today: HashSet::new(),
            }
        }

        fn view(&self) -> RiskView<'_> {
            RiskView {
                mode: TradingMode::Paper,
                daily_realized_pnl: Decimal::ZERO,
                account_equity: dec!(100000),
                day_trade_count: 0,
                orders_submitted_today: 0,
                open_positions: &self.positions,
                opened_today: &self.opened_today,
                reference_price: dec!(450.00),
            }
        }
    }

    fn gate() -> PreTradeRiskGate {
        PreTradeRiskGate::new(RiskConfig::default())
    }

    #[test]
    fn clean_buy_is_approved() {
        let fixture = ViewFixture::new();
        let approval = gate()
            .evaluate(
                &make_signal(OrderSide::Buy, dec!(10)),
                "C1",
                &HashSet::new(),
                &fixture.view(),
            )
            .unwrap();
        assert_eq!(approval.quantity, dec!(10));
        assert!(!approval.capped);
    }

    #[test]
    fn daily_loss_limit_rejects_first() {
        let fixture = ViewFixture::new();
        let mut view = fixture.view();
        view.daily_realized_pnl = dec!(-1000);

        let rejection = gate()
            .evaluate(
                &make_signal(OrderSide::Buy, dec!(10)),
                "C1",
                &HashSet::new(),
                &view,
            )
            .unwrap_err();
        assert_eq!(rejection.code, RiskReasonCode::DailyLossLimit);
    }

    #[test]
    fn order_budget_rejects() {
        let fixture = ViewFixture::new();
        let mut view = fixture.view();
        view.orders_submitted_today = 100;

        let rejection = gate()
            .evaluate(
                &make_signal(OrderSide::Buy, dec!(10)),
                "C1",
                &HashSet::new(),
                &view,
            )
            .unwrap_err();
        assert_eq!(rejection.code, RiskReasonCode::OrdersPerDayExceeded);
    }

    #[test]
    fn duplicate_client_id_rejects() {
        let fixture = ViewFixture::new();
        let submitted: HashSet<String> = ["C1".to_string()].into();

        let rejection = gate()
            .evaluate(
                &make_signal(OrderSide::Buy, dec!(10)),
                "C1",
                &submitted,
                &fixture.view(),
            )
            .unwrap_err();
        assert_eq!(rejection.code, RiskReasonCode::DuplicateClientOrderId);
    }

    #[test]
    fn pdt_blocks_fourth_day_trade_for_small_account() {
        let mut fixture = ViewFixture::new();
        fixture.positions = vec![make_position("SPY", dec!(10), dec!(450.00))];
        fixture.opened_today.insert("SPY".to_string());
        let mut view = fixture.view();
        view.account_equity = dec!(20000);
        view.day_trade_count = 3;

        let rejection = gate()
            .evaluate(
                &make_signal(OrderSide::Sell, dec!(10)),
                "C1",
                &HashSet::new(),
                &view,
            )
            .unwrap_err();
        assert_eq!(rejection.code, RiskReasonCode::PdtLimit);
    }

    #[test]
    fn pdt_ignores_large_accounts() {
        let mut fixture = ViewFixture::new();
        fixture.positions = vec![make_position("SPY", dec!(10), dec!(450.00))];
        fixture.opened_today.insert("SPY".to_string());
        let mut view = fixture.view();
        view.account_equity = dec!(30000);
        view.day_trade_count = 10;

        assert!(gate()
            .evaluate(
                &make_signal(OrderSide::Sell, dec!(10)),
                "C1",
                &HashSet::new(),
                &view,
            )
            .is_ok());
    }

    #[test]
    fn pdt_allows_sell_of_older_position() {
        let mut fixture = ViewFixture::new();
        fixture.positions = vec![make_position("SPY", dec!(10), dec!(450.00))];
        // Not opened today.
        let mut view = fixture.view();
        view.account_equity = dec!(20000);
        view.day_trade_count = 3;

        assert!(gate()
            .evaluate(
                &make_signal(OrderSide::Sell, dec!(10)),
                "C1",
                &HashSet::new(),
                &view,
            )
            .is_ok());
    }

    #[test]
    fn position_notional_cap_rejects_buy() {
        let fixture = ViewFixture::new();
        // 100 * 450 = 45000 > 25000 cap.
        let rejection = gate()
            .evaluate(
                &make_signal(OrderSide::Buy, dec!(100)),
                "C1",
                &HashSet::new(),
                &fixture.view(),
            )
            .unwrap_err();
        assert_eq!(rejection.code, RiskReasonCode::PositionNotionalExceeded);
    }

    #[test]
    fn portfolio_cap_counts_existing_positions() {
        let config = RiskConfig {
            max_portfolio_notional_pct: dec!(50),
            max_position_notional: dec!(50000),
            ..Default::default()
        };
        let gate = PreTradeRiskGate::new(config);

        let mut fixture = ViewFixture::new();
        fixture.positions = vec![make_position("QQQ", dec!(100), dec!(380.00))]; // 38k
        let view = fixture.view();

        // Cap = 50% of 100k = 50k; 38k + 10*450 = 42.5k passes.
        assert!(gate
            .evaluate(
                &make_signal(OrderSide::Buy, dec!(10)),
                "C1",
                &HashSet::new(),
                &view,
            )
            .is_ok());

        // 38k + 30*450 = 51.5k exceeds.
        let rejection = gate
            .evaluate(
                &make_signal(OrderSide::Buy, dec!(30)),
                "C2",
                &HashSet::new(),
                &view,
            )
            .unwrap_err();
        assert_eq!(rejection.code, RiskReasonCode::PortfolioNotionalExceeded);
    }

    #[test]
    fn buy_with_existing_position_rejects() {
        let mut fixture = ViewFixture::new();
        fixture.positions = vec![make_position("SPY", dec!(10), dec!(450.00))];

        let rejection = gate()
            .evaluate(
                &make_signal(OrderSide::Buy, dec!(10)),
                "C1",
                &HashSet::new(),
                &fixture.view(),
            )
            .unwrap_err();
        assert_eq!(rejection.code, RiskReasonCode::PositionExists);
    }

    #[test]
    fn oversized_sell_is_capped_to_position() {
        let mut fixture = ViewFixture::new();
        fixture.positions = vec![make_position("SPY", dec!(10), dec!(450.00))];

        let approval = gate()
            .evaluate(
                &make_signal(OrderSide::Sell, dec!(25)),
                "C1",
                &HashSet::new(),
                &fixture.view(),
            )
            .unwrap();
        assert_eq!(approval.quantity, dec!(10));
        assert!(approval.capped);
    }

    #[test]
    fn sell_without_position_rejects() {
        let fixture = ViewFixture::new();
        let rejection = gate()
            .evaluate(
                &make_signal(OrderSide::Sell, dec!(10)),
                "C1",
                &HashSet::new(),
                &fixture.view(),
            )
            .unwrap_err();
        assert_eq!(rejection.code, RiskReasonCode::NoPosition);
    }

    #[test]
    fn lookup_error_fails_open_in_paper_only() {
        let gate = gate();
        assert!(gate.on_lookup_error(TradingMode::Paper, "store down").is_ok());

        let rejection = gate
            .on_lookup_error(TradingMode::Live, "store down")
            .unwrap_err();
        assert_eq!(rejection.code, RiskReasonCode::LookupFailed);
    }

    #[test]
    fn lookup_fail_open_can_be_disabled() {
        let gate = PreTradeRiskGate::new(RiskConfig {
            fail_open_on_lookup_error: false,
            ..Default::default()
        });
        assert!(gate.on_lookup_error(TradingMode::Paper, "store down").is_err());
    }

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(RiskReasonCode::DailyLossLimit.reason(), "DAILY_LOSS_LIMIT");
        assert_eq!(
            RiskReasonCode::DuplicateClientOrderId.reason(),
            "DUPLICATE_CLIENT_ORDER_ID"
        );
        assert_eq!(RiskReasonCode::PdtLimit.reason(), "PDT_LIMIT");
    }
}
