//! Execution engine — turns admitted signals into broker orders.
//!
//! The submission path runs, in order: duplicate-id check, symbol
//! validation and rounding, protections, pre-trade risk gate, broker
//! submit. `ORDER_SUBMIT` is journaled before the broker call so a crash
//! between the two errs on the side of never double-submitting; replaying
//! those records at startup re-seeds the duplicate set.
//!
//! Fill and status updates arrive on a channel and are applied only by
//! `poll_status`, which runs on the runtime thread: state machine first,
//! then tracker, then position store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, BrokerError, OrderSpec, OrderUpdate};
use crate::clock::Clock;
use crate::journal::{JournalError, TransactionLog};
use crate::models::{
    Event, EventType, Order, OrderSide, OrderStatus, OrderType, Signal, SymbolDirectory,
    SymbolValidationError, TradingMode,
};
use crate::orders::{OrderError, OrderStateMachine, TransitionData};
use crate::positions::{FillOutcome, PositionError, PositionStore};
use crate::protections::{AdmissionDecision, ProtectionContext, ProtectionManager};
use crate::risk::{PreTradeRiskGate, RiskRejection, RiskView};
use crate::tracker::{InFlightOrder, OrderTracker, TrackerError};

/// Closed-trade lookback fed to the protections.
const PROTECTION_LOOKBACK_HOURS: i64 = 24;

/// Retained market-state samples (equity curve, per-symbol closes).
const MARKET_STATE_CAPACITY: usize = 512;

/// Errors from engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Client order id already submitted this session or before a restart.
    #[error("duplicate client order id: {0}")]
    DuplicateOrder(String),

    /// Signal failed symbol validation; no broker contact was made.
    #[error(transparent)]
    Validation(#[from] SymbolValidationError),

    /// A protection is active.
    #[error("protection {protection} active until {until}: {reason}")]
    ProtectionBlocked {
        /// Blocking protection.
        protection: String,
        /// When it clears.
        until: DateTime<Utc>,
        /// Stable reason code.
        reason: String,
    },

    /// The risk gate rejected the signal.
    #[error(transparent)]
    RiskRejected(#[from] RiskRejection),

    /// Broker call failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// State machine failure.
    #[error(transparent)]
    Order(#[from] OrderError),

    /// Position store failure.
    #[error(transparent)]
    Position(#[from] PositionError),

    /// Tracker failure.
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// Journal failure.
    #[error(transparent)]
    Journal(#[from] JournalError),
}

impl EngineError {
    /// Errors the runtime must treat as invariant violations.
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        match self {
            Self::Order(e) => e.is_invariant_violation(),
            Self::Tracker(e) => matches!(e, TrackerError::OverFill { .. }),
            _ => false,
        }
    }

    /// Admission rejections are expected outcomes, not faults.
    #[must_use]
    pub const fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            Self::ProtectionBlocked { .. } | Self::RiskRejected(_) | Self::DuplicateOrder(_)
        )
    }
}

#[derive(Default)]
struct MarketState {
    equity_curve: VecDeque<(DateTime<Utc>, Decimal)>,
    day_trade_count: u32,
    closes: HashMap<String, VecDeque<Decimal>>,
}

/// The execution engine.
pub struct ExecutionEngine {
    mode: TradingMode,
    clock: Arc<dyn Clock>,
    journal: Arc<dyn TransactionLog>,
    machine: Arc<OrderStateMachine>,
    tracker: Arc<OrderTracker>,
    positions: Arc<PositionStore>,
    protections: Arc<ProtectionManager>,
    risk_gate: PreTradeRiskGate,
    broker: Arc<dyn Broker>,
    symbols: Arc<dyn SymbolDirectory>,
    updates: Mutex<mpsc::UnboundedReceiver<OrderUpdate>>,
    submitted_ids: Mutex<HashSet<String>>,
    market: Mutex<MarketState>,
}

impl ExecutionEngine {
    /// Construct the engine, replaying `ORDER_SUBMIT` records from the
    /// journal to seed the duplicate-order set. Replayed events never
    /// re-invoke the broker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: TradingMode,
        clock: Arc<dyn Clock>,
        journal: Arc<dyn TransactionLog>,
        machine: Arc<OrderStateMachine>,
        tracker: Arc<OrderTracker>,
        positions: Arc<PositionStore>,
        protections: Arc<ProtectionManager>,
        risk_gate: PreTradeRiskGate,
        broker: Arc<dyn Broker>,
        symbols: Arc<dyn SymbolDirectory>,
        updates: mpsc::UnboundedReceiver<OrderUpdate>,
    ) -> Result<Self, EngineError> {
        let submits = journal.replay(&|e| e.event_type == EventType::OrderSubmit)?;
        let submitted_ids: HashSet<String> = submits
            .iter()
            .filter_map(|e| e.client_order_id.clone())
            .collect();
        if !submitted_ids.is_empty() {
            info!(
                count = submitted_ids.len(),
                "seeded duplicate-order set from journal"
            );
        }
        Ok(Self {
            mode,
            clock,
            journal,
            machine,
            tracker,
            positions,
            protections,
            risk_gate,
            broker,
            symbols,
            updates: Mutex::new(updates),
            submitted_ids: Mutex::new(submitted_ids),
            market: Mutex::new(MarketState::default()),
        })
    }

    /// Record the latest account snapshot (equity curve sample and day
    /// trade count). Called once per cycle by the runtime.
    pub fn record_account(&self, equity: Decimal, day_trade_count: u32) {
        let now = self.clock.now();
        let mut market = self.lock_market();
        market.equity_curve.push_back((now, equity));
        if market.equity_curve.len() > MARKET_STATE_CAPACITY {
            market.equity_curve.pop_front();
        }
        market.day_trade_count = day_trade_count;
    }

    /// Record a bar close for a symbol (volatility protection input).
    pub fn record_close(&self, symbol: &str, close: Decimal) {
        let mut market = self.lock_market();
        let closes = market.closes.entry(symbol.to_string()).or_default();
        closes.push_back(close);
        if closes.len() > MARKET_STATE_CAPACITY {
            closes.pop_front();
        }
    }

    /// Submit a signal under an engine-generated client order id.
    ///
    /// `reference_price` prices the notional checks (last trade for market
    /// orders); limit orders use their own limit price.
    pub async fn submit(
        &self,
        signal: &Signal,
        reference_price: Decimal,
    ) -> Result<String, EngineError> {
        let client_order_id = self.next_client_order_id(signal, self.clock.now());
        self.submit_with_id(signal, reference_price, client_order_id)
            .await
    }

    /// Submit a signal under a caller-chosen client order id.
    ///
    /// Strategies that derive deterministic ids use this entry point; the
    /// id is the idempotency key, so a repeat (same session or across a
    /// restart) fails with [`EngineError::DuplicateOrder`] without
    /// touching the broker.
    pub async fn submit_with_id(
        &self,
        signal: &Signal,
        reference_price: Decimal,
        client_order_id: String,
    ) -> Result<String, EngineError> {
        let now = self.clock.now();

        // Idempotency first: nothing is created for a duplicate.
        if self.lock_submitted().contains(&client_order_id) {
            return Err(EngineError::DuplicateOrder(client_order_id));
        }

        // Validate and round against symbol properties before any broker
        // contact.
        let spec = self
            .symbols
            .lookup(&signal.symbol)
            .ok_or_else(|| SymbolValidationError::UnknownSymbol(signal.symbol.clone()))?;
        if !spec.tradable {
            return Err(SymbolValidationError::NotTradable(signal.symbol.clone()).into());
        }
        let quantity = spec.round_qty(signal.quantity);
        if quantity.is_zero() {
            return Err(SymbolValidationError::QuantityTooSmall {
                symbol: signal.symbol.clone(),
            }
            .into());
        }
        let limit_price = signal.limit_price.map(|p| spec.round_price(p));
        let price_for_notional = limit_price.unwrap_or(reference_price);
        let notional = quantity * price_for_notional;
        if notional < spec.min_notional {
            return Err(SymbolValidationError::NotionalTooSmall {
                symbol: signal.symbol.clone(),
                notional,
                min_notional: spec.min_notional,
            }
            .into());
        }

        // The order exists locally from here on; admission rejections
        // leave it REJECTED with the reason journaled.
        self.machine.create(Order {
            client_order_id: client_order_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            order_type: signal.order_type,
            requested_qty: quantity,
            limit_price,
            ttl_seconds: signal.ttl_seconds,
            strategy_id: signal.strategy_id.clone(),
            created_at: signal.signal_time,
            status: OrderStatus::Pending,
            broker_order_id: None,
            filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            commission: Decimal::ZERO,
            submitted_at: None,
            filled_at: None,
            cancelled_at: None,
            status_message: String::new(),
        })?;

        let approved_qty = match self
            .admit(signal, &client_order_id, price_for_notional, now)
            .await
        {
            Ok(qty) => qty,
            Err(error) => {
                self.reject_local(&client_order_id, &error.to_string())?;
                return Err(error);
            }
        };

        // Journal the submission before the broker call: a crash in
        // between burns the id instead of risking a double submit.
        self.journal.append(&Event::order(
            EventType::OrderSubmit,
            now,
            client_order_id.clone(),
            json!({
                "symbol": signal.symbol,
                "side": signal.side,
                "order_type": signal.order_type,
                "quantity": approved_qty,
                "limit_price": limit_price,
                "strategy_id": signal.strategy_id,
                "signal_time": signal.signal_time,
            }),
        ))?;
        self.lock_submitted().insert(client_order_id.clone());

        let order_spec = OrderSpec {
            client_order_id: client_order_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            order_type: signal.order_type,
            quantity: approved_qty,
            limit_price,
        };
        match self.broker.submit(&order_spec).await {
            Ok(broker_order_id) => {
                let order = self.machine.transition(
                    &client_order_id,
                    OrderStatus::Pending,
                    OrderStatus::Submitted,
                    TransitionData::Ack {
                        broker_order_id: broker_order_id.clone(),
                    },
                )?;
                self.tracker.start_tracking(InFlightOrder {
                    client_order_id: client_order_id.clone(),
                    broker_order_id,
                    symbol: order.symbol,
                    side: order.side,
                    order_type: order.order_type,
                    requested_qty: order.requested_qty,
                    strategy_id: order.strategy_id,
                    submitted_at: order.submitted_at.unwrap_or(now),
                    status: OrderStatus::Submitted,
                    fills: vec![],
                })?;
                info!(
                    client_order_id = %client_order_id,
                    symbol = %signal.symbol,
                    side = %signal.side,
                    qty = %approved_qty,
                    "order submitted"
                );
                Ok(client_order_id)
            }
            Err(error) => {
                self.reject_local(&client_order_id, &error.to_string())?;
                Err(error.into())
            }
        }
    }

    /// Cancel a working order.
    ///
    /// Returns `Ok(true)` on a broker-acknowledged cancel. `Ok(false)`
    /// means the order was already terminal at the venue; local state is
    /// left for reconciliation.
    pub async fn cancel(
        &self,
        client_order_id: &str,
        reason: &str,
    ) -> Result<bool, EngineError> {
        let order = self.machine.get(client_order_id)?;
        if !order.status.is_cancelable() {
            return Ok(false);
        }
        let Some(broker_order_id) = order.broker_order_id.clone() else {
            return Ok(false);
        };

        let acked = self.broker.cancel(&broker_order_id).await?;
        if !acked {
            debug!(
                client_order_id = %client_order_id,
                "broker reports order already terminal; leaving for reconcile"
            );
            return Ok(false);
        }

        self.machine.transition(
            client_order_id,
            order.status,
            OrderStatus::Cancelled,
            TransitionData::Reason(reason.to_string()),
        )?;
        self.tracker
            .process_status(client_order_id, OrderStatus::Cancelled)?;
        info!(client_order_id = %client_order_id, reason = %reason, "order cancelled");
        Ok(true)
    }

    /// TTL check: `(now - submitted_at) >= ttl`.
    pub fn is_stale(&self, client_order_id: &str, ttl_seconds: u64) -> Result<bool, EngineError> {
        let order = self.machine.get(client_order_id)?;
        if order.status.is_terminal() {
            return Ok(false);
        }
        let Some(submitted_at) = order.submitted_at else {
            return Ok(false);
        };
        let age = self.clock.now() - submitted_at;
        Ok(age >= Duration::seconds(ttl_seconds.min(i64::MAX as u64) as i64))
    }

    /// Cancel stale resting LIMIT orders. Returns the cancelled ids.
    ///
    /// No protective stop is created for an unfilled entry; the order
    /// simply dies.
    pub async fn sweep_stale(&self, default_ttl_seconds: u64) -> Result<Vec<String>, EngineError> {
        let mut cancelled = Vec::new();
        for order in self.machine.pending() {
            if order.order_type != OrderType::Limit || !order.status.is_open() {
                continue;
            }
            let ttl = order.ttl_seconds.unwrap_or(default_ttl_seconds);
            if self.is_stale(&order.client_order_id, ttl)?
                && self.cancel(&order.client_order_id, "ttl expired").await?
            {
                cancelled.push(order.client_order_id);
            }
        }
        Ok(cancelled)
    }

    /// Drain queued fill/status updates and apply them in arrival order.
    ///
    /// Runs on the runtime thread only; this is the single entry point
    /// through which broker I/O reaches the state machine, tracker, and
    /// position store.
    pub async fn poll_status(&self) -> Result<u32, EngineError> {
        let mut processed = 0;
        loop {
            let update = {
                let mut updates = match self.updates.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                updates.try_recv().ok()
            };
            let Some(update) = update else { break };
            match update {
                OrderUpdate::Fill {
                    client_order_id,
                    fill,
                } => {
                    self.apply_fill_update(&client_order_id, fill).await?;
                }
                OrderUpdate::Status {
                    client_order_id,
                    status,
                    reason,
                } => {
                    self.apply_status_update(&client_order_id, status, reason)?;
                }
            }
            processed += 1;
        }
        Ok(processed)
    }

    /// Snapshot of the duplicate-order set size (for observability).
    #[must_use]
    pub fn submitted_count(&self) -> usize {
        self.lock_submitted().len()
    }

    /// Orders journaled as submitted since the given instant.
    pub fn submitted_since(&self, cutoff: DateTime<Utc>) -> Result<u32, EngineError> {
        let submits = self.journal.replay(&|e| {
            e.event_type == EventType::OrderSubmit && e.logged_at >= cutoff
        })?;
        Ok(submits.len() as u32)
    }

    async fn apply_fill_update(
        &self,
        client_order_id: &str,
        fill: crate::models::Fill,
    ) -> Result<(), EngineError> {
        let order = self.machine.get(client_order_id)?;
        if !order.status.can_fill() {
            warn!(
                client_order_id = %client_order_id,
                status = %order.status,
                "dropping fill for non-fillable order"
            );
            return Ok(());
        }
        let complete = order.filled_qty + fill.quantity == order.requested_qty;
        let target = if complete {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let updated = self.machine.transition(
            client_order_id,
            order.status,
            target,
            TransitionData::Fill(fill.clone()),
        )?;
        self.tracker.process_fill(client_order_id, fill.clone())?;

        // A closing fill must release the resting protective stop.
        let resting_stop = if updated.side == OrderSide::Sell {
            self.positions
                .position(&updated.symbol)
                .await?
                .and_then(|p| p.stop_order_id)
        } else {
            None
        };

        let outcome = self
            .positions
            .apply_fill(
                &updated.symbol,
                updated.side,
                fill.quantity,
                fill.price,
                fill.commission,
                &updated.strategy_id,
            )
            .await?;

        if let FillOutcome::Closed(_) = outcome
            && let Some(stop_id) = resting_stop
        {
            match self.broker.cancel(&stop_id).await {
                Ok(_) => debug!(stop_order_id = %stop_id, "protective stop released"),
                Err(e) => warn!(
                    stop_order_id = %stop_id,
                    error = %e,
                    "failed to cancel protective stop"
                ),
            }
        }
        Ok(())
    }

    fn apply_status_update(
        &self,
        client_order_id: &str,
        status: OrderStatus,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let order = self.machine.get(client_order_id)?;
        if order.status == status || order.status.is_terminal() {
            return Ok(());
        }
        let data = reason.map_or(TransitionData::None, TransitionData::Reason);
        self.machine
            .transition(client_order_id, order.status, status, data)?;
        self.tracker.process_status(client_order_id, status)?;
        Ok(())
    }

    async fn admit(
        &self,
        signal: &Signal,
        client_order_id: &str,
        reference_price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Decimal, EngineError> {
        // Stage 1: protections, on a consistent snapshot.
        let closed_trades = match self
            .positions
            .closed_trades_since(now - Duration::hours(PROTECTION_LOOKBACK_HOURS))
            .await
        {
            Ok(trades) => trades,
            Err(e) => {
                self.risk_gate.on_lookup_error(self.mode, &e.to_string())?;
                vec![]
            }
        };
        let (equity_curve, day_trade_count, recent_closes) = {
            let market = self.lock_market();
            (
                market.equity_curve.iter().copied().collect::<Vec<_>>(),
                market.day_trade_count,
                market
                    .closes
                    .get(&signal.symbol)
                    .map(|c| c.iter().copied().collect::<Vec<_>>())
                    .unwrap_or_default(),
            )
        };
        let ctx = ProtectionContext {
            now,
            symbol: &signal.symbol,
            closed_trades: &closed_trades,
            equity_curve: &equity_curve,
            recent_closes: &recent_closes,
        };
        if let AdmissionDecision::Blocked {
            protection,
            until,
            reason,
        } = self.protections.check(&ctx)
        {
            return Err(EngineError::ProtectionBlocked {
                protection,
                until,
                reason,
            });
        }

        // Stage 2: risk gate, same snapshot.
        let open_positions = match self.positions.open_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                self.risk_gate.on_lookup_error(self.mode, &e.to_string())?;
                vec![]
            }
        };
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map_or(now, |d| d.and_utc());
        let daily_realized_pnl = match self.positions.realized_pnl_since(day_start).await {
            Ok(pnl) => pnl,
            Err(e) => {
                self.risk_gate.on_lookup_error(self.mode, &e.to_string())?;
                Decimal::ZERO
            }
        };
        let opened_today: HashSet<String> = open_positions
            .iter()
            .filter(|p| p.opened_at >= day_start)
            .map(|p| p.symbol.clone())
            .collect();
        let account_equity = self
            .lock_market()
            .equity_curve
            .back()
            .map_or(Decimal::ZERO, |(_, equity)| *equity);
        let orders_submitted_today = self.submitted_since(day_start)?;

        let view = RiskView {
            mode: self.mode,
            daily_realized_pnl,
            account_equity,
            day_trade_count,
            orders_submitted_today,
            open_positions: &open_positions,
            opened_today: &opened_today,
            reference_price,
        };
        let submitted = self.lock_submitted().clone();
        let approval = self
            .risk_gate
            .evaluate(signal, client_order_id, &submitted, &view)?;
        if approval.capped {
            info!(
                client_order_id = %client_order_id,
                requested = %signal.quantity,
                approved = %approval.quantity,
                "sell quantity capped to open position"
            );
        }
        Ok(approval.quantity)
    }

    fn reject_local(&self, client_order_id: &str, reason: &str) -> Result<(), EngineError> {
        self.machine.transition(
            client_order_id,
            OrderStatus::Pending,
            OrderStatus::Rejected,
            TransitionData::Reason(reason.to_string()),
        )?;
        Ok(())
    }

    fn next_client_order_id(&self, signal: &Signal, now: DateTime<Utc>) -> String {
        let nonce = Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}-{}",
            signal.strategy_id,
            signal.symbol,
            now.timestamp_millis(),
            &nonce[..8]
        )
    }

    fn lock_submitted(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.submitted_ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_market(&self) -> MutexGuard<'_, MarketState> {
        match self.market.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
