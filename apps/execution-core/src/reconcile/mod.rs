//! Startup and periodic reconciliation against the broker.
//!
//! The broker is authoritative. Positions are compared symbol by symbol
//! and classified; orders are compared against the broker's open set to
//! surface orphans and shadows. Paper mode heals local state to match the
//! broker; live mode only proceeds when drift is within tolerance, and
//! the runtime halts otherwise.
//!
//! A symbol the broker holds that we do not is an accounting gap,
//! tolerated up to `max_missing`. A symbol we hold that the broker denies
//! is a 100% drift against broker truth and fails live reconciliation on
//! its own.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::clock::Clock;
use crate::journal::{JournalError, TransactionLog};
use crate::models::{Event, EventType, OrderSide, OrderStatus, OrderType, TradingMode};
use crate::orders::{OrderError, OrderStateMachine, TransitionData};
use crate::positions::{PositionError, PositionStore};
use crate::tracker::OrderTracker;

/// Reconciler configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReconcilerConfig {
    /// Broker-side positions missing locally tolerated before failing.
    #[serde(default = "default_max_missing")]
    pub max_missing: u32,
    /// Per-symbol quantity drift percentage tolerated before failing.
    #[serde(default = "default_max_drift_pct")]
    pub max_drift_pct: Decimal,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_missing: default_max_missing(),
            max_drift_pct: default_max_drift_pct(),
        }
    }
}

const fn default_max_missing() -> u32 {
    3
}

fn default_max_drift_pct() -> Decimal {
    Decimal::new(5, 0)
}

/// Classification of one symbol's local-vs-broker comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionDelta {
    /// Quantities agree.
    Match {
        /// Symbol.
        symbol: String,
    },
    /// Broker holds a position we do not track.
    MissingLocal {
        /// Symbol.
        symbol: String,
        /// Broker quantity.
        broker_qty: Decimal,
        /// Broker average entry price.
        broker_avg_price: Decimal,
    },
    /// We track a position the broker does not hold (100% drift).
    MissingBroker {
        /// Symbol.
        symbol: String,
        /// Local quantity.
        local_qty: Decimal,
    },
    /// Both sides hold the symbol with different quantities.
    QuantityMismatch {
        /// Symbol.
        symbol: String,
        /// Local quantity.
        local_qty: Decimal,
        /// Broker quantity.
        broker_qty: Decimal,
        /// `|local - broker| / |broker| * 100`.
        drift_pct: Decimal,
    },
}

impl PositionDelta {
    /// Returns true when the comparison found agreement.
    #[must_use]
    pub const fn is_match(&self) -> bool {
        matches!(self, Self::Match { .. })
    }
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    /// Per-symbol classifications (matches included).
    pub deltas: Vec<PositionDelta>,
    /// Broker order ids open at the venue but unknown locally.
    pub orphans: Vec<String>,
    /// Client order ids tracked locally but gone at the venue.
    pub shadows: Vec<String>,
    /// Heals applied (paper mode only).
    pub healed: u32,
    /// Whether the trading loop may proceed.
    pub passed: bool,
}

impl ReconcileReport {
    /// Count of non-match position deltas.
    #[must_use]
    pub fn discrepancy_count(&self) -> usize {
        self.deltas.iter().filter(|d| !d.is_match()).count()
    }
}

/// Errors from reconciliation I/O.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Broker call failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Position store failure.
    #[error(transparent)]
    Position(#[from] PositionError),

    /// State machine failure while healing.
    #[error(transparent)]
    Order(#[from] OrderError),

    /// Journal failure.
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Brings local state into agreement with the broker.
pub struct Reconciler {
    config: ReconcilerConfig,
    mode: TradingMode,
    clock: Arc<dyn Clock>,
    journal: Arc<dyn TransactionLog>,
    broker: Arc<dyn Broker>,
    positions: Arc<PositionStore>,
    machine: Arc<OrderStateMachine>,
    tracker: Arc<OrderTracker>,
}

impl Reconciler {
    /// Build a reconciler.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ReconcilerConfig,
        mode: TradingMode,
        clock: Arc<dyn Clock>,
        journal: Arc<dyn TransactionLog>,
        broker: Arc<dyn Broker>,
        positions: Arc<PositionStore>,
        machine: Arc<OrderStateMachine>,
        tracker: Arc<OrderTracker>,
    ) -> Self {
        Self {
            config,
            mode,
            clock,
            journal,
            broker,
            positions,
            machine,
            tracker,
        }
    }

    /// Run one reconciliation pass.
    ///
    /// Runs mandatorily before the trading loop starts and on demand
    /// afterwards. `passed = false` means the runtime must halt (live
    /// mode drift above tolerance).
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let now = self.clock.now();
        info!(mode = %self.mode, "starting reconciliation");

        let broker_positions = self.broker.list_positions().await?;
        let local_positions = self.positions.open_positions().await?;

        let broker_by_symbol: HashMap<&str, (Decimal, Decimal)> = broker_positions
            .iter()
            .map(|p| (p.symbol.as_str(), (p.qty, p.avg_entry_price)))
            .collect();
        let local_symbols: HashSet<&str> =
            local_positions.iter().map(|p| p.symbol.as_str()).collect();

        let mut deltas = Vec::new();
        for local in &local_positions {
            match broker_by_symbol.get(local.symbol.as_str()) {
                None => deltas.push(PositionDelta::MissingBroker {
                    symbol: local.symbol.clone(),
                    local_qty: local.quantity,
                }),
                Some((broker_qty, _)) if *broker_qty == local.quantity => {
                    deltas.push(PositionDelta::Match {
                        symbol: local.symbol.clone(),
                    });
                }
                Some((broker_qty, _)) => {
                    let drift_pct = if broker_qty.is_zero() {
                        Decimal::ONE_HUNDRED
                    } else {
                        ((local.quantity - *broker_qty).abs() / broker_qty.abs())
                            * Decimal::ONE_HUNDRED
                    };
                    deltas.push(PositionDelta::QuantityMismatch {
                        symbol: local.symbol.clone(),
                        local_qty: local.quantity,
                        broker_qty: *broker_qty,
                        drift_pct,
                    });
                }
            }
        }
        for broker_pos in &broker_positions {
            if !local_symbols.contains(broker_pos.symbol.as_str()) {
                deltas.push(PositionDelta::MissingLocal {
                    symbol: broker_pos.symbol.clone(),
                    broker_qty: broker_pos.qty,
                    broker_avg_price: broker_pos.avg_entry_price,
                });
            }
        }

        // Orders: orphans and shadows against the broker's open set.
        let broker_open: Vec<String> = self
            .broker
            .list_open_orders()
            .await?
            .iter()
            .map(|o| o.broker_order_id.clone())
            .collect();
        let orphans = self.tracker.orphans(&broker_open);
        let shadows = self.tracker.shadows(&broker_open);

        let discrepancies = deltas.iter().filter(|d| !d.is_match()).count();
        if discrepancies > 0 || !orphans.is_empty() || !shadows.is_empty() {
            self.journal.append(&Event::system(
                EventType::ReconcileDelta,
                now,
                json!({
                    "discrepancies": discrepancies,
                    "orphans": orphans,
                    "shadows": shadows,
                    "deltas": deltas
                        .iter()
                        .filter(|d| !d.is_match())
                        .map(describe_delta)
                        .collect::<Vec<_>>(),
                }),
            ))?;
        }

        let mut healed = 0;
        let passed = if self.mode.is_live() {
            self.evaluate_live(&deltas)
        } else {
            healed = self.heal(&deltas, &shadows).await?;
            true
        };

        info!(
            discrepancies,
            orphans = orphans.len(),
            shadows = shadows.len(),
            healed,
            passed,
            "reconciliation complete"
        );
        Ok(ReconcileReport {
            deltas,
            orphans,
            shadows,
            healed,
            passed,
        })
    }

    /// Load resting protective stops from the broker into a
    /// `symbol -> broker_order_id` map, recording them on the open
    /// positions. Lookup failure is fail-open: an empty map, with the
    /// single-position invariant preventing duplicate stops downstream.
    pub async fn load_protective_stops(&self) -> HashMap<String, String> {
        let open = match self.broker.list_open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(error = %e, "protective stop lookup failed; starting with empty map");
                return HashMap::new();
            }
        };

        let mut stops = HashMap::new();
        for order in open {
            let is_stop = matches!(order.order_type, OrderType::Stop | OrderType::StopLimit);
            if is_stop && order.side == OrderSide::Sell {
                stops.insert(order.symbol.clone(), order.broker_order_id.clone());
                if let Err(e) = self
                    .positions
                    .set_stop_order(&order.symbol, Some(&order.broker_order_id))
                    .await
                {
                    warn!(symbol = %order.symbol, error = %e, "failed to record stop id");
                }
            }
        }
        debug!(count = stops.len(), "protective stops loaded");
        stops
    }

    fn evaluate_live(&self, deltas: &[PositionDelta]) -> bool {
        let mut missing_local = 0u32;
        let mut passed = true;
        for delta in deltas {
            match delta {
                PositionDelta::Match { .. } => {}
                PositionDelta::MissingLocal { symbol, .. } => {
                    missing_local += 1;
                    warn!(symbol = %symbol, "broker position missing locally");
                }
                PositionDelta::MissingBroker { symbol, local_qty } => {
                    warn!(
                        symbol = %symbol,
                        local_qty = %local_qty,
                        "local position unknown to broker (100% drift)"
                    );
                    passed = false;
                }
                PositionDelta::QuantityMismatch {
                    symbol, drift_pct, ..
                } => {
                    if *drift_pct > self.config.max_drift_pct {
                        warn!(symbol = %symbol, drift_pct = %drift_pct, "drift above tolerance");
                        passed = false;
                    } else {
                        warn!(symbol = %symbol, drift_pct = %drift_pct, "drift within tolerance");
                    }
                }
            }
        }
        if missing_local > self.config.max_missing {
            warn!(
                missing = missing_local,
                max = self.config.max_missing,
                "too many broker positions missing locally"
            );
            passed = false;
        }
        passed
    }

    async fn heal(
        &self,
        deltas: &[PositionDelta],
        shadows: &[String],
    ) -> Result<u32, ReconcileError> {
        let mut healed = 0;
        for delta in deltas {
            match delta {
                PositionDelta::Match { .. } => {}
                PositionDelta::MissingLocal {
                    symbol,
                    broker_qty,
                    broker_avg_price,
                } => {
                    self.positions
                        .upsert_from_broker(symbol, *broker_qty, *broker_avg_price, "reconciler")
                        .await?;
                    info!(symbol = %symbol, qty = %broker_qty, "healed: adopted broker position");
                    healed += 1;
                }
                PositionDelta::MissingBroker { symbol, .. } => {
                    self.positions.remove(symbol).await?;
                    info!(symbol = %symbol, "healed: dropped position broker does not hold");
                    healed += 1;
                }
                PositionDelta::QuantityMismatch {
                    symbol, broker_qty, ..
                } => {
                    let avg = self
                        .positions
                        .position(symbol)
                        .await?
                        .map_or(Decimal::ZERO, |p| p.entry_vwap);
                    self.positions
                        .upsert_from_broker(symbol, *broker_qty, avg, "reconciler")
                        .await?;
                    info!(symbol = %symbol, qty = %broker_qty, "healed: synced quantity");
                    healed += 1;
                }
            }
        }

        // Shadows: the venue no longer knows these orders; close them out.
        for client_order_id in shadows {
            let order = self.machine.get(client_order_id)?;
            if order.status.is_terminal() {
                continue;
            }
            self.machine.transition(
                client_order_id,
                order.status,
                OrderStatus::Cancelled,
                TransitionData::Reason("not found at broker during reconcile".to_string()),
            )?;
            self.tracker.forget(client_order_id);
            info!(client_order_id = %client_order_id, "healed: closed shadow order");
            healed += 1;
        }
        Ok(healed)
    }
}

fn describe_delta(delta: &PositionDelta) -> serde_json::Value {
    match delta {
        PositionDelta::Match { symbol } => json!({ "symbol": symbol, "kind": "match" }),
        PositionDelta::MissingLocal {
            symbol, broker_qty, ..
        } => json!({ "symbol": symbol, "kind": "missing_local", "broker_qty": broker_qty }),
        PositionDelta::MissingBroker { symbol, local_qty } => {
            json!({ "symbol": symbol, "kind": "missing_broker", "local_qty": local_qty })
        }
        PositionDelta::QuantityMismatch {
            symbol,
            local_qty,
            broker_qty,
            drift_pct,
        } => json!({
            "symbol": symbol,
            "kind": "quantity_mismatch",
            "local_qty": local_qty,
            "broker_qty": broker_qty,
            "drift_pct": drift_pct,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerPosition, MockBroker, OpenOrder};
    use crate::clock::SimulatedClock;
    use crate::journal::MemoryJournal;
    use crate::tracker::InFlightOrder;
    use chrono::{DateTime, Utc};
    use rust_decimal_macros::dec;

    fn start_time() -> DateTime<Utc> {
        "2026-03-02T14:30:00Z".parse().unwrap()
    }

    struct Fixture {
        reconciler: Reconciler,
        broker: Arc<MockBroker>,
        positions: Arc<PositionStore>,
        machine: Arc<OrderStateMachine>,
        tracker: Arc<OrderTracker>,
        journal: Arc<MemoryJournal>,
    }

    async fn make_fixture(mode: TradingMode) -> Fixture {
        let clock = Arc::new(SimulatedClock::new(start_time()));
        let journal = Arc::new(MemoryJournal::new());
        let machine = Arc::new(OrderStateMachine::new(clock.clone(), journal.clone()));
        let tracker = Arc::new(OrderTracker::new());
        let positions = Arc::new(
            PositionStore::new_in_memory(clock.clone(), journal.clone())
                .await
                .unwrap(),
        );
        let broker = Arc::new(MockBroker::new());
        let reconciler = Reconciler::new(
            ReconcilerConfig::default(),
            mode,
            clock,
            journal.clone(),
            broker.clone(),
            positions.clone(),
            machine.clone(),
            tracker.clone(),
        );
        Fixture {
            reconciler,
            broker,
            positions,
            machine,
            tracker,
            journal,
        }
    }

    fn broker_position(symbol: &str, qty: Decimal) -> BrokerPosition {
        BrokerPosition {
            symbol: symbol.to_string(),
            qty,
            avg_entry_price: dec!(450.00),
        }
    }

    fn stop_order(symbol: &str, broker_id: &str) -> OpenOrder {
        OpenOrder {
            broker_order_id: broker_id.to_string(),
            client_order_id: None,
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Stop,
            quantity: dec!(10),
            filled_qty: Decimal::ZERO,
            created_at: start_time(),
        }
    }

    #[tokio::test]
    async fn agreement_passes_clean() {
        let fixture = make_fixture(TradingMode::Live).await;
        fixture
            .positions
            .upsert_from_broker("SPY", dec!(10), dec!(450.00), "vwap")
            .await
            .unwrap();
        fixture
            .broker
            .set_positions(vec![broker_position("SPY", dec!(10))]);

        let report = fixture.reconciler.reconcile().await.unwrap();
        assert!(report.passed);
        assert_eq!(report.discrepancy_count(), 0);
        assert!(fixture.journal.replay(&|_| true).unwrap().is_empty());
    }

    #[tokio::test]
    async fn live_halts_on_position_broker_denies() {
        // Local SPY=10, broker flat: 100% drift.
        let fixture = make_fixture(TradingMode::Live).await;
        fixture
            .positions
            .upsert_from_broker("SPY", dec!(10), dec!(450.00), "vwap")
            .await
            .unwrap();

        let report = fixture.reconciler.reconcile().await.unwrap();
        assert!(!report.passed);
        assert!(matches!(
            report.deltas[0],
            PositionDelta::MissingBroker { .. }
        ));

        let events = fixture
            .journal
            .replay(&|e| e.event_type == EventType::ReconcileDelta)
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn live_tolerates_small_drift() {
        let fixture = make_fixture(TradingMode::Live).await;
        fixture
            .positions
            .upsert_from_broker("SPY", dec!(100), dec!(450.00), "vwap")
            .await
            .unwrap();
        // 2% drift, under the 5% tolerance.
        fixture
            .broker
            .set_positions(vec![broker_position("SPY", dec!(98))]);

        let report = fixture.reconciler.reconcile().await.unwrap();
        assert!(report.passed);
        assert_eq!(report.discrepancy_count(), 1);
    }

    #[tokio::test]
    async fn live_halts_on_large_drift() {
        let fixture = make_fixture(TradingMode::Live).await;
        fixture
            .positions
            .upsert_from_broker("SPY", dec!(100), dec!(450.00), "vwap")
            .await
            .unwrap();
        // 50% drift.
        fixture
            .broker
            .set_positions(vec![broker_position("SPY", dec!(200))]);

        let report = fixture.reconciler.reconcile().await.unwrap();
        assert!(!report.passed);
    }

    #[tokio::test]
    async fn live_tolerates_few_missing_local() {
        let fixture = make_fixture(TradingMode::Live).await;
        fixture.broker.set_positions(vec![
            broker_position("SPY", dec!(10)),
            broker_position("QQQ", dec!(5)),
        ]);

        let report = fixture.reconciler.reconcile().await.unwrap();
        // 2 missing <= max_missing of 3.
        assert!(report.passed);
        assert_eq!(report.discrepancy_count(), 2);
    }

    #[tokio::test]
    async fn live_halts_when_missing_exceeds_cap() {
        let fixture = make_fixture(TradingMode::Live).await;
        fixture.broker.set_positions(vec![
            broker_position("SPY", dec!(10)),
            broker_position("QQQ", dec!(5)),
            broker_position("IWM", dec!(5)),
            broker_position("DIA", dec!(5)),
        ]);

        let report = fixture.reconciler.reconcile().await.unwrap();
        assert!(!report.passed);
    }

    #[tokio::test]
    async fn paper_heals_all_position_deltas() {
        let fixture = make_fixture(TradingMode::Paper).await;
        // Local has SPY (broker flat), broker has QQQ (local flat),
        // both have IWM at different sizes.
        fixture
            .positions
            .upsert_from_broker("SPY", dec!(10), dec!(450.00), "vwap")
            .await
            .unwrap();
        fixture
            .positions
            .upsert_from_broker("IWM", dec!(20), dec!(220.00), "vwap")
            .await
            .unwrap();
        fixture.broker.set_positions(vec![
            broker_position("QQQ", dec!(5)),
            broker_position("IWM", dec!(15)),
        ]);

        let report = fixture.reconciler.reconcile().await.unwrap();
        assert!(report.passed);
        assert_eq!(report.healed, 3);

        assert!(fixture.positions.position("SPY").await.unwrap().is_none());
        assert_eq!(
            fixture.positions.position("QQQ").await.unwrap().unwrap().quantity,
            dec!(5)
        );
        assert_eq!(
            fixture.positions.position("IWM").await.unwrap().unwrap().quantity,
            dec!(15)
        );
    }

    #[tokio::test]
    async fn paper_heals_shadow_orders() {
        let fixture = make_fixture(TradingMode::Paper).await;

        // A tracked order the broker no longer knows.
        fixture
            .machine
            .create(crate::models::Order {
                client_order_id: "C1".to_string(),
                symbol: "SPY".to_string(),
                side: OrderSide::Buy,
                order_type: OrderType::Limit,
                requested_qty: dec!(10),
                limit_price: Some(dec!(449.00)),
                ttl_seconds: None,
                strategy_id: "vwap".to_string(),
                created_at: start_time(),
                status: crate::models::OrderStatus::Pending,
                broker_order_id: None,
                filled_qty: Decimal::ZERO,
                avg_fill_price: Decimal::ZERO,
                commission: Decimal::ZERO,
                submitted_at: None,
                filled_at: None,
                cancelled_at: None,
                status_message: String::new(),
            })
            .unwrap();
        fixture
            .machine
            .transition(
                "C1",
                OrderStatus::Pending,
                OrderStatus::Submitted,
                TransitionData::Ack {
                    broker_order_id: "B1".to_string(),
                },
            )
            .unwrap();
        fixture
            .tracker
            .start_tracking(InFlightOrder {
                client_order_id: "C1".to_string(),
                broker_order_id: "B1".to_string(),
                symbol: "SPY".to_string(),
                side: OrderSide::Buy,
                order_type: OrderType::Limit,
                requested_qty: dec!(10),
                strategy_id: "vwap".to_string(),
                submitted_at: start_time(),
                status: OrderStatus::Submitted,
                fills: vec![],
            })
            .unwrap();

        let report = fixture.reconciler.reconcile().await.unwrap();
        assert_eq!(report.shadows, vec!["C1".to_string()]);

        let order = fixture.machine.get("C1").unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(fixture.tracker.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn orphans_are_surfaced_not_mutated() {
        let fixture = make_fixture(TradingMode::Paper).await;
        fixture.broker.set_open_orders(vec![OpenOrder {
            broker_order_id: "B77".to_string(),
            client_order_id: None,
            symbol: "SPY".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: dec!(10),
            filled_qty: Decimal::ZERO,
            created_at: start_time(),
        }]);

        let report = fixture.reconciler.reconcile().await.unwrap();
        assert_eq!(report.orphans, vec!["B77".to_string()]);
    }

    #[tokio::test]
    async fn protective_stops_load_into_map() {
        let fixture = make_fixture(TradingMode::Live).await;
        fixture
            .positions
            .upsert_from_broker("SPY", dec!(10), dec!(450.00), "vwap")
            .await
            .unwrap();
        fixture
            .broker
            .set_open_orders(vec![stop_order("SPY", "B-stop-1")]);

        let stops = fixture.reconciler.load_protective_stops().await;
        assert_eq!(stops.get("SPY").map(String::as_str), Some("B-stop-1"));

        let position = fixture.positions.position("SPY").await.unwrap().unwrap();
        assert_eq!(position.stop_order_id.as_deref(), Some("B-stop-1"));
    }

    #[tokio::test]
    async fn stop_lookup_failure_is_fail_open() {
        let fixture = make_fixture(TradingMode::Live).await;
        fixture
            .broker
            .fail_next_list_open_orders(BrokerError::Transient {
                message: "503".to_string(),
            });

        let stops = fixture.reconciler.load_protective_stops().await;
        assert!(stops.is_empty());
    }
}
