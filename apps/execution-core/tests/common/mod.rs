//! Shared fixture for integration scenarios.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

use execution_core::broker::{MockBroker, OrderUpdate};
use execution_core::clock::SimulatedClock;
use execution_core::engine::ExecutionEngine;
use execution_core::journal::TransactionLog;
use execution_core::models::{StaticSymbolDirectory, SymbolSpec, TradingMode};
use execution_core::orders::OrderStateMachine;
use execution_core::positions::PositionStore;
use execution_core::protections::{
    CooldownConfig, MaxDrawdownConfig, ProtectionManager, ProtectionsConfig, StoplossGuardConfig,
    TradingWindowConfig, VolatilityHaltConfig,
};
use execution_core::reconcile::{Reconciler, ReconcilerConfig};
use execution_core::risk::{PreTradeRiskGate, RiskConfig};
use execution_core::tracker::OrderTracker;

/// Session start for all scenarios.
pub fn session_start() -> DateTime<Utc> {
    "2026-03-02T14:30:00Z".parse().unwrap()
}

/// All protections disabled; scenarios enable what they test.
pub fn protections_off() -> ProtectionsConfig {
    ProtectionsConfig {
        stoploss_guard: StoplossGuardConfig {
            enabled: false,
            ..Default::default()
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

/// A fully wired engine over shared components.
pub struct Harness {
    pub clock: Arc<SimulatedClock>,
    pub journal: Arc<dyn TransactionLog>,
    pub machine: Arc<OrderStateMachine>,
    pub tracker: Arc<OrderTracker>,
    pub positions: Arc<PositionStore>,
    pub broker: Arc<MockBroker>,
    pub engine: Arc<ExecutionEngine>,
    pub reconciler: Arc<Reconciler>,
    pub updates_tx: mpsc::UnboundedSender<OrderUpdate>,
}

pub struct HarnessOptions {
    pub mode: TradingMode,
    pub start: DateTime<Utc>,
    pub journal: Arc<dyn TransactionLog>,
    pub broker: Arc<MockBroker>,
    pub protections: ProtectionsConfig,
    pub risk: RiskConfig,
}

impl HarnessOptions {
    pub fn paper(journal: Arc<dyn TransactionLog>) -> Self {
        Self {
            mode: TradingMode::Paper,
            start: session_start(),
            journal,
            broker: Arc::new(MockBroker::new()),
            protections: protections_off(),
            risk: RiskConfig::default(),
        }
    }
}

pub async fn build_harness(options: HarnessOptions) -> Harness {
    let clock = Arc::new(SimulatedClock::new(options.start));
    let journal = options.journal;
    let machine = Arc::new(OrderStateMachine::new(clock.clone(), journal.clone()));
    let tracker = Arc::new(OrderTracker::new());
    let positions = Arc::new(
        PositionStore::new_in_memory(clock.clone(), journal.clone())
            .await
            .unwrap(),
    );
    let protections = Arc::new(ProtectionManager::new(
        options.protections,
        clock.clone(),
        journal.clone(),
    ));
    let symbols = Arc::new(StaticSymbolDirectory::new([
        SymbolSpec::equity("SPY"),
        SymbolSpec::equity("QQQ"),
    ]));
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();

    let engine = Arc::new(
        ExecutionEngine::new(
            options.mode,
            clock.clone(),
            journal.clone(),
            machine.clone(),
            tracker.clone(),
            positions.clone(),
            protections,
            PreTradeRiskGate::new(options.risk),
            options.broker.clone(),
            symbols,
            updates_rx,
        )
        .unwrap(),
    );
    engine.record_account(dec!(100000), 0);

    let reconciler = Arc::new(Reconciler::new(
        ReconcilerConfig::default(),
        options.mode,
        clock.clone(),
        journal.clone(),
        options.broker.clone(),
        positions.clone(),
        machine.clone(),
        tracker.clone(),
    ));

    Harness {
        clock,
        journal,
        machine,
        tracker,
        positions,
        broker: options.broker,
        engine,
        reconciler,
        updates_tx,
    }
}
