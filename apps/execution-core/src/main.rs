//! Execution core binary.
//!
//! Composition root: builds the component graph in initialization order
//! (clock, journal, state, risk, execution, runtime) and runs the trading
//! loop. Exit code 0 is a clean shutdown; exit code 1 is a halt.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin execution-core -- [config.yaml]
//! ```
//!
//! The binary ships with the paper wiring (mock venue, idle feed); live
//! deployments plug a real broker adapter, strategy, and feed into
//! [`execution_core::runtime::Runtime`] through this entry point.

use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, info};

use execution_core::broker::MockBroker;
use execution_core::clock::{Clock, SystemClock};
use execution_core::config::{ExecutionConfig, load_config};
use execution_core::engine::ExecutionEngine;
use execution_core::journal::FileJournal;
use execution_core::models::{Bar, Signal, StaticSymbolDirectory};
use execution_core::orders::OrderStateMachine;
use execution_core::positions::PositionStore;
use execution_core::protections::ProtectionManager;
use execution_core::reconcile::Reconciler;
use execution_core::risk::PreTradeRiskGate;
use execution_core::runtime::{BarFeed, FeedError, Runtime, Strategy};
use execution_core::tracker::OrderTracker;

/// Feed that ends immediately; stands in until a data adapter is wired.
struct IdleFeed;

#[async_trait::async_trait]
impl BarFeed for IdleFeed {
    async fn next_bar(&self) -> Result<Option<Bar>, FeedError> {
        Ok(None)
    }
}

/// Strategy that never signals; stands in until one is wired.
struct IdleStrategy;

impl Strategy for IdleStrategy {
    fn on_bar(&self, _bar: &Bar, _now: DateTime<Utc>) -> Option<Signal> {
        None
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("execution_core=info")),
        )
        .init();

    let config_path = std::env::args().nth(1);
    let config = match config_path.as_deref() {
        Some(path) => match load_config(Some(path)) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "failed to load configuration");
                return ExitCode::FAILURE;
            }
        },
        None => ExecutionConfig::default(),
    };

    if config.account.mode.is_live() {
        error!("live mode requires a real broker adapter; none is wired in this binary");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(code) => {
            info!(exit_code = code, "execution core stopped");
            if code == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "failed to start execution core");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ExecutionConfig) -> anyhow::Result<u8> {
    info!(mode = %config.account.mode, "starting execution core");

    // Initialization order: clock, journal, states, risk, execution,
    // runtime.
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let journal = Arc::new(FileJournal::open(&config.execution.journal_path)?);
    let machine = Arc::new(OrderStateMachine::new(clock.clone(), journal.clone()));
    let tracker = Arc::new(OrderTracker::new());
    let positions = Arc::new(
        PositionStore::new_local(
            &config.execution.positions_db_path,
            clock.clone(),
            journal.clone(),
        )
        .await?,
    );
    let protections = Arc::new(ProtectionManager::new(
        config.protections.clone(),
        clock.clone(),
        journal.clone(),
    ));
    let risk_gate = PreTradeRiskGate::new(config.risk.clone());
    let broker = Arc::new(MockBroker::new());
    let symbols = Arc::new(StaticSymbolDirectory::default());
    let (_updates_tx, updates_rx) = mpsc::unbounded_channel();

    let engine = Arc::new(ExecutionEngine::new(
        config.account.mode,
        clock.clone(),
        journal.clone(),
        machine.clone(),
        tracker.clone(),
        positions.clone(),
        protections,
        risk_gate,
        broker.clone(),
        symbols,
        updates_rx,
    )?);
    let reconciler = Arc::new(Reconciler::new(
        config.reconciler.clone(),
        config.account.mode,
        clock.clone(),
        journal.clone(),
        broker.clone(),
        positions,
        machine.clone(),
        tracker,
    ));

    let mut runtime = Runtime::new(
        config.runtime.clone(),
        config.execution.default_limit_ttl_seconds,
        clock,
        journal,
        engine,
        machine,
        reconciler,
        broker,
        Arc::new(IdleStrategy),
        Arc::new(IdleFeed),
    );
    Ok(runtime.run().await)
}
