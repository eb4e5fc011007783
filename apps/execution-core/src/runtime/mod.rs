//! Runtime — the trading loop and the invariant-halt layer.
//!
//! One cycle: fetch bar, feed the strategy, admit and submit any signal,
//! drain fills, sweep stale TTLs, reconcile periodically, sleep. Three
//! triggers short-circuit the loop with exit code 1: failed startup
//! recovery, any invariant violation, and the consecutive-failure
//! breaker. Halting is synchronous and auditable: a `HALT` event is
//! journaled, pending orders are cancelled best-effort, and the journal
//! is closed before the process exits.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::clock::Clock;
use crate::engine::{EngineError, ExecutionEngine};
use crate::journal::TransactionLog;
use crate::models::{Bar, Event, EventType, Signal};
use crate::orders::OrderStateMachine;
use crate::reconcile::Reconciler;

/// Exit code for a clean shutdown.
pub const EXIT_CLEAN: u8 = 0;

/// Exit code for any halt.
pub const EXIT_HALT: u8 = 1;

/// Runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Consecutive unhandled cycle failures before halting.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Sleep between cycles, in seconds.
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    /// Cycles between periodic reconciliations.
    #[serde(default = "default_reconcile_interval_cycles")]
    pub reconcile_interval_cycles: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            cycle_interval_secs: default_cycle_interval_secs(),
            reconcile_interval_cycles: default_reconcile_interval_cycles(),
        }
    }
}

const fn default_max_consecutive_failures() -> u32 {
    5
}

const fn default_cycle_interval_secs() -> u64 {
    60
}

const fn default_reconcile_interval_cycles() -> u64 {
    10
}

/// Why the process halted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltCause {
    /// Startup reconciliation failed.
    RecoveryFailed,
    /// A documented invariant was violated.
    InvariantViolation(String),
    /// Mid-run reconciliation drifted outside tolerance.
    ReconcileDrift,
    /// The consecutive-failure breaker tripped.
    ConsecutiveFailures(u32),
}

impl std::fmt::Display for HaltCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RecoveryFailed => write!(f, "recovery_failed"),
            Self::InvariantViolation(detail) => write!(f, "invariant_violation: {detail}"),
            Self::ReconcileDrift => write!(f, "reconcile_drift"),
            Self::ConsecutiveFailures(n) => write!(f, "consecutive_failures: {n}"),
        }
    }
}

/// Counter of consecutive unhandled cycle failures.
#[derive(Debug)]
pub struct FailureBreaker {
    threshold: u32,
    consecutive: u32,
}

impl FailureBreaker {
    /// Create a breaker that trips at `threshold`.
    #[must_use]
    pub const fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive: 0,
        }
    }

    /// Record a failed cycle. Returns true when the breaker trips.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.threshold
    }

    /// Record a clean cycle.
    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Current consecutive-failure count.
    #[must_use]
    pub const fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Feed error surfaced by a bar source.
#[derive(Debug, Error)]
#[error("bar feed error: {0}")]
pub struct FeedError(pub String);

/// Source of market data bars (external collaborator).
#[async_trait]
pub trait BarFeed: Send + Sync {
    /// Next bar, or `None` when the feed is exhausted (clean shutdown).
    async fn next_bar(&self) -> Result<Option<Bar>, FeedError>;
}

/// Signal-producing strategy (external collaborator).
pub trait Strategy: Send + Sync {
    /// React to a bar, optionally emitting a signal.
    fn on_bar(&self, bar: &Bar, now: DateTime<Utc>) -> Option<Signal>;
}

/// The trading loop driver.
pub struct Runtime {
    config: RuntimeConfig,
    default_limit_ttl_seconds: u64,
    clock: Arc<dyn Clock>,
    journal: Arc<dyn TransactionLog>,
    engine: Arc<ExecutionEngine>,
    machine: Arc<OrderStateMachine>,
    reconciler: Arc<Reconciler>,
    broker: Arc<dyn Broker>,
    strategy: Arc<dyn Strategy>,
    feed: Arc<dyn BarFeed>,
    breaker: FailureBreaker,
}

impl Runtime {
    /// Build the runtime.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        default_limit_ttl_seconds: u64,
        clock: Arc<dyn Clock>,
        journal: Arc<dyn TransactionLog>,
        engine: Arc<ExecutionEngine>,
        machine: Arc<OrderStateMachine>,
        reconciler: Arc<Reconciler>,
        broker: Arc<dyn Broker>,
        strategy: Arc<dyn Strategy>,
        feed: Arc<dyn BarFeed>,
    ) -> Self {
        let breaker = FailureBreaker::new(config.max_consecutive_failures);
        Self {
            config,
            default_limit_ttl_seconds,
            clock,
            journal,
            engine,
            machine,
            reconciler,
            broker,
            strategy,
            feed,
            breaker,
        }
    }

    /// Run until the feed ends, a shutdown is requested, or a halt
    /// trigger fires. Returns the process exit code.
    pub async fn run(&mut self) -> u8 {
        // Mandatory startup recovery: reconcile before the loop starts.
        match self.reconciler.reconcile().await {
            Ok(report) if report.passed => {}
            Ok(_) => return self.halt(HaltCause::RecoveryFailed).await,
            Err(e) => {
                error!(error = %e, "startup reconciliation errored");
                return self.halt(HaltCause::RecoveryFailed).await;
            }
        }
        let stops = self.reconciler.load_protective_stops().await;
        info!(protective_stops = stops.len(), "startup recovery complete");

        let mut cycle: u64 = 0;
        loop {
            cycle += 1;
            match self.run_cycle(cycle).await {
                Ok(CycleOutcome::Continue) => {
                    self.breaker.record_success();
                }
                Ok(CycleOutcome::FeedExhausted) => {
                    info!("bar feed exhausted; shutting down cleanly");
                    return self.shutdown_clean();
                }
                Err(CycleFault::Invariant(detail)) => {
                    return self.halt(HaltCause::InvariantViolation(detail)).await;
                }
                Err(CycleFault::ReconcileDrift) => {
                    return self.halt(HaltCause::ReconcileDrift).await;
                }
                Err(CycleFault::Recoverable(detail)) => {
                    warn!(
                        detail = %detail,
                        consecutive = self.breaker.consecutive() + 1,
                        "cycle failed"
                    );
                    if self.breaker.record_failure() {
                        return self
                            .halt(HaltCause::ConsecutiveFailures(self.breaker.consecutive()))
                            .await;
                    }
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(
                self.config.cycle_interval_secs,
            ))
            .await;
        }
    }

    async fn run_cycle(&self, cycle: u64) -> Result<CycleOutcome, CycleFault> {
        // Data fetch.
        let bar = self
            .feed
            .next_bar()
            .await
            .map_err(|e| CycleFault::Recoverable(e.to_string()))?;
        let Some(bar) = bar else {
            return Ok(CycleOutcome::FeedExhausted);
        };
        self.engine.record_close(&bar.symbol, bar.close);

        // Account snapshot for the equity curve and PDT bookkeeping.
        match self.broker.get_account().await {
            Ok(account) => {
                self.engine
                    .record_account(account.equity, account.day_trade_count);
            }
            Err(e) => warn!(error = %e, "account snapshot failed; using last sample"),
        }

        // Strategy, then admission and submission.
        let now = self.clock.now();
        if let Some(signal) = self.strategy.on_bar(&bar, now) {
            match self.engine.submit(&signal, bar.close).await {
                Ok(client_order_id) => {
                    info!(client_order_id = %client_order_id, "signal admitted");
                }
                Err(e) if e.is_admission_rejection() => {
                    info!(reason = %e, "signal dropped");
                }
                Err(e) if e.is_invariant_violation() => {
                    return Err(CycleFault::Invariant(e.to_string()));
                }
                Err(e) => return Err(CycleFault::Recoverable(e.to_string())),
            }
        }

        // Fills, then TTL sweep.
        self.engine.poll_status().await.map_err(classify_fault)?;
        self.engine
            .sweep_stale(self.default_limit_ttl_seconds)
            .await
            .map_err(classify_fault)?;

        // Periodic reconcile.
        if self.config.reconcile_interval_cycles > 0
            && cycle % self.config.reconcile_interval_cycles == 0
        {
            let report = self
                .reconciler
                .reconcile()
                .await
                .map_err(|e| CycleFault::Recoverable(e.to_string()))?;
            if !report.passed {
                return Err(CycleFault::ReconcileDrift);
            }
        }

        Ok(CycleOutcome::Continue)
    }

    /// Synchronous, auditable halt: journal the cause, stop intake,
    /// cancel pending orders best-effort, close the journal, exit 1.
    async fn halt(&self, cause: HaltCause) -> u8 {
        error!(cause = %cause, "halting");
        if let Err(e) = self.journal.append(&Event::system(
            EventType::Halt,
            self.clock.now(),
            json!({ "cause": cause.to_string() }),
        )) {
            error!(error = %e, "failed to journal halt event");
        }

        for order in self.machine.pending() {
            if order.status.is_cancelable() {
                match self.engine.cancel(&order.client_order_id, "halt").await {
                    Ok(_) => {}
                    Err(e) => warn!(
                        client_order_id = %order.client_order_id,
                        error = %e,
                        "failed to cancel order during halt"
                    ),
                }
            }
        }

        if let Err(e) = self.journal.close() {
            error!(error = %e, "failed to close journal");
        }
        EXIT_HALT
    }

    fn shutdown_clean(&self) -> u8 {
        if let Err(e) = self.journal.close() {
            error!(error = %e, "failed to close journal");
            return EXIT_HALT;
        }
        EXIT_CLEAN
    }
}

enum CycleOutcome {
    Continue,
    FeedExhausted,
}

enum CycleFault {
    Recoverable(String),
    Invariant(String),
    ReconcileDrift,
}

fn classify_fault(error: EngineError) -> CycleFault {
    if error.is_invariant_violation() {
        CycleFault::Invariant(error.to_string())
    } else {
        CycleFault::Recoverable(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_trips_at_threshold() {
        let mut breaker = FailureBreaker::new(3);
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure());
        assert_eq!(breaker.consecutive(), 3);
    }

    #[test]
    fn success_resets_the_breaker() {
        let mut breaker = FailureBreaker::new(3);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive(), 0);
        assert!(!breaker.record_failure());
    }

    #[test]
    fn default_threshold_is_five() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_consecutive_failures, 5);
    }

    #[test]
    fn halt_cause_formats_with_detail() {
        assert_eq!(
            HaltCause::InvariantViolation("overfill on C1".to_string()).to_string(),
            "invariant_violation: overfill on C1"
        );
        assert_eq!(HaltCause::RecoveryFailed.to_string(), "recovery_failed");
        assert_eq!(
            HaltCause::ConsecutiveFailures(5).to_string(),
            "consecutive_failures: 5"
        );
    }
}
