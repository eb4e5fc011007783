//! Scriptable in-memory broker for tests and dry runs.
//!
//! Acks submissions with sequential broker ids, keeps an open-order set,
//! and records per-client submit counts so idempotency tests can assert
//! "the broker was called exactly once". Failures and venue state are
//! scripted by the test.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use super::{AccountSnapshot, Broker, BrokerError, BrokerPosition, OpenOrder, OrderSpec};

#[derive(Default)]
struct MockState {
    open_orders: Vec<OpenOrder>,
    positions: Vec<BrokerPosition>,
    account: Option<AccountSnapshot>,
    submit_failures: VecDeque<BrokerError>,
    cancel_failures: VecDeque<BrokerError>,
    list_failures: VecDeque<BrokerError>,
    submit_calls: HashMap<String, u64>,
}

/// In-memory broker double.
pub struct MockBroker {
    order_counter: AtomicU64,
    state: Mutex<MockState>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// Create a mock with an empty venue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            order_counter: AtomicU64::new(1),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Queue a failure for the next submit call.
    pub fn fail_next_submit(&self, error: BrokerError) {
        self.lock().submit_failures.push_back(error);
    }

    /// Queue a failure for the next cancel call.
    pub fn fail_next_cancel(&self, error: BrokerError) {
        self.lock().cancel_failures.push_back(error);
    }

    /// Queue a failure for the next open-orders listing.
    pub fn fail_next_list_open_orders(&self, error: BrokerError) {
        self.lock().list_failures.push_back(error);
    }

    /// Replace the venue's position set.
    pub fn set_positions(&self, positions: Vec<BrokerPosition>) {
        self.lock().positions = positions;
    }

    /// Replace the venue's open-order set.
    pub fn set_open_orders(&self, orders: Vec<OpenOrder>) {
        self.lock().open_orders = orders;
    }

    /// Replace the account snapshot.
    pub fn set_account(&self, account: AccountSnapshot) {
        self.lock().account = Some(account);
    }

    /// Remove an order from the open set (e.g. after a scripted fill).
    pub fn mark_closed(&self, broker_order_id: &str) {
        self.lock()
            .open_orders
            .retain(|o| o.broker_order_id != broker_order_id);
    }

    /// Total submit calls across all client ids.
    #[must_use]
    pub fn submit_calls(&self) -> u64 {
        self.lock().submit_calls.values().sum()
    }

    /// Submit calls for one client order id.
    #[must_use]
    pub fn submit_calls_for(&self, client_order_id: &str) -> u64 {
        self.lock()
            .submit_calls
            .get(client_order_id)
            .copied()
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn submit(&self, spec: &OrderSpec) -> Result<String, BrokerError> {
        let mut state = self.lock();
        *state
            .submit_calls
            .entry(spec.client_order_id.clone())
            .or_insert(0) += 1;

        if let Some(error) = state.submit_failures.pop_front() {
            return Err(error);
        }

        let broker_order_id = format!("B{}", self.order_counter.fetch_add(1, Ordering::SeqCst));
        state.open_orders.push(OpenOrder {
            broker_order_id: broker_order_id.clone(),
            client_order_id: Some(spec.client_order_id.clone()),
            symbol: spec.symbol.clone(),
            side: spec.side,
            order_type: spec.order_type,
            quantity: spec.quantity,
            filled_qty: Decimal::ZERO,
            created_at: Utc::now(),
        });
        Ok(broker_order_id)
    }

    async fn cancel(&self, broker_order_id: &str) -> Result<bool, BrokerError> {
        let mut state = self.lock();
        if let Some(error) = state.cancel_failures.pop_front() {
            return Err(error);
        }
        let before = state.open_orders.len();
        state
            .open_orders
            .retain(|o| o.broker_order_id != broker_order_id);
        Ok(state.open_orders.len() < before)
    }

    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError> {
        let mut state = self.lock();
        if let Some(error) = state.list_failures.pop_front() {
            return Err(error);
        }
        Ok(state.open_orders.clone())
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(self.lock().positions.clone())
    }

    async fn get_account(&self) -> Result<AccountSnapshot, BrokerError> {
        Ok(self.lock().account.clone().unwrap_or(AccountSnapshot {
            equity: Decimal::new(100_000, 0),
            cash: Decimal::new(100_000, 0),
            buying_power: Decimal::new(200_000, 0),
            day_trade_count: 0,
        }))
    }
}
