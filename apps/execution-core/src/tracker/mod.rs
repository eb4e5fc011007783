//! In-flight order tracking.
//!
//! The tracker keeps a fill-level view of every working order: the ordered
//! fill history, the recomputed average price, and the lifecycle summary.
//! It also detects drift against the broker's open-order set — orphans
//! (broker knows, we don't) and shadows (we know, broker doesn't). Drift
//! detection never mutates state; it feeds the reconciliation path.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::debug;

use crate::models::{Fill, OrderSide, OrderStatus, OrderType, weighted_avg_price};

/// Errors from tracker operations.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Unknown client order id.
    #[error("not tracking order: {0}")]
    NotTracking(String),

    /// Order id already tracked.
    #[error("already tracking order: {0}")]
    AlreadyTracking(String),

    /// Fill quantity exceeds the unfilled remainder.
    #[error("overfill on {client_order_id}: {attempted} > {remaining} remaining")]
    OverFill {
        /// Order id.
        client_order_id: String,
        /// Quantity attempted.
        attempted: Decimal,
        /// Quantity remaining before the fill.
        remaining: Decimal,
    },
}

/// Tracker view of one working order: the order summary plus its ordered
/// fill history.
#[derive(Debug, Clone)]
pub struct InFlightOrder {
    /// Client order id.
    pub client_order_id: String,
    /// Broker-assigned id.
    pub broker_order_id: String,
    /// Instrument symbol.
    pub symbol: String,
    /// Buy or sell.
    pub side: OrderSide,
    /// Order type.
    pub order_type: OrderType,
    /// Requested quantity.
    pub requested_qty: Decimal,
    /// Strategy that owns the order.
    pub strategy_id: String,
    /// When the broker acknowledged.
    pub submitted_at: DateTime<Utc>,
    /// Lifecycle summary, mirrored from status updates.
    pub status: OrderStatus,
    /// Fills in broker-reported order.
    pub fills: Vec<Fill>,
}

impl InFlightOrder {
    /// Cumulative filled quantity.
    #[must_use]
    pub fn filled_qty(&self) -> Decimal {
        self.fills.iter().map(|f| f.quantity).sum()
    }

    /// Volume-weighted average fill price.
    #[must_use]
    pub fn avg_fill_price(&self) -> Decimal {
        weighted_avg_price(&self.fills)
    }

    /// Quantity still unfilled.
    #[must_use]
    pub fn remaining_qty(&self) -> Decimal {
        self.requested_qty - self.filled_qty()
    }

    /// Returns true once the full quantity has been executed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.filled_qty() == self.requested_qty
    }
}

#[derive(Default)]
struct TrackerState {
    in_flight: HashMap<String, InFlightOrder>,
    completed: Vec<InFlightOrder>,
}

/// Tracks in-flight orders and aggregates their fills.
#[derive(Default)]
pub struct OrderTracker {
    state: Mutex<TrackerState>,
}

impl OrderTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking a freshly acknowledged order.
    pub fn start_tracking(&self, order: InFlightOrder) -> Result<(), TrackerError> {
        let mut state = self.lock();
        if state.in_flight.contains_key(&order.client_order_id) {
            return Err(TrackerError::AlreadyTracking(order.client_order_id));
        }
        debug!(
            client_order_id = %order.client_order_id,
            broker_order_id = %order.broker_order_id,
            "tracking order"
        );
        state.in_flight.insert(order.client_order_id.clone(), order);
        Ok(())
    }

    /// Apply a fill in arrival order.
    ///
    /// When the cumulative quantity reaches the requested quantity the
    /// record moves to the completed collection, retaining its fill
    /// history.
    pub fn process_fill(
        &self,
        client_order_id: &str,
        fill: Fill,
    ) -> Result<InFlightOrder, TrackerError> {
        let mut state = self.lock();
        let order = state
            .in_flight
            .get_mut(client_order_id)
            .ok_or_else(|| TrackerError::NotTracking(client_order_id.to_string()))?;

        let remaining = order.remaining_qty();
        if fill.quantity > remaining {
            return Err(TrackerError::OverFill {
                client_order_id: client_order_id.to_string(),
                attempted: fill.quantity,
                remaining,
            });
        }

        order.fills.push(fill);
        let complete = order.is_complete();
        order.status = if complete {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        let snapshot = order.clone();
        if complete
            && let Some(done) = state.in_flight.remove(client_order_id)
        {
            state.completed.push(done);
        }
        Ok(snapshot)
    }

    /// Apply a lifecycle status update.
    ///
    /// Terminal statuses move the record to the completed collection.
    pub fn process_status(
        &self,
        client_order_id: &str,
        status: OrderStatus,
    ) -> Result<(), TrackerError> {
        let mut state = self.lock();
        let order = state
            .in_flight
            .get_mut(client_order_id)
            .ok_or_else(|| TrackerError::NotTracking(client_order_id.to_string()))?;
        order.status = status;
        if status.is_terminal()
            && let Some(done) = state.in_flight.remove(client_order_id)
        {
            state.completed.push(done);
        }
        Ok(())
    }

    /// Stop tracking without recording completion (reconciliation path).
    pub fn forget(&self, client_order_id: &str) {
        self.lock().in_flight.remove(client_order_id);
    }

    /// Broker order ids open at the broker but unknown locally.
    #[must_use]
    pub fn orphans(&self, broker_open: &[String]) -> Vec<String> {
        let state = self.lock();
        let known: std::collections::HashSet<&str> = state
            .in_flight
            .values()
            .map(|o| o.broker_order_id.as_str())
            .collect();
        broker_open
            .iter()
            .filter(|id| !known.contains(id.as_str()))
            .cloned()
            .collect()
    }

    /// Client order ids tracked as non-terminal whose broker id is absent
    /// from the broker's open set.
    #[must_use]
    pub fn shadows(&self, broker_open: &[String]) -> Vec<String> {
        let state = self.lock();
        let open: std::collections::HashSet<&str> =
            broker_open.iter().map(String::as_str).collect();
        state
            .in_flight
            .values()
            .filter(|o| !o.status.is_terminal() && !open.contains(o.broker_order_id.as_str()))
            .map(|o| o.client_order_id.clone())
            .collect()
    }

    /// Completed orders whose last activity falls within `window` of `now`.
    #[must_use]
    pub fn completed(&self, now: DateTime<Utc>, window: Duration) -> Vec<InFlightOrder> {
        let cutoff = now - window;
        self.lock()
            .completed
            .iter()
            .filter(|o| {
                o.fills
                    .last()
                    .map_or(o.submitted_at, |f| f.timestamp)
                    >= cutoff
            })
            .cloned()
            .collect()
    }

    /// Snapshot of one in-flight record.
    #[must_use]
    pub fn get(&self, client_order_id: &str) -> Option<InFlightOrder> {
        self.lock().in_flight.get(client_order_id).cloned()
    }

    /// Number of in-flight records.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
