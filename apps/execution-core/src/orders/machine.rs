//! Order state machine.
//!
//! Owns every order and enforces the legal transition table:
//!
//! ```text
//! PENDING          → SUBMITTED | REJECTED
//! SUBMITTED        → PARTIALLY_FILLED | FILLED | CANCELLED | REJECTED | EXPIRED
//! PARTIALLY_FILLED → FILLED | CANCELLED
//! ```
//!
//! All operations serialize under a single mutex. Every transition appends
//! its journal event after the in-memory mutation and before the lock is
//! released; if the append fails the mutation is rolled back, so an order
//! is never observable in a state the journal does not record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::clock::Clock;
use crate::journal::{JournalError, TransactionLog};
use crate::models::{Event, EventType, Fill, Order, OrderStatus};

/// Errors from state machine operations.
#[derive(Debug, Error)]
pub enum OrderError {
    /// Transition is not in the legal table.
    #[error("invalid transition for {client_order_id}: {from} -> {to}")]
    InvalidTransition {
        /// Order id.
        client_order_id: String,
        /// Observed source state.
        from: OrderStatus,
        /// Requested target state.
        to: OrderStatus,
    },

    /// Transition attempted out of a terminal state.
    #[error("order {client_order_id} is terminal in {state}")]
    TerminalState {
        /// Order id.
        client_order_id: String,
        /// The terminal state.
        state: OrderStatus,
    },

    /// SUBMITTED requires a non-empty broker order id.
    #[error("missing broker ack for {client_order_id}")]
    MissingBrokerAck {
        /// Order id.
        client_order_id: String,
    },

    /// Fill quantity exceeds the unfilled remainder.
    #[error("overfill on {client_order_id}: {attempted} > {remaining} remaining")]
    OverFill {
        /// Order id.
        client_order_id: String,
        /// Quantity attempted.
        attempted: rust_decimal::Decimal,
        /// Quantity remaining before the fill.
        remaining: rust_decimal::Decimal,
    },

    /// Caller's view of the current state is stale.
    #[error("state desync on {client_order_id}: expected {expected}, actual {actual}")]
    StateDesync {
        /// Order id.
        client_order_id: String,
        /// State the caller expected.
        expected: OrderStatus,
        /// State actually stored.
        actual: OrderStatus,
    },

    /// Unknown order id.
    #[error("order not found: {0}")]
    NotFound(String),

    /// Order id already registered.
    #[error("order already exists: {0}")]
    AlreadyExists(String),

    /// Journal append failed; the transition was rolled back.
    #[error(transparent)]
    Journal(#[from] JournalError),
}

impl OrderError {
    /// Returns true for errors that the runtime must treat as invariant
    /// violations (halt the process).
    #[must_use]
    pub const fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. }
                | Self::TerminalState { .. }
                | Self::OverFill { .. }
                | Self::StateDesync { .. }
        )
    }
}

/// Data accompanying a transition.
#[derive(Debug, Clone)]
pub enum TransitionData {
    /// No additional data.
    None,
    /// Broker acknowledgment (required for SUBMITTED).
    Ack {
        /// Broker-assigned order id.
        broker_order_id: String,
    },
    /// An execution (required for fill states).
    Fill(Fill),
    /// Cancellation, rejection, or expiry detail.
    Reason(String),
}

/// Check if a state transition is legal.
#[must_use]
pub const fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
    matches!(
        (from, to),
        // From Pending
        (OrderStatus::Pending, OrderStatus::Submitted)
            | (OrderStatus::Pending, OrderStatus::Rejected)
            // From Submitted
            | (OrderStatus::Submitted, OrderStatus::PartiallyFilled)
            | (OrderStatus::Submitted, OrderStatus::Filled)
            | (OrderStatus::Submitted, OrderStatus::Cancelled)
            | (OrderStatus::Submitted, OrderStatus::Rejected)
            | (OrderStatus::Submitted, OrderStatus::Expired)
            // From PartiallyFilled
            | (OrderStatus::PartiallyFilled, OrderStatus::PartiallyFilled)
            | (OrderStatus::PartiallyFilled, OrderStatus::Filled)
            | (OrderStatus::PartiallyFilled, OrderStatus::Cancelled)
    )
}

/// All legal target states from a given state.
#[must_use]
pub fn valid_next_states(from: OrderStatus) -> Vec<OrderStatus> {
    [
        OrderStatus::Pending,
        OrderStatus::Submitted,
        OrderStatus::PartiallyFilled,
        OrderStatus::Filled,
        OrderStatus::Cancelled,
        OrderStatus::Rejected,
        OrderStatus::Expired,
    ]
    .into_iter()
    .filter(|to| is_valid_transition(from, *to))
    .collect()
}

/// Owner of all orders; the single writer of order state.
pub struct OrderStateMachine {
    clock: Arc<dyn Clock>,
    journal: Arc<dyn TransactionLog>,
    orders: Mutex<HashMap<String, Order>>,
}

impl OrderStateMachine {
    /// Create an empty state machine.
    pub fn new(clock: Arc<dyn Clock>, journal: Arc<dyn TransactionLog>) -> Self {
        Self {
            clock,
            journal,
            orders: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new order. The order must be in `Pending`.
    pub fn create(&self, order: Order) -> Result<(), OrderError> {
        let mut orders = self.lock();
        if orders.contains_key(&order.client_order_id) {
            return Err(OrderError::AlreadyExists(order.client_order_id));
        }
        debug!(
            client_order_id = %order.client_order_id,
            symbol = %order.symbol,
            side = %order.side,
            "order created"
        );
        orders.insert(order.client_order_id.clone(), order);
        Ok(())
    }

    /// Apply a transition, updating order attributes atomically with the
    /// state change and journaling the result.
    pub fn transition(
        &self,
        client_order_id: &str,
        from: OrderStatus,
        to: OrderStatus,
        data: TransitionData,
    ) -> Result<Order, OrderError> {
        let mut orders = self.lock();
        let order = orders
            .get(client_order_id)
            .ok_or_else(|| OrderError::NotFound(client_order_id.to_string()))?;

        if order.status != from {
            return Err(OrderError::StateDesync {
                client_order_id: client_order_id.to_string(),
                expected: from,
                actual: order.status,
            });
        }
        if from.is_terminal() {
            return Err(OrderError::TerminalState {
                client_order_id: client_order_id.to_string(),
                state: from,
            });
        }
        if !is_valid_transition(from, to) {
            return Err(OrderError::InvalidTransition {
                client_order_id: client_order_id.to_string(),
                from,
                to,
            });
        }

        // Build the updated order; nothing is stored until every check passes.
        let now = self.clock.now();
        let mut updated = order.clone();
        updated.status = to;

        let event = match to {
            OrderStatus::Submitted => {
                let TransitionData::Ack { broker_order_id } = data else {
                    return Err(OrderError::MissingBrokerAck {
                        client_order_id: client_order_id.to_string(),
                    });
                };
                if broker_order_id.is_empty() {
                    return Err(OrderError::MissingBrokerAck {
                        client_order_id: client_order_id.to_string(),
                    });
                }
                updated.broker_order_id = Some(broker_order_id.clone());
                updated.submitted_at = Some(now);
                Event::order(
                    EventType::OrderAck,
                    now,
                    client_order_id,
                    json!({
                        "broker_order_id": broker_order_id,
                        "symbol": updated.symbol,
                    }),
                )
            }
            OrderStatus::PartiallyFilled | OrderStatus::Filled => {
                let TransitionData::Fill(fill) = data else {
                    return Err(OrderError::InvalidTransition {
                        client_order_id: client_order_id.to_string(),
                        from,
                        to,
                    });
                };
                let remaining = updated.remaining_qty();
                if fill.quantity > remaining {
                    return Err(OrderError::OverFill {
                        client_order_id: client_order_id.to_string(),
                        attempted: fill.quantity,
                        remaining,
                    });
                }
                let new_filled = updated.filled_qty + fill.quantity;
                let complete = new_filled == updated.requested_qty;
                // FILLED iff cumulative equals requested.
                if complete != (to == OrderStatus::Filled) {
                    return Err(OrderError::InvalidTransition {
                        client_order_id: client_order_id.to_string(),
                        from,
                        to,
                    });
                }
                let prior_notional = updated.avg_fill_price * updated.filled_qty;
                updated.avg_fill_price = (prior_notional + fill.price * fill.quantity) / new_filled;
                updated.filled_qty = new_filled;
                updated.commission += fill.commission;
                if complete {
                    updated.filled_at = Some(now);
                }
                Event::order(
                    EventType::OrderFill,
                    now,
                    client_order_id,
                    json!({
                        "symbol": updated.symbol,
                        "quantity": fill.quantity,
                        "price": fill.price,
                        "commission": fill.commission,
                        "filled_qty": updated.filled_qty,
                        "avg_fill_price": updated.avg_fill_price,
                        "complete": complete,
                    }),
                )
            }
            OrderStatus::Cancelled => {
                updated.cancelled_at = Some(now);
                if let TransitionData::Reason(reason) = data {
                    updated.status_message = reason;
                }
                Event::order(
                    EventType::OrderCancel,
                    now,
                    client_order_id,
                    json!({
                        "symbol": updated.symbol,
                        "reason": updated.status_message,
                        "filled_qty": updated.filled_qty,
                    }),
                )
            }
            OrderStatus::Rejected => {
                if let TransitionData::Reason(reason) = data {
                    updated.status_message = reason;
                }
                Event::order(
                    EventType::OrderReject,
                    now,
                    client_order_id,
                    json!({
                        "symbol": updated.symbol,
                        "reason": updated.status_message,
                    }),
                )
            }
            OrderStatus::Expired => {
                if let TransitionData::Reason(reason) = data {
                    updated.status_message = reason;
                }
                Event::order(
                    EventType::OrderExpire,
                    now,
                    client_order_id,
                    json!({ "symbol": updated.symbol }),
                )
            }
            OrderStatus::Pending => {
                // Unreachable: no transition targets Pending.
                return Err(OrderError::InvalidTransition {
                    client_order_id: client_order_id.to_string(),
                    from,
                    to,
                });
            }
        };

        // Mutate, then journal inside the lock. Roll back on append failure.
        let prior = orders.insert(client_order_id.to_string(), updated.clone());
        if let Err(e) = self.journal.append(&event) {
            if let Some(prior) = prior {
                orders.insert(client_order_id.to_string(), prior);
            }
            return Err(e.into());
        }

        debug!(
            client_order_id = %client_order_id,
            from = %from,
            to = %to,
            "order transitioned"
        );
        Ok(updated)
    }

    /// Fetch a snapshot of one order.
    pub fn get(&self, client_order_id: &str) -> Result<Order, OrderError> {
        self.lock()
            .get(client_order_id)
            .cloned()
            .ok_or_else(|| OrderError::NotFound(client_order_id.to_string()))
    }

    /// All non-terminal orders.
    #[must_use]
    pub fn pending(&self) -> Vec<Order> {
        self.lock()
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect()
    }

    /// All orders for a symbol.
    #[must_use]
    pub fn by_symbol(&self, symbol: &str) -> Vec<Order> {
        self.lock()
            .values()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect()
    }

    /// All orders in a given state.
    #[must_use]
    pub fn by_state(&self, status: OrderStatus) -> Vec<Order> {
        self.lock()
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect()
    }

    /// Total number of orders ever created this session.
    #[must_use]
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Order>> {
        match self.orders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
