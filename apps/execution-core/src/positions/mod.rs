//! Durable position store.
//!
//! Persists open positions and completed round trips to Turso (Rust
//! rewrite of `SQLite`). The symbol primary key enforces the at-most-one
//! open position per symbol invariant at the storage layer; all mutations
//! run on the runtime task, so there is a single logical writer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};
use turso::{Builder, Database, Error as TursoError, Row, Value};
use uuid::Uuid;

use crate::clock::Clock;
use crate::journal::{JournalError, TransactionLog};
use crate::models::{ClosedTrade, Event, EventType, OrderSide, Position};

/// Errors from position store operations.
#[derive(Debug, Error)]
pub enum PositionError {
    /// Database connection error.
    #[error("position store connection error: {0}")]
    Connection(String),

    /// Query execution error.
    #[error("position store query error: {0}")]
    Query(String),

    /// Row decode error.
    #[error("position store missing field: {0}")]
    MissingField(String),

    /// Fill would reduce a position that does not exist.
    #[error("no open position for {0}")]
    NoPosition(String),

    /// Journal append failed.
    #[error(transparent)]
    Journal(#[from] JournalError),
}

impl From<TursoError> for PositionError {
    fn from(err: TursoError) -> Self {
        Self::Connection(err.to_string())
    }
}

/// What a fill did to the book.
#[derive(Debug, Clone)]
pub enum FillOutcome {
    /// A flat symbol became a position.
    Opened(Position),
    /// Same-side fill averaged into the existing position.
    Averaged(Position),
    /// Opposite-side fill reduced the position; P&L realized for the
    /// reduced quantity.
    Reduced {
        /// The surviving position.
        position: Position,
        /// The realized round trip.
        trade: ClosedTrade,
    },
    /// Opposite-side fill closed the position entirely.
    Closed(ClosedTrade),
}

/// Turso-backed store for positions and realized trades.
pub struct PositionStore {
    db: Database,
    clock: Arc<dyn Clock>,
    journal: Arc<dyn TransactionLog>,
}

impl PositionStore {
    /// Open (or create) a store at `db_path`.
    pub async fn new_local(
        db_path: &str,
        clock: Arc<dyn Clock>,
        journal: Arc<dyn TransactionLog>,
    ) -> Result<Self, PositionError> {
        let db = Builder::new_local(db_path).build().await?;
        Self::run_migrations(&db).await?;
        Ok(Self { db, clock, journal })
    }

    /// In-memory store for tests.
    pub async fn new_in_memory(
        clock: Arc<dyn Clock>,
        journal: Arc<dyn TransactionLog>,
    ) -> Result<Self, PositionError> {
        Self::new_local(":memory:", clock, journal).await
    }

    async fn run_migrations(db: &Database) -> Result<(), PositionError> {
        let conn = db.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                qty TEXT NOT NULL,
                entry_vwap TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                stop_order_id TEXT,
                realized_pnl TEXT NOT NULL DEFAULT '0'
            );

            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                qty TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_price TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                pnl TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_trades_closed_at
             ON trades(closed_at);",
        )
        .await
        .map_err(|e| PositionError::Query(e.to_string()))?;
        debug!("position store migrations complete");
        Ok(())
    }

    /// Apply a fill to the book.
    ///
    /// BUY on a flat symbol opens; same-side fills average; opposite-side
    /// fills reduce and possibly close, realizing
    /// `(exit - entry) * qty - commission`.
    pub async fn apply_fill(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
        commission: Decimal,
        strategy_id: &str,
    ) -> Result<FillOutcome, PositionError> {
        let now = self.clock.now();
        let existing = self.position(symbol).await?;

        match existing {
            None => {
                if side == OrderSide::Sell {
                    return Err(PositionError::NoPosition(symbol.to_string()));
                }
                let position = Position {
                    symbol: symbol.to_string(),
                    quantity: qty,
                    entry_vwap: price,
                    opened_at: now,
                    strategy_id: strategy_id.to_string(),
                    stop_order_id: None,
                    realized_pnl: Decimal::ZERO,
                };
                self.insert_position(&position).await?;
                self.journal.append(&Event::system(
                    EventType::PositionOpen,
                    now,
                    json!({
                        "symbol": symbol,
                        "quantity": qty,
                        "entry_vwap": price,
                        "strategy_id": strategy_id,
                    }),
                ))?;
                info!(symbol = %symbol, qty = %qty, price = %price, "position opened");
                Ok(FillOutcome::Opened(position))
            }
            Some(mut position) if side == OrderSide::Buy => {
                // Same-side: average the basis.
                let total = position.quantity + qty;
                position.entry_vwap =
                    (position.entry_vwap * position.quantity + price * qty) / total;
                position.quantity = total;
                self.update_position(&position).await?;
                self.journal.append(&Event::system(
                    EventType::PositionUpdate,
                    now,
                    json!({
                        "symbol": symbol,
                        "quantity": position.quantity,
                        "entry_vwap": position.entry_vwap,
                    }),
                ))?;
                Ok(FillOutcome::Averaged(position))
            }
            Some(mut position) => {
                // Opposite-side: reduce, realizing P&L for the closed slice.
                let closed_qty = qty.min(position.quantity);
                let pnl = (price - position.entry_vwap) * closed_qty - commission;
                let trade = ClosedTrade {
                    id: Uuid::new_v4().to_string(),
                    symbol: symbol.to_string(),
                    side: OrderSide::Buy,
                    quantity: closed_qty,
                    entry_price: position.entry_vwap,
                    exit_price: price,
                    opened_at: position.opened_at,
                    closed_at: now,
                    strategy_id: position.strategy_id.clone(),
                    pnl,
                };
                self.insert_trade(&trade).await?;

                position.quantity -= closed_qty;
                if position.quantity.is_zero() {
                    self.delete_position(symbol).await?;
                    self.journal.append(&Event::system(
                        EventType::PositionClose,
                        now,
                        json!({
                            "symbol": symbol,
                            "quantity": closed_qty,
                            "exit_price": price,
                            "pnl": pnl,
                        }),
                    ))?;
                    info!(symbol = %symbol, pnl = %pnl, "position closed");
                    Ok(FillOutcome::Closed(trade))
                } else {
                    position.realized_pnl += pnl;
                    self.update_position(&position).await?;
                    self.journal.append(&Event::system(
                        EventType::PositionUpdate,
                        now,
                        json!({
                            "symbol": symbol,
                            "quantity": position.quantity,
                            "realized_pnl": position.realized_pnl,
                        }),
                    ))?;
                    Ok(FillOutcome::Reduced { position, trade })
                }
            }
        }
    }

    /// Fetch one open position.
    pub async fn position(&self, symbol: &str) -> Result<Option<Position>, PositionError> {
        let conn = self.db.connect()?;
        let mut rows = conn
            .query(
                "SELECT symbol, qty, entry_vwap, opened_at, strategy_id, stop_order_id, realized_pnl
                 FROM positions WHERE symbol = ?",
                vec![Value::Text(symbol.to_string())],
            )
            .await
            .map_err(|e| PositionError::Query(e.to_string()))?;

        match rows
            .next()
            .await
            .map_err(|e| PositionError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_position(&row)?)),
            None => Ok(None),
        }
    }

    /// All open positions.
    pub async fn open_positions(&self) -> Result<Vec<Position>, PositionError> {
        let conn = self.db.connect()?;
        let mut rows = conn
            .query(
                "SELECT symbol, qty, entry_vwap, opened_at, strategy_id, stop_order_id, realized_pnl
                 FROM positions ORDER BY symbol",
                Vec::<Value>::new(),
            )
            .await
            .map_err(|e| PositionError::Query(e.to_string()))?;

        let mut positions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| PositionError::Query(e.to_string()))?
        {
            positions.push(row_to_position(&row)?);
        }
        Ok(positions)
    }

    /// Trades closed at or after `cutoff`, newest last.
    pub async fn closed_trades_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ClosedTrade>, PositionError> {
        let conn = self.db.connect()?;
        let mut rows = conn
            .query(
                "SELECT id, symbol, side, qty, entry_price, exit_price,
                        opened_at, closed_at, strategy_id, pnl
                 FROM trades WHERE closed_at >= ? ORDER BY closed_at",
                vec![Value::Text(cutoff.to_rfc3339())],
            )
            .await
            .map_err(|e| PositionError::Query(e.to_string()))?;

        let mut trades = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| PositionError::Query(e.to_string()))?
        {
            trades.push(row_to_trade(&row)?);
        }
        Ok(trades)
    }

    /// Realized P&L over trades closed at or after `cutoff`.
    pub async fn realized_pnl_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Decimal, PositionError> {
        let trades = self.closed_trades_since(cutoff).await?;
        Ok(trades.iter().map(|t| t.pnl).sum())
    }

    /// Record the broker id of the protective stop resting for a symbol.
    pub async fn set_stop_order(
        &self,
        symbol: &str,
        stop_order_id: Option<&str>,
    ) -> Result<(), PositionError> {
        let conn = self.db.connect()?;
        conn.execute(
            "UPDATE positions SET stop_order_id = ? WHERE symbol = ?",
            vec![
                stop_order_id.map_or(Value::Null, |s| Value::Text(s.to_string())),
                Value::Text(symbol.to_string()),
            ],
        )
        .await
        .map_err(|e| PositionError::Query(e.to_string()))?;
        Ok(())
    }

    /// Reconciliation heal: force a position to the broker's view.
    pub async fn upsert_from_broker(
        &self,
        symbol: &str,
        qty: Decimal,
        avg_entry_price: Decimal,
        strategy_id: &str,
    ) -> Result<(), PositionError> {
        let now = self.clock.now();
        match self.position(symbol).await? {
            Some(mut position) => {
                position.quantity = qty;
                position.entry_vwap = avg_entry_price;
                self.update_position(&position).await
            }
            None => {
                let position = Position {
                    symbol: symbol.to_string(),
                    quantity: qty,
                    entry_vwap: avg_entry_price,
                    opened_at: now,
                    strategy_id: strategy_id.to_string(),
                    stop_order_id: None,
                    realized_pnl: Decimal::ZERO,
                };
                self.insert_position(&position).await
            }
        }
    }

    /// Reconciliation heal: drop a position the broker does not have.
    pub async fn remove(&self, symbol: &str) -> Result<(), PositionError> {
        self.delete_position(symbol).await
    }

    async fn insert_position(&self, position: &Position) -> Result<(), PositionError> {
        let conn = self.db.connect()?;
        conn.execute(
            "INSERT INTO positions (symbol, qty, entry_vwap, opened_at, strategy_id, stop_order_id, realized_pnl)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            position_params(position),
        )
        .await
        .map_err(|e| PositionError::Query(e.to_string()))?;
        Ok(())
    }

    async fn update_position(&self, position: &Position) -> Result<(), PositionError> {
        let conn = self.db.connect()?;
        conn.execute(
            "UPDATE positions SET qty = ?, entry_vwap = ?, stop_order_id = ?, realized_pnl = ?
             WHERE symbol = ?",
            vec![
                Value::Text(position.quantity.to_string()),
                Value::Text(position.entry_vwap.to_string()),
                position
                    .stop_order_id
                    .as_ref()
                    .map_or(Value::Null, |s| Value::Text(s.clone())),
                Value::Text(position.realized_pnl.to_string()),
                Value::Text(position.symbol.clone()),
            ],
        )
        .await
        .map_err(|e| PositionError::Query(e.to_string()))?;
        Ok(())
    }

    async fn delete_position(&self, symbol: &str) -> Result<(), PositionError> {
        let conn = self.db.connect()?;
        conn.execute(
            "DELETE FROM positions WHERE symbol = ?",
            vec![Value::Text(symbol.to_string())],
        )
        .await
        .map_err(|e| PositionError::Query(e.to_string()))?;
        Ok(())
    }

    async fn insert_trade(&self, trade: &ClosedTrade) -> Result<(), PositionError> {
        let conn = self.db.connect()?;
        conn.execute(
            "INSERT INTO trades (id, symbol, side, qty, entry_price, exit_price,
                                 opened_at, closed_at, strategy_id, pnl)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            vec![
                Value::Text(trade.id.clone()),
                Value::Text(trade.symbol.clone()),
                Value::Text(trade.side.to_string()),
                Value::Text(trade.quantity.to_string()),
                Value::Text(trade.entry_price.to_string()),
                Value::Text(trade.exit_price.to_string()),
                Value::Text(trade.opened_at.to_rfc3339()),
                Value::Text(trade.closed_at.to_rfc3339()),
                Value::Text(trade.strategy_id.clone()),
                Value::Text(trade.pnl.to_string()),
            ],
        )
        .await
        .map_err(|e| PositionError::Query(e.to_string()))?;
        Ok(())
    }
}

fn position_params(position: &Position) -> Vec<Value> {
    vec![
        Value::Text(position.symbol.clone()),
        Value::Text(position.quantity.to_string()),
        Value::Text(position.entry_vwap.to_string()),
        Value::Text(position.opened_at.to_rfc3339()),
        Value::Text(position.strategy_id.clone()),
        position
            .stop_order_id
            .as_ref()
            .map_or(Value::Null, |s| Value::Text(s.clone())),
        Value::Text(position.realized_pnl.to_string()),
    ]
}

fn get_text(row: &Row, index: usize, field: &str) -> Result<String, PositionError> {
    row.get::<String>(index)
        .map_err(|e| PositionError::MissingField(format!("{field}: {e}")))
}

fn get_decimal(row: &Row, index: usize, field: &str) -> Result<Decimal, PositionError> {
    get_text(row, index, field)?
        .parse()
        .map_err(|e| PositionError::MissingField(format!("{field}: {e}")))
}

fn get_datetime(row: &Row, index: usize, field: &str) -> Result<DateTime<Utc>, PositionError> {
    let text = get_text(row, index, field)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PositionError::MissingField(format!("{field}: {e}")))
}

fn row_to_position(row: &Row) -> Result<Position, PositionError> {
    Ok(Position {
        symbol: get_text(row, 0, "symbol")?,
        quantity: get_decimal(row, 1, "qty")?,
        entry_vwap: get_decimal(row, 2, "entry_vwap")?,
        opened_at: get_datetime(row, 3, "opened_at")?,
        strategy_id: get_text(row, 4, "strategy_id")?,
        stop_order_id: row.get::<String>(5).ok(),
        realized_pnl: get_decimal(row, 6, "realized_pnl")?,
    })
}

fn row_to_trade(row: &Row) -> Result<ClosedTrade, PositionError> {
    let side = match get_text(row, 2, "side")?.as_str() {
        "SELL" => OrderSide::Sell,
        _ => OrderSide::Buy,
    };
    Ok(ClosedTrade {
        id: get_text(row, 0, "id")?,
        symbol: get_text(row, 1, "symbol")?,
        side,
        quantity: get_decimal(row, 3, "qty")?,
        entry_price: get_decimal(row, 4, "entry_price")?,
        exit_price: get_decimal(row, 5, "exit_price")?,
        opened_at: get_datetime(row, 6, "opened_at")?,
        closed_at: get_datetime(row, 7, "closed_at")?,
        strategy_id: get_text(row, 8, "strategy_id")?,
        pnl: get_decimal(row, 9, "pnl")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::journal::MemoryJournal;
    use rust_decimal_macros::dec;

    fn start_time() -> DateTime<Utc> {
        "2026-03-02T14:30:00Z".parse().unwrap()
    }

    async fn make_store() -> (PositionStore, Arc<MemoryJournal>, Arc<SimulatedClock>) {
        let clock = Arc::new(SimulatedClock::new(start_time()));
        let journal = Arc::new(MemoryJournal::new());
        let store = PositionStore::new_in_memory(clock.clone(), journal.clone())
            .await
            .unwrap();
        (store, journal, clock)
    }

    #[tokio::test]
    async fn buy_fill_opens_position() {
        let (store, journal, _clock) = make_store().await;

        let outcome = store
            .apply_fill("SPY", OrderSide::Buy, dec!(10), dec!(450.00), dec!(0), "vwap")
            .await
            .unwrap();

        assert!(matches!(outcome, FillOutcome::Opened(_)));
        let position = store.position("SPY").await.unwrap().unwrap();
        assert_eq!(position.quantity, dec!(10));
        assert_eq!(position.entry_vwap, dec!(450.00));

        let opens = journal
            .replay(&|e| e.event_type == EventType::PositionOpen)
            .unwrap();
        assert_eq!(opens.len(), 1);
    }

    #[tokio::test]
    async fn same_side_fill_averages_basis() {
        let (store, _journal, _clock) = make_store().await;

        store
            .apply_fill("SPY", OrderSide::Buy, dec!(10), dec!(450.00), dec!(0), "vwap")
            .await
            .unwrap();
        let outcome = store
            .apply_fill("SPY", OrderSide::Buy, dec!(10), dec!(452.00), dec!(0), "vwap")
            .await
            .unwrap();

        let FillOutcome::Averaged(position) = outcome else {
            panic!("expected averaged outcome");
        };
        assert_eq!(position.quantity, dec!(20));
        assert_eq!(position.entry_vwap, dec!(451.00));
    }

    #[tokio::test]
    async fn opposite_fill_closes_and_realizes_pnl() {
        let (store, journal, _clock) = make_store().await;

        store
            .apply_fill("SPY", OrderSide::Buy, dec!(10), dec!(450.00), dec!(0), "vwap")
            .await
            .unwrap();
        let outcome = store
            .apply_fill("SPY", OrderSide::Sell, dec!(10), dec!(451.00), dec!(1.00), "vwap")
            .await
            .unwrap();

        let FillOutcome::Closed(trade) = outcome else {
            panic!("expected closed outcome");
        };
        // (451 - 450) * 10 - 1.00 = 9.00
        assert_eq!(trade.pnl, dec!(9.00));
        assert!(store.position("SPY").await.unwrap().is_none());

        let closes = journal
            .replay(&|e| e.event_type == EventType::PositionClose)
            .unwrap();
        assert_eq!(closes.len(), 1);
    }

    #[tokio::test]
    async fn partial_reduction_keeps_position() {
        let (store, _journal, _clock) = make_store().await;

        store
            .apply_fill("SPY", OrderSide::Buy, dec!(10), dec!(450.00), dec!(0), "vwap")
            .await
            .unwrap();
        let outcome = store
            .apply_fill("SPY", OrderSide::Sell, dec!(4), dec!(452.00), dec!(0), "vwap")
            .await
            .unwrap();

        let FillOutcome::Reduced { position, trade } = outcome else {
            panic!("expected reduced outcome");
        };
        assert_eq!(position.quantity, dec!(6));
        assert_eq!(trade.quantity, dec!(4));
        assert_eq!(trade.pnl, dec!(8.00));
        assert_eq!(position.realized_pnl, dec!(8.00));
    }

    #[tokio::test]
    async fn sell_with_no_position_fails() {
        let (store, _journal, _clock) = make_store().await;
        let result = store
            .apply_fill("SPY", OrderSide::Sell, dec!(1), dec!(450.00), dec!(0), "vwap")
            .await;
        assert!(matches!(result, Err(PositionError::NoPosition(_))));
    }

    #[tokio::test]
    async fn closed_trades_window_and_pnl_sum() {
        let (store, _journal, clock) = make_store().await;

        store
            .apply_fill("SPY", OrderSide::Buy, dec!(10), dec!(450.00), dec!(0), "vwap")
            .await
            .unwrap();
        store
            .apply_fill("SPY", OrderSide::Sell, dec!(10), dec!(449.00), dec!(0), "vwap")
            .await
            .unwrap();

        clock.advance(chrono::Duration::hours(2));
        store
            .apply_fill("QQQ", OrderSide::Buy, dec!(5), dec!(380.00), dec!(0), "vwap")
            .await
            .unwrap();
        store
            .apply_fill("QQQ", OrderSide::Sell, dec!(5), dec!(381.00), dec!(0), "vwap")
            .await
            .unwrap();

        let all = store.closed_trades_since(start_time()).await.unwrap();
        assert_eq!(all.len(), 2);

        let recent = store
            .closed_trades_since(start_time() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].symbol, "QQQ");

        // -10 + 5 = -5
        let pnl = store.realized_pnl_since(start_time()).await.unwrap();
        assert_eq!(pnl, dec!(-5.00));
    }

    #[tokio::test]
    async fn heal_upsert_and_remove() {
        let (store, _journal, _clock) = make_store().await;

        store
            .upsert_from_broker("SPY", dec!(10), dec!(450.00), "reconciler")
            .await
            .unwrap();
        assert_eq!(
            store.position("SPY").await.unwrap().unwrap().quantity,
            dec!(10)
        );

        store
            .upsert_from_broker("SPY", dec!(7), dec!(450.00), "reconciler")
            .await
            .unwrap();
        assert_eq!(
            store.position("SPY").await.unwrap().unwrap().quantity,
            dec!(7)
        );

        store.remove("SPY").await.unwrap();
        assert!(store.position("SPY").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_order_id_round_trip() {
        let (store, _journal, _clock) = make_store().await;

        store
            .apply_fill("SPY", OrderSide::Buy, dec!(10), dec!(450.00), dec!(0), "vwap")
            .await
            .unwrap();
        store.set_stop_order("SPY", Some("B-stop-1")).await.unwrap();

        let position = store.position("SPY").await.unwrap().unwrap();
        assert_eq!(position.stop_order_id.as_deref(), Some("B-stop-1"));

        store.set_stop_order("SPY", None).await.unwrap();
        let position = store.position("SPY").await.unwrap().unwrap();
        assert!(position.stop_order_id.is_none());
    }
}
