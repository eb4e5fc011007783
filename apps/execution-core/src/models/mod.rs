//! Core domain types shared across the execution pipeline.

mod bar;
mod event;
mod fill;
mod mode;
mod order;
mod position;
mod signal;
mod symbol;

pub use bar::Bar;
pub use event::{Event, EventType};
pub use fill::{Fill, weighted_avg_price};
pub use mode::TradingMode;
pub use order::{Order, OrderSide, OrderStatus, OrderType};
pub use position::{ClosedTrade, Position};
pub use signal::Signal;
pub use symbol::{StaticSymbolDirectory, SymbolDirectory, SymbolSpec, SymbolValidationError};
