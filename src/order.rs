//! Order model
//!
//! Orders carry a signed quantity (positive = buy, negative = sell), an
//! optional trigger price for limit/stop variants, and optional protective
//! stop-loss / take-profit levels consumed by the engine's exit monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::Symbol;

/// Order ID type - u64 for performance
pub type OrderId = u64;

/// Atomic counter for fast order ID generation
static ORDER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate next order ID (thread-safe, lock-free, monotonic)
pub fn next_order_id() -> OrderId {
    ORDER_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Order type - determines execution logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Execute at the open of the bar being processed
    Market,

    /// Buy when the bar trades at or below the trigger, sell at or above
    Limit,

    /// Buy when the bar trades at or above the trigger, sell at or below
    Stop,

    /// Fill only when the bar straddles the trigger on both sides
    StopLimit,
}

/// Order construction and lifecycle errors. These are programming errors
/// and abort the run rather than being skipped.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order quantity must be non-zero")]
    ZeroQuantity,

    #[error("trigger price ({0}) must be positive")]
    NonPositiveTrigger(f64),

    #[error("order {0} already executed")]
    AlreadyExecuted(OrderId),

    #[error("{order_type:?} order requires a trigger price")]
    MissingTrigger { order_type: OrderType },
}

/// A single instruction to trade.
///
/// Mutates exactly twice: once at construction and once at execution.
/// Execution fields are frozen after `execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: Symbol,
    pub order_type: OrderType,
    /// Signed quantity: positive buys, negative sells
    pub quantity: f64,
    pub creation_time: DateTime<Utc>,
    /// Limit/stop trigger price; `None` for market orders
    pub trigger_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub executed: bool,
    pub execution_time: Option<DateTime<Utc>>,
    pub execution_price: Option<f64>,
}

impl Order {
    fn build(
        symbol: Symbol,
        order_type: OrderType,
        quantity: f64,
        creation_time: DateTime<Utc>,
        trigger_price: Option<f64>,
    ) -> Result<Self, OrderError> {
        if quantity == 0.0 {
            return Err(OrderError::ZeroQuantity);
        }
        match order_type {
            OrderType::Market => {}
            _ => match trigger_price {
                Some(p) if p > 0.0 => {}
                Some(p) => return Err(OrderError::NonPositiveTrigger(p)),
                None => return Err(OrderError::MissingTrigger { order_type }),
            },
        }

        Ok(Self {
            id: next_order_id(),
            symbol,
            order_type,
            quantity,
            creation_time,
            trigger_price,
            stop_loss: None,
            take_profit: None,
            executed: false,
            execution_time: None,
            execution_price: None,
        })
    }

    pub fn market(
        symbol: Symbol,
        quantity: f64,
        creation_time: DateTime<Utc>,
    ) -> Result<Self, OrderError> {
        Self::build(symbol, OrderType::Market, quantity, creation_time, None)
    }

    pub fn limit(
        symbol: Symbol,
        quantity: f64,
        trigger_price: f64,
        creation_time: DateTime<Utc>,
    ) -> Result<Self, OrderError> {
        Self::build(
            symbol,
            OrderType::Limit,
            quantity,
            creation_time,
            Some(trigger_price),
        )
    }

    pub fn stop(
        symbol: Symbol,
        quantity: f64,
        trigger_price: f64,
        creation_time: DateTime<Utc>,
    ) -> Result<Self, OrderError> {
        Self::build(
            symbol,
            OrderType::Stop,
            quantity,
            creation_time,
            Some(trigger_price),
        )
    }

    pub fn stop_limit(
        symbol: Symbol,
        quantity: f64,
        trigger_price: f64,
        creation_time: DateTime<Utc>,
    ) -> Result<Self, OrderError> {
        Self::build(
            symbol,
            OrderType::StopLimit,
            quantity,
            creation_time,
            Some(trigger_price),
        )
    }

    /// Attach a protective stop-loss level. Nonpositive values are ignored.
    pub fn with_stop_loss(mut self, price: f64) -> Self {
        self.stop_loss = (price > 0.0).then_some(price);
        self
    }

    /// Attach a take-profit level. Nonpositive values are ignored.
    pub fn with_take_profit(mut self, price: f64) -> Self {
        self.take_profit = (price > 0.0).then_some(price);
        self
    }

    pub fn is_buy(&self) -> bool {
        self.quantity > 0.0
    }

    pub fn is_sell(&self) -> bool {
        self.quantity < 0.0
    }

    pub fn has_stop_loss(&self) -> bool {
        self.stop_loss.is_some()
    }

    pub fn has_take_profit(&self) -> bool {
        self.take_profit.is_some()
    }

    /// Mark the order executed, freezing the execution fields.
    ///
    /// A second call is a programming error and fails.
    pub fn execute(&mut self, timestamp: DateTime<Utc>, price: f64) -> Result<(), OrderError> {
        if self.executed {
            return Err(OrderError::AlreadyExecuted(self.id));
        }
        self.executed = true;
        self.execution_time = Some(timestamp);
        self.execution_price = Some(price);
        Ok(())
    }
}
