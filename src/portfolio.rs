//! Portfolio accounting
//!
//! Positions with average-cost tracking, the append-only transaction journal,
//! and the cash ledger. A portfolio is owned by one backtest run; there is no
//! concurrent mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::{Order, Symbol};

/// Quantities below this are treated as a flat position.
const QTY_EPSILON: f64 = 1e-12;

/// Outcome of applying a fill to a position. One variant per branch of the
/// `(sign(qty), sign(dqty), |dqty| vs |qty|)` state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionUpdate {
    /// Zero-quantity fill; nothing changed
    NoOp,
    /// Same-side add (or open from flat); average price re-weighted
    ScaledIn,
    /// Opposite side, smaller than the holding; average price preserved
    Reduced,
    /// Opposite side, exactly flattening the holding
    Closed,
    /// Opposite side, larger than the holding; average price resets to the fill
    Reversed,
}

/// Per-symbol holding with signed quantity and average cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    /// Signed quantity: positive long, negative short
    pub quantity: f64,
    pub avg_price: f64,
    pub current_price: f64,
    /// Commissions accumulated on fills while this position has been open
    pub commission_paid: f64,
    /// The order that opened the position; carries its SL/TP levels and is
    /// consulted when a closing fill reconstructs the entry leg
    pub originating_order: Option<Order>,
}

impl Position {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            quantity: 0.0,
            avg_price: 0.0,
            current_price: 0.0,
            commission_paid: 0.0,
            originating_order: None,
        }
    }

    pub fn is_long(&self) -> bool {
        self.quantity > QTY_EPSILON
    }

    pub fn is_short(&self) -> bool {
        self.quantity < -QTY_EPSILON
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.abs() <= QTY_EPSILON
    }

    pub fn market_value(&self) -> f64 {
        self.quantity * self.current_price
    }

    pub fn unrealized_pnl(&self) -> f64 {
        (self.current_price - self.avg_price) * self.quantity
    }

    /// Apply a fill of `delta_qty` at `fill_price`.
    ///
    /// Average price is re-weighted on same-side adds, preserved on partial
    /// reductions, and reset to the fill price when the position closes or
    /// reverses. `current_price` tracks the fill on every non-trivial update.
    pub fn update(&mut self, delta_qty: f64, fill_price: f64) -> PositionUpdate {
        if delta_qty == 0.0 {
            return PositionUpdate::NoOp;
        }

        let outcome = if self.is_flat() || self.quantity.signum() == delta_qty.signum() {
            let held = self.quantity.abs();
            let added = delta_qty.abs();
            self.avg_price = (held * self.avg_price + added * fill_price) / (held + added);
            PositionUpdate::ScaledIn
        } else if delta_qty.abs() < self.quantity.abs() - QTY_EPSILON {
            PositionUpdate::Reduced
        } else if delta_qty.abs() <= self.quantity.abs() + QTY_EPSILON {
            self.avg_price = fill_price;
            PositionUpdate::Closed
        } else {
            self.avg_price = fill_price;
            PositionUpdate::Reversed
        };

        self.quantity += delta_qty;
        if self.quantity.abs() <= QTY_EPSILON {
            self.quantity = 0.0;
        }
        self.current_price = fill_price;
        outcome
    }
}

/// Record of a single settled fill. Never mutated once journaled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub timestamp: DateTime<Utc>,
    pub symbol: Symbol,
    /// Signed quantity: positive buys, negative sells
    pub quantity: f64,
    pub price: f64,
    pub commission: f64,
}

/// Cash, open positions, and the transaction journal for one backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    cash: f64,
    initial_capital: f64,
    positions: HashMap<Symbol, Position>,
    transactions: Vec<Transaction>,
    /// Internal hook: permit fills that open negative-quantity positions.
    /// Off by default; short selling is disabled at the engine level.
    allow_short: bool,
}

impl Portfolio {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            cash: initial_capital,
            initial_capital,
            positions: HashMap::new(),
            transactions: Vec::new(),
            allow_short: false,
        }
    }

    /// Clear all state and restart from `initial_capital`.
    pub fn reset(&mut self, initial_capital: f64) {
        self.cash = initial_capital;
        self.initial_capital = initial_capital;
        self.positions.clear();
        self.transactions.clear();
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn allow_short(&self) -> bool {
        self.allow_short
    }

    pub fn set_allow_short(&mut self, allow: bool) {
        self.allow_short = allow;
    }

    pub fn has_position(&self, symbol: &Symbol) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Mark an open position to a fresh price without trading.
    pub fn mark(&mut self, symbol: &Symbol, price: f64) {
        if let Some(pos) = self.positions.get_mut(symbol) {
            pos.current_price = price;
        }
    }

    /// Cash plus the marked value of all open positions.
    pub fn total_value(&self) -> f64 {
        self.cash + self.positions.values().map(|p| p.market_value()).sum::<f64>()
    }

    /// Total value against an explicit set of marks; symbols without a mark
    /// fall back to their last seen price.
    pub fn total_value_marked(&self, marks: &HashMap<Symbol, f64>) -> f64 {
        self.cash
            + self
                .positions
                .values()
                .map(|p| p.quantity * marks.get(&p.symbol).copied().unwrap_or(p.current_price))
                .sum::<f64>()
    }

    /// Attach the opening order to a position that does not have one yet.
    pub fn set_originating_order(&mut self, symbol: &Symbol, order: Order) {
        if let Some(pos) = self.positions.get_mut(symbol) {
            if pos.originating_order.is_none() {
                pos.originating_order = Some(order);
            }
        }
    }

    /// Overwrite the originating order after a reversal, where the surviving
    /// position was opened by the reversing fill.
    pub(crate) fn replace_originating_order(&mut self, symbol: &Symbol, order: Order) {
        if let Some(pos) = self.positions.get_mut(symbol) {
            pos.originating_order = Some(order);
        }
    }

    /// The central mutator: settle a fill of `delta_qty` at `price` with
    /// `commission` charged on top.
    ///
    /// All-or-nothing: on any rejection this returns `false` with no side
    /// effects. On success the cash ledger moves, the position is updated
    /// (and dropped if it went flat), and a transaction is journaled.
    pub fn update_position(
        &mut self,
        symbol: &Symbol,
        delta_qty: f64,
        price: f64,
        commission: f64,
        timestamp: DateTime<Utc>,
    ) -> bool {
        if delta_qty == 0.0 {
            debug!(%symbol, "rejected zero-quantity position update");
            return false;
        }

        let held = self
            .positions
            .get(symbol)
            .map(|p| p.quantity)
            .unwrap_or(0.0);

        if delta_qty > 0.0 {
            // A buy that is not covering a short must be fully funded.
            let cost = delta_qty * price + commission;
            let covering = held < -QTY_EPSILON;
            if !covering && cost > self.cash {
                debug!(
                    %symbol,
                    cost,
                    cash = self.cash,
                    "rejected buy: insufficient cash"
                );
                return false;
            }
            self.cash -= cost;
        } else {
            if !self.allow_short && held + delta_qty < -QTY_EPSILON {
                debug!(
                    %symbol,
                    held,
                    delta_qty,
                    "rejected sell: would open a short position"
                );
                return false;
            }
            self.cash += delta_qty.abs() * price - commission;
        }

        let pos = self
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| Position::new(symbol.clone()));

        match pos.update(delta_qty, price) {
            PositionUpdate::ScaledIn if pos.quantity == delta_qty => {
                // Fresh open: commission tracking restarts with this leg
                pos.commission_paid = commission;
            }
            PositionUpdate::Reversed => {
                pos.commission_paid = commission;
            }
            _ => {
                pos.commission_paid += commission;
            }
        }

        if pos.is_flat() {
            self.positions.remove(symbol);
        }

        self.transactions.push(Transaction {
            timestamp,
            symbol: symbol.clone(),
            quantity: delta_qty,
            price,
            commission,
        });

        true
    }
}
