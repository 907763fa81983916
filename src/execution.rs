//! Order execution simulation
//!
//! Fills orders against a single bar, applying slippage and commission, and
//! settles the result into the portfolio. A closing fill emits the completed
//! round-trip `Trade`.

use tracing::{debug, trace};

use crate::{Bar, Order, OrderError, OrderType, Portfolio, Position, Trade};

/// Fills orders against bars.
///
/// A miss (untriggered limit/stop, insufficient cash, disabled short) is not
/// an error: the order is left unexecuted and `Ok(None)` is returned with the
/// portfolio untouched.
#[derive(Debug, Clone)]
pub struct OrderExecutionSimulator {
    commission_rate: f64,
    slippage: f64,
}

impl OrderExecutionSimulator {
    pub fn new(commission_rate: f64, slippage: f64) -> Self {
        Self {
            commission_rate,
            slippage,
        }
    }

    pub fn commission_rate(&self) -> f64 {
        self.commission_rate
    }

    pub fn slippage(&self) -> f64 {
        self.slippage
    }

    pub fn set_commission_rate(&mut self, rate: f64) {
        self.commission_rate = rate;
    }

    pub fn set_slippage(&mut self, slippage: f64) {
        self.slippage = slippage;
    }

    /// Base fill price for `order` against `bar`, before slippage.
    ///
    /// Market orders fill at the bar open; limit/stop variants fill at their
    /// trigger when the bar's range reaches it.
    fn base_fill_price(&self, order: &Order, bar: &Bar) -> Option<f64> {
        match order.order_type {
            OrderType::Market => Some(bar.open),
            OrderType::Limit => {
                let trigger = order.trigger_price?;
                let touched = if order.is_buy() {
                    bar.low <= trigger
                } else {
                    bar.high >= trigger
                };
                touched.then_some(trigger)
            }
            OrderType::Stop => {
                let trigger = order.trigger_price?;
                let touched = if order.is_buy() {
                    bar.high >= trigger
                } else {
                    bar.low <= trigger
                };
                touched.then_some(trigger)
            }
            OrderType::StopLimit => {
                let trigger = order.trigger_price?;
                (bar.high >= trigger && bar.low <= trigger).then_some(trigger)
            }
        }
    }

    /// Attempt to fill `order` against `bar`, settling into `portfolio`.
    ///
    /// Returns a `Trade` only when the fill closes an open position. A fill
    /// that opens a position attaches the order as the position's originator
    /// for the engine's stop-loss / take-profit monitor.
    pub fn execute(
        &self,
        order: &mut Order,
        bar: &Bar,
        portfolio: &mut Portfolio,
    ) -> Result<Option<Trade>, OrderError> {
        if order.executed {
            return Err(OrderError::AlreadyExecuted(order.id));
        }

        let base = match self.base_fill_price(order, bar) {
            Some(p) => p,
            None => {
                trace!(
                    order_id = order.id,
                    symbol = %order.symbol,
                    order_type = ?order.order_type,
                    "no fill: trigger not reached"
                );
                return Ok(None);
            }
        };

        let exec_price = if order.is_buy() {
            base * (1.0 + self.slippage)
        } else {
            base * (1.0 - self.slippage)
        };
        let commission = (order.quantity * exec_price).abs() * self.commission_rate;

        // Entry-leg snapshot taken before the fill; a closing fill
        // reconstructs the round trip from it rather than from the journal.
        let before: Option<Position> = portfolio.position(&order.symbol).cloned();

        if !portfolio.update_position(
            &order.symbol,
            order.quantity,
            exec_price,
            commission,
            bar.timestamp,
        ) {
            debug!(
                order_id = order.id,
                symbol = %order.symbol,
                "no fill: portfolio rejected the trade"
            );
            return Ok(None);
        }

        order.execute(bar.timestamp, exec_price)?;
        debug!(
            order_id = order.id,
            symbol = %order.symbol,
            quantity = order.quantity,
            price = exec_price,
            commission,
            "order filled"
        );

        let after_qty = portfolio
            .position(&order.symbol)
            .map(|p| p.quantity)
            .unwrap_or(0.0);

        match before {
            Some(entry) if !entry.is_flat() && after_qty == 0.0 => {
                let trade = self.build_trade(&entry, order, exec_price, commission, portfolio);
                Ok(Some(trade))
            }
            Some(entry) if !entry.is_flat() && entry.quantity.signum() != after_qty.signum() => {
                // Reversal: the surviving position belongs to this order
                portfolio.replace_originating_order(&order.symbol, order.clone());
                Ok(None)
            }
            None => {
                portfolio.set_originating_order(&order.symbol, order.clone());
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn build_trade(
        &self,
        entry: &Position,
        order: &Order,
        exec_price: f64,
        exit_commission: f64,
        portfolio: &Portfolio,
    ) -> Trade {
        let is_long = entry.quantity > 0.0;
        let entry_qty = entry.quantity;
        let entry_price = entry.avg_price;
        let commission_total = entry.commission_paid + exit_commission;

        let gross = if is_long {
            (exec_price - entry_price) * entry_qty.abs()
        } else {
            (entry_price - exec_price) * entry_qty.abs()
        };
        let profit = gross - commission_total;
        let entry_notional = entry_price * entry_qty.abs();
        let profit_pct = if entry_notional > 0.0 {
            profit / entry_notional * 100.0
        } else {
            0.0
        };

        let entry_time = entry
            .originating_order
            .as_ref()
            .map(|o| o.execution_time.unwrap_or(o.creation_time))
            .unwrap_or(order.creation_time);

        Trade {
            symbol: order.symbol.clone(),
            entry_time,
            entry_price,
            entry_quantity: entry_qty,
            exit_time: order.execution_time.unwrap_or(order.creation_time),
            exit_price: exec_price,
            exit_quantity: order.quantity,
            commission_total,
            profit,
            profit_pct,
            is_long,
            capital_after_trade: portfolio.total_value(),
            stop_loss_hit: false,
            take_profit_hit: false,
        }
    }
}
