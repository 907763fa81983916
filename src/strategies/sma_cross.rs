//! Moving-average crossover strategy
//!
//! Long-only reference strategy: enter when the fast SMA crosses above the
//! slow SMA, exit when it crosses back below. Exercises the full strategy
//! contract including parameter reflection.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::indicators::sma;
use crate::strategy::{ParamSet, ParamValue, Strategy, StrategyError};
use crate::{Bar, Order, Portfolio, Symbol, TimeSeries};

/// Typed configuration for [`SmaCrossStrategy`].
#[derive(Debug, Clone)]
pub struct SmaCrossConfig {
    pub fast_period: usize,
    pub slow_period: usize,
    /// Units bought on an entry signal
    pub quantity: f64,
}

impl Default for SmaCrossConfig {
    fn default() -> Self {
        Self {
            fast_period: 10,
            slow_period: 30,
            quantity: 1.0,
        }
    }
}

/// Long-only SMA crossover over a single symbol.
pub struct SmaCrossStrategy {
    symbol: Symbol,
    config: SmaCrossConfig,
    closes: Vec<f64>,
}

impl SmaCrossStrategy {
    pub fn new(symbol: Symbol, config: SmaCrossConfig) -> Self {
        Self {
            symbol,
            config,
            closes: Vec::new(),
        }
    }

    /// Fast and slow SMA at the latest accumulated bar and the bar before it.
    fn crossover_state(&self) -> Option<(f64, f64, f64, f64)> {
        if self.closes.len() < self.config.slow_period + 1 {
            return None;
        }
        let fast = sma(&self.closes, self.config.fast_period);
        let slow = sma(&self.closes, self.config.slow_period);
        let last = self.closes.len() - 1;

        Some((
            fast[last - 1]?,
            fast[last]?,
            slow[last - 1]?,
            slow[last]?,
        ))
    }

    fn set_period(target: &mut usize, name: &str, value: ParamValue) -> Result<(), StrategyError> {
        match value.as_int() {
            Some(v) if v >= 1 => {
                *target = v as usize;
                Ok(())
            }
            _ => Err(StrategyError::InvalidParameter {
                name: name.to_string(),
                value,
                reason: "period must be a positive integer".to_string(),
            }),
        }
    }
}

impl Strategy for SmaCrossStrategy {
    fn name(&self) -> &str {
        "sma_cross"
    }

    fn required_symbols(&self) -> Vec<Symbol> {
        vec![self.symbol.clone()]
    }

    fn initialize(&mut self, data: &HashMap<Symbol, TimeSeries>) -> Result<(), StrategyError> {
        if self.config.fast_period >= self.config.slow_period {
            return Err(StrategyError::Failed(format!(
                "fast period ({}) must be shorter than slow period ({})",
                self.config.fast_period, self.config.slow_period
            )));
        }
        if !data.contains_key(&self.symbol) {
            return Err(StrategyError::Failed(format!(
                "no data provided for {}",
                self.symbol
            )));
        }
        self.closes.clear();
        Ok(())
    }

    fn on_bar(
        &mut self,
        _timestamp: DateTime<Utc>,
        current_bars: &HashMap<Symbol, Bar>,
        _portfolio: &Portfolio,
    ) -> Result<(), StrategyError> {
        if let Some(bar) = current_bars.get(&self.symbol) {
            self.closes.push(bar.close);
        }
        Ok(())
    }

    fn generate_orders(
        &mut self,
        timestamp: DateTime<Utc>,
        current_bars: &HashMap<Symbol, Bar>,
        portfolio: &Portfolio,
    ) -> Result<Vec<Order>, StrategyError> {
        if !current_bars.contains_key(&self.symbol) {
            return Ok(Vec::new());
        }
        let Some((fast_prev, fast_now, slow_prev, slow_now)) = self.crossover_state() else {
            return Ok(Vec::new());
        };

        let holding = portfolio.has_position(&self.symbol);
        let crossed_up = fast_prev <= slow_prev && fast_now > slow_now;
        let crossed_down = fast_prev >= slow_prev && fast_now < slow_now;

        if crossed_up && !holding {
            debug!(symbol = %self.symbol, fast = fast_now, slow = slow_now, "entry signal");
            let order = Order::market(self.symbol.clone(), self.config.quantity, timestamp)
                .map_err(|e| StrategyError::Failed(e.to_string()))?;
            return Ok(vec![order]);
        }

        if crossed_down && holding {
            if let Some(position) = portfolio.position(&self.symbol) {
                debug!(symbol = %self.symbol, fast = fast_now, slow = slow_now, "exit signal");
                let order = Order::market(self.symbol.clone(), -position.quantity, timestamp)
                    .map_err(|e| StrategyError::Failed(e.to_string()))?;
                return Ok(vec![order]);
            }
        }

        Ok(Vec::new())
    }

    fn parameters(&self) -> ParamSet {
        HashMap::from([
            (
                "fast_period".to_string(),
                ParamValue::from(self.config.fast_period),
            ),
            (
                "slow_period".to_string(),
                ParamValue::from(self.config.slow_period),
            ),
            ("quantity".to_string(), ParamValue::from(self.config.quantity)),
        ])
    }

    fn set_parameter(&mut self, name: &str, value: ParamValue) -> Result<(), StrategyError> {
        match name {
            "fast_period" => Self::set_period(&mut self.config.fast_period, name, value),
            "slow_period" => Self::set_period(&mut self.config.slow_period, name, value),
            "quantity" => match value.as_float() {
                Some(v) if v > 0.0 => {
                    self.config.quantity = v;
                    Ok(())
                }
                _ => Err(StrategyError::InvalidParameter {
                    name: name.to_string(),
                    value,
                    reason: "quantity must be positive".to_string(),
                }),
            },
            _ => Err(StrategyError::UnknownParameter(name.to_string())),
        }
    }
}
