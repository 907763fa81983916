//! Backtest engine
//!
//! The bar-driven event loop: replays the merged timeline across all
//! required symbols, monitors protective exits, routes strategy orders
//! through the execution simulator, and aggregates the run's results.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::data::{DataError, MarketDataService};
use crate::risk::{max_drawdown_pct, RiskAnalyzer, RiskMetrics};
use crate::strategy::{Strategy, StrategyError};
use crate::{
    Bar, Order, OrderError, OrderExecutionSimulator, Portfolio, Symbol, TimeSeries, Trade,
};

/// Default proportional commission per fill (0.1%).
pub const DEFAULT_COMMISSION_RATE: f64 = 0.001;

/// Default multiplicative slippage per fill (0.1%).
pub const DEFAULT_SLIPPAGE: f64 = 0.001;

/// Fatal backtest failures. Execution misses are not errors and never
/// surface here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error("strategy '{name}' failed at {timestamp}: {source}")]
    Strategy {
        name: String,
        timestamp: DateTime<Utc>,
        #[source]
        source: StrategyError,
    },

    #[error(transparent)]
    Order(#[from] OrderError),
}

/// Aggregate results of one backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResults {
    pub initial_capital: f64,
    pub final_capital: f64,
    pub profit: f64,
    pub return_pct: f64,
    pub trades: Vec<Trade>,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percentage of trades closed at a profit
    pub win_rate: f64,
    /// Mean profit over winning trades
    pub average_profit: f64,
    /// Mean absolute loss over losing trades
    pub average_loss: f64,
    pub profit_factor: f64,
    /// Maximum percentage drawdown over the after-trade capital sequence
    pub max_drawdown: f64,
    /// Attached when the engine carries a risk analyzer
    pub risk_metrics: Option<RiskMetrics>,
}

impl BacktestResults {
    fn from_run(initial_capital: f64, final_capital: f64, trades: Vec<Trade>) -> Self {
        let winners: Vec<&Trade> = trades.iter().filter(|t| t.profit > 0.0).collect();
        let losers: Vec<&Trade> = trades.iter().filter(|t| t.profit <= 0.0).collect();

        let win_rate = if trades.is_empty() {
            0.0
        } else {
            winners.len() as f64 / trades.len() as f64 * 100.0
        };

        let gross_profit: f64 = winners.iter().map(|t| t.profit).sum();
        let gross_loss: f64 = losers.iter().map(|t| t.profit.abs()).sum();

        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let average_profit = if winners.is_empty() {
            0.0
        } else {
            gross_profit / winners.len() as f64
        };
        let average_loss = if losers.is_empty() {
            0.0
        } else {
            gross_loss / losers.len() as f64
        };

        // High-water-mark walk over after-trade capital, seeded at the
        // starting capital.
        let mut capital_track = Vec::with_capacity(trades.len() + 1);
        capital_track.push(initial_capital);
        capital_track.extend(trades.iter().map(|t| t.capital_after_trade));
        let max_drawdown = max_drawdown_pct(&capital_track);

        let profit = final_capital - initial_capital;
        let return_pct = if initial_capital > 0.0 {
            profit / initial_capital * 100.0
        } else {
            0.0
        };

        Self {
            initial_capital,
            final_capital,
            profit,
            return_pct,
            total_trades: trades.len(),
            winning_trades: winners.len(),
            losing_trades: losers.len(),
            win_rate,
            average_profit,
            average_loss,
            profit_factor,
            max_drawdown,
            trades,
            risk_metrics: None,
        }
    }

    /// After-trade capital sequence, seeded with the initial capital.
    pub fn equity_curve(&self) -> Vec<f64> {
        std::iter::once(self.initial_capital)
            .chain(self.trades.iter().map(|t| t.capital_after_trade))
            .collect()
    }

    /// Lossless string-keyed view for interchange.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("results serialize to JSON")
    }
}

/// Drives strategies over historical bars against a simulated broker.
pub struct BacktestEngine {
    data_service: Arc<MarketDataService>,
    strategies: Vec<Box<dyn Strategy>>,
    executor: OrderExecutionSimulator,
    portfolio: Portfolio,
    initial_capital: f64,
    risk_analyzer: Option<RiskAnalyzer>,
    trades: Vec<Trade>,
}

impl BacktestEngine {
    pub fn new(data_service: Arc<MarketDataService>, initial_capital: f64) -> Self {
        Self {
            data_service,
            strategies: Vec::new(),
            executor: OrderExecutionSimulator::new(DEFAULT_COMMISSION_RATE, DEFAULT_SLIPPAGE),
            portfolio: Portfolio::new(initial_capital),
            initial_capital,
            risk_analyzer: None,
            trades: Vec::new(),
        }
    }

    pub fn add_strategy(&mut self, strategy: Box<dyn Strategy>) {
        self.strategies.push(strategy);
    }

    /// Remove all strategies with the given name. Returns whether any were
    /// removed.
    pub fn remove_strategy(&mut self, name: &str) -> bool {
        let before = self.strategies.len();
        self.strategies.retain(|s| s.name() != name);
        self.strategies.len() != before
    }

    pub fn set_commission_rate(&mut self, rate: f64) {
        self.executor.set_commission_rate(rate);
    }

    pub fn set_slippage(&mut self, slippage: f64) {
        self.executor.set_slippage(slippage);
    }

    /// Internal hook: allow fills that open short positions. Off by default.
    pub fn set_allow_short(&mut self, allow: bool) {
        self.portfolio.set_allow_short(allow);
    }

    /// Attach a risk analyzer whose metrics are added to every run's results.
    pub fn attach_risk_analyzer(&mut self, analyzer: RiskAnalyzer) {
        self.risk_analyzer = Some(analyzer);
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    /// Replay `[start, end]` and aggregate results.
    ///
    /// Deterministic: the timeline is the sorted union of bar timestamps
    /// across all required symbols, strategies fire in insertion order, and
    /// their orders execute in the order generated.
    pub fn run(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BacktestResults, EngineError> {
        self.portfolio.reset(self.initial_capital);
        self.trades.clear();

        let symbols: BTreeSet<Symbol> = self
            .strategies
            .iter()
            .flat_map(|s| s.required_symbols())
            .collect();

        let mut data: HashMap<Symbol, TimeSeries> = HashMap::new();
        for symbol in &symbols {
            let series = self.data_service.get(symbol, start, end)?;
            data.insert(symbol.clone(), series);
        }

        for strategy in &mut self.strategies {
            strategy
                .initialize(&data)
                .map_err(|source| EngineError::Strategy {
                    name: strategy.name().to_string(),
                    timestamp: start,
                    source,
                })?;
        }

        let timeline: Vec<DateTime<Utc>> = data
            .values()
            .flat_map(|series| series.timestamps())
            .filter(|t| *t >= start && *t <= end)
            .sorted()
            .dedup()
            .collect();

        info!(
            symbols = symbols.len(),
            ticks = timeline.len(),
            strategies = self.strategies.len(),
            "starting backtest"
        );

        for t in timeline {
            let current_bars: HashMap<Symbol, Bar> = data
                .iter()
                .filter_map(|(symbol, series)| {
                    series.get_at(t).map(|bar| (symbol.clone(), bar.clone()))
                })
                .collect();

            for (symbol, bar) in &current_bars {
                self.portfolio.mark(symbol, bar.close);
            }

            self.monitor_protective_exits(t, &current_bars)?;

            for strategy in &mut self.strategies {
                strategy
                    .on_bar(t, &current_bars, &self.portfolio)
                    .map_err(|source| EngineError::Strategy {
                        name: strategy.name().to_string(),
                        timestamp: t,
                        source,
                    })?;

                let orders = strategy
                    .generate_orders(t, &current_bars, &self.portfolio)
                    .map_err(|source| EngineError::Strategy {
                        name: strategy.name().to_string(),
                        timestamp: t,
                        source,
                    })?;

                for mut order in orders {
                    let Some(bar) = current_bars.get(&order.symbol) else {
                        trace!(symbol = %order.symbol, timestamp = %t, "data gap: order skipped");
                        continue;
                    };
                    if let Some(trade) =
                        self.executor.execute(&mut order, bar, &mut self.portfolio)?
                    {
                        self.trades.push(trade);
                    }
                }
            }
        }

        let final_capital = self.portfolio.total_value();
        let mut results =
            BacktestResults::from_run(self.initial_capital, final_capital, self.trades.clone());
        if let Some(analyzer) = &self.risk_analyzer {
            results.risk_metrics = Some(analyzer.analyze(&results.trades, self.initial_capital));
        }

        info!(
            final_capital,
            trades = results.total_trades,
            return_pct = results.return_pct,
            "backtest complete"
        );
        Ok(results)
    }

    /// Close positions whose originating order carries a stop-loss or
    /// take-profit that the current bar triggers.
    ///
    /// Conservative intra-bar assumption: when both levels trigger inside
    /// one bar, the stop-loss wins. Exits are synthesized as stop (SL) or
    /// limit (TP) orders at the trigger so they are priced like any other
    /// fill, including slippage and commission.
    fn monitor_protective_exits(
        &mut self,
        t: DateTime<Utc>,
        current_bars: &HashMap<Symbol, Bar>,
    ) -> Result<(), EngineError> {
        struct PendingExit {
            symbol: Symbol,
            quantity: f64,
            trigger: f64,
            is_stop_loss: bool,
        }

        let mut exits: Vec<PendingExit> = Vec::new();

        for position in self.portfolio.positions() {
            let Some(order) = &position.originating_order else {
                continue;
            };
            if order.stop_loss.is_none() && order.take_profit.is_none() {
                continue;
            }
            let Some(bar) = current_bars.get(&position.symbol) else {
                continue;
            };

            let long = position.is_long();
            let sl_hit = order.stop_loss.map_or(false, |p| {
                if long {
                    bar.low <= p
                } else {
                    bar.high >= p
                }
            });
            let tp_hit = order.take_profit.map_or(false, |p| {
                if long {
                    bar.high >= p
                } else {
                    bar.low <= p
                }
            });

            if sl_hit {
                exits.push(PendingExit {
                    symbol: position.symbol.clone(),
                    quantity: -position.quantity,
                    trigger: order.stop_loss.unwrap_or_default(),
                    is_stop_loss: true,
                });
            } else if tp_hit {
                exits.push(PendingExit {
                    symbol: position.symbol.clone(),
                    quantity: -position.quantity,
                    trigger: order.take_profit.unwrap_or_default(),
                    is_stop_loss: false,
                });
            }
        }

        // Deterministic across runs regardless of position-map iteration order
        exits.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        for exit in exits {
            let bar = &current_bars[&exit.symbol];
            let mut order = if exit.is_stop_loss {
                Order::stop(exit.symbol.clone(), exit.quantity, exit.trigger, t)?
            } else {
                Order::limit(exit.symbol.clone(), exit.quantity, exit.trigger, t)?
            };

            debug!(
                symbol = %exit.symbol,
                trigger = exit.trigger,
                stop_loss = exit.is_stop_loss,
                "protective exit triggered"
            );

            if let Some(mut trade) = self.executor.execute(&mut order, bar, &mut self.portfolio)? {
                if exit.is_stop_loss {
                    trade.stop_loss_hit = true;
                } else {
                    trade.take_profit_hit = true;
                }
                self.trades.push(trade);
            }
        }

        Ok(())
    }
}
