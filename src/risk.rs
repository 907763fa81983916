//! Risk and performance statistics
//!
//! Derives the equity curve, period returns, and annualized risk ratios from
//! a closed-trade ledger, plus position-sizing and stop-price helpers.
//!
//! # Annualization convention
//!
//! Ratios are annualized with `periods_per_year` (default 252, the
//! daily-bar trading calendar) and an annual risk-free rate (default 2%)
//! de-compounded to a per-period rate. Both are configurable on the
//! analyzer.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::indicators::{atr, bollinger_bands};
use crate::{TimeSeries, Trade};

/// Trading days per year used for annualization by default.
pub const DEFAULT_PERIODS_PER_YEAR: f64 = 252.0;

/// Default annual risk-free rate.
pub const DEFAULT_RISK_FREE_RATE: f64 = 0.02;

/// Derived risk/performance scalars for a trade sequence.
///
/// `win_rate` is a fraction in `[0, 1]`; `max_drawdown` is a percentage in
/// `[0, 100]`; `total_return` is a fraction of initial capital.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub total_return: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub volatility: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub expectancy: f64,
    pub n_trades: usize,
}

/// Computes `RiskMetrics` from a closed-trade ledger.
#[derive(Debug, Clone)]
pub struct RiskAnalyzer {
    periods_per_year: f64,
    risk_free_rate: f64,
}

impl Default for RiskAnalyzer {
    fn default() -> Self {
        Self {
            periods_per_year: DEFAULT_PERIODS_PER_YEAR,
            risk_free_rate: DEFAULT_RISK_FREE_RATE,
        }
    }
}

impl RiskAnalyzer {
    pub fn new(periods_per_year: f64, risk_free_rate: f64) -> Self {
        Self {
            periods_per_year,
            risk_free_rate,
        }
    }

    /// Annual risk-free rate de-compounded to one period.
    fn risk_free_per_period(&self) -> f64 {
        (1.0 + self.risk_free_rate).powf(1.0 / self.periods_per_year) - 1.0
    }

    /// Derive the full metrics set from `trades` and `initial_capital`.
    ///
    /// An empty ledger yields all-zero metrics. When a deviation in a ratio's
    /// denominator is zero the ratio reports the 0.0 sentinel; a zero
    /// drawdown with positive return reports an infinite Calmar ratio.
    pub fn analyze(&self, trades: &[Trade], initial_capital: f64) -> RiskMetrics {
        if trades.is_empty() || initial_capital <= 0.0 {
            return RiskMetrics::default();
        }

        let equity = equity_curve(trades, initial_capital);
        let returns: Vec<f64> = equity
            .windows(2)
            .map(|w| if w[0] != 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
            .collect();

        let final_capital = *equity.last().unwrap_or(&initial_capital);
        let total_return = (final_capital - initial_capital) / initial_capital;
        let max_drawdown = max_drawdown_pct(&equity);

        let sqrt_periods = self.periods_per_year.sqrt();
        let rf = self.risk_free_per_period();

        let volatility = if returns.len() > 1 {
            (&returns[..]).std_dev() * sqrt_periods
        } else {
            0.0
        };

        let excess: Vec<f64> = returns.iter().map(|r| r - rf).collect();
        let excess_std = if excess.len() > 1 {
            (&excess[..]).std_dev()
        } else {
            0.0
        };
        let sharpe_ratio = if excess_std > 0.0 {
            (&excess[..]).mean() / excess_std * sqrt_periods
        } else {
            0.0
        };

        let downside_sq: Vec<f64> = returns
            .iter()
            .filter(|&&r| r < rf)
            .map(|r| (r - rf) * (r - rf))
            .collect();
        let sortino_ratio = if downside_sq.is_empty() {
            0.0
        } else {
            let downside_dev = (&downside_sq[..]).mean().sqrt();
            if downside_dev > 0.0 {
                ((&returns[..]).mean() - rf) / downside_dev * sqrt_periods
            } else {
                0.0
            }
        };

        let calmar_ratio = if max_drawdown > 0.0 {
            total_return / (max_drawdown / 100.0)
        } else if total_return > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let winners: Vec<&Trade> = trades.iter().filter(|t| t.profit > 0.0).collect();
        let losers: Vec<&Trade> = trades.iter().filter(|t| t.profit <= 0.0).collect();
        let win_rate = winners.len() as f64 / trades.len() as f64;

        let gross_profit: f64 = winners.iter().map(|t| t.profit).sum();
        let gross_loss: f64 = losers.iter().map(|t| t.profit.abs()).sum();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let avg_win = if winners.is_empty() {
            0.0
        } else {
            gross_profit / winners.len() as f64
        };
        let avg_loss = if losers.is_empty() {
            0.0
        } else {
            gross_loss / losers.len() as f64
        };
        let expectancy = win_rate * avg_win - (1.0 - win_rate) * avg_loss;

        RiskMetrics {
            total_return,
            max_drawdown,
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
            volatility,
            win_rate,
            profit_factor,
            expectancy,
            n_trades: trades.len(),
        }
    }
}

/// Equity curve over a trade sequence: `E[0] = initial_capital`,
/// `E[i] = E[i-1] + trades[i-1].profit`.
pub fn equity_curve(trades: &[Trade], initial_capital: f64) -> Vec<f64> {
    let mut curve = Vec::with_capacity(trades.len() + 1);
    curve.push(initial_capital);
    let mut equity = initial_capital;
    for trade in trades {
        equity += trade.profit;
        curve.push(equity);
    }
    curve
}

/// Maximum percentage decline from a running high-water mark, in `[0, 100]`.
pub fn max_drawdown_pct(curve: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0;

    for &value in curve {
        if value > peak {
            peak = value;
        }
        if peak > 0.0 {
            let dd = (peak - value) / peak * 100.0;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    max_dd
}

/// Risk-budget position size: the whole number of units that puts
/// `risk_pct` percent of `portfolio_value` at risk between `entry_price`
/// and `stop_loss`. Returns 0 on nonpositive inputs or zero stop distance.
pub fn position_size(
    portfolio_value: f64,
    risk_pct: f64,
    entry_price: f64,
    stop_loss: f64,
) -> f64 {
    if portfolio_value <= 0.0 || risk_pct <= 0.0 || entry_price <= 0.0 || stop_loss <= 0.0 {
        return 0.0;
    }
    let stop_distance = (entry_price - stop_loss).abs();
    if stop_distance == 0.0 {
        return 0.0;
    }
    (portfolio_value * risk_pct / 100.0 / stop_distance).floor()
}

/// Stop a fixed percentage away from entry.
pub fn percentage_stop(entry_price: f64, pct: f64, is_long: bool) -> f64 {
    let pct = pct.max(0.0);
    if is_long {
        entry_price * (1.0 - pct / 100.0)
    } else {
        entry_price * (1.0 + pct / 100.0)
    }
}

/// Stop a fixed currency amount away from entry.
pub fn fixed_amount_stop(entry_price: f64, amount: f64, is_long: bool) -> f64 {
    let amount = amount.max(0.0);
    if is_long {
        entry_price - amount
    } else {
        entry_price + amount
    }
}

/// ATR-multiple stop from entry. `None` until the ATR has warmed up.
pub fn atr_stop(
    series: &TimeSeries,
    period: usize,
    multiple: f64,
    entry_price: f64,
    is_long: bool,
) -> Option<f64> {
    let current_atr = last_atr(series, period)?;
    Some(if is_long {
        entry_price - multiple * current_atr
    } else {
        entry_price + multiple * current_atr
    })
}

/// Chandelier exit: trailing stop hung from the highest high (long) or
/// lowest low (short) of the lookback window, offset by an ATR multiple.
pub fn chandelier_exit(
    series: &TimeSeries,
    period: usize,
    multiple: f64,
    is_long: bool,
) -> Option<f64> {
    if series.len() < period || period == 0 {
        return None;
    }
    let current_atr = last_atr(series, period)?;
    let window = &series.bars()[series.len() - period..];

    Some(if is_long {
        let highest = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        highest - multiple * current_atr
    } else {
        let lowest = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        lowest + multiple * current_atr
    })
}

/// Bollinger-band stop: the lower band for longs, the upper for shorts.
pub fn bollinger_stop(
    series: &TimeSeries,
    period: usize,
    num_std: f64,
    is_long: bool,
) -> Option<f64> {
    let closes = series.close_prices();
    let (upper, _, lower) = bollinger_bands(&closes, period, num_std);
    if is_long {
        lower.last().copied().flatten()
    } else {
        upper.last().copied().flatten()
    }
}

fn last_atr(series: &TimeSeries, period: usize) -> Option<f64> {
    let high: Vec<f64> = series.iter().map(|b| b.high).collect();
    let low: Vec<f64> = series.iter().map(|b| b.low).collect();
    let close: Vec<f64> = series.iter().map(|b| b.close).collect();
    atr(&high, &low, &close, period).last().copied().flatten()
}
