//! Technical indicators
//!
//! The small indicator set consumed by the stop-price helpers and the
//! bundled strategies, plus the `Indicator` contract external libraries
//! plug into. Outputs are aligned with the input series; `None` marks the
//! warm-up region.

use crate::TimeSeries;

/// Contract for pluggable indicators computed over a bar series.
pub trait Indicator: Send + Sync {
    fn name(&self) -> &str;

    /// One output per input bar, `None` during warm-up.
    fn compute(&self, series: &TimeSeries) -> Vec<Option<f64>>;
}

/// Calculate Simple Moving Average
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if i + 1 < period {
            result.push(None);
        } else {
            let sum: f64 = values[i + 1 - period..=i].iter().sum();
            result.push(Some(sum / period as f64));
        }
    }

    result
}

/// Calculate Exponential Moving Average
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    if values.is_empty() || period == 0 {
        return result;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema_value: Option<f64> = None;

    for (i, &value) in values.iter().enumerate() {
        if i < period - 1 {
            result.push(None);
        } else if i == period - 1 {
            // Seed with SMA
            let sum: f64 = values[0..period].iter().sum();
            ema_value = Some(sum / period as f64);
            result.push(ema_value);
        } else if let Some(prev_ema) = ema_value {
            let new_ema = (value - prev_ema) * multiplier + prev_ema;
            ema_value = Some(new_ema);
            result.push(Some(new_ema));
        }
    }

    result
}

/// Calculate True Range
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        let tr_value = if i == 0 {
            high[i] - low[i]
        } else {
            let hl = high[i] - low[i];
            let hc = (high[i] - close[i - 1]).abs();
            let lc = (low[i] - close[i - 1]).abs();
            hl.max(hc).max(lc)
        };
        tr.push(tr_value);
    }

    tr
}

/// Calculate Average True Range (ATR)
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    let tr = true_range(high, low, close);
    ema(&tr, period)
}

/// Calculate Bollinger Bands. Returns (upper, middle, lower).
pub fn bollinger_bands(
    values: &[f64],
    period: usize,
    num_std: f64,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let middle = sma(values, period);
    let mut upper = Vec::with_capacity(values.len());
    let mut lower = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if let Some(mid) = middle[i] {
            let window = &values[i + 1 - period..=i];
            let variance: f64 = window
                .iter()
                .map(|&x| {
                    let diff = x - mid;
                    diff * diff
                })
                .sum::<f64>()
                / period as f64;
            let std_dev = variance.sqrt();

            upper.push(Some(mid + num_std * std_dev));
            lower.push(Some(mid - num_std * std_dev));
        } else {
            upper.push(None);
            lower.push(None);
        }
    }

    (upper, middle, lower)
}

/// Calculate RSI (Relative Strength Index)
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut gains = Vec::with_capacity(values.len());
    let mut losses = Vec::with_capacity(values.len());

    gains.push(0.0);
    losses.push(0.0);

    for i in 1..values.len() {
        let change = values[i] - values[i - 1];
        gains.push(if change > 0.0 { change } else { 0.0 });
        losses.push(if change < 0.0 { -change } else { 0.0 });
    }

    let avg_gains = ema(&gains, period);
    let avg_losses = ema(&losses, period);

    let mut rsi_values = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if let (Some(avg_gain), Some(avg_loss)) = (avg_gains[i], avg_losses[i]) {
            if avg_loss == 0.0 {
                rsi_values.push(Some(100.0));
            } else {
                let rs = avg_gain / avg_loss;
                rsi_values.push(Some(100.0 - (100.0 / (1.0 + rs))));
            }
        } else {
            rsi_values.push(None);
        }
    }

    rsi_values
}

/// Simple moving average over series closes, as a pluggable indicator.
pub struct Sma {
    period: usize,
    name: String,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            name: format!("sma_{period}"),
        }
    }
}

impl Indicator for Sma {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute(&self, series: &TimeSeries) -> Vec<Option<f64>> {
        sma(&series.close_prices(), self.period)
    }
}

/// Exponential moving average over series closes, as a pluggable indicator.
pub struct Ema {
    period: usize,
    name: String,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            name: format!("ema_{period}"),
        }
    }
}

impl Indicator for Ema {
    fn name(&self) -> &str {
        &self.name
    }

    fn compute(&self, series: &TimeSeries) -> Vec<Option<f64>> {
        ema(&series.close_prices(), self.period)
    }
}
