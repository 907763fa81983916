//! Core data types used across the simulation engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for bar data
#[derive(Debug, Error)]
pub enum BarValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV observation at a single timestamp.
///
/// Bars are write-once; equality and hashing are keyed by `timestamp` so a
/// bar identifies one tick of one series regardless of later price revisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Create a new bar with validation
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, BarValidationError> {
        let bar = Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        };
        bar.validate()?;
        Ok(bar)
    }

    /// Create a bar without validation (for trusted sources or when validation is done separately)
    pub fn new_unchecked(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Validate the bar data
    pub fn validate(&self) -> Result<(), BarValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(BarValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(BarValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(BarValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(BarValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(BarValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    /// Check if the bar is valid without returning detailed error
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

impl PartialEq for Bar {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
    }
}

impl Eq for Bar {}

impl std::hash::Hash for Bar {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.timestamp.hash(state);
    }
}

/// Instrument symbol using Arc<str> for cheap cloning
///
/// Symbols are frequently cloned when passed to strategies, orders, and
/// positions. Using Arc<str> instead of String reduces heap allocations from
/// O(n) to O(1) per clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

/// Custom serde for Arc<str>
mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

/// Closed round-trip trade record.
///
/// Materialized at the moment a position closes and immutable thereafter;
/// the unit of P&L attribution for the statistics pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: Symbol,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub entry_quantity: f64,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_quantity: f64,
    /// Commission paid across both legs of the round trip
    pub commission_total: f64,
    /// Net profit after commissions
    pub profit: f64,
    /// Net profit as a percentage of the entry notional
    pub profit_pct: f64,
    pub is_long: bool,
    /// Portfolio total value immediately after the closing fill
    pub capital_after_trade: f64,
    pub stop_loss_hit: bool,
    pub take_profit_hit: bool,
}

impl Trade {
    pub fn is_winner(&self) -> bool {
        self.profit > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_bar_validation_accepts_well_formed() {
        let bar = Bar::new(ts(0), 100.0, 105.0, 95.0, 102.0, 1000.0);
        assert!(bar.is_ok());
    }

    #[test]
    fn test_bar_validation_rejects_inverted_range() {
        let bar = Bar::new(ts(0), 100.0, 90.0, 95.0, 92.0, 1000.0);
        assert!(matches!(
            bar,
            Err(BarValidationError::HighLessThanLow { .. })
        ));
    }

    #[test]
    fn test_bar_validation_rejects_open_outside_range() {
        let bar = Bar::new(ts(0), 110.0, 105.0, 95.0, 102.0, 1000.0);
        assert!(matches!(bar, Err(BarValidationError::OpenOutOfRange { .. })));
    }

    #[test]
    fn test_bar_validation_rejects_negative_volume() {
        let bar = Bar::new(ts(0), 100.0, 105.0, 95.0, 102.0, -1.0);
        assert!(matches!(bar, Err(BarValidationError::NegativeVolume(_))));
    }

    #[test]
    fn test_bar_equality_is_by_timestamp() {
        let a = Bar::new_unchecked(ts(60), 100.0, 105.0, 95.0, 102.0, 1000.0);
        let b = Bar::new_unchecked(ts(60), 200.0, 205.0, 195.0, 202.0, 0.0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_symbol_roundtrip_serde() {
        let symbol = Symbol::new("ACME");
        let json = serde_json::to_string(&symbol).unwrap();
        let parsed: Symbol = serde_json::from_str(&json).unwrap();
        assert_eq!(symbol, parsed);
    }
}
