//! Timestamp-indexed bar series
//!
//! Ordered OHLCV sequence for a single symbol with O(log n) timestamp lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Bar, Symbol};

/// Ordered sequence of bars for one symbol.
///
/// Bars are kept sorted by timestamp. Adding a bar whose timestamp already
/// exists overwrites the stored bar (last write wins); out-of-order adds are
/// inserted at their chronological slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    symbol: Symbol,
    bars: Vec<Bar>,
}

impl TimeSeries {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            bars: Vec::new(),
        }
    }

    pub fn with_bars(symbol: Symbol, mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|b| b.timestamp);
        bars.dedup_by(|next, prev| {
            // Last write wins on duplicate timestamps
            if next.timestamp == prev.timestamp {
                *prev = next.clone();
                true
            } else {
                false
            }
        });
        Self { symbol, bars }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Add a bar, preserving ascending timestamps.
    pub fn add(&mut self, bar: Bar) {
        match self
            .bars
            .binary_search_by_key(&bar.timestamp, |b| b.timestamp)
        {
            Ok(i) => self.bars[i] = bar,
            Err(i) => self.bars.insert(i, bar),
        }
    }

    pub fn get(&self, index: usize) -> Option<&Bar> {
        self.bars.get(index)
    }

    /// O(log n) lookup by timestamp.
    pub fn get_at(&self, timestamp: DateTime<Utc>) -> Option<&Bar> {
        self.bars
            .binary_search_by_key(&timestamp, |b| b.timestamp)
            .ok()
            .map(|i| &self.bars[i])
    }

    pub fn first(&self) -> Option<&Bar> {
        self.bars.first()
    }

    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    /// Chronological iteration.
    pub fn iter(&self) -> std::slice::Iter<'_, Bar> {
        self.bars.iter()
    }

    pub fn close_prices(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    /// Close prices of the most recent `last_n` bars (all of them if fewer).
    pub fn close_prices_last(&self, last_n: usize) -> Vec<f64> {
        let start = self.bars.len().saturating_sub(last_n);
        self.bars[start..].iter().map(|b| b.close).collect()
    }

    /// Sub-series over `[start, end]`, inclusive on both endpoints.
    pub fn sub_series(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> TimeSeries {
        let lo = self.bars.partition_point(|b| b.timestamp < start);
        let hi = self.bars.partition_point(|b| b.timestamp <= end);
        TimeSeries {
            symbol: self.symbol.clone(),
            bars: self.bars[lo..hi].to_vec(),
        }
    }

    /// Timestamps of all bars, ascending.
    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.bars.iter().map(|b| b.timestamp)
    }

    /// Whether the stored bars cover the inclusive range `[start, end]`.
    pub fn spans(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        match (self.first(), self.last()) {
            (Some(f), Some(l)) => f.timestamp <= start && l.timestamp >= end,
            _ => false,
        }
    }
}

impl<'a> IntoIterator for &'a TimeSeries {
    type Item = &'a Bar;
    type IntoIter = std::slice::Iter<'a, Bar>;

    fn into_iter(self) -> Self::IntoIter {
        self.bars.iter()
    }
}
