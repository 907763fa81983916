//! Market data loading and caching
//!
//! Defines the loader contract, a CSV-backed loader, and the per-symbol
//! cache that fronts loaders for the engine and the evaluator.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{info, warn};

use crate::{Bar, Symbol, TimeSeries};

/// Default timestamp format for file-backed data
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Data-layer errors. All of these are fatal and surface before the event
/// loop starts.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("no data file for symbol {symbol} at {path}")]
    MissingSymbol { symbol: Symbol, path: PathBuf },

    #[error("failed to parse {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("missing required column '{column}' in {path}")]
    MissingColumn { column: String, path: PathBuf },

    #[error("no bars for {symbol} in the requested range")]
    EmptyRange { symbol: Symbol },
}

/// Contract for anything that can produce a bar series for a symbol over an
/// inclusive time range.
pub trait MarketDataLoader: Send + Sync {
    fn load(
        &self,
        symbol: &Symbol,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TimeSeries, DataError>;
}

/// Loads `{symbol}.csv` files from a data directory.
///
/// Expected layout: a header row naming at least `datetime`, `open`, `high`,
/// `low`, `close` (matched case-insensitively, extra columns ignored) and an
/// optional `volume` defaulting to 0. Malformed rows are skipped with a
/// diagnostic rather than aborting the load.
pub struct CsvDataLoader {
    data_dir: PathBuf,
    timestamp_format: String,
}

impl CsvDataLoader {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
        }
    }

    pub fn with_timestamp_format(mut self, format: impl Into<String>) -> Self {
        self.timestamp_format = format.into();
        self
    }

    fn parse_timestamp(&self, raw: &str) -> Option<DateTime<Utc>> {
        raw.parse::<DateTime<Utc>>().ok().or_else(|| {
            NaiveDateTime::parse_from_str(raw, &self.timestamp_format)
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
                .ok()
        })
    }
}

impl MarketDataLoader for CsvDataLoader {
    fn load(
        &self,
        symbol: &Symbol,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TimeSeries, DataError> {
        let path = self.data_dir.join(format!("{}.csv", symbol.as_str()));
        if !path.exists() {
            return Err(DataError::MissingSymbol {
                symbol: symbol.clone(),
                path,
            });
        }

        let mut reader = csv::Reader::from_path(&path).map_err(|source| DataError::Csv {
            path: path.clone(),
            source,
        })?;

        let headers = reader
            .headers()
            .map_err(|source| DataError::Csv {
                path: path.clone(),
                source,
            })?
            .clone();
        let column = |name: &str| -> Option<usize> {
            headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name))
        };
        let require = |name: &str| -> Result<usize, DataError> {
            column(name).ok_or_else(|| DataError::MissingColumn {
                column: name.to_string(),
                path: path.clone(),
            })
        };

        let col_datetime = require("datetime")?;
        let col_open = require("open")?;
        let col_high = require("high")?;
        let col_low = require("low")?;
        let col_close = require("close")?;
        let col_volume = column("volume");

        let mut series = TimeSeries::new(symbol.clone());
        let mut skipped = 0usize;

        for (row_idx, record) in reader.records().enumerate() {
            let record = match record {
                Ok(r) => r,
                Err(err) => {
                    warn!(path = %path.display(), row = row_idx + 1, %err, "skipping unreadable row");
                    skipped += 1;
                    continue;
                }
            };

            let parsed = (|| {
                let timestamp = self.parse_timestamp(record.get(col_datetime)?.trim())?;
                let open: f64 = record.get(col_open)?.trim().parse().ok()?;
                let high: f64 = record.get(col_high)?.trim().parse().ok()?;
                let low: f64 = record.get(col_low)?.trim().parse().ok()?;
                let close: f64 = record.get(col_close)?.trim().parse().ok()?;
                let volume: f64 = match col_volume {
                    Some(i) => record.get(i)?.trim().parse().unwrap_or(0.0),
                    None => 0.0,
                };
                Bar::new(timestamp, open, high, low, close, volume).ok()
            })();

            match parsed {
                Some(bar) => {
                    if bar.timestamp >= start && bar.timestamp <= end {
                        series.add(bar);
                    }
                }
                None => {
                    warn!(path = %path.display(), row = row_idx + 1, "skipping malformed row");
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            warn!(path = %path.display(), skipped, "rows skipped during load");
        }
        if series.is_empty() {
            return Err(DataError::EmptyRange {
                symbol: symbol.clone(),
            });
        }

        info!(%symbol, bars = series.len(), "loaded series");
        Ok(series)
    }
}

struct CachedRange {
    series: TimeSeries,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Per-symbol cache in front of a loader.
///
/// Safe for concurrent readers; cache fills serialize on the write lock.
pub struct MarketDataService {
    loader: Box<dyn MarketDataLoader>,
    cache: RwLock<HashMap<Symbol, CachedRange>>,
}

impl MarketDataService {
    pub fn new(loader: Box<dyn MarketDataLoader>) -> Self {
        Self {
            loader,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch bars for `[start, end]`, serving from cache when the cached
    /// range covers the request.
    pub fn get(
        &self,
        symbol: &Symbol,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TimeSeries, DataError> {
        {
            let cache = self.cache.read().expect("market data cache poisoned");
            if let Some(cached) = cache.get(symbol) {
                if cached.start <= start && cached.end >= end {
                    return Ok(cached.series.sub_series(start, end));
                }
            }
        }

        let series = self.loader.load(symbol, start, end)?;
        let filtered = series.sub_series(start, end);
        if filtered.is_empty() {
            return Err(DataError::EmptyRange {
                symbol: symbol.clone(),
            });
        }

        let mut cache = self.cache.write().expect("market data cache poisoned");
        cache.insert(
            symbol.clone(),
            CachedRange {
                series,
                start,
                end,
            },
        );
        Ok(filtered)
    }

    pub fn evict(&self, symbol: &Symbol) {
        self.cache
            .write()
            .expect("market data cache poisoned")
            .remove(symbol);
    }

    pub fn clear(&self) {
        self.cache
            .write()
            .expect("market data cache poisoned")
            .clear();
    }
}

/// In-memory loader for tests and synthetic runs: serves pre-built series.
pub struct StaticDataLoader {
    series: HashMap<Symbol, TimeSeries>,
}

impl StaticDataLoader {
    pub fn new(series: impl IntoIterator<Item = TimeSeries>) -> Self {
        Self {
            series: series
                .into_iter()
                .map(|s| (s.symbol().clone(), s))
                .collect(),
        }
    }
}

impl MarketDataLoader for StaticDataLoader {
    fn load(
        &self,
        symbol: &Symbol,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TimeSeries, DataError> {
        let series = self
            .series
            .get(symbol)
            .ok_or_else(|| DataError::MissingSymbol {
                symbol: symbol.clone(),
                path: PathBuf::new(),
            })?;
        let filtered = series.sub_series(start, end);
        if filtered.is_empty() {
            return Err(DataError::EmptyRange {
                symbol: symbol.clone(),
            });
        }
        Ok(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn day(n: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, n, 0, 0, 0).unwrap()
    }

    fn write_csv(dir: &Path, name: &str, contents: &str) {
        let mut file = std::fs::File::create(dir.join(name)).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("market-replay-test-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_csv_loader_parses_headers_case_insensitively() {
        let dir = temp_dir("headers");
        write_csv(
            &dir,
            "ACME.csv",
            "DateTime,Open,High,Low,Close,Volume,Extra\n\
             2024-01-01 00:00:00,100,105,95,102,1000,x\n\
             2024-01-02 00:00:00,102,106,101,104,1100,y\n",
        );

        let loader = CsvDataLoader::new(&dir);
        let series = loader.load(&Symbol::new("ACME"), day(1), day(2)).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.first().unwrap().open, 100.0);
    }

    #[test]
    fn test_csv_loader_defaults_missing_volume() {
        let dir = temp_dir("novol");
        write_csv(
            &dir,
            "ACME.csv",
            "datetime,open,high,low,close\n2024-01-01 00:00:00,100,105,95,102\n",
        );

        let loader = CsvDataLoader::new(&dir);
        let series = loader.load(&Symbol::new("ACME"), day(1), day(1)).unwrap();
        assert_eq!(series.first().unwrap().volume, 0.0);
    }

    #[test]
    fn test_csv_loader_skips_malformed_rows() {
        let dir = temp_dir("malformed");
        write_csv(
            &dir,
            "ACME.csv",
            "datetime,open,high,low,close,volume\n\
             2024-01-01 00:00:00,100,105,95,102,1000\n\
             not-a-date,1,2,3,4,5\n\
             2024-01-02 00:00:00,102,abc,101,104,1100\n\
             2024-01-03 00:00:00,104,108,103,107,1200\n",
        );

        let loader = CsvDataLoader::new(&dir);
        let series = loader.load(&Symbol::new("ACME"), day(1), day(3)).unwrap();
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn test_csv_loader_missing_symbol_is_fatal() {
        let dir = temp_dir("missing");
        let loader = CsvDataLoader::new(&dir);
        let result = loader.load(&Symbol::new("NOPE"), day(1), day(2));
        assert!(matches!(result, Err(DataError::MissingSymbol { .. })));
    }

    #[test]
    fn test_csv_loader_missing_required_column_is_fatal() {
        let dir = temp_dir("nocol");
        write_csv(&dir, "ACME.csv", "datetime,open,high,low\n");
        let loader = CsvDataLoader::new(&dir);
        let result = loader.load(&Symbol::new("ACME"), day(1), day(2));
        assert!(matches!(result, Err(DataError::MissingColumn { .. })));
    }

    fn synthetic_series(symbol: &str, n: i64) -> TimeSeries {
        let mut series = TimeSeries::new(Symbol::new(symbol));
        for i in 0..n {
            series.add(Bar::new_unchecked(
                ts(i * 86_400),
                100.0 + i as f64,
                101.0 + i as f64,
                99.0 + i as f64,
                100.5 + i as f64,
                1_000.0,
            ));
        }
        series
    }

    #[test]
    fn test_service_serves_covered_range_from_cache() {
        let service =
            MarketDataService::new(Box::new(StaticDataLoader::new([synthetic_series("ACME", 10)])));

        let wide = service
            .get(&Symbol::new("ACME"), ts(0), ts(9 * 86_400))
            .unwrap();
        assert_eq!(wide.len(), 10);

        // Narrower request is answered by filtering the cached series
        let narrow = service
            .get(&Symbol::new("ACME"), ts(2 * 86_400), ts(4 * 86_400))
            .unwrap();
        assert_eq!(narrow.len(), 3);
    }

    #[test]
    fn test_service_range_filter_is_inclusive() {
        let service =
            MarketDataService::new(Box::new(StaticDataLoader::new([synthetic_series("ACME", 5)])));

        let series = service
            .get(&Symbol::new("ACME"), ts(86_400), ts(3 * 86_400))
            .unwrap();
        assert_eq!(series.first().unwrap().timestamp, ts(86_400));
        assert_eq!(series.last().unwrap().timestamp, ts(3 * 86_400));
    }

    #[test]
    fn test_service_evict_and_clear() {
        let service =
            MarketDataService::new(Box::new(StaticDataLoader::new([synthetic_series("ACME", 5)])));
        service
            .get(&Symbol::new("ACME"), ts(0), ts(4 * 86_400))
            .unwrap();
        service.evict(&Symbol::new("ACME"));
        service.clear();

        // Still served (reloaded through the loader)
        let series = service.get(&Symbol::new("ACME"), ts(0), ts(86_400)).unwrap();
        assert_eq!(series.len(), 2);
    }
}
