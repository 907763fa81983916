//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files for simulation
//! runs. Defaults mirror the engine's built-in conventions.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::data::{CsvDataLoader, MarketDataService, DEFAULT_TIMESTAMP_FORMAT};
use crate::engine::{BacktestEngine, DEFAULT_COMMISSION_RATE, DEFAULT_SLIPPAGE};
use crate::risk::{RiskAnalyzer, DEFAULT_PERIODS_PER_YEAR, DEFAULT_RISK_FREE_RATE};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub data: DataConfig,
}

impl SimulationConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: SimulationConfig =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        Ok(config)
    }

    /// CSV loader over the configured data directory.
    pub fn build_loader(&self) -> CsvDataLoader {
        CsvDataLoader::new(&self.data.data_dir)
            .with_timestamp_format(self.data.timestamp_format.clone())
    }

    /// Risk analyzer with the configured annualization settings.
    pub fn build_analyzer(&self) -> RiskAnalyzer {
        RiskAnalyzer::new(self.risk.periods_per_year, self.risk.risk_free_rate)
    }

    /// Engine wired to this configuration, with the analyzer attached.
    pub fn build_engine(&self, service: Arc<MarketDataService>) -> BacktestEngine {
        let mut engine = BacktestEngine::new(service, self.trading.initial_capital);
        engine.set_commission_rate(self.execution.commission_rate);
        engine.set_slippage(self.execution.slippage);
        engine.set_allow_short(self.trading.allow_short);
        engine.attach_risk_analyzer(self.build_analyzer());
        engine
    }
}

/// Trading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    pub initial_capital: f64,
    /// Internal hook for enabling short selling; off by default
    #[serde(default)]
    pub allow_short: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        TradingConfig {
            initial_capital: 100_000.0,
            allow_short: false,
        }
    }
}

/// Execution model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Proportional commission charged on filled notional
    pub commission_rate: f64,
    /// Multiplicative adverse fill-price adjustment
    pub slippage: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            commission_rate: DEFAULT_COMMISSION_RATE,
            slippage: DEFAULT_SLIPPAGE,
        }
    }
}

/// Statistics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub periods_per_year: f64,
    pub risk_free_rate: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            periods_per_year: DEFAULT_PERIODS_PER_YEAR,
            risk_free_rate: DEFAULT_RISK_FREE_RATE,
        }
    }
}

/// Data layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub data_dir: String,
    pub timestamp_format: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            data_dir: "data".to_string(),
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
        }
    }
}
