//! Trading strategy framework
//!
//! Defines the Strategy trait the engine drives and the typed parameter
//! values exchanged at the optimizer boundary. Strategies never mutate the
//! portfolio directly; every effect flows through the orders they return.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::{Bar, Order, Portfolio, Symbol, TimeSeries};

/// Errors raised from strategy callbacks. The engine treats these as fatal
/// and aborts the run at the offending timestamp.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("parameter '{name}' rejected value {value}: {reason}")]
    InvalidParameter {
        name: String,
        value: ParamValue,
        reason: String,
    },

    #[error("{0}")]
    Failed(String),
}

/// Narrow runtime-reflected parameter value.
///
/// Strategies keep typed configuration structs; this enum is only the
/// interchange form used by `parameters`/`set_parameter` and the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl ParamValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<usize> for ParamValue {
    fn from(v: usize) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// A set of named parameter values, as swept by the evaluator.
pub type ParamSet = HashMap<String, ParamValue>;

/// Trading strategy contract driven by the backtest engine.
///
/// Implementations must be deterministic functions of their declared inputs
/// and internal state.
pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// Symbols this strategy needs bars for.
    fn required_symbols(&self) -> Vec<Symbol>;

    /// Called once before the event loop with the fetched history.
    fn initialize(&mut self, data: &HashMap<Symbol, TimeSeries>) -> Result<(), StrategyError>;

    /// Called at every timeline tick before order generation.
    fn on_bar(
        &mut self,
        timestamp: DateTime<Utc>,
        current_bars: &HashMap<Symbol, Bar>,
        portfolio: &Portfolio,
    ) -> Result<(), StrategyError>;

    /// Orders to submit at this tick, executed in the order returned.
    fn generate_orders(
        &mut self,
        timestamp: DateTime<Utc>,
        current_bars: &HashMap<Symbol, Bar>,
        portfolio: &Portfolio,
    ) -> Result<Vec<Order>, StrategyError>;

    /// Reflected view of the current configuration.
    fn parameters(&self) -> ParamSet;

    /// Apply one reflected parameter. Unknown names and out-of-domain
    /// values are errors.
    fn set_parameter(&mut self, name: &str, value: ParamValue) -> Result<(), StrategyError>;
}
