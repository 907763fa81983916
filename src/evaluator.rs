//! Parameter evaluation framework
//!
//! Parallel grid sweeps and walk-forward optimization over the backtest
//! engine. Every task owns its strategy, engine, and portfolio; the only
//! shared state is the read-only market-data cache warmed before submission.

use chrono::{DateTime, Duration, Utc};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::data::{DataError, MarketDataService};
use crate::engine::{BacktestEngine, BacktestResults, EngineError};
use crate::risk::{RiskAnalyzer, RiskMetrics};
use crate::strategy::{ParamSet, Strategy, StrategyError};
use crate::{Symbol, Trade};

/// Errors surfaced by the evaluator. Any failing task aborts the whole
/// sweep; partial results are discarded.
#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error("failed to build worker pool: {0}")]
    Pool(String),

    #[error("evaluator has been shut down")]
    ShutDown,

    #[error("task cancelled after another task failed")]
    Cancelled,

    #[error("no parameter sets to evaluate")]
    EmptySweep,

    #[error("walk-forward windows must have positive train and test lengths")]
    InvalidWindow,
}

/// Outcome of one parameter set's backtest.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub params: ParamSet,
    pub results: BacktestResults,
    pub metrics: RiskMetrics,
}

/// One train/test window of a walk-forward pass.
#[derive(Debug, Clone)]
pub struct WalkForwardWindow {
    pub train_start: DateTime<Utc>,
    pub train_end: DateTime<Utc>,
    pub test_start: DateTime<Utc>,
    pub test_end: DateTime<Utc>,
    /// Parameter set that won the training sweep
    pub params: ParamSet,
    /// Results of the test leg run with those parameters
    pub results: BacktestResults,
}

/// Aggregate of a walk-forward optimization.
#[derive(Debug, Clone)]
pub struct WalkForwardReport {
    pub windows: Vec<WalkForwardWindow>,
    /// Concatenated test-leg trades in window order
    pub trades: Vec<Trade>,
    /// Metrics over the concatenated test trades
    pub metrics: RiskMetrics,
    /// Per-parameter most frequently selected value (ties: first seen)
    pub best_parameters: ParamSet,
}

/// Shared knobs for one evaluation campaign.
#[derive(Debug, Clone)]
pub struct EvaluationSpec {
    pub symbol: Symbol,
    pub initial_capital: f64,
    pub commission_rate: f64,
    pub slippage: f64,
}

/// Runs independent backtests across a worker pool.
///
/// The pool is sized `max(1, cores - 1)` and owned by the evaluator; it is
/// released on `shutdown` or drop. Task timeouts are the caller's concern
/// and unbounded by default.
pub struct StrategyEvaluator {
    data_service: Arc<MarketDataService>,
    pool: Option<rayon::ThreadPool>,
    analyzer: RiskAnalyzer,
}

impl StrategyEvaluator {
    pub fn new(data_service: Arc<MarketDataService>) -> Result<Self, EvaluatorError> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers = cores.saturating_sub(1).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| EvaluatorError::Pool(e.to_string()))?;

        info!(workers, "evaluator worker pool ready");
        Ok(Self {
            data_service,
            pool: Some(pool),
            analyzer: RiskAnalyzer::default(),
        })
    }

    pub fn with_analyzer(mut self, analyzer: RiskAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Release the worker pool. Subsequent sweeps fail with `ShutDown`.
    pub fn shutdown(&mut self) {
        if self.pool.take().is_some() {
            info!("evaluator worker pool released");
        }
    }

    /// Run one backtest per parameter set in parallel and rank the outcomes
    /// by total return, best first.
    ///
    /// The first failing task cancels the remaining ones and its error is
    /// surfaced; no partial results are returned.
    pub fn evaluate_parameters<F>(
        &self,
        factory: &F,
        param_sets: &[ParamSet],
        spec: &EvaluationSpec,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<EvaluationResult>, EvaluatorError>
    where
        F: Fn(&ParamSet) -> Result<Box<dyn Strategy>, StrategyError> + Sync,
    {
        let pool = self.pool.as_ref().ok_or(EvaluatorError::ShutDown)?;
        if param_sets.is_empty() {
            return Err(EvaluatorError::EmptySweep);
        }

        // Warm the shared cache once so tasks only take the read path
        self.data_service.get(&spec.symbol, start, end)?;

        info!(
            combinations = param_sets.len(),
            symbol = %spec.symbol,
            "evaluating parameter sets"
        );

        let cancelled = Arc::new(AtomicBool::new(false));
        let mut results: Vec<EvaluationResult> = pool.install(|| {
            param_sets
                .par_iter()
                .map(|params| {
                    if cancelled.load(Ordering::Relaxed) {
                        return Err(EvaluatorError::Cancelled);
                    }
                    self.run_single(factory, params, spec, start, end)
                        .map_err(|err| {
                            warn!(%err, "parameter sweep task failed");
                            cancelled.store(true, Ordering::Relaxed);
                            err
                        })
                })
                .collect::<Result<Vec<_>, _>>()
        })?;

        results.sort_by_key(|r| std::cmp::Reverse(OrderedFloat(r.metrics.total_return)));
        Ok(results)
    }

    /// Rolling train/test evaluation.
    ///
    /// `[start, end]` is split into consecutive non-overlapping windows of
    /// `train_days + test_days` days; a trailing partial window is
    /// discarded. Each window sweeps parameters on its training leg, then
    /// replays the winner on the test leg. Test-leg trades concatenate into
    /// the aggregate metrics.
    #[allow(clippy::too_many_arguments)]
    pub fn walk_forward_optimization<F>(
        &self,
        factory: &F,
        param_sets: &[ParamSet],
        spec: &EvaluationSpec,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        train_days: i64,
        test_days: i64,
    ) -> Result<WalkForwardReport, EvaluatorError>
    where
        F: Fn(&ParamSet) -> Result<Box<dyn Strategy>, StrategyError> + Sync,
    {
        if self.pool.is_none() {
            return Err(EvaluatorError::ShutDown);
        }
        if train_days <= 0 || test_days <= 0 {
            return Err(EvaluatorError::InvalidWindow);
        }

        let mut windows = Vec::new();
        let mut trades = Vec::new();
        // Per parameter: selected values with usage counts, first-seen order
        let mut usage: HashMap<String, Vec<(crate::ParamValue, usize)>> = HashMap::new();

        let span = Duration::days(train_days + test_days);
        let mut window_start = start;

        while window_start + span - Duration::days(1) <= end {
            let train_start = window_start;
            let train_end = window_start + Duration::days(train_days - 1);
            let test_start = window_start + Duration::days(train_days);
            let test_end = window_start + span - Duration::days(1);

            let ranked =
                self.evaluate_parameters(factory, param_sets, spec, train_start, train_end)?;
            let winner = ranked.into_iter().next().ok_or(EvaluatorError::EmptySweep)?;

            info!(
                %train_start,
                %test_start,
                params = %format_params(&winner.params),
                "walk-forward window trained"
            );

            for (name, value) in &winner.params {
                let values = usage.entry(name.clone()).or_default();
                match values.iter_mut().find(|(v, _)| v == value) {
                    Some((_, count)) => *count += 1,
                    None => values.push((value.clone(), 1)),
                }
            }

            let strategy = factory(&winner.params)?;
            let mut engine =
                BacktestEngine::new(Arc::clone(&self.data_service), spec.initial_capital);
            engine.set_commission_rate(spec.commission_rate);
            engine.set_slippage(spec.slippage);
            engine.add_strategy(strategy);
            let results = engine.run(test_start, test_end)?;

            trades.extend(results.trades.iter().cloned());
            windows.push(WalkForwardWindow {
                train_start,
                train_end,
                test_start,
                test_end,
                params: winner.params,
                results,
            });

            window_start = window_start + span;
        }

        // Most-used value per parameter; first seen wins ties
        let best_parameters: ParamSet = usage
            .into_iter()
            .filter_map(|(name, values)| {
                values
                    .into_iter()
                    .reduce(|best, candidate| if candidate.1 > best.1 { candidate } else { best })
                    .map(|(value, _)| (name, value))
            })
            .collect();

        let metrics = self.analyzer.analyze(&trades, spec.initial_capital);

        Ok(WalkForwardReport {
            windows,
            trades,
            metrics,
            best_parameters,
        })
    }

    fn run_single<F>(
        &self,
        factory: &F,
        params: &ParamSet,
        spec: &EvaluationSpec,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<EvaluationResult, EvaluatorError>
    where
        F: Fn(&ParamSet) -> Result<Box<dyn Strategy>, StrategyError> + Sync,
    {
        let strategy = factory(params)?;
        let mut engine = BacktestEngine::new(Arc::clone(&self.data_service), spec.initial_capital);
        engine.set_commission_rate(spec.commission_rate);
        engine.set_slippage(spec.slippage);
        engine.add_strategy(strategy);

        let results = engine.run(start, end)?;
        let metrics = self.analyzer.analyze(&results.trades, spec.initial_capital);

        Ok(EvaluationResult {
            params: params.clone(),
            results,
            metrics,
        })
    }
}

impl Drop for StrategyEvaluator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn format_params(params: &ParamSet) -> String {
    let mut items: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    items.sort();
    items.join(", ")
}
