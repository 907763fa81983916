//! Integration tests for the market replay engine
//!
//! These tests drive the public API end to end: data service, engine event
//! loop, execution model, trade ledger, and the statistics pipeline.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use market_replay::data::StaticDataLoader;
use market_replay::risk::{equity_curve, max_drawdown_pct};
use market_replay::strategies::{SmaCrossConfig, SmaCrossStrategy};
use market_replay::{
    Bar, BacktestEngine, CsvDataLoader, MarketDataService, Order, ParamSet, Portfolio,
    RiskAnalyzer, SimulationConfig, Strategy, StrategyError, Symbol, TimeSeries,
};

// =============================================================================
// Test Utilities
// =============================================================================

/// Route engine logs through the test harness; honors RUST_LOG.
fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .try_init();
}

fn day(n: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(n as i64)
}

/// Bars with chosen opens; high/low straddle the open by `spread`.
fn series_from_opens(symbol: &str, opens: &[f64], spread: f64) -> TimeSeries {
    let mut series = TimeSeries::new(Symbol::new(symbol));
    for (i, &open) in opens.iter().enumerate() {
        series.add(Bar::new_unchecked(
            day(i as u32),
            open,
            open + spread,
            open - spread,
            open,
            1_000.0,
        ));
    }
    series
}

/// Flat tape at a constant price.
fn flat_series(symbol: &str, days: usize, price: f64) -> TimeSeries {
    series_from_opens(symbol, &vec![price; days], 1.0)
}

fn service_for(series: TimeSeries) -> Arc<MarketDataService> {
    Arc::new(MarketDataService::new(Box::new(StaticDataLoader::new([
        series,
    ]))))
}

#[derive(Clone)]
enum Action {
    Market(f64),
    Limit(f64, f64),
    Stop(f64, f64),
}

/// Issues a fixed script of orders keyed by tick index.
struct Scripted {
    symbol: Symbol,
    script: Vec<(usize, Action)>,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
    tick: usize,
}

impl Scripted {
    fn new(symbol: &str, script: Vec<(usize, Action)>) -> Self {
        Self {
            symbol: Symbol::new(symbol),
            script,
            stop_loss: None,
            take_profit: None,
            tick: 0,
        }
    }

    fn with_stop_loss(mut self, price: f64) -> Self {
        self.stop_loss = Some(price);
        self
    }

    fn with_take_profit(mut self, price: f64) -> Self {
        self.take_profit = Some(price);
        self
    }
}

impl Strategy for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn required_symbols(&self) -> Vec<Symbol> {
        vec![self.symbol.clone()]
    }

    fn initialize(&mut self, _data: &HashMap<Symbol, TimeSeries>) -> Result<(), StrategyError> {
        self.tick = 0;
        Ok(())
    }

    fn on_bar(
        &mut self,
        _timestamp: DateTime<Utc>,
        _current_bars: &HashMap<Symbol, Bar>,
        _portfolio: &Portfolio,
    ) -> Result<(), StrategyError> {
        Ok(())
    }

    fn generate_orders(
        &mut self,
        timestamp: DateTime<Utc>,
        _current_bars: &HashMap<Symbol, Bar>,
        _portfolio: &Portfolio,
    ) -> Result<Vec<Order>, StrategyError> {
        let tick = self.tick;
        self.tick += 1;

        let mut orders = Vec::new();
        for (_, action) in self.script.iter().filter(|(at, _)| *at == tick) {
            let mut order = match *action {
                Action::Market(qty) => Order::market(self.symbol.clone(), qty, timestamp),
                Action::Limit(qty, price) => {
                    Order::limit(self.symbol.clone(), qty, price, timestamp)
                }
                Action::Stop(qty, price) => Order::stop(self.symbol.clone(), qty, price, timestamp),
            }
            .map_err(|e| StrategyError::Failed(e.to_string()))?;

            if order.is_buy() {
                if let Some(sl) = self.stop_loss {
                    order = order.with_stop_loss(sl);
                }
                if let Some(tp) = self.take_profit {
                    order = order.with_take_profit(tp);
                }
            }
            orders.push(order);
        }
        Ok(orders)
    }

    fn parameters(&self) -> ParamSet {
        ParamSet::new()
    }

    fn set_parameter(
        &mut self,
        name: &str,
        _value: market_replay::ParamValue,
    ) -> Result<(), StrategyError> {
        Err(StrategyError::UnknownParameter(name.to_string()))
    }
}

/// Registers interest in a symbol but never trades.
struct Idle(Symbol);

impl Strategy for Idle {
    fn name(&self) -> &str {
        "idle"
    }
    fn required_symbols(&self) -> Vec<Symbol> {
        vec![self.0.clone()]
    }
    fn initialize(&mut self, _data: &HashMap<Symbol, TimeSeries>) -> Result<(), StrategyError> {
        Ok(())
    }
    fn on_bar(
        &mut self,
        _timestamp: DateTime<Utc>,
        _current_bars: &HashMap<Symbol, Bar>,
        _portfolio: &Portfolio,
    ) -> Result<(), StrategyError> {
        Ok(())
    }
    fn generate_orders(
        &mut self,
        _timestamp: DateTime<Utc>,
        _current_bars: &HashMap<Symbol, Bar>,
        _portfolio: &Portfolio,
    ) -> Result<Vec<Order>, StrategyError> {
        Ok(Vec::new())
    }
    fn parameters(&self) -> ParamSet {
        ParamSet::new()
    }
    fn set_parameter(
        &mut self,
        name: &str,
        _value: market_replay::ParamValue,
    ) -> Result<(), StrategyError> {
        Err(StrategyError::UnknownParameter(name.to_string()))
    }
}

fn engine_with(
    series: TimeSeries,
    strategy: Box<dyn Strategy>,
    initial: f64,
    commission: f64,
    slippage: f64,
) -> BacktestEngine {
    let mut engine = BacktestEngine::new(service_for(series), initial);
    engine.set_commission_rate(commission);
    engine.set_slippage(slippage);
    engine.add_strategy(strategy);
    engine
}

fn round_trip_opens() -> Vec<f64> {
    vec![100.0, 101.0, 102.0, 103.0, 104.0, 110.0, 111.0]
}

fn round_trip_script() -> Vec<(usize, Action)> {
    vec![(0, Action::Market(10.0)), (5, Action::Market(-10.0))]
}

// =============================================================================
// Concrete Scenarios
// =============================================================================

#[test]
fn test_no_trade_run_preserves_capital() {
    let series = flat_series("ACME", 30, 100.0);
    let mut engine = engine_with(series, Box::new(Idle(Symbol::new("ACME"))), 10_000.0, 0.001, 0.001);

    let results = engine.run(day(0), day(29)).unwrap();

    assert_eq!(results.total_trades, 0);
    assert_eq!(results.final_capital, 10_000.0);
    assert_eq!(results.max_drawdown, 0.0);
    assert_eq!(results.profit, 0.0);
}

#[test]
fn test_single_long_round_trip() {
    let series = series_from_opens("ACME", &round_trip_opens(), 0.5);
    let mut engine = engine_with(
        series,
        Box::new(Scripted::new("ACME", round_trip_script())),
        10_000.0,
        0.0,
        0.0,
    );

    let results = engine.run(day(0), day(6)).unwrap();

    assert_eq!(results.total_trades, 1);
    assert_eq!(results.winning_trades, 1);
    assert_eq!(results.win_rate, 100.0);
    assert_eq!(results.max_drawdown, 0.0);

    let trade = &results.trades[0];
    assert!(trade.is_long);
    assert!((trade.profit - 100.0).abs() < 1e-9);
    assert!((trade.profit_pct - 10.0).abs() < 1e-9);
    assert!((results.final_capital - 10_100.0).abs() < 1e-9);
}

#[test]
fn test_commission_drag_on_round_trip() {
    let series = series_from_opens("ACME", &round_trip_opens(), 0.5);
    let mut engine = engine_with(
        series,
        Box::new(Scripted::new("ACME", round_trip_script())),
        10_000.0,
        0.01,
        0.0,
    );

    let results = engine.run(day(0), day(6)).unwrap();

    // profit = 100 - 0.01*(10*100 + 10*110) = 79
    assert!((results.trades[0].profit - 79.0).abs() < 1e-9);
}

#[test]
fn test_slippage_drag_on_round_trip() {
    let series = series_from_opens("ACME", &round_trip_opens(), 0.5);
    let mut engine = engine_with(
        series,
        Box::new(Scripted::new("ACME", round_trip_script())),
        10_000.0,
        0.0,
        0.01,
    );

    let results = engine.run(day(0), day(6)).unwrap();

    // Buy fill 101, sell fill 108.9, profit = (108.9 - 101)*10 = 79
    let trade = &results.trades[0];
    assert!((trade.entry_price - 101.0).abs() < 1e-9);
    assert!((trade.exit_price - 108.9).abs() < 1e-9);
    assert!((trade.profit - 79.0).abs() < 1e-9);
}

#[test]
fn test_stop_loss_fires_on_breach() {
    let mut series = TimeSeries::new(Symbol::new("ACME"));
    series.add(Bar::new_unchecked(day(0), 100.0, 101.0, 99.0, 100.0, 0.0));
    series.add(Bar::new_unchecked(day(1), 98.0, 99.0, 94.0, 95.0, 0.0));

    let strategy =
        Scripted::new("ACME", vec![(0, Action::Market(10.0))]).with_stop_loss(95.0);
    let mut engine = engine_with(series, Box::new(strategy), 10_000.0, 0.0, 0.001);

    let results = engine.run(day(0), day(1)).unwrap();

    assert_eq!(results.total_trades, 1);
    let trade = &results.trades[0];
    assert!(trade.stop_loss_hit);
    assert!(!trade.take_profit_hit);
    // Synthesized exit priced at the stop with slippage applied
    assert!((trade.exit_price - 95.0 * 0.999).abs() < 1e-9);
}

#[test]
fn test_stop_loss_wins_tie_against_take_profit() {
    let mut series = TimeSeries::new(Symbol::new("ACME"));
    series.add(Bar::new_unchecked(day(0), 100.0, 101.0, 99.0, 100.0, 0.0));
    // One bar spans both protective levels
    series.add(Bar::new_unchecked(day(1), 100.0, 106.0, 94.0, 100.0, 0.0));

    let strategy = Scripted::new("ACME", vec![(0, Action::Market(10.0))])
        .with_stop_loss(95.0)
        .with_take_profit(105.0);
    let mut engine = engine_with(series, Box::new(strategy), 10_000.0, 0.0, 0.0);

    let results = engine.run(day(0), day(1)).unwrap();

    assert_eq!(results.total_trades, 1);
    assert!(results.trades[0].stop_loss_hit);
    assert!(!results.trades[0].take_profit_hit);
}

// =============================================================================
// Order-Type Semantics
// =============================================================================

#[test]
fn test_limit_buy_semantics() {
    // Bar lows: 99.5, 96.5, ... limit at 97 first reachable on tick 1
    let series = series_from_opens("ACME", &[100.0, 97.0, 98.0, 99.0], 0.5);
    let strategy = Scripted::new(
        "ACME",
        vec![(0, Action::Limit(10.0, 97.0)), (1, Action::Limit(10.0, 97.0))],
    );
    let mut engine = engine_with(series, Box::new(strategy), 10_000.0, 0.0, 0.01);

    engine.run(day(0), day(3)).unwrap();

    let journal = engine.portfolio().transactions();
    // Tick 0 misses (low 99.5 > 97); tick 1 fills at 97*(1+s)
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].timestamp, day(1));
    assert!((journal[0].price - 97.0 * 1.01).abs() < 1e-9);
}

#[test]
fn test_stop_sell_semantics() {
    let series = series_from_opens("ACME", &[100.0, 101.0, 95.0, 96.0], 0.5);
    let strategy = Scripted::new(
        "ACME",
        vec![
            (0, Action::Market(10.0)),
            (1, Action::Stop(-10.0, 96.0)),
            (2, Action::Stop(-10.0, 96.0)),
        ],
    );
    let mut engine = engine_with(series, Box::new(strategy), 10_000.0, 0.0, 0.01);

    let results = engine.run(day(0), day(3)).unwrap();

    // Tick 1 misses (low 100.5 > 96); tick 2 fills at 96*(1-s)
    assert_eq!(results.total_trades, 1);
    assert!((results.trades[0].exit_price - 96.0 * 0.99).abs() < 1e-9);
}

// =============================================================================
// Universal Properties
// =============================================================================

#[test]
fn test_every_fill_is_journaled() {
    let series = series_from_opens("ACME", &round_trip_opens(), 0.5);
    let mut engine = engine_with(
        series,
        Box::new(Scripted::new("ACME", round_trip_script())),
        10_000.0,
        0.001,
        0.0,
    );

    engine.run(day(0), day(6)).unwrap();

    let journal = engine.portfolio().transactions();
    assert_eq!(journal.len(), 2);

    assert_eq!(journal[0].symbol, Symbol::new("ACME"));
    assert_eq!(journal[0].quantity, 10.0);
    assert!((journal[0].price - 100.0).abs() < 1e-9);
    assert!((journal[0].commission - 1.0).abs() < 1e-9);

    assert_eq!(journal[1].quantity, -10.0);
    assert!((journal[1].price - 110.0).abs() < 1e-9);
    assert!((journal[1].commission - 1.1).abs() < 1e-9);
}

#[test]
fn test_total_value_identity_with_open_position() {
    // Entry only; the position stays open to the end of the run
    let series = series_from_opens("ACME", &[100.0, 101.0, 102.0], 0.0);
    let strategy = Scripted::new("ACME", vec![(0, Action::Market(10.0))]);
    let mut engine = engine_with(series, Box::new(strategy), 10_000.0, 0.001, 0.0);

    let results = engine.run(day(0), day(2)).unwrap();

    let portfolio = engine.portfolio();
    let position = portfolio.position(&Symbol::new("ACME")).unwrap();
    let entry_commission: f64 = portfolio.transactions().iter().map(|t| t.commission).sum();

    let expected = 10_000.0 + position.unrealized_pnl() - entry_commission;
    assert!((portfolio.total_value() - expected).abs() < 1e-9);
    assert!((results.final_capital - expected).abs() < 1e-9);
}

#[test]
fn test_equity_curve_steps_by_trade_profit() {
    let opens = [100.0, 110.0, 105.0, 104.0, 95.0, 100.0];
    let series = series_from_opens("ACME", &opens, 0.5);
    let strategy = Scripted::new(
        "ACME",
        vec![
            (0, Action::Market(10.0)),
            (1, Action::Market(-10.0)),
            (2, Action::Market(10.0)),
            (4, Action::Market(-10.0)),
        ],
    );
    let mut engine = engine_with(series, Box::new(strategy), 10_000.0, 0.0, 0.0);

    let results = engine.run(day(0), day(5)).unwrap();
    assert_eq!(results.total_trades, 2);

    let curve = equity_curve(&results.trades, results.initial_capital);
    for (i, trade) in results.trades.iter().enumerate() {
        assert!((curve[i + 1] - curve[i] - trade.profit).abs() < 1e-9);
    }

    let dd = max_drawdown_pct(&curve);
    assert!((0.0..=100.0).contains(&dd));
    assert!(dd > 0.0, "losing second trade must register a drawdown");
}

#[test]
fn test_commission_and_slippage_drag_are_monotonic() {
    let mut finals = Vec::new();
    for (commission, slippage) in [(0.0, 0.0), (0.001, 0.0), (0.01, 0.0), (0.01, 0.01)] {
        let series = series_from_opens("ACME", &round_trip_opens(), 0.5);
        let mut engine = engine_with(
            series,
            Box::new(Scripted::new("ACME", round_trip_script())),
            10_000.0,
            commission,
            slippage,
        );
        finals.push(engine.run(day(0), day(6)).unwrap().final_capital);
    }

    for pair in finals.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-9, "drag must weakly decrease capital");
    }
}

#[test]
fn test_identical_runs_are_byte_identical() {
    let build = || {
        let series = series_from_opens("ACME", &round_trip_opens(), 0.5);
        engine_with(
            series,
            Box::new(Scripted::new("ACME", round_trip_script())),
            10_000.0,
            0.001,
            0.001,
        )
    };

    let a = build().run(day(0), day(6)).unwrap();
    let b = build().run(day(0), day(6)).unwrap();

    assert_eq!(a, b);
    assert_eq!(
        serde_json::to_string(&a.to_value()).unwrap(),
        serde_json::to_string(&b.to_value()).unwrap()
    );
}

// =============================================================================
// Statistics
// =============================================================================

#[test]
fn test_attached_risk_metrics_sentinels() {
    let series = series_from_opens("ACME", &round_trip_opens(), 0.5);
    let mut engine = engine_with(
        series,
        Box::new(Scripted::new("ACME", round_trip_script())),
        10_000.0,
        0.0,
        0.0,
    );
    engine.attach_risk_analyzer(RiskAnalyzer::default());

    let results = engine.run(day(0), day(6)).unwrap();
    let metrics = results.risk_metrics.as_ref().unwrap();

    // One winning trade, no losers
    assert!(metrics.profit_factor.is_infinite());
    assert!(results.profit_factor.is_infinite());
    // Single-return series has zero deviation: guarded sentinel
    assert_eq!(metrics.sharpe_ratio, 0.0);
    assert_eq!(metrics.n_trades, 1);
    assert!((metrics.total_return - 0.01).abs() < 1e-9);
}

// =============================================================================
// End-to-End with CSV Data
// =============================================================================

#[test]
fn test_csv_backed_backtest_end_to_end() {
    init_logging();

    let dir = std::env::temp_dir().join(format!("market-replay-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let mut csv = String::from("datetime,open,high,low,close,volume\n");
    for i in 0..60u32 {
        let phase = (i % 20) as f64;
        let base = 100.0 + if phase < 10.0 { phase } else { 20.0 - phase } * 3.0;
        let d = day(i).format("%Y-%m-%d %H:%M:%S");
        csv.push_str(&format!(
            "{d},{base},{},{},{base},1000\n",
            base + 1.0,
            base - 1.0
        ));
    }
    std::fs::write(dir.join("WAVE.csv"), csv).unwrap();

    let service = Arc::new(MarketDataService::new(Box::new(CsvDataLoader::new(&dir))));
    let mut engine = BacktestEngine::new(service, 10_000.0);
    engine.add_strategy(Box::new(SmaCrossStrategy::new(
        Symbol::new("WAVE"),
        SmaCrossConfig {
            fast_period: 3,
            slow_period: 8,
            quantity: 5.0,
        },
    )));
    engine.attach_risk_analyzer(RiskAnalyzer::default());

    let results = engine.run(day(0), day(59)).unwrap();

    // The crossover strategy must trade this tape, and the accounting must
    // reconcile with the journal.
    assert!(results.total_trades > 0);
    assert_eq!(
        results.total_trades,
        results.winning_trades + results.losing_trades
    );
    assert!(results.risk_metrics.is_some());
    let journal = engine.portfolio().transactions();
    assert!(journal.len() >= results.total_trades * 2 - 1);
}

#[test]
fn test_config_file_drives_engine_setup() {
    init_logging();

    let dir = std::env::temp_dir().join(format!("market-replay-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let config_json = format!(
        r#"{{
            "trading": {{"initial_capital": 25000.0}},
            "execution": {{"commission_rate": 0.0, "slippage": 0.0}},
            "risk": {{"periods_per_year": 252.0, "risk_free_rate": 0.02}},
            "data": {{"data_dir": "{}", "timestamp_format": "%Y-%m-%d %H:%M:%S"}}
        }}"#,
        dir.display()
    );
    let config_path = dir.join("sim.json");
    std::fs::write(&config_path, config_json).unwrap();

    let config = SimulationConfig::from_file(&config_path).unwrap();
    assert_eq!(config.trading.initial_capital, 25_000.0);

    let series = series_from_opens("ACME", &round_trip_opens(), 0.5);
    let mut engine = config.build_engine(service_for(series));
    engine.add_strategy(Box::new(Scripted::new("ACME", round_trip_script())));

    let results = engine.run(day(0), day(6)).unwrap();

    assert_eq!(results.initial_capital, 25_000.0);
    // Zero-cost configuration: the round trip keeps its full 100 profit
    assert!((results.trades[0].profit - 100.0).abs() < 1e-9);
    assert!(results.risk_metrics.is_some());
}
