//! Bar-by-bar execution simulator
//!
//! Holds at most one position. On every bar after the seed bar, exits on the
//! existing position are checked against the bar's extremes first; only a flat
//! book may then open a new position from the signal rule's decision.

use serde::Serialize;
use tracing::debug;

use crate::fees::ExecutionCosts;
use crate::indicators::{IndicatedSeries, IndicatorError};
use crate::strategy::{evaluate_signal, SignalConfig};
use crate::types::*;

/// Floor on the stop distance used for sizing
pub const MIN_STOP_DISTANCE: f64 = 1e-8;

/// Everything a single simulation run needs besides the bars
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationConfig {
    pub initial_balance: f64,
    pub risk_per_trade: f64,
    /// Cash value of a one-unit price move per unit of size
    pub unit_value: f64,
    pub costs: ExecutionCosts,
    pub signal: SignalConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self::from_params(&StrategyParameters::default())
    }
}

impl SimulationConfig {
    pub fn from_params(params: &StrategyParameters) -> Self {
        Self {
            initial_balance: 10_000.0,
            risk_per_trade: params.risk_per_trade,
            unit_value: 1.0,
            costs: ExecutionCosts::default(),
            signal: SignalConfig::from(params),
        }
    }
}

/// Output of one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationResult {
    /// One point per bar after the seed bar
    pub equity: Vec<EquityPoint>,
    pub trades: Vec<BacktestTrade>,
    /// Bars whose signal evaluation faulted and fell back to neutral
    pub degraded_bars: usize,
}

impl SimulationResult {
    pub fn final_equity(&self) -> Option<f64> {
        self.equity.last().map(|p| p.equity)
    }

    pub fn equity_values(&self) -> Vec<f64> {
        self.equity.iter().map(|p| p.equity).collect()
    }
}

/// Units to buy so that a stop-out loses `balance * risk_per_trade`.
/// Zero whenever the computed size is not a positive finite number.
pub fn position_size(balance: f64, risk_per_trade: f64, atr: f64, stop_mult: f64, unit_value: f64) -> f64 {
    let stop_distance = (atr * stop_mult).max(MIN_STOP_DISTANCE);
    let size = balance * risk_per_trade / (stop_distance * unit_value);
    if size.is_finite() && size > 0.0 {
        size
    } else {
        0.0
    }
}

/// Stop or take triggered by this bar, with the slipped fill price.
/// The stop is checked first.
pub fn check_exit(position: &Position, bar: &Bar, costs: &ExecutionCosts) -> Option<(f64, ExitReason)> {
    let (stop_hit, take_hit) = match position.side {
        TradeSide::Long => (
            bar.low <= position.stop_price,
            position.take_price.is_some_and(|take| bar.high >= take),
        ),
        TradeSide::Short => (
            bar.high >= position.stop_price,
            position.take_price.is_some_and(|take| bar.low <= take),
        ),
    };

    if stop_hit {
        Some((costs.stop_fill(position.stop_price, position.side), ExitReason::Stop))
    } else if take_hit {
        let take = position.take_price?;
        Some((costs.take_fill(take, position.side), ExitReason::Take))
    } else {
        None
    }
}

/// Cash returned to the account when `position` is closed at `exit_price`
pub fn settle(position: &Position, exit_price: f64, costs: &ExecutionCosts) -> f64 {
    let exit_notional = exit_price * position.size;
    let gross = match position.side {
        TradeSide::Long => exit_notional,
        TradeSide::Short => position.cost_basis() + (position.entry_price - exit_price) * position.size,
    };
    gross - costs.commission_on(exit_notional)
}

/// Backtesting engine that simulates bar-by-bar execution
pub struct BacktestEngine;

impl BacktestEngine {
    /// Prepare indicators for `bars` and simulate
    pub fn run(config: &SimulationConfig, bars: &[Bar]) -> Result<SimulationResult, IndicatorError> {
        let series = IndicatedSeries::prepared(bars, config.signal.ema_fast, config.signal.ema_slow)?;
        Ok(Self::run_series(config, &series, None))
    }

    /// Simulate over an already indicated series. `reference` holds optional
    /// higher-timeframe closes aligned by bar index.
    pub fn run_series(
        config: &SimulationConfig,
        series: &IndicatedSeries,
        reference: Option<&[f64]>,
    ) -> SimulationResult {
        let costs = &config.costs;
        let mut cash = config.initial_balance;
        let mut position: Option<Position> = None;
        let mut result = SimulationResult {
            equity: Vec::with_capacity(series.len().saturating_sub(1)),
            ..Default::default()
        };

        debug!(
            bars = series.len(),
            balance = config.initial_balance,
            risk_per_trade = config.risk_per_trade,
            "Starting simulation"
        );

        for (i, bar) in series.bars().iter().enumerate().skip(1) {
            if let Some(pos) = position {
                if let Some((exit_price, reason)) = check_exit(&pos, bar, costs) {
                    let returned = settle(&pos, exit_price, costs);
                    cash += returned;
                    position = None;

                    result.trades.push(BacktestTrade {
                        entry_index: pos.entry_index,
                        exit_index: i,
                        side: pos.side,
                        entry_price: pos.entry_price,
                        exit_price,
                        size: pos.size,
                        pnl: returned - pos.cost_basis(),
                        reason,
                    });
                    debug!(index = i, ?reason, exit = exit_price, cash, "Closed position");
                }
            }

            if position.is_none() {
                let higher_tf = reference.and_then(|r| r.get(i).copied());
                let outcome = evaluate_signal(series, i, higher_tf, &config.signal);
                if outcome.is_degraded() {
                    result.degraded_bars += 1;
                }
                let decision = outcome.decision();

                if let Some(side) = decision.direction.side() {
                    let atr = series.atr().and_then(|a| a.get(i)).copied().unwrap_or(0.0);
                    position = Self::try_open(config, cash, i, bar, atr, side, decision);
                    if let Some(pos) = &position {
                        cash -= pos.cost_basis() + costs.commission_on(pos.cost_basis());
                    }
                }
            }

            let (committed, unrealized) = position
                .map(|p| (p.cost_basis(), p.unrealized_pnl(bar.close)))
                .unwrap_or((0.0, 0.0));
            result.equity.push(EquityPoint {
                equity: cash + committed + unrealized,
                has_open_position: position.is_some(),
                unrealized_pnl: unrealized,
            });
        }

        debug!(
            bars = series.len(),
            trades = result.trades.len(),
            degraded = result.degraded_bars,
            final_equity = result.final_equity().unwrap_or(config.initial_balance),
            "Simulation complete"
        );

        result
    }

    /// Size and price a new position; `None` when nothing can be opened
    fn try_open(
        config: &SimulationConfig,
        cash: f64,
        index: usize,
        bar: &Bar,
        atr: f64,
        side: TradeSide,
        decision: &SignalDecision,
    ) -> Option<Position> {
        let costs = &config.costs;
        let size = position_size(cash, config.risk_per_trade, atr, decision.stop_atr_mult, config.unit_value);
        if size <= 0.0 {
            return None;
        }

        let entry_price = costs.entry_price(bar.close, side);
        let notional = entry_price * size;
        if notional + costs.commission_on(notional) > cash {
            debug!(index, notional, cash, "Entry rejected: not affordable");
            return None;
        }

        let sign = side.sign();
        let stop_offset = atr * decision.stop_atr_mult + entry_price * costs.half_spread();
        let position = Position {
            entry_index: index,
            entry_price,
            size,
            stop_price: entry_price - sign * stop_offset,
            take_price: Some(entry_price + sign * atr * decision.take_atr_mult),
            side,
        };
        debug!(
            index,
            ?side,
            entry = entry_price,
            size,
            stop = position.stop_price,
            confidence = decision.confidence,
            "Opened position"
        );
        Some(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{compute_metrics, PERIODS_PER_YEAR};
    use crate::synthetic::{BarSource, RandomWalkSource};

    fn rising_bars(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let close = 100.0 + i as f64;
                Bar::new(close - 0.5, close + 0.5, close - 0.5, close, 1000.0 + 10.0 * i as f64)
            })
            .collect()
    }

    fn flat_bars(n: usize) -> Vec<Bar> {
        (0..n).map(|_| Bar::new(100.0, 100.0, 100.0, 100.0, 500.0)).collect()
    }

    fn long_position(stop: f64, take: Option<f64>) -> Position {
        Position {
            entry_index: 1,
            entry_price: 100.0,
            size: 10.0,
            stop_price: stop,
            take_price: take,
            side: TradeSide::Long,
        }
    }

    #[test]
    fn test_empty_and_single_bar_series() {
        let config = SimulationConfig::default();
        assert!(BacktestEngine::run(&config, &[]).unwrap().equity.is_empty());
        assert!(BacktestEngine::run(&config, &flat_bars(1)).unwrap().equity.is_empty());
    }

    #[test]
    fn test_flat_series_never_trades() {
        let config = SimulationConfig::default();
        let result = BacktestEngine::run(&config, &flat_bars(60)).unwrap();

        assert_eq!(result.equity.len(), 59);
        assert!(result.trades.is_empty());
        assert!(result.equity.iter().all(|p| p.equity == 10_000.0 && !p.has_open_position));
    }

    #[test]
    fn test_rising_series_enters_long_and_profits() {
        let config = SimulationConfig::default();
        let result = BacktestEngine::run(&config, &rising_bars(80)).unwrap();

        assert_eq!(result.equity.len(), 79);
        assert!(!result.trades.is_empty());
        assert!(result.trades.iter().all(|t| t.side == TradeSide::Long));
        assert!(result.trades.iter().any(|t| t.reason == ExitReason::Take && t.pnl > 0.0));
        assert!(result.final_equity().unwrap() > 10_000.0);
        assert_eq!(result.degraded_bars, 0);
    }

    #[test]
    fn test_scored_rising_and_flat_series() {
        let config = SimulationConfig::default();

        let rising = BacktestEngine::run(&config, &rising_bars(80)).unwrap();
        let metrics = compute_metrics(&rising.equity_values(), PERIODS_PER_YEAR);
        assert!(rising.trades.iter().any(|t| t.side == TradeSide::Long));
        assert!(metrics.sharpe > 0.0);
        assert!(metrics.cagr > 0.0);
        assert_eq!(metrics.sample_len, 79);

        let flat = BacktestEngine::run(&config, &flat_bars(60)).unwrap();
        let metrics = compute_metrics(&flat.equity_values(), PERIODS_PER_YEAR);
        assert_eq!(metrics.sharpe, 0.0);
        assert_eq!(metrics.sortino, 0.0);
        assert_eq!(metrics.max_drawdown, 0.0);
    }

    #[test]
    fn test_higher_timeframe_reference_lifts_confidence() {
        // Trend, RSI and breakout give 0.6 on this series; only the reference bonus clears 0.62
        let config = SimulationConfig {
            signal: SignalConfig {
                min_confidence: 0.62,
                ..SignalConfig::default()
            },
            ..SimulationConfig::default()
        };
        let bars = rising_bars(80);
        let series = IndicatedSeries::prepared(&bars, config.signal.ema_fast, config.signal.ema_slow).unwrap();

        let plain = BacktestEngine::run_series(&config, &series, None);
        assert!(plain.trades.is_empty());
        assert!(plain.equity.iter().all(|p| !p.has_open_position));

        let above = vec![f64::MAX; bars.len()];
        let capped = BacktestEngine::run_series(&config, &series, Some(&above));
        assert!(capped.trades.is_empty());

        let below = vec![50.0; bars.len()];
        let lifted = BacktestEngine::run_series(&config, &series, Some(&below));
        assert!(!lifted.trades.is_empty());
        assert!(lifted.trades.iter().all(|t| t.side == TradeSide::Long));
    }

    #[test]
    fn test_unaffordable_entry_is_rejected() {
        let config = SimulationConfig {
            risk_per_trade: 1.0,
            ..SimulationConfig::default()
        };
        let result = BacktestEngine::run(&config, &rising_bars(40)).unwrap();

        assert!(result.trades.is_empty());
        assert!(result.equity.iter().all(|p| !p.has_open_position && p.equity == 10_000.0));
    }

    #[test]
    fn test_position_size_floors() {
        assert!((position_size(10_000.0, 0.01, 2.0, 1.5, 1.0) - 100.0 / 3.0).abs() < 1e-9);
        // Zero ATR hits the distance floor instead of dividing by zero
        assert_eq!(position_size(10_000.0, 0.01, 0.0, 1.5, 1.0), 100.0 / MIN_STOP_DISTANCE);
        assert_eq!(position_size(10_000.0, -0.01, 2.0, 1.5, 1.0), 0.0);
        assert_eq!(position_size(0.0, 0.01, 2.0, 1.5, 1.0), 0.0);
        assert_eq!(position_size(10_000.0, 0.01, 2.0, 1.5, 0.0), 0.0);
    }

    #[test]
    fn test_stop_checked_before_take() {
        let costs = ExecutionCosts::default();
        let pos = long_position(95.0, Some(105.0));
        // Outside bar touches both levels
        let bar = Bar::new(100.0, 106.0, 94.0, 100.0, 1.0);
        let (price, reason) = check_exit(&pos, &bar, &costs).unwrap();
        assert_eq!(reason, ExitReason::Stop);
        assert!((price - 95.0 * 1.0005).abs() < 1e-9);
    }

    #[test]
    fn test_missing_take_never_triggers() {
        let costs = ExecutionCosts::default();
        let pos = long_position(95.0, None);
        let bar = Bar::new(100.0, 1e12, 99.0, 100.0, 1.0);
        assert!(check_exit(&pos, &bar, &costs).is_none());
    }

    #[test]
    fn test_short_exits_mirror_long() {
        let costs = ExecutionCosts::zero();
        let pos = Position {
            side: TradeSide::Short,
            stop_price: 105.0,
            take_price: Some(90.0),
            ..long_position(0.0, None)
        };

        let take_bar = Bar::new(92.0, 93.0, 89.0, 91.0, 1.0);
        let (price, reason) = check_exit(&pos, &take_bar, &costs).unwrap();
        assert_eq!((price, reason), (90.0, ExitReason::Take));
        // 10 units shorted at 100, covered at 90
        assert_eq!(settle(&pos, price, &costs), 1000.0 + 100.0);

        let stop_bar = Bar::new(104.0, 105.0, 103.0, 104.5, 1.0);
        let (price, reason) = check_exit(&pos, &stop_bar, &costs).unwrap();
        assert_eq!((price, reason), (105.0, ExitReason::Stop));
        assert_eq!(settle(&pos, price, &costs), 1000.0 - 50.0);
    }

    #[test]
    fn test_random_walk_keeps_single_position_and_solvent_cash() {
        let bars = RandomWalkSource::default().bars(7);
        let config = SimulationConfig::default();
        let result = BacktestEngine::run(&config, &bars).unwrap();

        assert_eq!(result.equity.len(), bars.len() - 1);
        for pair in result.trades.windows(2) {
            assert!(pair[1].entry_index >= pair[0].exit_index);
        }
        for trade in &result.trades {
            assert!(trade.exit_index > trade.entry_index);
            assert!(trade.size > 0.0);
        }
    }
}
