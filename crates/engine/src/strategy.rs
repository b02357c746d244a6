//! Signal rule
//!
//! Pure per-bar function from the indicator state of bar `i` (plus bar `i - 1`)
//! to a direction, a confidence score and the exit multiples to use on entry.
//! A fault while evaluating one bar never propagates: the caller gets a neutral
//! decision tagged with the fault.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::indicators::IndicatedSeries;
use crate::types::{Bar, Direction, IndicatedBar, SignalDecision, StrategyParameters};

/// Confidence added by a supplied higher-timeframe close below the current close
const HIGHER_TF_BONUS: f64 = 0.05;
/// Confidence added by a confirmed breakout
const BREAKOUT_BONUS: f64 = 0.05;

/// Signal rule configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub rsi_low: f64,
    pub rsi_high: f64,
    /// Volume spike threshold as a multiple of the rolling average volume
    pub min_vol_mult: f64,
    pub atr_stop_mult: f64,
    pub atr_take_mult: f64,
    pub trend_weight: f64,
    pub rsi_weight: f64,
    pub vol_weight: f64,
    pub candle_weight: f64,
    pub min_confidence: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self::from(&StrategyParameters::default())
    }
}

impl From<&StrategyParameters> for SignalConfig {
    fn from(params: &StrategyParameters) -> Self {
        Self {
            ema_fast: params.ema_fast,
            ema_slow: params.ema_slow,
            rsi_low: params.rsi_low,
            rsi_high: params.rsi_high,
            min_vol_mult: 1.1,
            atr_stop_mult: params.atr_stop_mult,
            atr_take_mult: params.atr_take_mult,
            trend_weight: 0.4,
            rsi_weight: 0.15,
            vol_weight: 0.15,
            candle_weight: 0.2,
            min_confidence: params.confidence_threshold,
        }
    }
}

/// Why a bar could not be evaluated
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalFault {
    #[error("bar {index} has no previous bar")]
    MissingHistory { index: usize },

    #[error("indicators for bar {index} are not available")]
    IndicatorsMissing { index: usize },

    #[error("non-finite {field} at bar {index}")]
    NonFinite { index: usize, field: &'static str },
}

/// Result of evaluating the rule on one bar
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    /// The rule ran to completion (the direction may still be flat)
    Decided(SignalDecision),
    /// The rule faulted and fell back to the neutral decision
    Degraded {
        decision: SignalDecision,
        fault: SignalFault,
    },
}

impl SignalOutcome {
    pub fn decision(&self) -> &SignalDecision {
        match self {
            SignalOutcome::Decided(decision) => decision,
            SignalOutcome::Degraded { decision, .. } => decision,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, SignalOutcome::Degraded { .. })
    }
}

/// Evaluate the rule on bar `index` (must be >= 1)
pub fn evaluate_signal(
    series: &IndicatedSeries,
    index: usize,
    higher_tf_close: Option<f64>,
    config: &SignalConfig,
) -> SignalOutcome {
    match try_evaluate(series, index, higher_tf_close, config) {
        Ok(decision) => SignalOutcome::Decided(decision),
        Err(fault) => {
            error!(%fault, "Signal rule fault, degrading to neutral");
            debug!(index, bars = series.len(), "Faulted bar");
            SignalOutcome::Degraded {
                decision: SignalDecision::neutral(),
                fault,
            }
        }
    }
}

fn try_evaluate(
    series: &IndicatedSeries,
    index: usize,
    higher_tf_close: Option<f64>,
    cfg: &SignalConfig,
) -> Result<SignalDecision, SignalFault> {
    let prev = index
        .checked_sub(1)
        .and_then(|p| series.bar(p))
        .ok_or(SignalFault::MissingHistory { index })?;
    let row = series
        .indicated(index, cfg.ema_fast, cfg.ema_slow)
        .ok_or(SignalFault::IndicatorsMissing { index })?;
    check_finite(index, &row, prev)?;

    let bar = &row.bar;
    let mut confidence = 0.0;

    let trend_long = bar.close > row.ema_fast && row.ema_fast > row.ema_slow;
    let trend_short = bar.close < row.ema_fast && row.ema_fast < row.ema_slow;
    if trend_long {
        confidence += cfg.trend_weight;
    }
    if trend_short {
        confidence += cfg.trend_weight;
    }

    if row.rsi < cfg.rsi_low {
        confidence += cfg.rsi_weight;
    }
    if row.rsi > cfg.rsi_high {
        confidence += cfg.rsi_weight;
    }

    if bar.volume > cfg.min_vol_mult * row.vol_avg {
        confidence += cfg.vol_weight;
    }

    let bull_engulf = is_bullish_engulfing(bar, prev);
    let bear_engulf = is_bearish_engulfing(bar, prev);
    if bull_engulf {
        confidence += cfg.candle_weight;
    }
    if bear_engulf {
        confidence += cfg.candle_weight;
    }

    if let Some(reference) = higher_tf_close {
        if bar.close > reference {
            confidence += HIGHER_TF_BONUS;
        }
    }

    let mut direction = Direction::Flat;
    if bull_engulf && row.rsi < cfg.rsi_high && trend_long {
        direction = Direction::Long;
    } else if bear_engulf && row.rsi > cfg.rsi_low && trend_short {
        direction = Direction::Short;
    } else {
        // Both breakouts are checked; on a contradictory bar the short side wins.
        if bar.close > prev.high && bar.volume > row.vol_avg {
            direction = Direction::Long;
            confidence += BREAKOUT_BONUS;
        }
        if bar.close < prev.low && bar.volume > row.vol_avg {
            direction = Direction::Short;
            confidence += BREAKOUT_BONUS;
        }
    }

    let confidence = confidence.clamp(0.0, 1.0);
    if confidence < cfg.min_confidence {
        direction = Direction::Flat;
    }

    Ok(SignalDecision {
        direction,
        confidence,
        stop_atr_mult: cfg.atr_stop_mult,
        take_atr_mult: cfg.atr_take_mult,
    })
}

fn check_finite(index: usize, row: &IndicatedBar, prev: &Bar) -> Result<(), SignalFault> {
    let fields = [
        ("open", row.bar.open),
        ("high", row.bar.high),
        ("low", row.bar.low),
        ("close", row.bar.close),
        ("volume", row.bar.volume),
        ("ema_fast", row.ema_fast),
        ("ema_slow", row.ema_slow),
        ("atr", row.atr),
        ("rsi", row.rsi),
        ("vol_avg", row.vol_avg),
        ("prev_open", prev.open),
        ("prev_high", prev.high),
        ("prev_low", prev.low),
        ("prev_close", prev.close),
    ];
    match fields.iter().find(|(_, v)| !v.is_finite()) {
        Some(&(field, _)) => Err(SignalFault::NonFinite { index, field }),
        None => Ok(()),
    }
}

/// Green candle whose body strictly covers the previous one
fn is_bullish_engulfing(bar: &Bar, prev: &Bar) -> bool {
    bar.close > bar.open
        && bar.open < prev.close
        && bar.close > prev.open
        && bar.body() > prev.body()
}

/// Red candle whose body strictly covers the previous one
fn is_bearish_engulfing(bar: &Bar, prev: &Bar) -> bool {
    bar.close < bar.open
        && bar.open > prev.close
        && bar.close < prev.open
        && bar.body() > prev.body()
}
