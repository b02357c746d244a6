//! Types shared by the simulator, the metrics engine and the evolutionary search

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single OHLCV bar. Position in the series is its time index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Absolute candle body
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }
}

/// A bar together with its derived indicator values
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IndicatedBar {
    pub bar: Bar,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub atr: f64,
    pub rsi: f64,
    pub vol_avg: f64,
}

/// Directional output of the signal rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Short,
    Flat,
    Long,
}

impl Direction {
    /// The side a position opened on this direction would take
    pub fn side(self) -> Option<TradeSide> {
        match self {
            Direction::Long => Some(TradeSide::Long),
            Direction::Short => Some(TradeSide::Short),
            Direction::Flat => None,
        }
    }
}

/// Side of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    /// +1 for long, -1 for short
    pub fn sign(self) -> f64 {
        match self {
            TradeSide::Long => 1.0,
            TradeSide::Short => -1.0,
        }
    }
}

/// Signal rule output for one bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SignalDecision {
    pub direction: Direction,
    /// Always within [0, 1]
    pub confidence: f64,
    pub stop_atr_mult: f64,
    pub take_atr_mult: f64,
}

impl SignalDecision {
    /// Neutral decision with the default risk payload
    pub fn neutral() -> Self {
        Self {
            direction: Direction::Flat,
            confidence: 0.0,
            stop_atr_mult: 1.5,
            take_atr_mult: 3.0,
        }
    }
}

/// The single open position held by the simulator
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    pub entry_index: usize,
    pub entry_price: f64,
    pub size: f64,
    pub stop_price: f64,
    /// `None` means no target: the take side never triggers
    pub take_price: Option<f64>,
    pub side: TradeSide,
}

impl Position {
    /// Mark-to-market PnL at `price`
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.size * self.side.sign()
    }

    /// Capital committed at entry (excluding the entry commission)
    pub fn cost_basis(&self) -> f64 {
        self.entry_price * self.size
    }
}

/// How a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitReason {
    Stop,
    Take,
}

/// A closed round trip
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BacktestTrade {
    pub entry_index: usize,
    pub exit_index: usize,
    pub side: TradeSide,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    /// Cash returned at exit net of commission, minus the cost basis
    pub pnl: f64,
    pub reason: ExitReason,
}

/// One point of the equity trace (one per bar after the seed bar)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EquityPoint {
    pub equity: f64,
    pub has_open_position: bool,
    pub unrealized_pnl: f64,
}

/// The genome: parameters the search mutates and the configuration the API serves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParameters {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub rsi_low: f64,
    pub rsi_high: f64,
    pub atr_stop_mult: f64,
    pub atr_take_mult: f64,
    pub risk_per_trade: f64,
    pub confidence_threshold: f64,
}

impl Default for StrategyParameters {
    fn default() -> Self {
        Self {
            ema_fast: 21,
            ema_slow: 50,
            rsi_low: 30.0,
            rsi_high: 70.0,
            atr_stop_mult: 1.5,
            atr_take_mult: 3.0,
            risk_per_trade: 0.01,
            confidence_threshold: 0.5,
        }
    }
}

impl StrategyParameters {
    /// Reasons this configuration cannot drive a simulation; empty when valid
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.ema_fast == 0 || self.ema_slow == 0 {
            errors.push("ema spans must be positive".to_string());
        }
        if !(self.rsi_low < self.rsi_high) {
            errors.push(format!("rsi_low ({}) must be below rsi_high ({})", self.rsi_low, self.rsi_high));
        }
        for (name, value) in [
            ("atr_stop_mult", self.atr_stop_mult),
            ("atr_take_mult", self.atr_take_mult),
        ] {
            if !(value.is_finite() && value > 0.0) {
                errors.push(format!("{name} must be a positive number"));
            }
        }
        if !(self.risk_per_trade > 0.0 && self.risk_per_trade <= 1.0) {
            errors.push("risk_per_trade must be in (0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            errors.push("confidence_threshold must be in [0, 1]".to_string());
        }
        errors
    }
}

/// Scalar scores reduced from an equity trace
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub cagr: f64,
    pub sharpe: f64,
    pub sortino: f64,
    /// Non-positive: worst equity shortfall from its running peak
    pub max_drawdown: f64,
    pub winrate: f64,
    /// Number of equity points the metrics were computed from
    #[serde(rename = "len")]
    pub sample_len: usize,
}

/// A persisted champion record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: i64,
    pub version: String,
    pub metrics: serde_json::Value,
    pub promoted: bool,
    pub created_at: DateTime<Utc>,
}

impl ModelVersion {
    /// Sharpe stored in the metrics document, 0 when missing
    pub fn sharpe(&self) -> f64 {
        self.metrics
            .get("sharpe")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
    }
}
