//! Indicator preprocessor
//!
//! Derives trend (EMA), volatility (ATR), momentum (RSI) and volume features
//! from a bar series once. Every column uses the history available so far, so
//! there are no leading undefined values. Columns are memoized: `ensure` only
//! computes what is missing.

use std::collections::BTreeMap;

use ta::indicators::{ExponentialMovingAverage, SimpleMovingAverage};
use ta::Next;
use thiserror::Error;

use crate::types::{Bar, IndicatedBar};

pub const ATR_PERIOD: usize = 14;
pub const RSI_SPAN: usize = 14;
pub const VOLUME_WINDOW: usize = 20;

/// Guards the RSI ratio when there were no down moves
const RSI_EPSILON: f64 = 1e-9;

/// RSI reported for the seed bar, which has no price change yet
const RSI_SEED: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndicatorError {
    #[error("invalid {name} period: {period}")]
    InvalidPeriod { name: &'static str, period: usize },
}

/// A bar series plus its memoized indicator columns
#[derive(Debug, Clone)]
pub struct IndicatedSeries {
    bars: Vec<Bar>,
    emas: BTreeMap<usize, Vec<f64>>,
    atr: Option<Vec<f64>>,
    rsi: Option<Vec<f64>>,
    vol_avg: Option<Vec<f64>>,
}

impl IndicatedSeries {
    /// Copies the bars; the caller's series is never touched
    pub fn new(bars: &[Bar]) -> Self {
        Self {
            bars: bars.to_vec(),
            emas: BTreeMap::new(),
            atr: None,
            rsi: None,
            vol_avg: None,
        }
    }

    /// Build and fill every column needed for the given EMA spans
    pub fn prepared(bars: &[Bar], ema_fast: usize, ema_slow: usize) -> Result<Self, IndicatorError> {
        let mut series = Self::new(bars);
        series.ensure(ema_fast, ema_slow)?;
        Ok(series)
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn bar(&self, index: usize) -> Option<&Bar> {
        self.bars.get(index)
    }

    /// Compute whichever columns are still absent
    pub fn ensure(&mut self, ema_fast: usize, ema_slow: usize) -> Result<(), IndicatorError> {
        let closes: Vec<f64> = self.bars.iter().map(|b| b.close).collect();

        for span in [ema_fast, ema_slow] {
            if !self.emas.contains_key(&span) {
                let column = ema_series(&closes, span)?;
                self.emas.insert(span, column);
            }
        }
        if self.atr.is_none() {
            self.atr = Some(rolling_mean(&true_range(&self.bars), ATR_PERIOD)?);
        }
        if self.rsi.is_none() {
            self.rsi = Some(rsi_series(&closes, RSI_SPAN)?);
        }
        if self.vol_avg.is_none() {
            let volumes: Vec<f64> = self.bars.iter().map(|b| b.volume).collect();
            self.vol_avg = Some(rolling_mean(&volumes, VOLUME_WINDOW)?);
        }
        Ok(())
    }

    pub fn ema(&self, span: usize) -> Option<&[f64]> {
        self.emas.get(&span).map(Vec::as_slice)
    }

    pub fn atr(&self) -> Option<&[f64]> {
        self.atr.as_deref()
    }

    pub fn rsi(&self) -> Option<&[f64]> {
        self.rsi.as_deref()
    }

    pub fn vol_avg(&self) -> Option<&[f64]> {
        self.vol_avg.as_deref()
    }

    /// Assemble the enriched view of bar `index`.
    /// `None` when the index is out of range or a column has not been computed.
    pub fn indicated(&self, index: usize, ema_fast: usize, ema_slow: usize) -> Option<IndicatedBar> {
        Some(IndicatedBar {
            bar: *self.bars.get(index)?,
            ema_fast: *self.ema(ema_fast)?.get(index)?,
            ema_slow: *self.ema(ema_slow)?.get(index)?,
            atr: *self.atr()?.get(index)?,
            rsi: *self.rsi()?.get(index)?,
            vol_avg: *self.vol_avg()?.get(index)?,
        })
    }
}

/// EMA seeded with the first value, smoothing factor 2 / (span + 1)
pub fn ema_series(values: &[f64], span: usize) -> Result<Vec<f64>, IndicatorError> {
    let mut ema = ExponentialMovingAverage::new(span)
        .map_err(|_| IndicatorError::InvalidPeriod { name: "ema", period: span })?;
    Ok(values.iter().map(|&v| ema.next(v)).collect())
}

/// Rolling mean over at most `window` trailing values
pub fn rolling_mean(values: &[f64], window: usize) -> Result<Vec<f64>, IndicatorError> {
    let mut sma = SimpleMovingAverage::new(window).map_err(|_| IndicatorError::InvalidPeriod {
        name: "rolling mean",
        period: window,
    })?;
    Ok(values.iter().map(|&v| sma.next(v)).collect())
}

/// max(high - low, |high - prev close|, |low - prev close|); the first bar uses high - low
pub fn true_range(bars: &[Bar]) -> Vec<f64> {
    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let range = bar.high - bar.low;
            match i.checked_sub(1).and_then(|p| bars.get(p)) {
                Some(prev) => range
                    .max((bar.high - prev.close).abs())
                    .max((bar.low - prev.close).abs()),
                None => range,
            }
        })
        .collect()
}

/// RSI from exponentially smoothed gains and losses
pub fn rsi_series(closes: &[f64], span: usize) -> Result<Vec<f64>, IndicatorError> {
    let invalid = |_| IndicatorError::InvalidPeriod { name: "rsi", period: span };
    let mut gains = ExponentialMovingAverage::new(span).map_err(invalid)?;
    let mut losses = ExponentialMovingAverage::new(span).map_err(invalid)?;

    let mut out = Vec::with_capacity(closes.len());
    for (i, &close) in closes.iter().enumerate() {
        let Some(&prev) = i.checked_sub(1).and_then(|p| closes.get(p)) else {
            out.push(RSI_SEED);
            continue;
        };
        let delta = close - prev;
        let avg_gain = gains.next(delta.max(0.0));
        let avg_loss = losses.next((-delta).max(0.0));
        let rs = avg_gain / (avg_loss + RSI_EPSILON);
        out.push(100.0 - 100.0 / (1.0 + rs));
    }
    Ok(out)
}
