//! Execution frictions applied by the simulator
//!
//! Slippage and half the spread always move the fill against the trader on
//! entry. Exits apply slippage only. Commission is charged on the absolute
//! notional of every fill.

use serde::{Deserialize, Serialize};

use crate::types::TradeSide;

/// Friction parameters, all expressed as fractions of price or notional
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCosts {
    pub slippage: f64,
    pub commission: f64,
    pub spread: f64,
}

impl Default for ExecutionCosts {
    fn default() -> Self {
        Self {
            slippage: 0.0005,
            commission: 0.0002,
            spread: 0.0,
        }
    }
}

impl ExecutionCosts {
    /// Frictionless fills, handy for reasoning about PnL in tests
    pub fn zero() -> Self {
        Self {
            slippage: 0.0,
            commission: 0.0,
            spread: 0.0,
        }
    }

    pub fn half_spread(&self) -> f64 {
        self.spread / 2.0
    }

    /// Commission on a fill of the given notional
    pub fn commission_on(&self, notional: f64) -> f64 {
        notional.abs() * self.commission
    }

    /// Fill price for opening a position at `close`
    pub fn entry_price(&self, close: f64, side: TradeSide) -> f64 {
        let adverse = self.slippage + self.half_spread();
        match side {
            TradeSide::Long => close * (1.0 + adverse),
            TradeSide::Short => close * (1.0 - adverse),
        }
    }

    /// Fill price when a stop at `stop_price` is hit
    pub fn stop_fill(&self, stop_price: f64, side: TradeSide) -> f64 {
        match side {
            TradeSide::Long => stop_price * (1.0 + self.slippage),
            TradeSide::Short => stop_price * (1.0 - self.slippage),
        }
    }

    /// Fill price when a target at `take_price` is hit
    pub fn take_fill(&self, take_price: f64, side: TradeSide) -> f64 {
        match side {
            TradeSide::Long => take_price * (1.0 - self.slippage),
            TradeSide::Short => take_price * (1.0 + self.slippage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_moves_against_trader() {
        let costs = ExecutionCosts {
            slippage: 0.001,
            commission: 0.0,
            spread: 0.002,
        };
        assert!((costs.entry_price(100.0, TradeSide::Long) - 100.2).abs() < 1e-9);
        assert!((costs.entry_price(100.0, TradeSide::Short) - 99.8).abs() < 1e-9);
    }

    #[test]
    fn test_exit_fills() {
        let costs = ExecutionCosts::default();
        assert!((costs.stop_fill(100.0, TradeSide::Long) - 100.05).abs() < 1e-9);
        assert!((costs.take_fill(100.0, TradeSide::Long) - 99.95).abs() < 1e-9);
        assert!((costs.stop_fill(100.0, TradeSide::Short) - 99.95).abs() < 1e-9);
        assert!((costs.take_fill(100.0, TradeSide::Short) - 100.05).abs() < 1e-9);
    }

    #[test]
    fn test_commission_uses_absolute_notional() {
        let costs = ExecutionCosts::default();
        assert!((costs.commission_on(-5000.0) - 1.0).abs() < 1e-12);
        assert_eq!(ExecutionCosts::zero().commission_on(5000.0), 0.0);
    }
}
