//! Reduce an equity trace to risk-adjusted scores

use crate::types::PerformanceMetrics;

/// Bars per year used for annualization by default
pub const PERIODS_PER_YEAR: f64 = 252.0;

/// Guards every division by a volatility
const EPSILON: f64 = 1e-9;

/// Compute CAGR, Sharpe, Sortino, max drawdown and win rate.
///
/// A trace too short to produce a single return yields zeroed metrics.
pub fn compute_metrics(equity: &[f64], periods_per_year: f64) -> PerformanceMetrics {
    let sample_len = equity.len();
    if sample_len < 2 {
        return PerformanceMetrics {
            sample_len,
            ..Default::default()
        };
    }

    let returns: Vec<f64> = equity.windows(2).map(|w| w[1] / w[0] - 1.0).collect();

    let annual_mean = mean(&returns) * periods_per_year;
    let annual_vol = sample_std(&returns) * periods_per_year.sqrt();
    let sharpe = annual_mean / (annual_vol + EPSILON);

    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    let downside_vol = if downside.is_empty() {
        0.0
    } else {
        sample_std(&downside) * periods_per_year.sqrt()
    };
    let sortino = annual_mean / (downside_vol + EPSILON);

    let wins = returns.iter().filter(|r| **r > 0.0).count();
    let winrate = wins as f64 / returns.len() as f64;

    PerformanceMetrics {
        cagr: cagr(equity, periods_per_year),
        sharpe,
        sortino,
        max_drawdown: max_drawdown(equity),
        winrate,
        sample_len,
    }
}

/// Worst `equity / running peak - 1`; 0 when equity never falls
pub fn max_drawdown(equity: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0_f64;
    for &value in equity {
        peak = peak.max(value);
        worst = worst.min(value / peak - 1.0);
    }
    worst
}

fn cagr(equity: &[f64], periods_per_year: f64) -> f64 {
    let (Some(&first), Some(&last)) = (equity.first(), equity.last()) else {
        return 0.0;
    };
    if first <= 0.0 {
        return 0.0;
    }
    let years = (equity.len() as f64 / periods_per_year).max(EPSILON);
    (last / first).powf(1.0 / years) - 1.0
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1); 0 for fewer than two values
fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}
